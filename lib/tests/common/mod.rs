#![allow(dead_code)]

use std::io;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// errno of the last failed libc call in this process
pub fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Returns `[read_end, write_end]`, or exits the (forked) caller on failure
pub fn pipe_or_exit() -> [libc::c_int; 2] {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        unsafe { libc::_exit(100) }
    }
    fds
}

pub fn loopback(port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();
    addr
}

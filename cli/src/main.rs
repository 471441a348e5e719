mod app;
mod logger;

use log::{debug, error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use syshook::platforms::NativeHandler;
use syshook::{DetachHandle, Pid, RuntimeConf, Supervisor, Tracer, TracerConf};

use crate::app::App;

fn main() -> Result<(), String> {
    let app = App::new();

    // Load TracerConf from file if necessary
    let conf: TracerConf = match app.args.get_one::<String>("config_file") {
        Some(filename) => {
            let c = TracerConf::from_file(filename).map_err(|e| {
                format!("Unable to read hook configuration from file {}: {}", filename, e)
            })?;
            debug!("Configuration loaded from {}", filename);
            c
        }
        None => {
            warn!("No configuration file given, syscalls will only be traced");
            TracerConf::default()
        }
    };
    let registry = conf
        .into_registry(&NativeHandler::new())
        .map_err(|e| e.to_string())?;
    info!("{} hook(s) installed", registry.len());

    let mut runtime_conf = RuntimeConf::default();
    if let Some(argv0) = app.args.get_one::<String>("only") {
        runtime_conf.match_argv0(argv0.as_str());
    }

    let mut supervisor = Supervisor::new(Tracer::new(registry, runtime_conf));
    watch_signals(supervisor.detach_handle())?;

    for pid in app.pids() {
        supervisor
            .attach(Pid::from_raw(pid))
            .map_err(|e| format!("Unable to trace process {}: {}", pid, e))?;
    }
    if let Some(cmd) = app.tracee_cmd() {
        supervisor
            .spawn(cmd)
            .map_err(|e| format!("Unable to start tracee: {}", e))?;
    }

    // Print final report
    let mut failed = 0;
    for res in supervisor.wait() {
        match res {
            Ok(report) => {
                for exit in &report.exits {
                    info!("Process {} {}", exit.pid, exit.status);
                }
            }
            Err(e) => {
                error!("{}", e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        Err(format!("{} trace(s) failed", failed))
    } else {
        Ok(())
    }
}

/// Turns SIGINT/SIGTERM into a request to detach from every traced process
fn watch_signals(detach: DetachHandle) -> Result<(), String> {
    let term = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM] {
        flag::register(sig, Arc::clone(&term))
            .map_err(|e| format!("Unable to register handler for signal {}: {}", sig, e))?;
    }
    thread::Builder::new()
        .name(String::from("signals"))
        .spawn(move || {
            while !term.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(100));
            }
            info!("Interrupted, detaching from all traced processes");
            detach.request_all();
        })
        .map_err(|e| format!("Unable to start signal watcher: {}", e))?;
    Ok(())
}

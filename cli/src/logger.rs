use log::{Level, Metadata, Record};
use std::thread;

/// Writes records to stderr, tagged with the control thread that emitted them
pub struct AppLogger;

impl log::Log for AppLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let prefix = match record.level() {
            Level::Error => "ERROR: ",
            Level::Warn => "WARNING: ",
            _ => "",
        };
        match thread::current().name() {
            Some(name) if name != "main" => eprintln!("[{}] {}{}", name, prefix, record.args()),
            _ => eprintln!("{}{}", prefix, record.args()),
        }
    }

    fn flush(&self) {}
}

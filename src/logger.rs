//! Logging for the daemon and the CLI.
//!
//! Lines go to stderr (colored when attached to a terminal) and, for the
//! daemon, are appended to the warden log file so `warden tail` style
//! inspection works after the fact.

use crate::env;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

struct Logger {
    file: Mutex<Option<File>>,
}

static LOGGER: Logger = Logger {
    file: Mutex::new(None),
};

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= *env::WARDEN_LOG
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let level = record.level();
        let styled = match level {
            log::Level::Error => console::style(level).red(),
            log::Level::Warn => console::style(level).yellow(),
            log::Level::Info => console::style(level).green(),
            _ => console::style(level).dim(),
        };
        eprintln!("{now} {styled} {}", record.args());
        if let Ok(mut guard) = self.file.lock()
            && let Some(file) = guard.as_mut()
        {
            let _ = writeln!(file, "{now} {level} {}", record.args());
        }
    }

    fn flush(&self) {
        if let Ok(mut guard) = self.file.lock()
            && let Some(file) = guard.as_mut()
        {
            let _ = file.flush();
        }
    }
}

pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(*env::WARDEN_LOG);
}

/// Attach the daemon log file. Only `warden run` calls this; plain CLI
/// invocations log to stderr alone.
pub fn attach_file() {
    if let Some(parent) = env::WARDEN_LOG_FILE.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(file) = open_log(&env::WARDEN_LOG_FILE)
        && let Ok(mut guard) = LOGGER.file.lock()
    {
        *guard = Some(file);
    }
}

/// Close and reopen the daemon log file (SIGUSR2 log rotation handshake).
pub fn reopen_file() {
    if let Ok(mut guard) = LOGGER.file.lock()
        && guard.is_some()
    {
        *guard = open_log(&env::WARDEN_LOG_FILE).ok();
    }
}

fn open_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().append(true).create(true).open(path)
}

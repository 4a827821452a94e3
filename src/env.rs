use once_cell::sync::Lazy;
pub use std::env::*;
use std::path::PathBuf;

pub static WARDEN_BIN: Lazy<PathBuf> =
    Lazy::new(|| current_exe().unwrap().canonicalize().unwrap());
pub static CWD: Lazy<PathBuf> = Lazy::new(|| current_dir().unwrap_or_default());

pub static HOME_DIR: Lazy<PathBuf> = Lazy::new(|| dirs::home_dir().unwrap_or_default());
pub static WARDEN_STATE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    var_path("WARDEN_STATE_DIR").unwrap_or(
        dirs::state_dir()
            .unwrap_or(HOME_DIR.join(".local").join("state"))
            .join("warden"),
    )
});
pub static WARDEN_CONFIG: Lazy<PathBuf> =
    Lazy::new(|| var_path("WARDEN_CONFIG").unwrap_or(CWD.join("warden.toml")));
pub static WARDEN_LOG: Lazy<log::LevelFilter> =
    Lazy::new(|| var_log_level("WARDEN_LOG").unwrap_or(log::LevelFilter::Info));
pub static WARDEN_LOGS_DIR: Lazy<PathBuf> =
    Lazy::new(|| var_path("WARDEN_LOGS_DIR").unwrap_or(WARDEN_STATE_DIR.join("logs")));
pub static WARDEN_LOG_FILE: Lazy<PathBuf> =
    Lazy::new(|| WARDEN_LOGS_DIR.join("warden.log"));

/// Identifier reported to event listeners in the `server:` envelope field.
pub static WARDEN_IDENTIFIER: Lazy<String> =
    Lazy::new(|| var("WARDEN_IDENTIFIER").unwrap_or_else(|_| "warden".to_string()));

/// URL exported to children as SUPERVISOR_SERVER_URL.
pub static WARDEN_SERVER_URL: Lazy<String> = Lazy::new(|| {
    var("WARDEN_SERVER_URL").unwrap_or_else(|_| format!("unix://{}", IPC_SOCK_MAIN.display()))
});

/// Scheduler cadence; transitions, reaping and I/O draining all run on this tick.
pub static WARDEN_TICK_MS: Lazy<u64> = Lazy::new(|| {
    var("WARDEN_TICK_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(200)
});

pub static IPC_SOCK_DIR: Lazy<PathBuf> = Lazy::new(|| WARDEN_STATE_DIR.join("sock"));
pub static IPC_SOCK_MAIN: Lazy<PathBuf> = Lazy::new(|| IPC_SOCK_DIR.join("main.sock"));
pub static IPC_JSON: Lazy<bool> = Lazy::new(|| !var_false("IPC_JSON"));

fn var_path(name: &str) -> Option<PathBuf> {
    var(name).map(PathBuf::from).ok()
}

fn var_log_level(name: &str) -> Option<log::LevelFilter> {
    var(name).ok().and_then(|level| level.parse().ok())
}

fn var_false(name: &str) -> bool {
    var(name)
        .map(|val| val.to_lowercase())
        .map(|val| val == "false" || val == "0")
        .unwrap_or(false)
}

//! Error types: control-plane faults with stable integer codes, and the
//! spawn-path failures a subprocess records before entering BACKOFF.

use miette::Diagnostic;
use thiserror::Error;

/// A control-plane fault. The integer codes are part of the wire contract and
/// must never be renumbered.
#[derive(Debug, Clone, Error, Diagnostic, serde::Serialize, serde::Deserialize)]
pub enum Fault {
    #[error("unknown method")]
    UnknownMethod,
    #[error("incorrect parameters: {0}")]
    IncorrectParameters(String),
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error("signature unsupported")]
    SignatureUnsupported,
    #[error("supervisor is shutting down")]
    #[diagnostic(help("wait for the daemon to finish shutting down or restart it"))]
    ShutdownState,
    #[error("no such process or group: {0}")]
    BadName(String),
    #[error("bad signal: {0}")]
    BadSignal(String),
    #[error("no such file: {0}")]
    NoFile(String),
    #[error("not executable: {0}")]
    NotExecutable(String),
    #[error("{0}")]
    Failed(String),
    #[error("process terminated abnormally: {0}")]
    AbnormalTermination(String),
    #[error("spawn error: {0}")]
    SpawnError(String),
    #[error("already started: {0}")]
    AlreadyStarted(String),
    #[error("not running: {0}")]
    NotRunning(String),
    #[error("already added: {0}")]
    AlreadyAdded(String),
    #[error("still running: {0}")]
    StillRunning(String),
    #[error("cannot re-read config: {0}")]
    CantReread(String),
    #[error("process is disabled: {0}")]
    #[diagnostic(help("pass --force to start a disabled process"))]
    Disabled(String),
}

/// Code reported alongside a per-process success in group results.
pub const FAULT_SUCCESS: i32 = 80;

impl Fault {
    pub fn code(&self) -> i32 {
        match self {
            Fault::UnknownMethod => 1,
            Fault::IncorrectParameters(_) => 2,
            Fault::BadArguments(_) => 3,
            Fault::SignatureUnsupported => 4,
            Fault::ShutdownState => 6,
            Fault::BadName(_) => 10,
            Fault::BadSignal(_) => 11,
            Fault::NoFile(_) => 20,
            Fault::NotExecutable(_) => 21,
            Fault::Failed(_) => 30,
            Fault::AbnormalTermination(_) => 40,
            Fault::SpawnError(_) => 50,
            Fault::AlreadyStarted(_) => 60,
            Fault::NotRunning(_) => 70,
            Fault::AlreadyAdded(_) => 90,
            Fault::StillRunning(_) => 91,
            Fault::CantReread(_) => 92,
            Fault::Disabled(_) => 93,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Fault::UnknownMethod => "UNKNOWN_METHOD",
            Fault::IncorrectParameters(_) => "INCORRECT_PARAMETERS",
            Fault::BadArguments(_) => "BAD_ARGUMENTS",
            Fault::SignatureUnsupported => "SIGNATURE_UNSUPPORTED",
            Fault::ShutdownState => "SHUTDOWN_STATE",
            Fault::BadName(_) => "BAD_NAME",
            Fault::BadSignal(_) => "BAD_SIGNAL",
            Fault::NoFile(_) => "NO_FILE",
            Fault::NotExecutable(_) => "NOT_EXECUTABLE",
            Fault::Failed(_) => "FAILED",
            Fault::AbnormalTermination(_) => "ABNORMAL_TERMINATION",
            Fault::SpawnError(_) => "SPAWN_ERROR",
            Fault::AlreadyStarted(_) => "ALREADY_STARTED",
            Fault::NotRunning(_) => "NOT_RUNNING",
            Fault::AlreadyAdded(_) => "ALREADY_ADDED",
            Fault::StillRunning(_) => "STILL_RUNNING",
            Fault::CantReread(_) => "CANT_REREAD",
            Fault::Disabled(_) => "DISABLED",
        }
    }
}

/// Why a spawn attempt failed before (or at) fork/exec. Recorded on the
/// subprocess as `spawnerr` and surfaced over RPC as SPAWN_ERROR.
#[derive(Debug, Clone, Error)]
pub enum SpawnFailure {
    #[error("can't parse command {command:?}: {reason}")]
    BadCommand { command: String, reason: String },
    #[error("command is empty")]
    EmptyCommand,
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("not an executable file: {0}")]
    NotExecutable(String),
    #[error("too many open files to spawn {0}")]
    TooManyFiles(String),
    #[error("error making dispatchers for {name}: {reason}")]
    Dispatcher { name: String, reason: String },
    #[error("too many processes in process table to spawn {0}")]
    ProcessTableFull(String),
    #[error("error during fork for {name}: {reason}")]
    Fork { name: String, reason: String },
}

/// Configuration-file problems. Reload keeps the active configuration when
/// any of these surface.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file: {}", path.display())]
    #[diagnostic(code(warden::config::read_error))]
    ReadError {
        path: std::path::PathBuf,
        #[help]
        details: Option<String>,
    },

    #[error("failed to parse config file: {}", path.display())]
    #[diagnostic(code(warden::config::parse_error))]
    ParseError {
        path: std::path::PathBuf,
        #[help]
        details: Option<String>,
    },

    #[error("process {process} references unknown group {group}")]
    #[diagnostic(
        code(warden::config::unknown_group),
        help("declare [groups.{group}] or [pools.{group}] before referencing it")
    )]
    UnknownGroup { process: String, group: String },

    #[error("duplicate process name {0}")]
    #[diagnostic(code(warden::config::duplicate_name))]
    DuplicateName(String),

    #[error("detached process {0} has no pid_file")]
    #[diagnostic(
        code(warden::config::detached_needs_pid_file),
        help("run_detached processes are tracked through their pid file; set pid_file")
    )]
    DetachedNeedsPidFile(String),

    #[error("pool {pool} subscribes to unknown event type {event}")]
    #[diagnostic(code(warden::config::unknown_event))]
    UnknownEvent { pool: String, event: String },

    #[error("invalid stop signal {signal} for process {process}")]
    #[diagnostic(code(warden::config::bad_signal))]
    BadStopSignal { process: String, signal: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_codes_are_stable() {
        assert_eq!(Fault::UnknownMethod.code(), 1);
        assert_eq!(Fault::ShutdownState.code(), 6);
        assert_eq!(Fault::BadName("x".into()).code(), 10);
        assert_eq!(Fault::NoFile("x".into()).code(), 20);
        assert_eq!(Fault::NotExecutable("x".into()).code(), 21);
        assert_eq!(Fault::Failed("x".into()).code(), 30);
        assert_eq!(Fault::AbnormalTermination("x".into()).code(), 40);
        assert_eq!(Fault::SpawnError("x".into()).code(), 50);
        assert_eq!(Fault::AlreadyStarted("x".into()).code(), 60);
        assert_eq!(Fault::NotRunning("x".into()).code(), 70);
        assert_eq!(FAULT_SUCCESS, 80);
        assert_eq!(Fault::AlreadyAdded("x".into()).code(), 90);
        assert_eq!(Fault::StillRunning("x".into()).code(), 91);
        assert_eq!(Fault::CantReread("x".into()).code(), 92);
        assert_eq!(Fault::Disabled("x".into()).code(), 93);
    }

    #[test]
    fn fault_names_match_codes() {
        assert_eq!(Fault::BadSignal("HUP".into()).name(), "BAD_SIGNAL");
        assert_eq!(Fault::Disabled("x".into()).name(), "DISABLED");
        assert_eq!(Fault::CantReread("x".into()).name(), "CANT_REREAD");
    }
}

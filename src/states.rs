//! State catalog: the process, supervisor and event-listener state spaces,
//! their numeric codes, and the stopped/running partitions everything else
//! keys off.

use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIs,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessState {
    Disabled,
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
    Unknown,
}

impl ProcessState {
    pub fn code(self) -> i32 {
        match self {
            ProcessState::Disabled => -10,
            ProcessState::Stopped => 0,
            ProcessState::Starting => 10,
            ProcessState::Running => 20,
            ProcessState::Backoff => 30,
            ProcessState::Stopping => 40,
            ProcessState::Exited => 100,
            ProcessState::Fatal => 200,
            ProcessState::Unknown => 1000,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        ALL_PROCESS_STATES.iter().copied().find(|s| s.code() == code)
    }

    /// STOPPED, EXITED, FATAL, UNKNOWN.
    pub fn in_stopped_states(self) -> bool {
        matches!(
            self,
            ProcessState::Stopped
                | ProcessState::Exited
                | ProcessState::Fatal
                | ProcessState::Unknown
        )
    }

    /// The stopped partition plus DISABLED.
    pub fn in_all_stopped_states(self) -> bool {
        self.in_stopped_states() || self == ProcessState::Disabled
    }

    /// STARTING, RUNNING, BACKOFF.
    pub fn in_running_states(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Backoff
        )
    }
}

pub const ALL_PROCESS_STATES: &[ProcessState] = &[
    ProcessState::Disabled,
    ProcessState::Stopped,
    ProcessState::Starting,
    ProcessState::Running,
    ProcessState::Backoff,
    ProcessState::Stopping,
    ProcessState::Exited,
    ProcessState::Fatal,
    ProcessState::Unknown,
];

/// Top-level daemon mood. Anything below RUNNING means we are on the way out
/// and no new processes may be spawned.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIs,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SupervisorState {
    Fatal,
    Running,
    Restarting,
    Shutdown,
}

impl SupervisorState {
    pub fn code(self) -> i32 {
        match self {
            SupervisorState::Fatal => 2,
            SupervisorState::Running => 1,
            SupervisorState::Restarting => 0,
            SupervisorState::Shutdown => -1,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        [
            SupervisorState::Fatal,
            SupervisorState::Running,
            SupervisorState::Restarting,
            SupervisorState::Shutdown,
        ]
        .into_iter()
        .find(|s| s.code() == code)
    }

    /// True once a shutdown or restart has been requested.
    pub fn is_shutting_down(self) -> bool {
        self.code() < SupervisorState::Running.code()
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIs,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ListenerState {
    /// Ready to be sent an event.
    Ready,
    /// Processing an event we delivered.
    Busy,
    /// Reported a result; waiting for the next READY token.
    Acknowledged,
    /// Spoke something that isn't the protocol.
    Unknown,
}

impl ListenerState {
    pub fn code(self) -> i32 {
        match self {
            ListenerState::Ready => 10,
            ListenerState::Busy => 20,
            ListenerState::Acknowledged => 30,
            ListenerState::Unknown => 40,
        }
    }
}

/// Human-readable name for a process state code, if the code is known.
pub fn describe(code: i32) -> Option<String> {
    ProcessState::from_code(code).map(|s| s.to_string())
}

/// Inverse of [`describe`].
pub fn by_name(name: &str) -> Option<i32> {
    name.parse::<ProcessState>().ok().map(|s| s.code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for state in ALL_PROCESS_STATES {
            assert_eq!(ProcessState::from_code(state.code()), Some(*state));
        }
        assert_eq!(ProcessState::from_code(42), None);
    }

    #[test]
    fn describe_and_by_name() {
        assert_eq!(describe(10).as_deref(), Some("STARTING"));
        assert_eq!(describe(-10).as_deref(), Some("DISABLED"));
        assert_eq!(describe(7), None);
        assert_eq!(by_name("FATAL"), Some(200));
        assert_eq!(by_name("BOGUS"), None);
    }

    #[test]
    fn partitions() {
        use ProcessState::*;
        for s in [Stopped, Exited, Fatal, Unknown] {
            assert!(s.in_stopped_states());
            assert!(s.in_all_stopped_states());
            assert!(!s.in_running_states());
        }
        assert!(!Disabled.in_stopped_states());
        assert!(Disabled.in_all_stopped_states());
        for s in [Starting, Running, Backoff] {
            assert!(s.in_running_states());
            assert!(!s.in_all_stopped_states());
        }
        assert!(!Stopping.in_running_states());
        assert!(!Stopping.in_all_stopped_states());
    }

    #[test]
    fn mood_ordering() {
        assert!(SupervisorState::Shutdown.is_shutting_down());
        assert!(SupervisorState::Restarting.is_shutting_down());
        assert!(!SupervisorState::Running.is_shutting_down());
        assert!(!SupervisorState::Fatal.is_shutting_down());
        assert_eq!(SupervisorState::from_code(-1), Some(SupervisorState::Shutdown));
    }
}

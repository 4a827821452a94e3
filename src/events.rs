//! Typed lifecycle events and the in-process bus.
//!
//! Event kinds form a closed enum; the abstract-base-class matching of the
//! classic supervisor becomes category membership. Payloads are rendered
//! eagerly at construction so later pid/state changes cannot alter what a
//! listener sees. `notify` enqueues; the supervisor routes the queue to
//! subscribed listener pools between transitions, which keeps every mutation
//! on the scheduler thread.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::VecDeque;

/// Markers a child brackets payloads with on stdout/stderr to emit a
/// process-communication event.
pub const COMM_BEGIN_TOKEN: &str = "<!--XSUPERVISOR:BEGIN-->";
pub const COMM_END_TOKEN: &str = "<!--XSUPERVISOR:END-->";

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
)]
pub enum EventKind {
    #[strum(serialize = "PROCESS_STATE_DISABLED")]
    ProcessStateDisabled,
    #[strum(serialize = "PROCESS_STATE_STOPPED")]
    ProcessStateStopped,
    #[strum(serialize = "PROCESS_STATE_STARTING")]
    ProcessStateStarting,
    #[strum(serialize = "PROCESS_STATE_RUNNING")]
    ProcessStateRunning,
    #[strum(serialize = "PROCESS_STATE_BACKOFF")]
    ProcessStateBackoff,
    #[strum(serialize = "PROCESS_STATE_STOPPING")]
    ProcessStateStopping,
    #[strum(serialize = "PROCESS_STATE_EXITED")]
    ProcessStateExited,
    #[strum(serialize = "PROCESS_STATE_FATAL")]
    ProcessStateFatal,
    #[strum(serialize = "PROCESS_STATE_UNKNOWN")]
    ProcessStateUnknown,
    #[strum(serialize = "PROCESS_COMMUNICATION_STDOUT")]
    ProcessCommunicationStdout,
    #[strum(serialize = "PROCESS_COMMUNICATION_STDERR")]
    ProcessCommunicationStderr,
    #[strum(serialize = "PROCESS_LOG_STDOUT")]
    ProcessLogStdout,
    #[strum(serialize = "PROCESS_LOG_STDERR")]
    ProcessLogStderr,
    #[strum(serialize = "REMOTE_COMMUNICATION")]
    RemoteCommunication,
    #[strum(serialize = "SUPERVISOR_STATE_CHANGE_RUNNING")]
    SupervisorStateChangeRunning,
    #[strum(serialize = "SUPERVISOR_STATE_CHANGE_STOPPING")]
    SupervisorStateChangeStopping,
    #[strum(serialize = "TICK_5")]
    Tick5,
    #[strum(serialize = "TICK_60")]
    Tick60,
    #[strum(serialize = "TICK_3600")]
    Tick3600,
    #[strum(serialize = "PROCESS_GROUP_ADDED")]
    ProcessGroupAdded,
    #[strum(serialize = "PROCESS_GROUP_REMOVED")]
    ProcessGroupRemoved,
}

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
)]
pub enum EventCategory {
    /// Every event.
    #[strum(serialize = "EVENT")]
    Event,
    #[strum(serialize = "PROCESS_STATE")]
    ProcessState,
    #[strum(serialize = "PROCESS_COMMUNICATION")]
    ProcessCommunication,
    #[strum(serialize = "PROCESS_LOG")]
    ProcessLog,
    #[strum(serialize = "SUPERVISOR_STATE_CHANGE")]
    SupervisorStateChange,
    #[strum(serialize = "TICK")]
    Tick,
    #[strum(serialize = "PROCESS_GROUP")]
    ProcessGroup,
}

impl EventKind {
    pub fn in_category(self, category: EventCategory) -> bool {
        use EventKind::*;
        match category {
            EventCategory::Event => true,
            EventCategory::ProcessState => matches!(
                self,
                ProcessStateDisabled
                    | ProcessStateStopped
                    | ProcessStateStarting
                    | ProcessStateRunning
                    | ProcessStateBackoff
                    | ProcessStateStopping
                    | ProcessStateExited
                    | ProcessStateFatal
                    | ProcessStateUnknown
            ),
            EventCategory::ProcessCommunication => {
                matches!(self, ProcessCommunicationStdout | ProcessCommunicationStderr)
            }
            EventCategory::ProcessLog => matches!(self, ProcessLogStdout | ProcessLogStderr),
            EventCategory::SupervisorStateChange => {
                matches!(self, SupervisorStateChangeRunning | SupervisorStateChangeStopping)
            }
            EventCategory::Tick => matches!(self, Tick5 | Tick60 | Tick3600),
            EventCategory::ProcessGroup => {
                matches!(self, ProcessGroupAdded | ProcessGroupRemoved)
            }
        }
    }
}

/// One pool subscription entry: either a concrete kind or a whole category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSubscription {
    Kind(EventKind),
    Category(EventCategory),
}

impl EventSubscription {
    /// Parse a subscription name as written in the config file. Category
    /// names win over kind names, mirroring the abstract-type subscription
    /// semantics of the original.
    pub fn from_name(name: &str) -> Option<Self> {
        if let Ok(category) = name.parse::<EventCategory>() {
            return Some(EventSubscription::Category(category));
        }
        name.parse::<EventKind>().ok().map(EventSubscription::Kind)
    }

    pub fn matches(self, kind: EventKind) -> bool {
        match self {
            EventSubscription::Kind(k) => k == kind,
            EventSubscription::Category(c) => kind.in_category(c),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    /// Global serial, assigned when the event is first accepted by any pool.
    pub serial: Option<u32>,
    /// Per-pool serial, assigned when the event enters that pool's buffer.
    pub pool_serials: HashMap<String, u32>,
    pub payload: String,
}

impl Event {
    pub fn new(kind: EventKind, payload: String) -> Self {
        Self {
            kind,
            serial: None,
            pool_serials: HashMap::new(),
            payload,
        }
    }

    /// The envelope written to a listener child's stdin. The format is a wire
    /// contract; see the listener protocol docs.
    pub fn envelope(&self, identifier: &str, pool: &str) -> String {
        let serial = self.serial.unwrap_or(0);
        let pool_serial = self.pool_serials.get(pool).copied().unwrap_or(0);
        format!(
            "ver:3.0 server:{identifier} serial:{serial} pool:{pool} poolserial:{pool_serial} \
             eventname:{} len:{}\n{}",
            self.kind,
            self.payload.len(),
            self.payload
        )
    }
}

/// Payload builders. These render the space-separated key:value forms the
/// listener protocol requires.
pub fn process_state_payload(
    processname: &str,
    groupname: &str,
    from_state: crate::states::ProcessState,
    extras: &[(&str, String)],
) -> String {
    let mut parts = vec![
        format!("processname:{processname}"),
        format!("groupname:{groupname}"),
        format!("from_state:{from_state}"),
    ];
    for (name, val) in extras {
        parts.push(format!("{name}:{val}"));
    }
    parts.join(" ")
}

pub fn process_log_payload(
    processname: &str,
    groupname: &str,
    pid: u32,
    channel: &str,
    data: &str,
) -> String {
    format!("processname:{processname} groupname:{groupname} pid:{pid} channel:{channel}\n{data}")
}

pub fn process_comm_payload(processname: &str, groupname: &str, pid: u32, data: &str) -> String {
    format!("processname:{processname} groupname:{groupname} pid:{pid}\n{data}")
}

pub fn remote_comm_payload(kind: &str, data: &str) -> String {
    format!("type:{kind}\n{data}")
}

pub fn group_payload(groupname: &str) -> String {
    format!("groupname:{groupname}\n")
}

pub fn tick_payload(when: i64) -> String {
    format!("when:{when}")
}

/// Monotonic serial source wrapping at the ceiling.
#[derive(Debug)]
pub struct SerialAllocator {
    next: u32,
    ceiling: u32,
}

impl Default for SerialAllocator {
    fn default() -> Self {
        Self::new(u32::MAX)
    }
}

impl SerialAllocator {
    pub fn new(ceiling: u32) -> Self {
        Self { next: 0, ceiling }
    }

    pub fn next(&mut self) -> u32 {
        let serial = self.next;
        self.next = if serial == self.ceiling { 0 } else { serial + 1 };
        serial
    }
}

/// An entry on the bus queue. Rejection notices are not events: they carry no
/// serial and are only consumed by the pool that owns the rejecting process.
#[derive(Debug)]
pub enum BusItem {
    Event(Event),
    Rejected {
        group: String,
        process: String,
        event: Event,
    },
}

/// The process-wide bus, owned by the supervisor (no module-level state).
#[derive(Debug, Default)]
pub struct EventBus {
    queue: VecDeque<BusItem>,
    serial: SerialAllocator,
}

impl EventBus {
    pub fn notify(&mut self, event: Event) {
        self.queue.push_back(BusItem::Event(event));
    }

    /// Report that `process` died (or answered FAIL) while holding `event`,
    /// so the owning pool can rebuffer it.
    pub fn notify_rejected(&mut self, group: &str, process: &str, event: Event) {
        self.queue.push_back(BusItem::Rejected {
            group: group.to_string(),
            process: process.to_string(),
            event,
        });
    }

    pub fn drain(&mut self) -> Vec<BusItem> {
        self.queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Allocate the global serial for an event entering its first pool.
    pub fn next_serial(&mut self) -> u32 {
        self.serial.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::ProcessState;

    #[test]
    fn envelope_format_is_exact() {
        let mut ev = Event::new(
            EventKind::ProcessStateStarting,
            process_state_payload("rx", "radio", ProcessState::Stopped, &[("tries", "0".into())]),
        );
        ev.serial = Some(4);
        ev.pool_serials.insert("audit".to_string(), 1);
        assert_eq!(
            ev.envelope("warden", "audit"),
            "ver:3.0 server:warden serial:4 pool:audit poolserial:1 \
             eventname:PROCESS_STATE_STARTING len:57\n\
             processname:rx groupname:radio from_state:STOPPED tries:0"
        );
    }

    #[test]
    fn kind_names() {
        assert_eq!(EventKind::Tick5.to_string(), "TICK_5");
        assert_eq!(EventKind::Tick3600.to_string(), "TICK_3600");
        assert_eq!(
            EventKind::ProcessStateExited.to_string(),
            "PROCESS_STATE_EXITED"
        );
        assert_eq!(
            "PROCESS_GROUP_REMOVED".parse::<EventKind>().ok(),
            Some(EventKind::ProcessGroupRemoved)
        );
    }

    #[test]
    fn category_matching() {
        assert!(EventKind::ProcessStateBackoff.in_category(EventCategory::ProcessState));
        assert!(EventKind::ProcessStateBackoff.in_category(EventCategory::Event));
        assert!(!EventKind::Tick60.in_category(EventCategory::ProcessState));

        let sub = EventSubscription::from_name("PROCESS_STATE").unwrap();
        assert!(sub.matches(EventKind::ProcessStateFatal));
        assert!(!sub.matches(EventKind::Tick5));

        let sub = EventSubscription::from_name("TICK_60").unwrap();
        assert_eq!(sub, EventSubscription::Kind(EventKind::Tick60));
        assert!(EventSubscription::from_name("NO_SUCH_EVENT").is_none());
    }

    #[test]
    fn serial_allocator_wraps_at_ceiling() {
        let mut alloc = SerialAllocator::new(2);
        assert_eq!(alloc.next(), 0);
        assert_eq!(alloc.next(), 1);
        assert_eq!(alloc.next(), 2);
        assert_eq!(alloc.next(), 0);
    }

    #[test]
    fn bus_queues_in_order() {
        let mut bus = EventBus::default();
        bus.notify(Event::new(EventKind::Tick5, tick_payload(5)));
        bus.notify(Event::new(EventKind::Tick60, tick_payload(60)));
        let items = bus.drain();
        assert_eq!(items.len(), 2);
        assert!(bus.is_empty());
        match &items[0] {
            BusItem::Event(ev) => assert_eq!(ev.kind, EventKind::Tick5),
            _ => panic!("expected event"),
        }
    }
}

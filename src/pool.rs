//! Event-listener pools: bounded buffering and at-most-one-inflight-per-
//! listener delivery of bus events to listener children.
//!
//! A pool rides along inside its ProcessGroup (composition, not a subclass).
//! The supervisor routes matching bus events into `accept_event`; the group
//! tick calls `tick` which dispatches the oldest buffered event to the first
//! READY member. Rejected events are rebuffered at the head so only the
//! rejected event keeps its causal position.

use crate::config::PoolSettings;
use crate::env;
use crate::events::{Event, EventKind, SerialAllocator};
use crate::process::Subprocess;
use crate::states::{ListenerState, ProcessState};
use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug)]
pub struct ListenerPool {
    pub name: String,
    settings: PoolSettings,
    pub event_buffer: VecDeque<Event>,
    serial: SerialAllocator,
    last_dispatch: Option<Instant>,
}

impl ListenerPool {
    pub fn new(name: &str, settings: PoolSettings) -> Self {
        Self {
            name: name.to_string(),
            settings,
            event_buffer: VecDeque::new(),
            serial: SerialAllocator::default(),
            last_dispatch: None,
        }
    }

    /// Does this pool subscribe to events of `kind`?
    pub fn wants(&self, kind: EventKind) -> bool {
        self.settings.events.iter().any(|sub| sub.matches(kind))
    }

    /// Buffer an event, assigning its serial for this pool on first entry.
    /// A full buffer discards the oldest event with an error log; that is the
    /// only way an accepted event can be lost.
    pub fn accept_event(&mut self, mut event: Event, head: bool) {
        if event.pool_serials.contains_key(&self.name) {
            debug!(
                "rebuffering event {:?} for pool {} (buf size={}, max={})",
                event.serial,
                self.name,
                self.event_buffer.len(),
                self.settings.buffer_size
            );
        } else {
            let serial = self.serial.next();
            event.pool_serials.insert(self.name.clone(), serial);
        }

        if self.event_buffer.len() >= self.settings.buffer_size
            && let Some(discarded) = self.event_buffer.pop_front()
        {
            error!(
                "pool {} event buffer overflowed, discarding event {:?}",
                self.name, discarded.serial
            );
        }
        if head {
            self.event_buffer.push_front(event);
        } else {
            self.event_buffer.push_back(event);
        }
    }

    /// A listener (ours) rejected an event: back to the head of the buffer.
    pub fn handle_rejected(&mut self, event: Event) {
        self.accept_event(event, true);
    }

    /// Per-tick dispatch: runs after members have transitioned. Honors the
    /// dispatch throttle and stops at the first event nobody will take.
    pub fn tick(&mut self, processes: &mut [Subprocess]) {
        let dispatch_capable = processes.iter().any(|p| {
            p.state == ProcessState::Running && p.listener_state == Some(ListenerState::Ready)
        });
        if !dispatch_capable {
            return;
        }
        if !self.settings.dispatch_throttle.is_zero()
            && let Some(last) = self.last_dispatch
            && last.elapsed() < self.settings.dispatch_throttle
        {
            return;
        }
        self.dispatch(processes);
    }

    fn dispatch(&mut self, processes: &mut [Subprocess]) {
        while let Some(event) = self.event_buffer.pop_front() {
            match self.dispatch_event(event, processes) {
                Ok(()) => {}
                Err(event) => {
                    // nobody READY took it; rebuffer and stop for this tick
                    self.accept_event(event, true);
                    break;
                }
            }
        }
        self.last_dispatch = Some(Instant::now());
    }

    /// Write the envelope to the first READY member's stdin. EPIPE moves on
    /// to the next member; no taker hands the event back.
    fn dispatch_event(&mut self, event: Event, processes: &mut [Subprocess]) -> Result<(), Event> {
        for process in processes.iter_mut() {
            if process.state != ProcessState::Running
                || process.listener_state != Some(ListenerState::Ready)
            {
                continue;
            }
            let envelope = event.envelope(&env::WARDEN_IDENTIFIER, &self.name);
            if process.write(envelope.as_bytes()).is_err() {
                continue;
            }
            process.listener_state = Some(ListenerState::Busy);
            debug!(
                "event {:?} sent to listener {}",
                event.serial, process.config.name
            );
            process.event = Some(event);
            return Ok(());
        }
        Err(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventCategory, EventSubscription, tick_payload};
    use std::time::Duration;

    fn pool(buffer_size: usize) -> ListenerPool {
        ListenerPool::new(
            "audit",
            PoolSettings {
                events: vec![EventSubscription::Category(EventCategory::ProcessState)],
                buffer_size,
                dispatch_throttle: Duration::ZERO,
            },
        )
    }

    fn event(n: u32) -> Event {
        let mut ev = Event::new(EventKind::ProcessStateStarting, format!("payload{n}"));
        ev.serial = Some(n);
        ev
    }

    #[test]
    fn subscription_matching() {
        let pool = pool(4);
        assert!(pool.wants(EventKind::ProcessStateFatal));
        assert!(!pool.wants(EventKind::Tick60));
    }

    #[test]
    fn pool_serials_are_monotonic() {
        let mut pool = pool(8);
        for n in 0..4 {
            pool.accept_event(event(n), false);
        }
        let serials: Vec<_> = pool
            .event_buffer
            .iter()
            .map(|ev| ev.pool_serials["audit"])
            .collect();
        assert_eq!(serials, vec![0, 1, 2, 3]);
    }

    #[test]
    fn rebuffering_keeps_the_pool_serial() {
        let mut pool = pool(8);
        pool.accept_event(event(0), false);
        pool.accept_event(event(1), false);
        let first = pool.event_buffer.pop_front().unwrap();
        assert_eq!(first.pool_serials["audit"], 0);
        pool.handle_rejected(first);
        // back at the head, same serial, no new allocation
        assert_eq!(pool.event_buffer[0].pool_serials["audit"], 0);
        assert_eq!(pool.event_buffer[1].pool_serials["audit"], 1);
        pool.accept_event(event(2), false);
        assert_eq!(pool.event_buffer[2].pool_serials["audit"], 2);
    }

    #[test]
    fn overflow_discards_oldest() {
        let mut pool = pool(2);
        pool.accept_event(event(1), false);
        pool.accept_event(event(2), false);
        pool.accept_event(event(3), false);
        let serials: Vec<_> = pool.event_buffer.iter().map(|ev| ev.serial).collect();
        assert_eq!(serials, vec![Some(2), Some(3)]);
    }

    #[test]
    fn throttle_blocks_dispatch() {
        let mut pool = ListenerPool::new(
            "audit",
            PoolSettings {
                events: vec![EventSubscription::Category(EventCategory::Event)],
                buffer_size: 4,
                dispatch_throttle: Duration::from_secs(3600),
            },
        );
        pool.last_dispatch = Some(Instant::now());
        pool.accept_event(event(1), false);

        let mut config: crate::config::ProcessConfig =
            toml::from_str("command = \"/bin/true\"").unwrap();
        config.name = "l1".to_string();
        let mut listener = Subprocess::new(config, "audit", true);
        listener.state = ProcessState::Running;
        listener.listener_state = Some(ListenerState::Ready);

        pool.tick(std::slice::from_mut(&mut listener));
        // throttled: nothing was dispatched
        assert_eq!(pool.event_buffer.len(), 1);
        assert_eq!(listener.listener_state, Some(ListenerState::Ready));
    }

    #[test]
    fn no_ready_member_rebuffers_at_head() {
        let mut pool = pool(4);
        pool.accept_event(event(1), false);
        pool.accept_event(event(2), false);

        let mut config: crate::config::ProcessConfig =
            toml::from_str("command = \"/bin/true\"").unwrap();
        config.name = "l1".to_string();
        let mut listener = Subprocess::new(config, "audit", true);
        listener.state = ProcessState::Running;
        listener.listener_state = Some(ListenerState::Busy);

        pool.dispatch(std::slice::from_mut(&mut listener));
        // order preserved: the undeliverable head went back to the head
        let serials: Vec<_> = pool.event_buffer.iter().map(|ev| ev.serial).collect();
        assert_eq!(serials, vec![Some(1), Some(2)]);
    }
}

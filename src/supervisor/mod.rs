//! The supervisor: owns the process groups, the event bus and the scheduler.
//!
//! Split into focused submodules:
//! - `reload`: config re-read, diff and group add/remove/update
//!
//! Everything that mutates supervisor state runs on the tick loop in `run`,
//! which multiplexes the timer, signal streams and IPC requests. One tick =
//! due tick events, reap, I/O drain, group transitions in priority order,
//! then deferred-RPC polling.

mod reload;

use crate::config::GroupConfig;
use crate::events::{self, BusItem, Event, EventBus, EventKind};
use crate::group::ProcessGroup;
use crate::ipc::server::IpcServer;
use crate::ipc::IpcResponse;
use crate::rpc::{self, Deferred, DeferredPoll, RpcOutcome};
use crate::states::SupervisorState;
use crate::{env, logger, Result};
use indexmap::IndexMap;
use miette::IntoDiagnostic;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc::Sender;
use tokio::time::{self, MissedTickBehavior};

const TICK_PERIODS: [i64; 3] = [5, 60, 3600];

pub struct Supervisor {
    pub groups: IndexMap<String, ProcessGroup>,
    /// Last-loaded group configs; `reload_config` replaces these without
    /// touching the active groups.
    pub group_configs: Vec<GroupConfig>,
    pub bus: EventBus,
    pub mood: SupervisorState,
    stopping: bool,
    tick_slots: [i64; 3],
    deferreds: Vec<PendingDeferred>,
}

struct PendingDeferred {
    deferred: Deferred,
    reply: Sender<IpcResponse>,
    next_poll: Instant,
}

impl Supervisor {
    pub fn new(group_configs: Vec<GroupConfig>) -> Self {
        let now = chrono::Utc::now().timestamp();
        let mut sup = Self {
            groups: IndexMap::new(),
            group_configs: group_configs.clone(),
            bus: EventBus::default(),
            mood: SupervisorState::Running,
            stopping: false,
            tick_slots: TICK_PERIODS.map(|p| now / p),
            deferreds: vec![],
        };
        for config in group_configs {
            sup.add_process_group(config);
        }
        sup
    }

    /// Run until shutdown or restart is requested and every process has
    /// reached a stopped state. Returns the final mood.
    pub async fn run(&mut self, mut ipc: IpcServer) -> Result<SupervisorState> {
        info!("supervisor running with pid {}", std::process::id());
        self.bus.notify(Event::new(
            EventKind::SupervisorStateChangeRunning,
            String::new(),
        ));

        let mut term = signal(SignalKind::terminate()).into_diagnostic()?;
        let mut int = signal(SignalKind::interrupt()).into_diagnostic()?;
        let mut quit = signal(SignalKind::quit()).into_diagnostic()?;
        let mut hup = signal(SignalKind::hangup()).into_diagnostic()?;
        let mut usr2 = signal(SignalKind::user_defined2()).into_diagnostic()?;
        let mut chld = signal(SignalKind::child()).into_diagnostic()?;

        let mut interval = time::interval(Duration::from_millis(*env::WARDEN_TICK_MS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(),
                _ = term.recv() => self.request_shutdown("SIGTERM"),
                _ = int.recv() => self.request_shutdown("SIGINT"),
                _ = quit.recv() => self.request_shutdown("SIGQUIT"),
                _ = hup.recv() => {
                    info!("received SIGHUP, re-reading config");
                    match self.reload_config() {
                        Ok((added, changed, removed)) => info!(
                            "config re-read: added {added:?} changed {changed:?} removed {removed:?}"
                        ),
                        Err(e) => error!("config re-read failed: {e}"),
                    }
                }
                _ = usr2.recv() => {
                    info!("received SIGUSR2, reopening log files");
                    self.reopen_logs();
                }
                _ = chld.recv() => self.reap(),
                Some((req, reply)) = ipc.read() => self.handle_request(req, reply),
            }

            if self.mood.is_shutting_down() {
                if !self.stopping {
                    self.stopping = true;
                    self.bus.notify(Event::new(
                        EventKind::SupervisorStateChangeStopping,
                        String::new(),
                    ));
                    self.stop_groups();
                }
                if self.all_stopped() {
                    break;
                }
            }
        }

        self.reap();
        info!("supervisor stopped, final mood {}", self.mood);
        Ok(self.mood)
    }

    fn request_shutdown(&mut self, why: &str) {
        info!("received {why}, shutting down");
        self.mood = SupervisorState::Shutdown;
    }

    /// One scheduler pass.
    pub fn tick(&mut self) {
        self.send_tick_events();
        self.reap();
        self.drain_io();
        self.route_events();

        let mood = self.mood;
        let order = self.group_order(false);
        {
            let Self { groups, bus, .. } = self;
            for name in &order {
                if let Some(group) = groups.get_mut(name) {
                    group.transition(mood, bus);
                }
            }
        }
        self.route_events();
        self.poll_deferreds();
    }

    /// Group names in priority order (reverse for stopping).
    fn group_order(&self, reverse: bool) -> Vec<String> {
        let mut names: Vec<(i32, String)> = self
            .groups
            .values()
            .map(|g| (g.config.priority, g.config.name.clone()))
            .collect();
        names.sort();
        if reverse {
            names.reverse();
        }
        names.into_iter().map(|(_, name)| name).collect()
    }

    fn send_tick_events(&mut self) {
        let now = chrono::Utc::now().timestamp();
        for (i, period) in TICK_PERIODS.iter().enumerate() {
            let slot = now / period;
            if self.tick_slots[i] != slot {
                self.tick_slots[i] = slot;
                let kind = match *period {
                    5 => EventKind::Tick5,
                    60 => EventKind::Tick60,
                    _ => EventKind::Tick3600,
                };
                let when = slot * period;
                self.bus.notify(Event::new(kind, events::tick_payload(when)));
            }
        }
    }

    /// Non-blocking reap of every exited child.
    pub fn reap(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.finish_pid(pid.as_raw() as u32, code, &format!("exit status {code}"));
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.finish_pid(pid.as_raw() as u32, -1, &format!("terminated by {sig}"));
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(e) => {
                    warn!("waitpid failed: {e}");
                    break;
                }
            }
        }
    }

    fn finish_pid(&mut self, pid: u32, es: i32, msg: &str) {
        let mood = self.mood;
        let Self { groups, bus, .. } = self;
        for group in groups.values_mut() {
            if let Some(proc) = group.by_pid_mut(pid) {
                proc.finish(es, msg, mood, bus);
                return;
            }
        }
        debug!("reaped unknown pid {pid}");
    }

    fn drain_io(&mut self) {
        let Self { groups, bus, .. } = self;
        for group in groups.values_mut() {
            for proc in &mut group.processes {
                if proc.pid != 0 {
                    proc.drain(bus);
                }
            }
        }
    }

    /// Deliver queued bus items to subscribed listener pools. The global
    /// serial is allocated once per event, before it fans out.
    pub fn route_events(&mut self) {
        for item in self.bus.drain() {
            match item {
                BusItem::Event(mut event) => {
                    let takers: Vec<String> = self
                        .groups
                        .values()
                        .filter(|g| g.pool.as_ref().is_some_and(|p| p.wants(event.kind)))
                        .map(|g| g.config.name.clone())
                        .collect();
                    if takers.is_empty() {
                        continue;
                    }
                    if event.serial.is_none() {
                        event.serial = Some(self.bus.next_serial());
                    }
                    let last = takers.len() - 1;
                    let mut event = Some(event);
                    for (i, name) in takers.iter().enumerate() {
                        let ev = if i == last {
                            event.take().unwrap()
                        } else {
                            event.as_ref().unwrap().clone()
                        };
                        if let Some(pool) =
                            self.groups.get_mut(name).and_then(|g| g.pool.as_mut())
                        {
                            pool.accept_event(ev, false);
                        }
                    }
                }
                BusItem::Rejected {
                    group,
                    process,
                    event,
                } => {
                    if let Some(g) = self.groups.get_mut(&group) {
                        let is_member = g.by_name(&process).is_some();
                        if is_member && let Some(pool) = g.pool.as_mut() {
                            pool.handle_rejected(event);
                        }
                    }
                }
            }
        }
    }

    /// Stop every group, lowest priority last.
    pub fn stop_groups(&mut self) {
        let shutting_down = self.mood.is_shutting_down();
        let order = self.group_order(true);
        let Self { groups, bus, .. } = self;
        for name in &order {
            if let Some(group) = groups.get_mut(name) {
                group.stop_all(shutting_down, bus);
            }
        }
    }

    pub fn all_stopped(&self) -> bool {
        self.groups.values().all(|g| g.unstopped().is_empty())
    }

    /// Run `f` with a process and the bus borrowed together.
    pub fn with_process<R>(
        &mut self,
        group: &str,
        name: &str,
        f: impl FnOnce(&mut crate::process::Subprocess, &mut EventBus) -> R,
    ) -> Option<R> {
        let Self { groups, bus, .. } = self;
        let proc = groups.get_mut(group)?.by_name_mut(name)?;
        Some(f(proc, bus))
    }

    fn reopen_logs(&mut self) {
        logger::reopen_file();
        for group in self.groups.values_mut() {
            for proc in &mut group.processes {
                proc.reopen_logs();
            }
        }
    }

    fn handle_request(&mut self, req: crate::ipc::IpcRequest, reply: Sender<IpcResponse>) {
        debug!("handling request: {req}");
        match rpc::dispatch(self, req) {
            Ok(RpcOutcome::Done(rsp)) => {
                tokio::spawn(async move {
                    let _ = reply.send(rsp).await;
                });
            }
            Ok(RpcOutcome::Deferred(deferred)) => {
                let next_poll = Instant::now() + deferred.delay;
                self.deferreds.push(PendingDeferred {
                    deferred,
                    reply,
                    next_poll,
                });
            }
            Err(fault) => {
                let rsp = IpcResponse::from_fault(&fault);
                tokio::spawn(async move {
                    let _ = reply.send(rsp).await;
                });
            }
        }
    }

    /// Step every due deferred; completed ones reply to their caller.
    fn poll_deferreds(&mut self) {
        if self.deferreds.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.deferreds);
        let mut still_pending = vec![];
        for mut pd in pending {
            if Instant::now() < pd.next_poll {
                still_pending.push(pd);
                continue;
            }
            match (pd.deferred.step)(self) {
                DeferredPoll::NotDone => {
                    pd.next_poll = Instant::now() + pd.deferred.delay;
                    still_pending.push(pd);
                }
                DeferredPoll::Done(rsp) => {
                    let reply = pd.reply;
                    tokio::spawn(async move {
                        let _ = reply.send(rsp).await;
                    });
                }
            }
        }
        self.deferreds.extend(still_pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::states::ProcessState;

    fn load(toml: &str) -> Vec<GroupConfig> {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), toml).unwrap();
        config::load(file.path()).unwrap()
    }

    fn sup() -> Supervisor {
        Supervisor::new(load(
            r#"
[pools.audit]
events = ["PROCESS_STATE"]
buffer_size = 4

[processes.listener0]
group = "audit"
command = "/bin/true"
autostart = false

[processes.app]
command = "/bin/true"
autostart = false
"#,
        ))
    }

    #[test]
    fn adding_groups_emits_group_added_events() {
        let mut sup = sup();
        let kinds: Vec<_> = sup
            .bus
            .drain()
            .into_iter()
            .filter_map(|item| match item {
                BusItem::Event(ev) => Some(ev.kind),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::ProcessGroupAdded, EventKind::ProcessGroupAdded]
        );
    }

    #[test]
    fn routing_assigns_global_serials_in_order() {
        let mut sup = sup();
        sup.route_events(); // flush group-added noise
        let mut ev1 = Event::new(EventKind::ProcessStateStarting, "one".to_string());
        ev1.serial = None;
        sup.bus.notify(ev1);
        sup.bus
            .notify(Event::new(EventKind::ProcessStateStopped, "two".to_string()));
        sup.route_events();
        let pool = sup.groups["audit"].pool.as_ref().unwrap();
        let serials: Vec<_> = pool.event_buffer.iter().map(|ev| ev.serial).collect();
        assert_eq!(serials, vec![Some(0), Some(1)]);
    }

    #[test]
    fn events_without_subscribers_are_dropped() {
        let mut sup = sup();
        sup.route_events();
        sup.bus
            .notify(Event::new(EventKind::Tick60, "when:60".to_string()));
        sup.route_events();
        let pool = sup.groups["audit"].pool.as_ref().unwrap();
        assert!(pool.event_buffer.is_empty());
    }

    #[test]
    fn rejected_events_rebuffer_into_owning_pool() {
        let mut sup = sup();
        sup.route_events();
        let mut ev = Event::new(EventKind::ProcessStateStarting, "payload".to_string());
        ev.serial = Some(9);
        ev.pool_serials.insert("audit".to_string(), 3);
        sup.bus.notify_rejected("audit", "listener0", ev);
        sup.route_events();
        let pool = sup.groups["audit"].pool.as_ref().unwrap();
        assert_eq!(pool.event_buffer.len(), 1);
        assert_eq!(pool.event_buffer[0].pool_serials["audit"], 3);
    }

    #[test]
    fn stop_groups_and_all_stopped() {
        let mut sup = sup();
        assert!(sup.all_stopped());
        sup.groups
            .get_mut("app")
            .unwrap()
            .by_name_mut("app")
            .unwrap()
            .state = ProcessState::Backoff;
        assert!(!sup.all_stopped());
        sup.mood = SupervisorState::Shutdown;
        sup.stop_groups();
        // BACKOFF members give up immediately under stop-all
        assert!(sup.all_stopped());
    }

    #[test]
    fn tick_events_fire_when_slots_roll() {
        let mut sup = sup();
        sup.route_events();
        // force every slot to look stale
        sup.tick_slots = [0, 0, 0];
        sup.send_tick_events();
        let kinds: Vec<_> = sup
            .bus
            .drain()
            .into_iter()
            .filter_map(|item| match item {
                BusItem::Event(ev) => Some(ev.kind),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::Tick5, EventKind::Tick60, EventKind::Tick3600]
        );
    }
}

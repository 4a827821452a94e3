//! A single supervised child: state machine, timers, signals and reaping.
//!
//! Every state assignment goes through `change_state`, which emits the
//! matching lifecycle event atomically with the transition. Time-based moves
//! (STARTING→RUNNING, BACKOFF retry, STOPPING→SIGKILL) happen in
//! `transition`, which the scheduler calls on every tick.

pub mod detached;
mod dispatcher;
pub mod spawn;

pub use dispatcher::{Channel, Dispatchers, InputDispatcher, OutputDispatcher, OutputEvent};

use crate::config::ProcessConfig;
use crate::events::{self, Event, EventBus, EventKind};
use crate::states::{ListenerState, ProcessState, SupervisorState};
use chrono::{DateTime, Local};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// Parse a signal by name ("TERM", "SIGTERM") or number.
pub fn signal_by_name(name: &str) -> Option<Signal> {
    let name = name.trim();
    if let Ok(num) = name.parse::<i32>() {
        return Signal::try_from(num).ok();
    }
    let upper = name.to_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    full.parse().ok()
}

#[derive(Debug)]
pub struct Subprocess {
    pub config: ProcessConfig,
    pub group_name: String,
    pub state: ProcessState,
    /// 0 when not running. For detached processes this is the shepherd's pid.
    pub pid: u32,
    pub laststart: Option<DateTime<Local>>,
    pub laststop: Option<DateTime<Local>>,
    /// Monotonic start instant; all duration math uses this, not wall clock.
    pub started_at: Option<Instant>,
    laststopreport: Option<Instant>,
    /// When set, the next timed transition becomes eligible at this instant.
    pub delay: Option<Instant>,
    pub backoff: u32,
    /// True between sending a kill signal and the reap.
    pub killing: bool,
    pub administrative_stop: bool,
    pub system_stop: bool,
    pub spawnerr: Option<String>,
    pub exitstatus: Option<i32>,
    pub dispatchers: Dispatchers,
    pub is_listener: bool,
    pub listener_state: Option<ListenerState>,
    /// Event currently inflight to this listener child.
    pub event: Option<Event>,
    /// Remaining wait-for-previous budget, managed by the group walk.
    pub waits_left: Option<u32>,
}

fn state_event_kind(state: ProcessState) -> EventKind {
    match state {
        ProcessState::Disabled => EventKind::ProcessStateDisabled,
        ProcessState::Stopped => EventKind::ProcessStateStopped,
        ProcessState::Starting => EventKind::ProcessStateStarting,
        ProcessState::Running => EventKind::ProcessStateRunning,
        ProcessState::Backoff => EventKind::ProcessStateBackoff,
        ProcessState::Stopping => EventKind::ProcessStateStopping,
        ProcessState::Exited => EventKind::ProcessStateExited,
        ProcessState::Fatal => EventKind::ProcessStateFatal,
        ProcessState::Unknown => EventKind::ProcessStateUnknown,
    }
}

impl Subprocess {
    pub fn new(config: ProcessConfig, group_name: &str, is_listener: bool) -> Self {
        let state = if config.is_enabled() {
            ProcessState::Stopped
        } else {
            ProcessState::Disabled
        };
        Self {
            config,
            group_name: group_name.to_string(),
            state,
            pid: 0,
            laststart: None,
            laststop: None,
            started_at: None,
            laststopreport: None,
            delay: None,
            backoff: 0,
            killing: false,
            administrative_stop: false,
            system_stop: false,
            spawnerr: None,
            exitstatus: None,
            dispatchers: Dispatchers::default(),
            is_listener,
            listener_state: None,
            event: None,
            waits_left: None,
        }
    }

    pub fn namespec(&self) -> String {
        crate::config::make_namespec(&self.group_name, &self.config.name)
    }

    fn assert_in(&self, states: &[ProcessState]) {
        if !states.contains(&self.state) {
            error!(
                "state assertion failed for {}: {} not in {:?}",
                self.config.name, self.state, states
            );
            debug_assert!(false, "bad state for {}", self.config.name);
        }
    }

    fn state_event_extras(&self, new_state: ProcessState, expected: bool) -> Vec<(&'static str, String)> {
        match new_state {
            ProcessState::Starting | ProcessState::Backoff => {
                vec![("tries", self.backoff.to_string())]
            }
            ProcessState::Exited => vec![
                ("expected", (expected as i32).to_string()),
                ("pid", self.pid.to_string()),
            ],
            ProcessState::Running | ProcessState::Stopping | ProcessState::Stopped => {
                vec![("pid", self.pid.to_string())]
            }
            _ => vec![],
        }
    }

    /// The single place process state changes. Emits the state-change event,
    /// applies backoff arithmetic on entry to BACKOFF, and diverts
    /// STOPPED/EXITED to DISABLED for processes whose config is disabled.
    pub fn change_state(&mut self, new_state: ProcessState, expected: bool, bus: &mut EventBus) -> bool {
        let old_state = self.state;
        if new_state == old_state {
            return false;
        }

        let extras = self.state_event_extras(new_state, expected);
        let payload = events::process_state_payload(
            &self.config.name,
            &self.group_name,
            old_state,
            &extras,
        );
        bus.notify(Event::new(state_event_kind(new_state), payload));

        let mut stored = new_state;
        if new_state == ProcessState::Backoff {
            self.backoff += 1;
            self.delay = Some(Instant::now() + Duration::from_secs(self.backoff as u64));
        } else if matches!(new_state, ProcessState::Stopped | ProcessState::Exited)
            && !self.config.is_enabled()
            && old_state != ProcessState::Disabled
        {
            stored = ProcessState::Disabled;
        }
        if matches!(
            new_state,
            ProcessState::Running | ProcessState::Stopped | ProcessState::Fatal
        ) {
            self.backoff = 0;
            self.delay = None;
        }
        self.state = stored;
        true
    }

    fn record_spawnerr(&mut self, msg: String) {
        info!("spawnerr: {msg}");
        self.spawnerr = Some(msg);
    }

    /// Start the child. Returns the pid, or None when anything on the spawn
    /// path failed (the process is then in BACKOFF with `spawnerr` set).
    pub fn spawn(&mut self, bus: &mut EventBus) -> Option<u32> {
        let name = self.config.name.clone();
        if self.pid != 0 {
            warn!("process {name:?} already running");
            return None;
        }

        self.killing = false;
        self.spawnerr = None;
        self.exitstatus = None;
        self.system_stop = false;
        self.administrative_stop = false;

        self.laststart = Some(Local::now());
        self.started_at = Some(Instant::now());

        self.assert_in(&[
            ProcessState::Exited,
            ProcessState::Fatal,
            ProcessState::Backoff,
            ProcessState::Stopped,
        ]);
        self.change_state(ProcessState::Starting, true, bus);

        let (filename, argv) = match spawn::get_execv_args(&self.config) {
            Ok(args) => args,
            Err(e) => {
                self.record_spawnerr(e.to_string());
                self.assert_in(&[ProcessState::Starting]);
                self.change_state(ProcessState::Backoff, true, bus);
                return None;
            }
        };

        let (parent, child_stdio) = match spawn::make_pipes(self.config.redirect_stderr) {
            Ok(pipes) => pipes,
            Err(e) => {
                self.record_spawnerr(spawn::describe_pipe_error(&name, &e).to_string());
                self.assert_in(&[ProcessState::Starting]);
                self.change_state(ProcessState::Backoff, true, bus);
                return None;
            }
        };
        let dispatchers = match spawn::build_dispatchers(&self.config, self.is_listener, parent) {
            Ok(d) => d,
            Err(e) => {
                self.record_spawnerr(spawn::describe_pipe_error(&name, &e).to_string());
                self.assert_in(&[ProcessState::Starting]);
                self.change_state(ProcessState::Backoff, true, bus);
                return None;
            }
        };

        match spawn::launch(&self.config, &self.group_name, &filename, &argv, child_stdio) {
            Ok(child) => {
                self.pid = child.id();
                self.dispatchers = dispatchers;
                if self.is_listener {
                    self.listener_state = Some(ListenerState::Acknowledged);
                    self.event = None;
                }
                self.delay =
                    Some(Instant::now() + Duration::from_secs(self.config.startsecs));
                self.spawnerr = None;
                info!("spawned: {name:?} with pid {}", self.pid);
                Some(self.pid)
            }
            Err(e) => {
                self.record_spawnerr(spawn::describe_fork_error(&name, &e).to_string());
                self.assert_in(&[ProcessState::Starting]);
                self.change_state(ProcessState::Backoff, true, bus);
                None
            }
        }
    }

    /// Administrative stop: pre script, stop signal, post script. Detached
    /// processes are left running (scripts skipped) when the whole daemon is
    /// shutting down.
    pub fn stop(&mut self, shutting_down: bool, bus: &mut EventBus) -> Option<String> {
        self.administrative_stop = true;
        self.laststopreport = None;

        if !shutting_down || !self.config.run_detached {
            if let Some(script) = self.config.stop_pre_script.clone() {
                detached::run_script(&script);
            }
        }

        let sig = signal_by_name(&self.config.stopsignal).unwrap_or(Signal::SIGTERM);
        let killval = self.kill(sig, shutting_down, bus);

        if !shutting_down || !self.config.run_detached {
            if let Some(script) = self.config.stop_post_script.clone() {
                detached::run_script(&script);
            }
        }

        killval
    }

    /// Log a "waiting for x to stop" line, throttled to one per 2 seconds.
    pub fn stop_report(&mut self) {
        if self.state == ProcessState::Stopping {
            let due = self
                .laststopreport
                .map(|at| at.elapsed() > Duration::from_secs(2))
                .unwrap_or(true);
            if due {
                info!("waiting for {} to stop", self.config.name);
                self.laststopreport = Some(Instant::now());
            }
        }
    }

    /// BACKOFF → FATAL after too many retries.
    pub fn give_up(&mut self, bus: &mut EventBus) {
        self.delay = None;
        self.backoff = 0;
        self.system_stop = true;
        self.assert_in(&[ProcessState::Backoff]);
        self.change_state(ProcessState::Fatal, true, bus);
    }

    /// Send a (possibly killing) signal. Returns an error message when the
    /// signal could not be sent; the process is then in UNKNOWN.
    pub fn kill(&mut self, sig: Signal, shutdown: bool, bus: &mut EventBus) -> Option<String> {
        let name = self.config.name.clone();

        let mut detached_pid = None;
        let mut stop_command = None;
        if self.config.run_detached
            && let Some(pid_file) = self.config.pid_file.clone()
            && pid_file.exists()
        {
            match detached::read_pid_file(&pid_file) {
                Some(pid) => {
                    debug!("found detached pid {pid} for native pid {}", self.pid);
                    detached_pid = Some(pid);
                }
                None => match self.config.stop_command.clone() {
                    Some(cmd) => {
                        debug!("pid file isn't an integer, using stop command for {}", self.pid);
                        stop_command = Some(cmd);
                    }
                    None => {
                        return Some(format!(
                            "unparsable pid file {} and no stop_command for {name}",
                            pid_file.display()
                        ));
                    }
                },
            }
        }

        // A process in BACKOFF has no pid to signal; stopping it just means
        // abandoning the retry loop.
        if self.state == ProcessState::Backoff {
            debug!("attempted to kill {name}, which is in BACKOFF state");
            self.change_state(ProcessState::Stopped, true, bus);
            return None;
        }

        if self.pid == 0 {
            let msg = format!("attempted to kill {name} with sig {sig} but it wasn't running");
            debug!("{msg}");
            return Some(msg);
        }

        // in STOPPING we've already sent stopsignal and this is the escalation
        let killasgroup = if self.state == ProcessState::Stopping {
            self.config.killasgroup()
        } else {
            self.config.stopasgroup
        };

        let as_group = if killasgroup { "process group " } else { "" };
        debug!("killing {name} (pid {}) {as_group}with signal {sig}", self.pid);

        self.killing = true;
        self.delay = Some(Instant::now() + Duration::from_secs(self.config.stopwaitsecs));
        self.assert_in(&[
            ProcessState::Running,
            ProcessState::Starting,
            ProcessState::Stopping,
        ]);
        self.change_state(ProcessState::Stopping, true, bus);

        let mut pid = self.pid as i32;
        if killasgroup {
            pid = -pid;
        }

        if let Some(dpid) = detached_pid {
            if shutdown {
                info!("leaving {name} ({dpid}) running, system is shutting down");
            } else {
                match nix::sys::signal::kill(Pid::from_raw(dpid), sig) {
                    Ok(()) => {
                        warn!("killed detached pid {dpid}");
                        self.remove_pid_file_if_down();
                    }
                    Err(e) => warn!("problem killing detached pid {dpid}: {e}"),
                }
            }
        }
        if let Some(cmdline) = stop_command {
            if shutdown {
                info!("leaving {name} ({pid}) running, system is shutting down");
            } else {
                match std::process::Command::new("sh").arg("-c").arg(&cmdline).status() {
                    Ok(status) => {
                        debug!("stop command for {pid} had return code {status}");
                        self.remove_pid_file_if_down();
                    }
                    Err(e) => warn!("problem running stop command for {pid}: {e}"),
                }
            }
        }

        info!("sending {sig} to pid {pid}");
        if let Err(e) = nix::sys::signal::kill(Pid::from_raw(pid), sig) {
            let msg = format!("unknown problem killing {name} ({}): {e}", self.pid);
            error!("{msg}");
            self.change_state(ProcessState::Unknown, true, bus);
            self.pid = 0;
            self.killing = false;
            self.delay = None;
            return Some(msg);
        }

        None
    }

    fn remove_pid_file_if_down(&self) {
        if let Some(pid_file) = &self.config.pid_file
            && pid_file.exists()
            && !detached::check_status(&self.config)
        {
            trace!("removing {} after killing detached process", pid_file.display());
            let _ = std::fs::remove_file(pid_file);
        }
    }

    /// Send a signal without any state change.
    pub fn signal(&mut self, sig: Signal, bus: &mut EventBus) -> Option<String> {
        let name = self.config.name.clone();
        if self.pid == 0 {
            let msg = format!("attempted to send {name} sig {sig} but it wasn't running");
            debug!("{msg}");
            return Some(msg);
        }

        debug!("sending {name} (pid {}) sig {sig}", self.pid);
        self.assert_in(&[
            ProcessState::Running,
            ProcessState::Starting,
            ProcessState::Stopping,
        ]);

        if let Err(e) = nix::sys::signal::kill(Pid::from_raw(self.pid as i32), sig) {
            let msg = format!("unknown problem sending sig {name} ({}): {e}", self.pid);
            error!("{msg}");
            self.change_state(ProcessState::Unknown, true, bus);
            self.pid = 0;
            return Some(msg);
        }

        None
    }

    /// Queue bytes on the child's stdin. EPIPE when there is no live stdin.
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        let epipe = || std::io::Error::from_raw_os_error(libc::EPIPE);
        if self.pid == 0 || self.killing {
            return Err(epipe());
        }
        let Some(stdin) = self.dispatchers.stdin.as_mut() else {
            return Err(epipe());
        };
        if stdin.closed {
            return Err(epipe());
        }
        stdin.push(data);
        stdin.flush()
    }

    /// Pump the output dispatchers and flush pending stdin. Called on every
    /// tick and once more at reap time.
    pub fn drain(&mut self, bus: &mut EventBus) {
        let mut observed = vec![];
        if let Some(d) = self.dispatchers.stdout.as_mut() {
            observed.extend(d.drain());
        }
        if let Some(d) = self.dispatchers.stderr.as_mut() {
            observed.extend(d.drain());
        }
        for event in observed {
            self.apply_output_event(event, bus);
        }
        if let Some(stdin) = self.dispatchers.stdin.as_mut() {
            let _ = stdin.flush();
        }
    }

    fn apply_output_event(&mut self, observed: OutputEvent, bus: &mut EventBus) {
        match observed {
            OutputEvent::Log { channel, data } => {
                let kind = match channel {
                    Channel::Stderr => EventKind::ProcessLogStderr,
                    _ => EventKind::ProcessLogStdout,
                };
                let payload = events::process_log_payload(
                    &self.config.name,
                    &self.group_name,
                    self.pid,
                    &channel.to_string(),
                    &data,
                );
                bus.notify(Event::new(kind, payload));
            }
            OutputEvent::Comm { channel, data } => {
                let kind = match channel {
                    Channel::Stderr => EventKind::ProcessCommunicationStderr,
                    _ => EventKind::ProcessCommunicationStdout,
                };
                let payload = events::process_comm_payload(
                    &self.config.name,
                    &self.group_name,
                    self.pid,
                    &data,
                );
                bus.notify(Event::new(kind, payload));
            }
            OutputEvent::ListenerReady => match self.listener_state {
                Some(ListenerState::Acknowledged) => {
                    self.listener_state = Some(ListenerState::Ready);
                }
                Some(ListenerState::Unknown) | None => {}
                _ => self.listener_protocol_error("unexpected READY", bus),
            },
            OutputEvent::ListenerResult { body } => {
                if self.listener_state != Some(ListenerState::Busy) {
                    self.listener_protocol_error("unexpected RESULT", bus);
                    return;
                }
                if body.starts_with("OK") {
                    debug!("event processed by listener {}", self.config.name);
                    self.event = None;
                    self.listener_state = Some(ListenerState::Acknowledged);
                } else if body.starts_with("FAIL") {
                    if let Some(event) = self.event.take() {
                        bus.notify_rejected(&self.group_name, &self.config.name, event);
                    }
                    self.listener_state = Some(ListenerState::Acknowledged);
                } else {
                    self.listener_protocol_error(&format!("bad result body {body:?}"), bus);
                }
            }
            OutputEvent::ListenerProtocolError { line } => {
                self.listener_protocol_error(&format!("bad token {line:?}"), bus);
            }
        }
    }

    fn listener_protocol_error(&mut self, reason: &str, bus: &mut EventBus) {
        if self.listener_state.is_none() {
            return;
        }
        warn!("listener {} violated the protocol: {reason}", self.config.name);
        self.listener_state = Some(ListenerState::Unknown);
        if let Some(event) = self.event.take() {
            bus.notify_rejected(&self.group_name, &self.config.name, event);
        }
    }

    /// The reaper observed this process's child exit. Decode the status into
    /// the post-exit state and release the pipes.
    pub fn finish(&mut self, es: i32, status_msg: &str, mood: SupervisorState, bus: &mut EventBus) {
        self.drain(bus);

        self.laststop = Some(Local::now());
        let processname = self.config.name.clone();

        let too_quickly = self
            .started_at
            .map(|at| at.elapsed() < Duration::from_secs(self.config.startsecs))
            .unwrap_or(false);
        let exit_expected = self.config.exitcodes.contains(&es);

        if self.killing {
            // the result of a stop or kill request
            self.killing = false;
            self.delay = None;
            self.exitstatus = Some(es);
            info!("stopped: {processname} ({status_msg})");
            self.assert_in(&[ProcessState::Stopping]);
            self.change_state(ProcessState::Stopped, true, bus);
        } else if too_quickly && self.state == ProcessState::Starting {
            self.exitstatus = None;
            self.spawnerr = Some("Exited too quickly (process log may have details)".to_string());
            info!("exited: {processname} ({status_msg}; not expected)");
            self.change_state(ProcessState::Backoff, true, bus);
        } else {
            self.delay = None;
            self.backoff = 0;
            self.exitstatus = Some(es);

            // a process that outlived startsecs but is still marked STARTING
            // (scheduler lag) passes through RUNNING first
            if self.state == ProcessState::Starting {
                self.change_state(ProcessState::Running, true, bus);
            }
            self.assert_in(&[ProcessState::Running]);

            if exit_expected {
                info!("exited: {processname} ({status_msg}; expected)");
                self.change_state(ProcessState::Exited, true, bus);
            } else {
                self.spawnerr = Some(format!("Bad exit code {es}"));
                info!("exited: {processname} ({status_msg}; not expected)");
                self.change_state(ProcessState::Exited, false, bus);
            }
        }

        // a reaped detached process is done with its pid file
        if mood == SupervisorState::Running
            && self.config.run_detached
            && let Some(pid_file) = &self.config.pid_file
            && pid_file.exists()
        {
            trace!("finishing process, removing pid file {}", pid_file.display());
            let _ = std::fs::remove_file(pid_file);
        }

        self.pid = 0;
        self.dispatchers = Dispatchers::default();

        // a listener that died holding an event rejects it back to the pool
        if let Some(event) = self.event.take() {
            bus.notify_rejected(&self.group_name, &self.config.name, event);
        }
    }

    /// Drive time-based transitions. `state` is sampled once at entry, as the
    /// spawn branches below change it.
    pub fn transition(&mut self, mood: SupervisorState, bus: &mut EventBus) {
        let now = Instant::now();
        let state = self.state;

        if !mood.is_shutting_down() {
            match state {
                ProcessState::Exited => {
                    if self.config.is_enabled() {
                        match self.config.autorestart {
                            crate::config::Autorestart::Always => {
                                self.spawn(bus);
                            }
                            crate::config::Autorestart::Unexpected => {
                                let unexpected = self
                                    .exitstatus
                                    .map(|es| !self.config.exitcodes.contains(&es))
                                    .unwrap_or(true);
                                if unexpected {
                                    self.spawn(bus);
                                }
                            }
                            crate::config::Autorestart::Never => {}
                        }
                    }
                }
                ProcessState::Stopped if self.laststart.is_none() => {
                    // never started in this supervisor's lifetime
                    if self.config.run_detached
                        && let Some(pid_file) = self.config.pid_file.clone()
                        && pid_file.exists()
                        && !detached::check_status(&self.config)
                    {
                        info!(
                            "didn't expect to find the pid file {}, removing now",
                            pid_file.display()
                        );
                        let _ = std::fs::remove_file(&pid_file);
                    }

                    if self.config.is_enabled() && self.config.autostart {
                        self.spawn(bus);
                    } else if self.config.run_detached
                        && self.config.pid_file.as_ref().is_some_and(|f| f.exists())
                        && detached::check_status(&self.config)
                    {
                        // already running outside us; spawn only attaches a
                        // status watcher
                        info!(
                            "{} appears to be running already, changing from {} to STARTING state",
                            self.config.name, self.state
                        );
                        self.spawn(bus);
                    }
                }
                ProcessState::Disabled => {
                    if let Some(pid_file) = self.config.pid_file.clone()
                        && pid_file.exists()
                    {
                        if detached::check_status(&self.config) {
                            info!(
                                "{} appears to be running already, changing it to a startable state",
                                self.config.name
                            );
                            self.change_state(ProcessState::Stopped, true, bus);
                            self.spawn(bus);
                        } else {
                            info!(
                                "didn't expect to find the pid file {}, removing now",
                                pid_file.display()
                            );
                            let _ = std::fs::remove_file(&pid_file);
                        }
                    }
                }
                ProcessState::Backoff => {
                    if self.config.is_enabled()
                        && self.backoff <= self.config.startretries
                        && self.delay.is_some_and(|at| now > at)
                    {
                        self.spawn(bus);
                    }
                }
                _ => {}
            }
        }

        if state == ProcessState::Starting
            && self
                .started_at
                .is_some_and(|at| at.elapsed() > Duration::from_secs(self.config.startsecs))
        {
            self.delay = None;
            self.backoff = 0;
            self.assert_in(&[ProcessState::Starting]);
            self.change_state(ProcessState::Running, true, bus);
            info!(
                "success: {} entered RUNNING state, process has stayed up for > than {} seconds (startsecs)",
                self.config.name, self.config.startsecs
            );
        }

        if state == ProcessState::Backoff {
            if self.backoff > self.config.startretries {
                self.give_up(bus);
                info!(
                    "gave up: {} entered FATAL state, too many start retries too quickly",
                    self.config.name
                );
            }
        } else if state == ProcessState::Stopping && self.delay.is_some_and(|at| now > at) {
            // SIGTERM didn't do it within stopwaitsecs
            warn!("killing {:?} ({}) with SIGKILL", self.config.name, self.pid);
            self.kill(Signal::SIGKILL, mood.is_shutting_down(), bus);
        }
    }

    /// Truncate this process's log files.
    pub fn clear_logs(&mut self) -> std::io::Result<()> {
        for path in [self.config.stdout_logfile(), self.config.stderr_logfile()] {
            if path.exists() {
                std::fs::OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .open(&path)?;
            }
        }
        Ok(())
    }

    pub fn reopen_logs(&mut self) {
        self.dispatchers.reopen_logs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BusItem;
    use crate::states::ProcessState::*;

    fn subprocess(extra: &str) -> Subprocess {
        let mut config: ProcessConfig =
            toml::from_str(&format!("command = \"/bin/true\"\n{extra}")).unwrap();
        config.name = "p1".to_string();
        Subprocess::new(config, "g1", false)
    }

    fn bus() -> EventBus {
        EventBus::default()
    }

    fn kinds(bus: &mut EventBus) -> Vec<EventKind> {
        bus.drain()
            .into_iter()
            .filter_map(|item| match item {
                BusItem::Event(ev) => Some(ev.kind),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn starts_stopped_or_disabled() {
        assert_eq!(subprocess("").state, Stopped);
        assert_eq!(subprocess("enabled = false").state, Disabled);
    }

    #[test]
    fn change_state_emits_event_with_from_state() {
        let mut p = subprocess("");
        let mut bus = bus();
        assert!(p.change_state(Starting, true, &mut bus));
        let items = bus.drain();
        let BusItem::Event(ev) = &items[0] else {
            panic!("expected event")
        };
        assert_eq!(ev.kind, EventKind::ProcessStateStarting);
        assert!(ev.payload.contains("processname:p1"));
        assert!(ev.payload.contains("groupname:g1"));
        assert!(ev.payload.contains("from_state:STOPPED"));
        assert!(ev.payload.contains("tries:0"));
    }

    #[test]
    fn change_state_to_same_state_is_a_noop() {
        let mut p = subprocess("");
        let mut bus = bus();
        assert!(!p.change_state(Stopped, true, &mut bus));
        assert!(bus.is_empty());
    }

    #[test]
    fn backoff_math() {
        let mut p = subprocess("");
        let mut bus = bus();
        p.change_state(Starting, true, &mut bus);
        p.change_state(Backoff, true, &mut bus);
        assert_eq!(p.backoff, 1);
        assert!(p.delay.is_some());
        p.change_state(Starting, true, &mut bus);
        p.change_state(Backoff, true, &mut bus);
        assert_eq!(p.backoff, 2);
        // entering RUNNING resets the retry counter
        p.change_state(Starting, true, &mut bus);
        p.change_state(Running, true, &mut bus);
        assert_eq!(p.backoff, 0);
        assert!(p.delay.is_none());
    }

    #[test]
    fn disabled_config_diverts_stopped_to_disabled() {
        let mut p = subprocess("enabled = false");
        let mut bus = bus();
        p.state = Stopping;
        p.change_state(Stopped, true, &mut bus);
        assert_eq!(p.state, Disabled);
        // the emitted event is still the STOPPED event
        assert_eq!(kinds(&mut bus), vec![EventKind::ProcessStateStopped]);
    }

    #[test]
    fn kill_in_backoff_goes_to_stopped() {
        let mut p = subprocess("");
        let mut bus = bus();
        p.change_state(Starting, true, &mut bus);
        p.change_state(Backoff, true, &mut bus);
        let err = p.kill(Signal::SIGTERM, false, &mut bus);
        assert!(err.is_none());
        assert_eq!(p.state, Stopped);
        assert_eq!(p.backoff, 0);
    }

    #[test]
    fn kill_without_pid_reports_error() {
        let mut p = subprocess("");
        let mut bus = bus();
        p.state = Running;
        let err = p.kill(Signal::SIGTERM, false, &mut bus);
        assert!(err.is_some());
        assert_eq!(p.state, Running);
    }

    #[test]
    fn finish_after_kill_is_stopped() {
        let mut p = subprocess("");
        let mut bus = bus();
        p.state = Stopping;
        p.killing = true;
        p.pid = 4242;
        p.started_at = Some(Instant::now() - Duration::from_secs(60));
        p.finish(0, "exit status 0", SupervisorState::Running, &mut bus);
        assert_eq!(p.state, Stopped);
        assert!(!p.killing);
        assert_eq!(p.pid, 0);
        assert_eq!(p.exitstatus, Some(0));
        assert_eq!(kinds(&mut bus), vec![EventKind::ProcessStateStopped]);
    }

    #[test]
    fn finish_too_quickly_backs_off() {
        let mut p = subprocess("startsecs = 5");
        let mut bus = bus();
        p.state = Starting;
        p.pid = 4242;
        p.started_at = Some(Instant::now());
        p.finish(1, "exit status 1", SupervisorState::Running, &mut bus);
        assert_eq!(p.state, Backoff);
        assert_eq!(p.backoff, 1);
        assert!(p.spawnerr.as_deref().unwrap().contains("Exited too quickly"));
        assert_eq!(p.exitstatus, None);
        assert_eq!(kinds(&mut bus), vec![EventKind::ProcessStateBackoff]);
    }

    #[test]
    fn finish_expected_exit() {
        let mut p = subprocess("startsecs = 0");
        let mut bus = bus();
        p.state = Running;
        p.pid = 4242;
        p.started_at = Some(Instant::now() - Duration::from_secs(10));
        p.finish(0, "exit status 0", SupervisorState::Running, &mut bus);
        assert_eq!(p.state, Exited);
        assert_eq!(p.exitstatus, Some(0));
        let items = bus.drain();
        let BusItem::Event(ev) = &items[0] else {
            panic!("expected event")
        };
        assert_eq!(ev.kind, EventKind::ProcessStateExited);
        assert!(ev.payload.contains("expected:1"));
        assert!(ev.payload.contains("pid:4242"));
    }

    #[test]
    fn finish_unexpected_exit_records_bad_exit_code() {
        let mut p = subprocess("startsecs = 0");
        let mut bus = bus();
        p.state = Running;
        p.pid = 4242;
        p.started_at = Some(Instant::now() - Duration::from_secs(10));
        p.finish(3, "exit status 3", SupervisorState::Running, &mut bus);
        assert_eq!(p.state, Exited);
        assert_eq!(p.spawnerr.as_deref(), Some("Bad exit code 3"));
        let items = bus.drain();
        let BusItem::Event(ev) = &items[0] else {
            panic!("expected event")
        };
        assert!(ev.payload.contains("expected:0"));
    }

    #[test]
    fn finish_in_starting_passes_through_running() {
        let mut p = subprocess("startsecs = 0");
        let mut bus = bus();
        p.state = Starting;
        p.pid = 4242;
        p.started_at = Some(Instant::now() - Duration::from_secs(10));
        p.finish(0, "exit status 0", SupervisorState::Running, &mut bus);
        assert_eq!(p.state, Exited);
        assert_eq!(
            kinds(&mut bus),
            vec![EventKind::ProcessStateRunning, EventKind::ProcessStateExited]
        );
    }

    #[test]
    fn finish_rejects_inflight_listener_event() {
        let mut p = subprocess("startsecs = 0");
        p.is_listener = true;
        p.listener_state = Some(ListenerState::Busy);
        p.event = Some(Event::new(EventKind::Tick5, "when:5".to_string()));
        let mut bus = bus();
        p.state = Stopping;
        p.killing = true;
        p.pid = 7;
        p.started_at = Some(Instant::now() - Duration::from_secs(10));
        p.finish(0, "exit status 0", SupervisorState::Running, &mut bus);
        let rejected = bus
            .drain()
            .into_iter()
            .any(|item| matches!(item, BusItem::Rejected { .. }));
        assert!(rejected);
        assert!(p.event.is_none());
    }

    #[test]
    fn transition_starting_to_running_after_startsecs() {
        let mut p = subprocess("startsecs = 1");
        let mut bus = bus();
        p.state = Starting;
        p.pid = 4242;
        p.started_at = Some(Instant::now() - Duration::from_secs(5));
        p.transition(SupervisorState::Running, &mut bus);
        assert_eq!(p.state, Running);
        assert_eq!(p.backoff, 0);
    }

    #[test]
    fn transition_gives_up_after_retries() {
        let mut p = subprocess("startretries = 2");
        let mut bus = bus();
        p.state = Backoff;
        p.backoff = 3;
        p.transition(SupervisorState::Running, &mut bus);
        assert_eq!(p.state, Fatal);
        assert!(p.system_stop);
        assert_eq!(p.backoff, 0);
    }

    #[test]
    fn transition_does_not_spawn_while_shutting_down() {
        let mut p = subprocess("autostart = true");
        let mut bus = bus();
        p.transition(SupervisorState::Shutdown, &mut bus);
        assert_eq!(p.state, Stopped);
    }

    #[test]
    fn listener_protocol_result_transitions() {
        let mut p = subprocess("");
        p.is_listener = true;
        p.listener_state = Some(ListenerState::Busy);
        p.event = Some(Event::new(EventKind::Tick5, "when:5".to_string()));
        let mut bus = bus();
        p.apply_output_event(
            OutputEvent::ListenerResult {
                body: "OK".to_string(),
            },
            &mut bus,
        );
        assert_eq!(p.listener_state, Some(ListenerState::Acknowledged));
        assert!(p.event.is_none());
        assert!(bus.is_empty());

        p.apply_output_event(OutputEvent::ListenerReady, &mut bus);
        assert_eq!(p.listener_state, Some(ListenerState::Ready));
    }

    #[test]
    fn listener_fail_result_rejects_event() {
        let mut p = subprocess("");
        p.is_listener = true;
        p.listener_state = Some(ListenerState::Busy);
        p.event = Some(Event::new(EventKind::Tick5, "when:5".to_string()));
        let mut bus = bus();
        p.apply_output_event(
            OutputEvent::ListenerResult {
                body: "FAIL".to_string(),
            },
            &mut bus,
        );
        assert_eq!(p.listener_state, Some(ListenerState::Acknowledged));
        let rejected = bus
            .drain()
            .into_iter()
            .any(|item| matches!(item, BusItem::Rejected { .. }));
        assert!(rejected);
    }

    #[test]
    fn write_fails_epipe_when_not_running() {
        let mut p = subprocess("");
        let err = p.write(b"hello").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EPIPE));
    }

    #[test]
    fn signal_names_parse() {
        assert_eq!(signal_by_name("TERM"), Some(Signal::SIGTERM));
        assert_eq!(signal_by_name("SIGKILL"), Some(Signal::SIGKILL));
        assert_eq!(signal_by_name("9"), Some(Signal::SIGKILL));
        assert_eq!(signal_by_name("hup"), Some(Signal::SIGHUP));
        assert_eq!(signal_by_name("NOPE"), None);
    }
}

//! Process groups: ordered containers of subprocesses.
//!
//! The group walk advances members in ascending priority order with the
//! wait-for-previous gate: a member configured with `waitforprevious` defers
//! the rest of the group while its predecessor is STARTING, and either fails
//! FATAL or proceeds once the budget runs out. Deferral returns without
//! advancing later members, so start ordering is preserved across ticks.

use crate::config::GroupConfig;
use crate::events::EventBus;
use crate::pool::ListenerPool;
use crate::process::Subprocess;
use crate::states::{ProcessState, SupervisorState};

#[derive(Debug)]
pub struct ProcessGroup {
    pub config: GroupConfig,
    /// Sorted by (priority, name) at construction.
    pub processes: Vec<Subprocess>,
    /// Present when this group is an event-listener pool.
    pub pool: Option<ListenerPool>,
}

impl ProcessGroup {
    pub fn new(config: GroupConfig) -> Self {
        let is_listener = config.pool.is_some();
        let processes = config
            .process_configs
            .iter()
            .map(|pconfig| Subprocess::new(pconfig.clone(), &config.name, is_listener))
            .collect();
        let pool = config
            .pool
            .as_ref()
            .map(|settings| ListenerPool::new(&config.name, settings.clone()));
        Self {
            config,
            processes,
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn by_name(&self, name: &str) -> Option<&Subprocess> {
        self.processes.iter().find(|p| p.config.name == name)
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut Subprocess> {
        self.processes.iter_mut().find(|p| p.config.name == name)
    }

    pub fn by_pid_mut(&mut self, pid: u32) -> Option<&mut Subprocess> {
        self.processes.iter_mut().find(|p| p.pid != 0 && p.pid == pid)
    }

    /// Members not in ALL_STOPPED_STATES.
    pub fn unstopped(&self) -> Vec<&Subprocess> {
        self.processes
            .iter()
            .filter(|p| !p.state.in_all_stopped_states())
            .collect()
    }

    /// Advance every member one tick. Listener pools have no start ordering;
    /// plain groups apply the wait-for-previous gate.
    pub fn transition(&mut self, mood: SupervisorState, bus: &mut EventBus) {
        match &mut self.pool {
            Some(pool) => {
                for process in &mut self.processes {
                    process.transition(mood, bus);
                }
                pool.tick(&mut self.processes);
            }
            None => self.ordered_transition(mood, bus),
        }
    }

    fn ordered_transition(&mut self, mood: SupervisorState, bus: &mut EventBus) {
        // state of the most recent non-DISABLED member considered
        let mut last_state: Option<ProcessState> = None;

        for i in 0..self.processes.len() {
            let state = self.processes[i].state;

            if let Some(previous_state) = last_state
                && state.in_stopped_states()
            {
                let proc = &mut self.processes[i];
                if previous_state.in_running_states() && proc.waits_left.is_none() {
                    proc.waits_left = proc.config.waitforprevious;
                }

                if proc.waits_left.is_some() && previous_state != ProcessState::Running {
                    // the previous process is still on its way up (or went bad)
                    if proc.waits_left.unwrap_or(0) > 0
                        && previous_state == ProcessState::Starting
                    {
                        trace!(
                            "{} startup wait conditions true, returning",
                            proc.config.name
                        );
                        *proc.waits_left.as_mut().unwrap() -= 1;
                        return;
                    } else if proc.waits_left == Some(0)
                        || previous_state != ProcessState::Starting
                    {
                        debug!("waits = 0 or previous is not starting");
                        if proc.config.failafterwait && proc.state != ProcessState::Fatal {
                            debug!(
                                "marking {} as FATAL, waits left: {:?} previous state: {previous_state}",
                                proc.config.name, proc.waits_left
                            );
                            proc.change_state(ProcessState::Fatal, true, bus);
                            continue;
                        }
                    }
                }
            } else if last_state == Some(ProcessState::Starting)
                && state == ProcessState::Disabled
            {
                // don't touch disabled members until the previous one settles
                trace!(
                    "{} is disabled, previous process is starting; waiting for previous to transition",
                    self.processes[i].config.name
                );
                return;
            }

            let proc = &mut self.processes[i];
            proc.waits_left = None;
            proc.transition(mood, bus);
            if proc.state != ProcessState::Disabled {
                last_state = Some(proc.state);
            }
        }
    }

    /// Stop every member, highest priority first. BACKOFF members give up
    /// immediately rather than waiting out their retries.
    pub fn stop_all(&mut self, shutting_down: bool, bus: &mut EventBus) {
        for i in (0..self.processes.len()).rev() {
            let proc = &mut self.processes[i];
            match proc.state {
                ProcessState::Running | ProcessState::Starting => {
                    proc.stop(shutting_down, bus);
                }
                ProcessState::Backoff => {
                    proc.give_up(bus);
                }
                _ => {}
            }
        }
    }
}

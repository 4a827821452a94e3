//! Config re-read and process-group management.
//!
//! `reload_config` replaces the last-loaded configs and reports the diff
//! against the active groups without touching them; add/remove/update apply
//! the loaded configs to the running supervisor.

use super::Supervisor;
use crate::config::{self, GroupConfig};
use crate::env;
use crate::error::Fault;
use crate::events::{self, Event, EventKind};
use crate::group::ProcessGroup;

impl Supervisor {
    /// Re-read the config file. Active groups are untouched; a parse error
    /// leaves the previously-loaded configs in place too.
    pub fn reload_config(&mut self) -> Result<(Vec<String>, Vec<String>, Vec<String>), Fault> {
        let configs = config::load(&env::WARDEN_CONFIG)
            .map_err(|e| Fault::CantReread(e.to_string()))?;
        self.group_configs = configs;
        let active: Vec<GroupConfig> = self.groups.values().map(|g| g.config.clone()).collect();
        Ok(config::diff(&self.group_configs, &active))
    }

    /// Install a group. False when a group by that name is already active.
    pub fn add_process_group(&mut self, config: GroupConfig) -> bool {
        if self.groups.contains_key(&config.name) {
            return false;
        }
        info!("adding process group {}", config.name);
        self.bus.notify(Event::new(
            EventKind::ProcessGroupAdded,
            events::group_payload(&config.name),
        ));
        self.groups
            .insert(config.name.clone(), ProcessGroup::new(config));
        true
    }

    /// Remove a group. False when any member is still unstopped.
    pub fn remove_process_group(&mut self, name: &str) -> bool {
        let Some(group) = self.groups.get(name) else {
            return false;
        };
        if !group.unstopped().is_empty() {
            return false;
        }
        info!("removing process group {name}");
        self.groups.shift_remove(name);
        self.bus.notify(Event::new(
            EventKind::ProcessGroupRemoved,
            events::group_payload(name),
        ));
        true
    }

    /// Replace a group with its freshly-loaded config: members that left the
    /// config are stopped, the group is rebuilt, and the new member names are
    /// returned. A config that empties the group removes it (and returns the
    /// empty list).
    pub fn update_process_group(&mut self, name: &str) -> Result<Vec<String>, Fault> {
        if !self.groups.contains_key(name) {
            return Err(Fault::BadName(name.to_string()));
        }
        let new_config = self
            .group_configs
            .iter()
            .find(|g| g.name == name)
            .cloned()
            .filter(|g| !g.process_configs.is_empty());

        let Some(new_config) = new_config else {
            let shutting_down = self.mood.is_shutting_down();
            {
                let Self { groups, bus, .. } = self;
                groups.get_mut(name).unwrap().stop_all(shutting_down, bus);
            }
            if !self.remove_process_group(name) {
                warn!("group {name} still has running members; not removed");
            }
            return Ok(vec![]);
        };

        let new_names: Vec<String> = new_config
            .process_configs
            .iter()
            .map(|p| p.name.clone())
            .collect();

        // stop members that were dropped from the config, highest priority
        // first
        let shutting_down = self.mood.is_shutting_down();
        {
            let Self { groups, bus, .. } = self;
            let group = groups.get_mut(name).unwrap();
            for i in (0..group.processes.len()).rev() {
                let proc = &mut group.processes[i];
                if !new_names.contains(&proc.config.name) && proc.state.in_running_states() {
                    debug!("process {} left the config, stopping", proc.config.name);
                    proc.stop(shutting_down, bus);
                }
            }
        }

        self.groups
            .insert(name.to_string(), ProcessGroup::new(new_config));
        Ok(new_names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::ProcessState;

    fn load_str(toml: &str) -> Vec<GroupConfig> {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), toml).unwrap();
        config::load(file.path()).unwrap()
    }

    const BASE: &str = r#"
[groups.radio]
priority = 10

[processes.rx]
group = "radio"
command = "/bin/true"
autostart = false

[processes.tx]
group = "radio"
command = "/bin/true"
autostart = false
"#;

    #[test]
    fn add_is_idempotent_by_name() {
        let configs = load_str(BASE);
        let mut sup = Supervisor::new(configs.clone());
        assert!(!sup.add_process_group(configs[0].clone()));
    }

    #[test]
    fn remove_refuses_running_members() {
        let mut sup = Supervisor::new(load_str(BASE));
        sup.groups
            .get_mut("radio")
            .unwrap()
            .by_name_mut("rx")
            .unwrap()
            .state = ProcessState::Running;
        assert!(!sup.remove_process_group("radio"));
        sup.groups
            .get_mut("radio")
            .unwrap()
            .by_name_mut("rx")
            .unwrap()
            .state = ProcessState::Stopped;
        assert!(sup.remove_process_group("radio"));
        assert!(!sup.groups.contains_key("radio"));
    }

    #[test]
    fn update_installs_new_member_list() {
        let mut sup = Supervisor::new(load_str(BASE));
        sup.group_configs = load_str(
            r#"
[groups.radio]
priority = 10

[processes.rx]
group = "radio"
command = "/bin/true"
autostart = false

[processes.scanner]
group = "radio"
command = "/bin/true"
autostart = false
"#,
        );
        let members = sup.update_process_group("radio").unwrap();
        assert_eq!(members, vec!["rx", "scanner"]);
        assert!(sup.groups["radio"].by_name("tx").is_none());
        assert!(sup.groups["radio"].by_name("scanner").is_some());
    }

    #[test]
    fn update_with_emptied_config_removes_group() {
        let mut sup = Supervisor::new(load_str(BASE));
        sup.group_configs = vec![];
        let members = sup.update_process_group("radio").unwrap();
        assert!(members.is_empty());
        assert!(!sup.groups.contains_key("radio"));
    }

    #[test]
    fn update_unknown_group_is_bad_name() {
        let mut sup = Supervisor::new(load_str(BASE));
        assert!(matches!(
            sup.update_process_group("nope"),
            Err(Fault::BadName(_))
        ));
    }
}

//! Configuration records: process, group and listener-pool definitions.
//!
//! `warden.toml` declares `[groups.*]`, `[pools.*]` and `[processes.*]`
//! tables. A process names its group; a process without one forms an implicit
//! single-member group under its own name. The resolved `GroupConfig` list is
//! the only thing the supervisor core consumes; it is immutable after load
//! and replaced wholesale on reload.

use crate::env;
use crate::error::ConfigError;
use crate::events::EventSubscription;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "lowercase")]
pub enum ConfigType {
    Domain,
    Nodes,
    Waveforms,
    #[default]
    Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Autorestart {
    Never,
    #[default]
    Unexpected,
    Always,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(skip)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub autostart: bool,
    #[serde(default)]
    pub autorestart: Autorestart,
    /// Seconds the process must stay up before it counts as RUNNING.
    #[serde(default = "default_startsecs")]
    pub startsecs: u64,
    #[serde(default = "default_startretries")]
    pub startretries: u32,
    #[serde(default = "default_stopsignal")]
    pub stopsignal: String,
    /// Seconds to wait after the stop signal before escalating to SIGKILL.
    #[serde(default = "default_stopwaitsecs")]
    pub stopwaitsecs: u64,
    #[serde(default)]
    pub stopasgroup: bool,
    /// Defaults to `stopasgroup` when unset.
    #[serde(default)]
    pub killasgroup: Option<bool>,
    #[serde(default = "default_exitcodes")]
    pub exitcodes: Vec<i32>,
    #[serde(default)]
    pub redirect_stderr: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub run_detached: bool,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Run after a detached launch; must exit 0 once the daemon is up.
    #[serde(default)]
    pub started_status_script: Option<String>,
    /// Liveness probe for a detached daemon. Falls back to a kill(pid, 0)
    /// check against the pid file when unset.
    #[serde(default)]
    pub status_check_command: Option<String>,
    /// Used to stop a detached daemon whose pid file is unparsable.
    #[serde(default)]
    pub stop_command: Option<String>,
    #[serde(default)]
    pub stop_pre_script: Option<String>,
    #[serde(default)]
    pub stop_post_script: Option<String>,
    /// Ticks to wait for the previous group member to reach RUNNING.
    #[serde(default)]
    pub waitforprevious: Option<u32>,
    /// When the wait budget runs out, mark this process FATAL.
    #[serde(default)]
    pub failafterwait: bool,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub umask: Option<u32>,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: IndexMap<String, String>,
    #[serde(default)]
    pub stdout_logfile: Option<PathBuf>,
    #[serde(default)]
    pub stderr_logfile: Option<PathBuf>,
    #[serde(default)]
    pub stdout_events_enabled: bool,
    #[serde(default)]
    pub stderr_events_enabled: bool,
    #[serde(default)]
    pub serverurl: Option<String>,
}

fn default_priority() -> i32 {
    999
}
fn default_true() -> bool {
    true
}
fn default_startsecs() -> u64 {
    1
}
fn default_startretries() -> u32 {
    3
}
fn default_stopsignal() -> String {
    "TERM".to_string()
}
fn default_stopwaitsecs() -> u64 {
    10
}
fn default_exitcodes() -> Vec<i32> {
    vec![0]
}

impl ProcessConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn killasgroup(&self) -> bool {
        self.killasgroup.unwrap_or(self.stopasgroup)
    }

    pub fn stdout_logfile(&self) -> PathBuf {
        self.stdout_logfile
            .clone()
            .unwrap_or_else(|| env::WARDEN_LOGS_DIR.join(format!("{}.out.log", self.name)))
    }

    pub fn stderr_logfile(&self) -> PathBuf {
        self.stderr_logfile
            .clone()
            .unwrap_or_else(|| env::WARDEN_LOGS_DIR.join(format!("{}.err.log", self.name)))
    }
}

/// Listener-pool knobs carried by a group that dispatches events.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub events: Vec<EventSubscription>,
    pub buffer_size: usize,
    pub dispatch_throttle: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupConfig {
    pub name: String,
    pub priority: i32,
    pub config_type: ConfigType,
    /// Present when this group is an event-listener pool.
    pub pool: Option<PoolSettings>,
    /// Sorted by (priority, name).
    pub process_configs: Vec<ProcessConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct GroupSection {
    #[serde(default = "default_priority")]
    priority: i32,
    #[serde(default)]
    config_type: ConfigType,
}

#[derive(Debug, Deserialize)]
struct PoolSection {
    #[serde(default = "default_priority")]
    priority: i32,
    #[serde(default)]
    config_type: ConfigType,
    events: Vec<String>,
    #[serde(default = "default_buffer_size")]
    buffer_size: usize,
    #[serde(default)]
    dispatch_throttle_ms: u64,
}

fn default_buffer_size() -> usize {
    10
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    groups: IndexMap<String, GroupSection>,
    #[serde(default)]
    pools: IndexMap<String, PoolSection>,
    #[serde(default)]
    processes: IndexMap<String, ProcessConfig>,
}

/// Load and resolve the config file into group configs, sorted by
/// (priority, name).
pub fn load(path: &Path) -> Result<Vec<GroupConfig>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        details: Some(e.to_string()),
    })?;
    let file: ConfigFile = toml::from_str(&raw).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        details: Some(e.to_string()),
    })?;
    resolve(file)
}

fn resolve(file: ConfigFile) -> Result<Vec<GroupConfig>, ConfigError> {
    let mut groups: IndexMap<String, GroupConfig> = IndexMap::new();

    for (name, section) in &file.groups {
        groups.insert(
            name.clone(),
            GroupConfig {
                name: name.clone(),
                priority: section.priority,
                config_type: section.config_type,
                pool: None,
                process_configs: vec![],
            },
        );
    }
    for (name, section) in &file.pools {
        if groups.contains_key(name) {
            return Err(ConfigError::DuplicateName(name.clone()));
        }
        let mut events = Vec::with_capacity(section.events.len());
        for raw in &section.events {
            let sub =
                EventSubscription::from_name(raw).ok_or_else(|| ConfigError::UnknownEvent {
                    pool: name.clone(),
                    event: raw.clone(),
                })?;
            events.push(sub);
        }
        groups.insert(
            name.clone(),
            GroupConfig {
                name: name.clone(),
                priority: section.priority,
                config_type: section.config_type,
                pool: Some(PoolSettings {
                    events,
                    buffer_size: section.buffer_size,
                    dispatch_throttle: Duration::from_millis(section.dispatch_throttle_ms),
                }),
                process_configs: vec![],
            },
        );
    }

    for (name, config) in file.processes {
        let mut config = config;
        config.name = name.clone();
        validate_process(&config)?;
        match config.group.clone() {
            Some(group) => {
                let Some(entry) = groups.get_mut(&group) else {
                    return Err(ConfigError::UnknownGroup {
                        process: name,
                        group,
                    });
                };
                entry.process_configs.push(config);
            }
            None => {
                // implicit single-member group named after the process
                if groups.contains_key(&name) {
                    return Err(ConfigError::DuplicateName(name));
                }
                groups.insert(
                    name.clone(),
                    GroupConfig {
                        name: name.clone(),
                        priority: config.priority,
                        config_type: ConfigType::default(),
                        pool: None,
                        process_configs: vec![config],
                    },
                );
            }
        }
    }

    let mut out: Vec<GroupConfig> = groups.into_values().collect();
    for group in &mut out {
        group
            .process_configs
            .sort_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));
    }
    out.sort_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));
    Ok(out)
}

fn validate_process(config: &ProcessConfig) -> Result<(), ConfigError> {
    if config.run_detached && config.pid_file.is_none() {
        return Err(ConfigError::DetachedNeedsPidFile(config.name.clone()));
    }
    #[cfg(unix)]
    if crate::process::signal_by_name(&config.stopsignal).is_none() {
        return Err(ConfigError::BadStopSignal {
            process: config.name.clone(),
            signal: config.stopsignal.clone(),
        });
    }
    Ok(())
}

/// Diff freshly-loaded group configs against the active set. Returns
/// (added, changed, removed) group names.
pub fn diff(
    new: &[GroupConfig],
    active: &[GroupConfig],
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut added = vec![];
    let mut changed = vec![];
    let mut removed = vec![];
    for group in new {
        match active.iter().find(|g| g.name == group.name) {
            None => added.push(group.name.clone()),
            Some(old) if old != group => changed.push(group.name.clone()),
            Some(_) => {}
        }
    }
    for group in active {
        if !new.iter().any(|g| g.name == group.name) {
            removed.push(group.name.clone());
        }
    }
    (added, changed, removed)
}

/// Split a `group:name` spec. `"g:*"` selects the whole group, a bare name
/// means the process and its implicit group share it.
pub fn split_namespec(namespec: &str) -> (String, Option<String>) {
    match namespec.split_once(':') {
        Some((group, "*")) => (group.to_string(), None),
        Some((group, process)) => (group.to_string(), Some(process.to_string())),
        None => (namespec.to_string(), Some(namespec.to_string())),
    }
}

pub fn make_namespec(group: &str, process: &str) -> String {
    if group == process {
        process.to_string()
    } else {
        format!("{group}:{process}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"
[groups.radio]
priority = 10
config_type = "waveforms"

[pools.audit]
priority = 5
events = ["PROCESS_STATE", "TICK_60"]
buffer_size = 4

[processes.rx]
group = "radio"
command = "/usr/bin/rx --rate 48k"
priority = 1
startsecs = 2

[processes.tx]
group = "radio"
command = "/usr/bin/tx"
priority = 2
waitforprevious = 3
failafterwait = true

[processes.audit0]
group = "audit"
command = "/usr/bin/audit-listener"

[processes.lone]
command = "/bin/true"
autostart = false
"#
    }

    fn parse(raw: &str) -> Vec<GroupConfig> {
        resolve(toml::from_str(raw).unwrap()).unwrap()
    }

    #[test]
    fn resolves_groups_pools_and_implicit_groups() {
        let groups = parse(sample());
        let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
        // sorted by priority: audit(5), radio(10), lone(999)
        assert_eq!(names, ["audit", "radio", "lone"]);

        let radio = &groups[1];
        assert_eq!(radio.config_type, ConfigType::Waveforms);
        let members: Vec<_> = radio.process_configs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(members, ["rx", "tx"]);
        assert_eq!(radio.process_configs[1].waitforprevious, Some(3));
        assert!(radio.process_configs[1].failafterwait);

        let audit = &groups[0];
        let pool = audit.pool.as_ref().unwrap();
        assert_eq!(pool.buffer_size, 4);
        assert_eq!(pool.events.len(), 2);

        let lone = &groups[2];
        assert!(lone.pool.is_none());
        assert_eq!(lone.process_configs[0].name, "lone");
        assert!(!lone.process_configs[0].autostart);
    }

    #[test]
    fn process_defaults() {
        let groups = parse(sample());
        let rx = &groups[1].process_configs[0];
        assert_eq!(rx.startsecs, 2);
        assert_eq!(rx.startretries, 3);
        assert_eq!(rx.stopsignal, "TERM");
        assert_eq!(rx.stopwaitsecs, 10);
        assert_eq!(rx.exitcodes, vec![0]);
        assert!(rx.enabled);
        assert!(!rx.killasgroup());
    }

    #[test]
    fn killasgroup_follows_stopasgroup() {
        let groups = parse(
            r#"
[processes.p]
command = "/bin/true"
stopasgroup = true
"#,
        );
        assert!(groups[0].process_configs[0].killasgroup());
    }

    #[test]
    fn unknown_group_is_an_error() {
        let file: ConfigFile = toml::from_str(
            r#"
[processes.p]
group = "nope"
command = "/bin/true"
"#,
        )
        .unwrap();
        assert!(matches!(
            resolve(file),
            Err(ConfigError::UnknownGroup { .. })
        ));
    }

    #[test]
    fn detached_requires_pid_file() {
        let file: ConfigFile = toml::from_str(
            r#"
[processes.p]
command = "/bin/true"
run_detached = true
"#,
        )
        .unwrap();
        assert!(matches!(
            resolve(file),
            Err(ConfigError::DetachedNeedsPidFile(_))
        ));
    }

    #[test]
    fn diff_is_empty_for_identical_configs() {
        let a = parse(sample());
        let b = parse(sample());
        assert_eq!(diff(&a, &b), (vec![], vec![], vec![]));
    }

    #[test]
    fn diff_reports_added_changed_removed() {
        let old = parse(sample());
        let new = parse(
            r#"
[groups.radio]
priority = 10
config_type = "waveforms"

[processes.rx]
group = "radio"
command = "/usr/bin/rx --rate 96k"

[processes.fresh]
command = "/bin/true"
"#,
        );
        let (added, changed, removed) = diff(&new, &old);
        assert_eq!(added, vec!["fresh"]);
        assert_eq!(changed, vec!["radio"]);
        let mut removed = removed;
        removed.sort();
        assert_eq!(removed, vec!["audit", "lone"]);
    }

    #[test]
    fn namespec_round_trip() {
        assert_eq!(split_namespec("radio:rx"), ("radio".into(), Some("rx".into())));
        assert_eq!(split_namespec("radio:*"), ("radio".into(), None));
        assert_eq!(split_namespec("rx"), ("rx".into(), Some("rx".into())));
        assert_eq!(make_namespec("radio", "rx"), "radio:rx");
        assert_eq!(make_namespec("rx", "rx"), "rx");
    }
}

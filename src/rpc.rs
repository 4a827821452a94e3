//! Control-plane semantics: stateless translation between the named
//! operations and the supervisor, groups and processes.
//!
//! Operations that cannot complete immediately return a [`Deferred`]: a
//! step-polling handle with an advisory delay. The supervisor polls pending
//! deferreds on every tick and replies to the caller once a step returns
//! something other than not-done.

use crate::config::{make_namespec, split_namespec};
use crate::env;
use crate::error::{FAULT_SUCCESS, Fault, SpawnFailure};
use crate::events::{self, Event, EventKind};
use crate::ipc::{IpcRequest, IpcResponse};
use crate::logtail::{self, LogReadError};
use crate::process::{Subprocess, signal_by_name, spawn};
use crate::states::{ProcessState, SupervisorState};
use crate::supervisor::Supervisor;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

pub enum DeferredPoll {
    NotDone,
    Done(IpcResponse),
}

/// A poll-able handle for an operation still in flight. `delay` is the
/// advisory pause between polls.
pub struct Deferred {
    pub delay: Duration,
    pub step: Box<dyn FnMut(&mut Supervisor) -> DeferredPoll + Send>,
}

pub enum RpcOutcome {
    Done(IpcResponse),
    Deferred(Deferred),
}

fn done(rsp: IpcResponse) -> Result<RpcOutcome, Fault> {
    Ok(RpcOutcome::Done(rsp))
}

/// Snapshot of one process for the status surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub group: String,
    pub start: i64,
    pub stop: i64,
    pub now: i64,
    pub state: i32,
    pub statename: String,
    pub enabled: bool,
    pub spawnerr: String,
    pub exitstatus: i32,
    pub stdout_logfile: String,
    pub stderr_logfile: String,
    pub pid: u32,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigInfo {
    pub name: String,
    pub group: String,
    pub config_type: String,
    pub inuse: bool,
    pub autostart: bool,
    pub enabled: bool,
    pub group_prio: i32,
    pub process_prio: i32,
}

/// Per-member result for group/all operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcStatus {
    pub name: String,
    pub group: String,
    pub status: i32,
    pub description: String,
}

pub fn dispatch(sup: &mut Supervisor, req: IpcRequest) -> Result<RpcOutcome, Fault> {
    if !matches!(req, IpcRequest::Connect) && sup.mood.is_shutting_down() {
        return Err(Fault::ShutdownState);
    }
    match req {
        IpcRequest::Connect => done(IpcResponse::Ok),
        IpcRequest::StartProcess { name, force, wait } => start_process(sup, &name, force, wait),
        IpcRequest::StartProcessGroup { name, force, wait } => {
            start_group(sup, &name, force, wait)
        }
        IpcRequest::StartAllProcesses { wait } => start_all(sup, wait),
        IpcRequest::StopProcess { name, wait } => stop_process(sup, &name, wait),
        IpcRequest::StopProcessGroup { name, wait } => stop_group(sup, &name, wait),
        IpcRequest::StopAllProcesses { wait } => stop_all(sup, wait),
        IpcRequest::SignalProcess { name, signal } => signal_process(sup, &name, &signal),
        IpcRequest::SignalProcessGroup { name, signal } => signal_group(sup, &name, &signal),
        IpcRequest::SignalAllProcesses { signal } => signal_all(sup, &signal),
        IpcRequest::GetProcessInfo { name } => get_process_info(sup, &name),
        IpcRequest::GetAllProcessInfo => get_all_process_info(sup),
        IpcRequest::GetConfigInfo { name } => get_config_info(sup, name.as_deref()),
        IpcRequest::ReloadConfig => {
            let (added, changed, removed) = sup.reload_config()?;
            done(IpcResponse::ReloadResult {
                added,
                changed,
                removed,
            })
        }
        IpcRequest::AddProcessGroup { name } => add_process_group(sup, &name),
        IpcRequest::RemoveProcessGroup { name } => remove_process_group(sup, &name),
        IpcRequest::UpdateProcessGroup { name } => {
            let members = sup.update_process_group(&name)?;
            done(IpcResponse::UpdateResult { members })
        }
        IpcRequest::ReadProcessStdoutLog {
            name,
            offset,
            length,
        } => read_process_log(sup, &name, offset, length, false),
        IpcRequest::ReadProcessStderrLog {
            name,
            offset,
            length,
        } => read_process_log(sup, &name, offset, length, true),
        IpcRequest::TailProcessStdoutLog {
            name,
            offset,
            length,
        } => tail_process_log(sup, &name, offset, length, false),
        IpcRequest::TailProcessStderrLog {
            name,
            offset,
            length,
        } => tail_process_log(sup, &name, offset, length, true),
        IpcRequest::ClearProcessLogs { name } => clear_process_logs(sup, &name),
        IpcRequest::SendProcessStdin { name, chars } => send_stdin(sup, &name, &chars),
        IpcRequest::SendRemoteCommEvent { kind, data } => {
            sup.bus.notify(Event::new(
                EventKind::RemoteCommunication,
                events::remote_comm_payload(&kind, &data),
            ));
            done(IpcResponse::Bool(true))
        }
        IpcRequest::ReadLog { offset, length } => read_main_log(offset, length),
        IpcRequest::ClearLog => clear_main_log(),
        IpcRequest::GetState => done(IpcResponse::State {
            code: sup.mood.code(),
            name: sup.mood.to_string(),
        }),
        IpcRequest::GetPid => done(IpcResponse::Pid(std::process::id())),
        IpcRequest::Shutdown => {
            sup.mood = SupervisorState::Shutdown;
            done(IpcResponse::Bool(true))
        }
        IpcRequest::Restart => {
            sup.mood = SupervisorState::Restarting;
            done(IpcResponse::Bool(true))
        }
    }
}

fn resolve_spec(sup: &Supervisor, namespec: &str) -> Result<(String, Option<String>), Fault> {
    let (group, process) = split_namespec(namespec);
    if !sup.groups.contains_key(&group) {
        return Err(Fault::BadName(namespec.to_string()));
    }
    if let Some(process) = &process
        && sup.groups[&group].by_name(process).is_none()
    {
        return Err(Fault::BadName(namespec.to_string()));
    }
    Ok((group, process))
}

fn start_process(
    sup: &mut Supervisor,
    namespec: &str,
    force: bool,
    wait: bool,
) -> Result<RpcOutcome, Fault> {
    let (group_name, process_name) = resolve_spec(sup, namespec)?;
    let Some(process_name) = process_name else {
        return start_group(sup, &group_name, force, wait);
    };

    {
        let mood = sup.mood;
        let (groups, bus) = (&mut sup.groups, &mut sup.bus);
        let proc = groups
            .get_mut(&group_name)
            .and_then(|g| g.by_name_mut(&process_name))
            .ok_or_else(|| Fault::BadName(namespec.to_string()))?;

        if !force && !proc.config.is_enabled() {
            return Err(Fault::Disabled(namespec.to_string()));
        }
        if proc.state.in_running_states() {
            return Err(Fault::AlreadyStarted(namespec.to_string()));
        }
        if force && proc.state == ProcessState::Disabled {
            proc.change_state(ProcessState::Stopped, true, bus);
        }

        // don't bother forking when exec is doomed
        match spawn::get_execv_args(&proc.config) {
            Ok(_) => {}
            Err(SpawnFailure::NotFound(f)) => return Err(Fault::NoFile(f)),
            Err(SpawnFailure::NotExecutable(f)) => return Err(Fault::NotExecutable(f)),
            Err(e) => return Err(Fault::Failed(e.to_string())),
        }

        proc.spawn(bus);
        // pick up a startsecs == 0 STARTING→RUNNING without waiting a tick
        proc.transition(mood, bus);
    }

    // collect an immediate death (bad exec, instant exit) before answering
    sup.reap();

    {
        let proc = sup
            .groups
            .get(&group_name)
            .and_then(|g| g.by_name(&process_name))
            .ok_or_else(|| Fault::BadName(namespec.to_string()))?;
        if proc.spawnerr.is_some() {
            return Err(Fault::SpawnError(namespec.to_string()));
        }
        if !wait || proc.state == ProcessState::Running {
            return done(IpcResponse::Bool(true));
        }
    }

    let spec = namespec.to_string();
    Ok(RpcOutcome::Deferred(Deferred {
        delay: Duration::from_millis(50),
        step: Box::new(move |sup| {
            let (group_name, process_name) = split_namespec(&spec);
            let process_name = process_name.unwrap_or_else(|| group_name.clone());
            let Some(proc) = sup
                .groups
                .get(&group_name)
                .and_then(|g| g.by_name(&process_name))
            else {
                return DeferredPoll::Done(IpcResponse::from_fault(&Fault::BadName(spec.clone())));
            };
            if proc.spawnerr.is_some() {
                return DeferredPoll::Done(IpcResponse::from_fault(&Fault::SpawnError(
                    spec.clone(),
                )));
            }
            match proc.state {
                ProcessState::Running => DeferredPoll::Done(IpcResponse::Bool(true)),
                ProcessState::Starting => DeferredPoll::NotDone,
                _ => DeferredPoll::Done(IpcResponse::from_fault(&Fault::AbnormalTermination(
                    spec.clone(),
                ))),
            }
        }),
    }))
}

fn start_group(
    sup: &mut Supervisor,
    name: &str,
    force: bool,
    wait: bool,
) -> Result<RpcOutcome, Fault> {
    let group = sup
        .groups
        .get(name)
        .ok_or_else(|| Fault::BadName(name.to_string()))?;
    let members: Vec<(String, String)> = group
        .processes
        .iter()
        .map(|p| (name.to_string(), p.config.name.clone()))
        .collect();
    Ok(start_many(members, force, wait))
}

fn start_all(sup: &mut Supervisor, wait: bool) -> Result<RpcOutcome, Fault> {
    Ok(start_many(all_members(sup, false), false, wait))
}

fn stop_group(sup: &mut Supervisor, name: &str, wait: bool) -> Result<RpcOutcome, Fault> {
    let group = sup
        .groups
        .get(name)
        .ok_or_else(|| Fault::BadName(name.to_string()))?;
    let members: Vec<(String, String)> = group
        .processes
        .iter()
        .rev()
        .map(|p| (name.to_string(), p.config.name.clone()))
        .collect();
    Ok(stop_many(members, wait))
}

fn stop_all(sup: &mut Supervisor, wait: bool) -> Result<RpcOutcome, Fault> {
    Ok(stop_many(all_members(sup, true), wait))
}

/// (group, process) pairs across all groups in priority order.
fn all_members(sup: &Supervisor, reverse: bool) -> Vec<(String, String)> {
    let mut groups: Vec<&crate::group::ProcessGroup> = sup.groups.values().collect();
    groups.sort_by(|a, b| {
        (a.config.priority, &a.config.name).cmp(&(b.config.priority, &b.config.name))
    });
    if reverse {
        groups.reverse();
    }
    let mut members = vec![];
    for group in groups {
        let procs: Vec<_> = group.processes.iter().collect();
        let iter: Box<dyn Iterator<Item = _>> = if reverse {
            Box::new(procs.into_iter().rev())
        } else {
            Box::new(procs.into_iter())
        };
        for proc in iter {
            members.push((group.config.name.clone(), proc.config.name.clone()));
        }
    }
    members
}

/// Start members one after another, skipping those already running. Each
/// member runs through the full `start_process` path (including its own
/// deferred when `wait` is set), so wait-for-previous ordering holds.
fn start_many(members: Vec<(String, String)>, force: bool, wait: bool) -> RpcOutcome {
    let mut queue: VecDeque<(String, String)> = members.into();
    let mut results: Vec<ProcStatus> = vec![];
    let mut inner: Option<(String, String, Deferred)> = None;
    RpcOutcome::Deferred(Deferred {
        delay: Duration::from_millis(50),
        step: Box::new(move |sup| {
            loop {
                if let Some((group, process, mut deferred)) = inner.take() {
                    match (deferred.step)(sup) {
                        DeferredPoll::NotDone => {
                            inner = Some((group, process, deferred));
                            return DeferredPoll::NotDone;
                        }
                        DeferredPoll::Done(rsp) => {
                            results.push(status_from_response(&group, &process, rsp));
                        }
                    }
                }
                let Some((group, process)) = queue.pop_front() else {
                    return DeferredPoll::Done(IpcResponse::GroupResult(results.clone()));
                };
                let state = sup
                    .groups
                    .get(&group)
                    .and_then(|g| g.by_name(&process))
                    .map(|p| p.state);
                let Some(state) = state else { continue };
                if state.in_running_states() {
                    continue;
                }
                let namespec = make_namespec(&group, &process);
                match start_process(sup, &namespec, force, wait) {
                    Ok(RpcOutcome::Done(rsp)) => {
                        results.push(status_from_response(&group, &process, rsp));
                    }
                    Ok(RpcOutcome::Deferred(deferred)) => {
                        inner = Some((group, process, deferred));
                    }
                    Err(fault) => {
                        results.push(ProcStatus {
                            name: process,
                            group,
                            status: fault.code(),
                            description: fault.to_string(),
                        });
                    }
                }
            }
        }),
    })
}

fn stop_many(members: Vec<(String, String)>, wait: bool) -> RpcOutcome {
    let mut queue: VecDeque<(String, String)> = members.into();
    let mut results: Vec<ProcStatus> = vec![];
    let mut inner: Option<(String, String, Deferred)> = None;
    RpcOutcome::Deferred(Deferred {
        delay: Duration::from_millis(50),
        step: Box::new(move |sup| {
            loop {
                if let Some((group, process, mut deferred)) = inner.take() {
                    match (deferred.step)(sup) {
                        DeferredPoll::NotDone => {
                            inner = Some((group, process, deferred));
                            return DeferredPoll::NotDone;
                        }
                        DeferredPoll::Done(rsp) => {
                            results.push(status_from_response(&group, &process, rsp));
                        }
                    }
                }
                let Some((group, process)) = queue.pop_front() else {
                    return DeferredPoll::Done(IpcResponse::GroupResult(results.clone()));
                };
                let state = sup
                    .groups
                    .get(&group)
                    .and_then(|g| g.by_name(&process))
                    .map(|p| p.state);
                let Some(state) = state else { continue };
                if !state.in_running_states() {
                    continue;
                }
                let namespec = make_namespec(&group, &process);
                match stop_process(sup, &namespec, wait) {
                    Ok(RpcOutcome::Done(rsp)) => {
                        results.push(status_from_response(&group, &process, rsp));
                    }
                    Ok(RpcOutcome::Deferred(deferred)) => {
                        inner = Some((group, process, deferred));
                    }
                    Err(fault) => {
                        results.push(ProcStatus {
                            name: process,
                            group,
                            status: fault.code(),
                            description: fault.to_string(),
                        });
                    }
                }
            }
        }),
    })
}

fn status_from_response(group: &str, process: &str, rsp: IpcResponse) -> ProcStatus {
    match rsp {
        IpcResponse::Fault { code, message, .. } => ProcStatus {
            name: process.to_string(),
            group: group.to_string(),
            status: code,
            description: message,
        },
        _ => ProcStatus {
            name: process.to_string(),
            group: group.to_string(),
            status: FAULT_SUCCESS,
            description: "OK".to_string(),
        },
    }
}

fn stop_process(sup: &mut Supervisor, namespec: &str, wait: bool) -> Result<RpcOutcome, Fault> {
    let (group_name, process_name) = resolve_spec(sup, namespec)?;
    let Some(process_name) = process_name else {
        return stop_group(sup, &group_name, wait);
    };

    {
        let shutting_down = sup.mood.is_shutting_down();
        let (groups, bus) = (&mut sup.groups, &mut sup.bus);
        let proc = groups
            .get_mut(&group_name)
            .and_then(|g| g.by_name_mut(&process_name))
            .ok_or_else(|| Fault::BadName(namespec.to_string()))?;
        if !proc.state.in_running_states() {
            return Err(Fault::NotRunning(namespec.to_string()));
        }
        if let Some(msg) = proc.stop(shutting_down, bus) {
            return Err(Fault::Failed(msg));
        }
    }

    sup.reap();

    {
        let proc = sup
            .groups
            .get(&group_name)
            .and_then(|g| g.by_name(&process_name))
            .ok_or_else(|| Fault::BadName(namespec.to_string()))?;
        if !wait || proc.state.in_all_stopped_states() {
            return done(IpcResponse::Bool(true));
        }
    }

    Ok(RpcOutcome::Deferred(Deferred {
        delay: Duration::ZERO,
        step: Box::new({
            let group_name = group_name.clone();
            let process_name = process_name.clone();
            move |sup| {
                let Some(proc) = sup
                    .groups
                    .get_mut(&group_name)
                    .and_then(|g| g.by_name_mut(&process_name))
                else {
                    return DeferredPoll::Done(IpcResponse::Bool(true));
                };
                proc.stop_report();
                if proc.state.in_all_stopped_states() {
                    DeferredPoll::Done(IpcResponse::Bool(true))
                } else {
                    DeferredPoll::NotDone
                }
            }
        }),
    }))
}

fn signal_process(sup: &mut Supervisor, namespec: &str, signal: &str) -> Result<RpcOutcome, Fault> {
    let (group_name, process_name) = resolve_spec(sup, namespec)?;
    let Some(process_name) = process_name else {
        return signal_group(sup, &group_name, signal);
    };
    let sig = signal_by_name(signal).ok_or_else(|| Fault::BadSignal(signal.to_string()))?;

    let (groups, bus) = (&mut sup.groups, &mut sup.bus);
    let proc = groups
        .get_mut(&group_name)
        .and_then(|g| g.by_name_mut(&process_name))
        .ok_or_else(|| Fault::BadName(namespec.to_string()))?;
    if !proc.state.in_running_states() {
        return Err(Fault::NotRunning(namespec.to_string()));
    }
    if let Some(msg) = proc.signal(sig, bus) {
        return Err(Fault::Failed(msg));
    }
    done(IpcResponse::Bool(true))
}

fn signal_group(sup: &mut Supervisor, name: &str, signal: &str) -> Result<RpcOutcome, Fault> {
    if !sup.groups.contains_key(name) {
        return Err(Fault::BadName(name.to_string()));
    }
    let sig = signal_by_name(signal).ok_or_else(|| Fault::BadSignal(signal.to_string()))?;
    let members: Vec<(String, String)> = sup.groups[name]
        .processes
        .iter()
        .map(|p| (name.to_string(), p.config.name.clone()))
        .collect();
    done(IpcResponse::GroupResult(signal_many(sup, members, sig)))
}

fn signal_all(sup: &mut Supervisor, signal: &str) -> Result<RpcOutcome, Fault> {
    let sig = signal_by_name(signal).ok_or_else(|| Fault::BadSignal(signal.to_string()))?;
    let members = all_members(sup, false);
    done(IpcResponse::GroupResult(signal_many(sup, members, sig)))
}

fn signal_many(
    sup: &mut Supervisor,
    members: Vec<(String, String)>,
    sig: nix::sys::signal::Signal,
) -> Vec<ProcStatus> {
    let (groups, bus) = (&mut sup.groups, &mut sup.bus);
    let mut results = vec![];
    for (group, process) in members {
        let Some(proc) = groups.get_mut(&group).and_then(|g| g.by_name_mut(&process)) else {
            continue;
        };
        if !proc.state.in_running_states() {
            continue;
        }
        let status = match proc.signal(sig, bus) {
            None => ProcStatus {
                name: process,
                group,
                status: FAULT_SUCCESS,
                description: "OK".to_string(),
            },
            Some(msg) => ProcStatus {
                name: process,
                group,
                status: Fault::Failed(msg.clone()).code(),
                description: msg,
            },
        };
        results.push(status);
    }
    results
}

fn get_process_info(sup: &mut Supervisor, namespec: &str) -> Result<RpcOutcome, Fault> {
    let (group_name, process_name) = resolve_spec(sup, namespec)?;
    let process_name = process_name.ok_or_else(|| Fault::BadName(namespec.to_string()))?;
    let proc = sup
        .groups
        .get(&group_name)
        .and_then(|g| g.by_name(&process_name))
        .ok_or_else(|| Fault::BadName(namespec.to_string()))?;
    done(IpcResponse::ProcessInfo(Box::new(info_for(
        proc,
        &group_name,
    ))))
}

fn info_for(proc: &Subprocess, group_name: &str) -> ProcessInfo {
    ProcessInfo {
        name: proc.config.name.clone(),
        group: group_name.to_string(),
        start: proc.laststart.map(|t| t.timestamp()).unwrap_or(0),
        stop: proc.laststop.map(|t| t.timestamp()).unwrap_or(0),
        now: chrono::Local::now().timestamp(),
        state: proc.state.code(),
        statename: proc.state.to_string(),
        enabled: proc.config.is_enabled(),
        spawnerr: proc.spawnerr.clone().unwrap_or_default(),
        exitstatus: proc.exitstatus.unwrap_or(0),
        stdout_logfile: proc.config.stdout_logfile().display().to_string(),
        stderr_logfile: proc.config.stderr_logfile().display().to_string(),
        pid: proc.pid,
        description: describe_process(proc),
    }
}

fn describe_process(proc: &Subprocess) -> String {
    match proc.state {
        ProcessState::Running => {
            let uptime = proc
                .laststart
                .map(|t| (chrono::Local::now() - t).num_seconds().max(0))
                .unwrap_or(0);
            format!("pid {}, uptime {}", proc.pid, format_uptime(uptime))
        }
        ProcessState::Fatal | ProcessState::Backoff => proc
            .spawnerr
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("unknown error (try \"tail {}\")", proc.config.name)),
        ProcessState::Disabled | ProcessState::Stopped | ProcessState::Exited => {
            if proc.laststart.is_some() {
                proc.laststop
                    .map(|t| t.format("%b %d %I:%M %p").to_string())
                    .unwrap_or_default()
            } else {
                "Not started".to_string()
            }
        }
        _ => String::new(),
    }
}

fn format_uptime(total: i64) -> String {
    let days = total / 86400;
    let rem = total % 86400;
    let h = rem / 3600;
    let m = (rem % 3600) / 60;
    let s = rem % 60;
    match days {
        0 => format!("{h}:{m:02}:{s:02}"),
        1 => format!("1 day, {h}:{m:02}:{s:02}"),
        _ => format!("{days} days, {h}:{m:02}:{s:02}"),
    }
}

fn get_all_process_info(sup: &mut Supervisor) -> Result<RpcOutcome, Fault> {
    let mut group_names: Vec<&String> = sup.groups.keys().collect();
    group_names.sort();
    let mut infos = vec![];
    for group_name in group_names {
        let group = &sup.groups[group_name.as_str()];
        let mut procs: Vec<&Subprocess> = group.processes.iter().collect();
        procs.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        for proc in procs {
            infos.push(info_for(proc, group_name));
        }
    }
    done(IpcResponse::AllProcessInfo(infos))
}

fn get_config_info(sup: &mut Supervisor, name: Option<&str>) -> Result<RpcOutcome, Fault> {
    let (group_filter, process_filter) = match name {
        Some(spec) => {
            let (g, p) = split_namespec(spec);
            (Some(g), p)
        }
        None => (None, None),
    };
    let mut infos = vec![];
    for gconfig in &sup.group_configs {
        if group_filter.as_deref().is_some_and(|g| g != gconfig.name) {
            continue;
        }
        let inuse = sup.groups.contains_key(&gconfig.name);
        for pconfig in &gconfig.process_configs {
            if process_filter.as_deref().is_some_and(|p| p != pconfig.name) {
                continue;
            }
            infos.push(ConfigInfo {
                name: pconfig.name.clone(),
                group: gconfig.name.clone(),
                config_type: gconfig.config_type.to_string(),
                inuse,
                autostart: pconfig.autostart,
                enabled: pconfig.is_enabled(),
                group_prio: gconfig.priority,
                process_prio: pconfig.priority,
            });
        }
    }
    infos.sort_by(|a, b| (&a.group, &a.name).cmp(&(&b.group, &b.name)));
    done(IpcResponse::ConfigInfo(infos))
}

fn add_process_group(sup: &mut Supervisor, name: &str) -> Result<RpcOutcome, Fault> {
    let config = sup
        .group_configs
        .iter()
        .find(|g| g.name == name)
        .cloned()
        .ok_or_else(|| Fault::BadName(name.to_string()))?;
    if !sup.add_process_group(config) {
        return Err(Fault::AlreadyAdded(name.to_string()));
    }
    done(IpcResponse::Bool(true))
}

fn remove_process_group(sup: &mut Supervisor, name: &str) -> Result<RpcOutcome, Fault> {
    if !sup.groups.contains_key(name) {
        return Err(Fault::BadName(name.to_string()));
    }
    if !sup.remove_process_group(name) {
        return Err(Fault::StillRunning(name.to_string()));
    }
    done(IpcResponse::Bool(true))
}

fn logfile_for(sup: &Supervisor, namespec: &str, stderr: bool) -> Result<std::path::PathBuf, Fault> {
    let (group_name, process_name) = resolve_spec(sup, namespec)?;
    let process_name = process_name.ok_or_else(|| Fault::BadName(namespec.to_string()))?;
    let proc = sup
        .groups
        .get(&group_name)
        .and_then(|g| g.by_name(&process_name))
        .ok_or_else(|| Fault::BadName(namespec.to_string()))?;
    Ok(if stderr {
        proc.config.stderr_logfile()
    } else {
        proc.config.stdout_logfile()
    })
}

fn read_process_log(
    sup: &mut Supervisor,
    namespec: &str,
    offset: i64,
    length: i64,
    stderr: bool,
) -> Result<RpcOutcome, Fault> {
    let logfile = logfile_for(sup, namespec, stderr)?;
    if !logfile.exists() {
        return Err(Fault::NoFile(logfile.display().to_string()));
    }
    let bytes = read_log_range(&logfile, offset, length)?;
    done(IpcResponse::Log(
        String::from_utf8_lossy(&bytes).into_owned(),
    ))
}

fn read_log_range(path: &Path, offset: i64, length: i64) -> Result<Vec<u8>, Fault> {
    logtail::read_file(path, offset, length).map_err(|e| match e {
        LogReadError::NoFile => Fault::NoFile(path.display().to_string()),
        LogReadError::BadArguments => {
            Fault::BadArguments("negative offset requires zero length".to_string())
        }
        LogReadError::Io(e) => Fault::Failed(e.to_string()),
    })
}

fn tail_process_log(
    sup: &mut Supervisor,
    namespec: &str,
    offset: i64,
    length: i64,
    stderr: bool,
) -> Result<RpcOutcome, Fault> {
    let logfile = logfile_for(sup, namespec, stderr)?;
    let (bytes, offset, overflow) = logtail::tail_file(&logfile, offset, length);
    done(IpcResponse::Tail {
        bytes: String::from_utf8_lossy(&bytes).into_owned(),
        offset,
        overflow,
    })
}

fn clear_process_logs(sup: &mut Supervisor, namespec: &str) -> Result<RpcOutcome, Fault> {
    let (group_name, process_name) = resolve_spec(sup, namespec)?;
    let process_name = process_name.ok_or_else(|| Fault::BadName(namespec.to_string()))?;
    let proc = sup
        .groups
        .get_mut(&group_name)
        .and_then(|g| g.by_name_mut(&process_name))
        .ok_or_else(|| Fault::BadName(namespec.to_string()))?;
    proc.clear_logs()
        .map_err(|_| Fault::Failed(namespec.to_string()))?;
    done(IpcResponse::Bool(true))
}

fn send_stdin(sup: &mut Supervisor, namespec: &str, chars: &str) -> Result<RpcOutcome, Fault> {
    let (group_name, process_name) = resolve_spec(sup, namespec)?;
    let process_name = process_name.ok_or_else(|| Fault::BadName(namespec.to_string()))?;
    let proc = sup
        .groups
        .get_mut(&group_name)
        .and_then(|g| g.by_name_mut(&process_name))
        .ok_or_else(|| Fault::BadName(namespec.to_string()))?;
    if proc.pid == 0 || proc.killing {
        return Err(Fault::NotRunning(namespec.to_string()));
    }
    match proc.write(chars.as_bytes()) {
        Ok(()) => done(IpcResponse::Bool(true)),
        Err(e) if e.raw_os_error() == Some(libc::EPIPE) => {
            Err(Fault::NoFile(namespec.to_string()))
        }
        Err(e) => Err(Fault::Failed(e.to_string())),
    }
}

fn read_main_log(offset: i64, length: i64) -> Result<RpcOutcome, Fault> {
    let path = env::WARDEN_LOG_FILE.clone();
    if !path.exists() {
        return Err(Fault::NoFile(path.display().to_string()));
    }
    let bytes = read_log_range(&path, offset, length)?;
    done(IpcResponse::Log(
        String::from_utf8_lossy(&bytes).into_owned(),
    ))
}

fn clear_main_log() -> Result<RpcOutcome, Fault> {
    let path = env::WARDEN_LOG_FILE.clone();
    if !path.exists() {
        return Err(Fault::NoFile(path.display().to_string()));
    }
    std::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| Fault::Failed(e.to_string()))?;
    done(IpcResponse::Bool(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, GroupConfig};

    fn load(toml: &str) -> Vec<GroupConfig> {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), toml).unwrap();
        config::load(file.path()).unwrap()
    }

    fn sup() -> Supervisor {
        Supervisor::new(load(
            r#"
[groups.radio]
priority = 10

[processes.rx]
group = "radio"
command = "/bin/true"
autostart = false

[processes.quiet]
command = "/bin/true"
autostart = false
enabled = false
"#,
        ))
    }

    fn fault_of(result: Result<RpcOutcome, Fault>) -> Fault {
        match result {
            Err(fault) => fault,
            Ok(_) => panic!("expected fault"),
        }
    }

    #[test]
    fn unknown_names_are_bad_name() {
        let mut sup = sup();
        let fault = fault_of(dispatch(
            &mut sup,
            IpcRequest::GetProcessInfo {
                name: "radio:nope".to_string(),
            },
        ));
        assert_eq!(fault.name(), "BAD_NAME");
    }

    #[test]
    fn start_disabled_without_force_faults() {
        let mut sup = sup();
        let fault = fault_of(start_process(&mut sup, "quiet", false, false));
        assert_eq!(fault.name(), "DISABLED");
    }

    #[test]
    fn start_already_started_faults() {
        let mut sup = sup();
        sup.groups
            .get_mut("radio")
            .unwrap()
            .by_name_mut("rx")
            .unwrap()
            .state = ProcessState::Running;
        let fault = fault_of(start_process(&mut sup, "radio:rx", false, false));
        assert_eq!(fault.name(), "ALREADY_STARTED");
    }

    #[test]
    fn stop_not_running_faults() {
        let mut sup = sup();
        let fault = fault_of(stop_process(&mut sup, "radio:rx", false));
        assert_eq!(fault.name(), "NOT_RUNNING");
    }

    #[test]
    fn signal_with_bad_name_faults() {
        let mut sup = sup();
        let fault = fault_of(signal_process(&mut sup, "radio:rx", "NOSIG"));
        assert_eq!(fault.name(), "BAD_SIGNAL");
    }

    #[test]
    fn operations_fault_during_shutdown() {
        let mut sup = sup();
        sup.mood = SupervisorState::Shutdown;
        let fault = fault_of(dispatch(&mut sup, IpcRequest::GetAllProcessInfo));
        assert_eq!(fault.name(), "SHUTDOWN_STATE");
    }

    #[test]
    fn info_descriptions() {
        let mut sup = sup();
        {
            let proc = sup
                .groups
                .get_mut("radio")
                .unwrap()
                .by_name_mut("rx")
                .unwrap();
            assert_eq!(describe_process(proc), "Not started");

            proc.state = ProcessState::Running;
            proc.pid = 42;
            proc.laststart = Some(chrono::Local::now() - chrono::Duration::seconds(75));
            assert_eq!(describe_process(proc), "pid 42, uptime 0:01:15");

            proc.state = ProcessState::Fatal;
            proc.spawnerr = Some("spawn error".to_string());
            assert_eq!(describe_process(proc), "spawn error");
        }
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(0), "0:00:00");
        assert_eq!(format_uptime(3661), "1:01:01");
        assert_eq!(format_uptime(86400 + 61), "1 day, 0:01:01");
        assert_eq!(format_uptime(3 * 86400), "3 days, 0:00:00");
    }

    #[test]
    fn config_info_reports_inuse_and_priorities() {
        let mut sup = sup();
        let Ok(RpcOutcome::Done(IpcResponse::ConfigInfo(infos))) =
            get_config_info(&mut sup, None)
        else {
            panic!("expected config info");
        };
        assert_eq!(infos.len(), 2);
        let rx = infos.iter().find(|i| i.name == "rx").unwrap();
        assert!(rx.inuse);
        assert_eq!(rx.group, "radio");
        assert_eq!(rx.group_prio, 10);
        let quiet = infos.iter().find(|i| i.name == "quiet").unwrap();
        assert!(!quiet.enabled);
    }

    #[test]
    fn get_state_reports_mood() {
        let mut sup = sup();
        let Ok(RpcOutcome::Done(IpcResponse::State { code, name })) =
            dispatch(&mut sup, IpcRequest::GetState)
        else {
            panic!("expected state");
        };
        assert_eq!(code, 1);
        assert_eq!(name, "RUNNING");
    }

    #[test]
    fn shutdown_sets_mood() {
        let mut sup = sup();
        let Ok(RpcOutcome::Done(IpcResponse::Bool(true))) =
            dispatch(&mut sup, IpcRequest::Shutdown)
        else {
            panic!("expected ok");
        };
        assert_eq!(sup.mood, SupervisorState::Shutdown);
    }

    #[test]
    fn group_spec_targets_whole_group() {
        let mut sup = sup();
        // stopping a group with nothing running yields an empty result set
        let Ok(RpcOutcome::Deferred(mut d)) = stop_process(&mut sup, "radio:*", false) else {
            panic!("expected deferred");
        };
        match (d.step)(&mut sup) {
            DeferredPoll::Done(IpcResponse::GroupResult(results)) => assert!(results.is_empty()),
            _ => panic!("expected group result"),
        }
    }
}

//! The spawn path: command resolution, pipe plumbing and the actual
//! fork/exec via `std::process::Command`.
//!
//! Detached processes are not exec'd directly; the supervisor's child is a
//! shepherd (`warden probe`, re-exec of this binary) that daemonises the real
//! program and then polls its liveness probe. The shepherd's lifetime is what
//! the ordinary reaping machinery tracks.

use crate::config::ProcessConfig;
use crate::env;
use crate::error::SpawnFailure;
use crate::process::dispatcher::{Channel, Dispatchers, InputDispatcher, OutputDispatcher};
use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Resolve the configured command into an executable path plus argv,
/// searching $PATH for bare program names and rejecting non-executables
/// before we bother forking.
pub fn get_execv_args(config: &ProcessConfig) -> Result<(PathBuf, Vec<String>), SpawnFailure> {
    let argv = shell_words::split(&config.command).map_err(|e| SpawnFailure::BadCommand {
        command: config.command.clone(),
        reason: e.to_string(),
    })?;
    let Some(program) = argv.first() else {
        return Err(SpawnFailure::EmptyCommand);
    };

    let filename = if program.contains('/') {
        PathBuf::from(program)
    } else {
        search_path(program).unwrap_or_else(|| PathBuf::from(program))
    };

    check_executable(&filename)?;
    Ok((filename, argv))
}

fn search_path(program: &str) -> Option<PathBuf> {
    let path = env::var("PATH").ok()?;
    for dir in path.split(':') {
        let candidate = Path::new(dir).join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn check_executable(filename: &Path) -> Result<(), SpawnFailure> {
    let display = filename.display().to_string();
    let meta = std::fs::metadata(filename).map_err(|_| SpawnFailure::NotFound(display.clone()))?;
    if meta.is_dir() || meta.permissions().mode() & 0o111 == 0 {
        return Err(SpawnFailure::NotExecutable(display));
    }
    Ok(())
}

/// Child-side ends of the stdio pipes, handed to `Command`.
pub struct ChildStdio {
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

/// Parent-side ends; `stderr` is absent when stderr is redirected onto the
/// stdout pipe.
pub struct ParentStdio {
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: Option<OwnedFd>,
}

/// Create the stdio pipes for a child. This is the step that can hit EMFILE,
/// which the caller turns into a BACKOFF. Everything is CLOEXEC: the child
/// ends get dup2'd onto 0/1/2 at exec, and parent ends must not leak into
/// sibling children or pipe EOFs never arrive.
pub fn make_pipes(redirect_stderr: bool) -> std::io::Result<(ParentStdio, ChildStdio)> {
    use nix::fcntl::OFlag;
    let (stdin_child, stdin_parent) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    let (stdout_parent, stdout_child) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    let (stderr_parent, stderr_child) = if redirect_stderr {
        (None, stdout_child.try_clone()?)
    } else {
        let (r, w) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        (Some(r), w)
    };
    Ok((
        ParentStdio {
            stdin: stdin_parent,
            stdout: stdout_parent,
            stderr: stderr_parent,
        },
        ChildStdio {
            stdin: stdin_child,
            stdout: stdout_child,
            stderr: stderr_child,
        },
    ))
}

fn set_nonblocking<F: AsFd>(fd: &F) -> nix::Result<()> {
    use nix::fcntl::{FcntlArg, OFlag, fcntl};
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Wire the parent pipe ends into dispatchers. Opening the log files is part
/// of dispatcher creation and shares its failure path.
pub fn build_dispatchers(
    config: &ProcessConfig,
    is_listener: bool,
    parent: ParentStdio,
) -> std::io::Result<Dispatchers> {
    set_nonblocking(&parent.stdin).map_err(std::io::Error::from)?;
    set_nonblocking(&parent.stdout).map_err(std::io::Error::from)?;
    if let Some(fd) = parent.stderr.as_ref() {
        set_nonblocking(fd).map_err(std::io::Error::from)?;
    }
    let stdout = OutputDispatcher::new(
        Channel::Stdout,
        File::from(parent.stdout),
        config.stdout_logfile(),
        config.stdout_events_enabled,
        is_listener,
    )?;
    let stderr = match parent.stderr {
        Some(fd) => Some(OutputDispatcher::new(
            Channel::Stderr,
            File::from(fd),
            config.stderr_logfile(),
            config.stderr_events_enabled,
            false,
        )?),
        None => None,
    };
    Ok(Dispatchers {
        stdin: Some(InputDispatcher::new(File::from(parent.stdin))),
        stdout: Some(stdout),
        stderr,
    })
}

/// Environment exported to every child, ahead of config-provided overrides.
pub fn child_env(config: &ProcessConfig, group_name: &str) -> Vec<(String, String)> {
    let serverurl = config
        .serverurl
        .clone()
        .unwrap_or_else(|| env::WARDEN_SERVER_URL.clone());
    let mut vars = vec![
        ("SUPERVISOR_ENABLED".to_string(), "1".to_string()),
        (
            "SUPERVISOR_PROCESS_NAME".to_string(),
            config.name.clone(),
        ),
        ("SUPERVISOR_GROUP_NAME".to_string(), group_name.to_string()),
        ("SUPERVISOR_SERVER_URL".to_string(), serverurl),
    ];
    for (k, v) in &config.environment {
        vars.push((k.clone(), v.clone()));
    }
    vars
}

/// Fork and exec. Exec failures (ENOENT after a TOCTOU, EACCES) surface as
/// the returned error, which the caller records as a spawn error.
pub fn launch(
    config: &ProcessConfig,
    group_name: &str,
    filename: &Path,
    argv: &[String],
    stdio: ChildStdio,
) -> std::io::Result<Child> {
    let mut cmd = if config.run_detached {
        shepherd_command(config, argv)
    } else {
        let mut cmd = Command::new(filename);
        cmd.args(&argv[1..]);
        if let Some(dir) = &config.directory {
            cmd.current_dir(dir);
        }
        cmd
    };

    cmd.stdin(Stdio::from(stdio.stdin))
        .stdout(Stdio::from(stdio.stdout))
        .stderr(Stdio::from(stdio.stderr))
        .envs(child_env(config, group_name));
    if let Some(uid) = config.uid {
        cmd.uid(uid);
    }
    if let Some(gid) = config.gid {
        cmd.gid(gid);
    }

    // New process group so signals aimed at the supervisor's terminal do not
    // leak into children, and so stopasgroup/killasgroup can target -pid.
    let umask = config.umask;
    unsafe {
        cmd.pre_exec(move || {
            if libc::setpgid(0, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(mask) = umask {
                libc::umask(mask as libc::mode_t);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// The supervisor's direct child for a detached process: a re-exec of this
/// binary running the probe loop.
fn shepherd_command(config: &ProcessConfig, argv: &[String]) -> Command {
    let mut cmd = Command::new(&*env::WARDEN_BIN);
    cmd.arg("probe");
    cmd.arg("--name").arg(&config.name);
    if let Some(pid_file) = &config.pid_file {
        cmd.arg("--pid-file").arg(pid_file);
    }
    if let Some(check) = &config.status_check_command {
        cmd.arg("--status-check").arg(check);
    }
    if let Some(script) = &config.started_status_script {
        cmd.arg("--started-script").arg(script);
    }
    if let Some(dir) = &config.directory {
        cmd.arg("--directory").arg(dir);
    }
    if let Some(umask) = config.umask {
        cmd.arg("--umask").arg(umask.to_string());
    }
    cmd.arg("--");
    cmd.args(argv);
    cmd
}

/// Map a pipe/fork errno onto the message recorded as `spawnerr`.
pub fn describe_pipe_error(name: &str, err: &std::io::Error) -> SpawnFailure {
    if err.raw_os_error() == Some(libc::EMFILE) {
        SpawnFailure::TooManyFiles(name.to_string())
    } else {
        SpawnFailure::Dispatcher {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }
}

pub fn describe_fork_error(name: &str, err: &std::io::Error) -> SpawnFailure {
    if err.raw_os_error() == Some(libc::EAGAIN) {
        SpawnFailure::ProcessTableFull(name.to_string())
    } else {
        SpawnFailure::Fork {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;

    fn config_for(command: &str) -> ProcessConfig {
        let mut config: ProcessConfig = toml::from_str(&format!("command = {command:?}")).unwrap();
        config.name = "test".to_string();
        config
    }

    #[test]
    fn resolves_absolute_commands() {
        let (filename, argv) = get_execv_args(&config_for("/bin/sh -c 'echo hi'")).unwrap();
        assert_eq!(filename, PathBuf::from("/bin/sh"));
        assert_eq!(argv, vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn searches_path_for_bare_names() {
        let (filename, _) = get_execv_args(&config_for("sh")).unwrap();
        assert!(filename.to_string_lossy().ends_with("/sh"));
    }

    #[test]
    fn missing_command_is_not_found() {
        assert!(matches!(
            get_execv_args(&config_for("/no/such/binary")),
            Err(SpawnFailure::NotFound(_))
        ));
    }

    #[test]
    fn directory_is_not_executable() {
        assert!(matches!(
            get_execv_args(&config_for("/tmp")),
            Err(SpawnFailure::NotExecutable(_))
        ));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            get_execv_args(&config_for("")),
            Err(SpawnFailure::EmptyCommand)
        ));
    }

    #[test]
    fn child_env_includes_supervisor_vars() {
        let mut config = config_for("/bin/true");
        config
            .environment
            .insert("EXTRA".to_string(), "1".to_string());
        let vars = child_env(&config, "radio");
        let get = |k: &str| {
            vars.iter()
                .find(|(name, _)| name == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("SUPERVISOR_ENABLED"), Some("1"));
        assert_eq!(get("SUPERVISOR_PROCESS_NAME"), Some("test"));
        assert_eq!(get("SUPERVISOR_GROUP_NAME"), Some("radio"));
        assert!(get("SUPERVISOR_SERVER_URL").is_some());
        assert_eq!(get("EXTRA"), Some("1"));
    }
}

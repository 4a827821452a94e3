//! Detached-daemon support: pid-file probes and the shepherd loop.
//!
//! A detached process daemonises itself (or is daemonised for it); the
//! supervisor's own child is a shepherd that launches the program, waits for
//! its pid file, and then polls the status probe once a second. The shepherd
//! exits 0 once the daemon has been observed up and later went down, so the
//! reap path sees an expected exit.

use crate::config::ProcessConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time;

/// kill(pid, 0) liveness test.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

pub fn read_pid_file(path: &Path) -> Option<i32> {
    let raw = std::fs::read_to_string(path).ok()?;
    raw.split_whitespace().next()?.parse().ok()
}

/// Run the status probe for a detached process: the configured check command
/// when present, otherwise a liveness test against the pid file.
pub fn probe(status_check_command: Option<&str>, pid_file: Option<&Path>) -> bool {
    if let Some(cmd) = status_check_command {
        return sh(cmd, None);
    }
    pid_file
        .and_then(read_pid_file)
        .map(pid_alive)
        .unwrap_or(false)
}

pub fn check_status(config: &ProcessConfig) -> bool {
    probe(
        config.status_check_command.as_deref(),
        config.pid_file.as_deref(),
    )
}

/// Run a stop pre/post script. A directory runs every file in it, sorted.
pub fn run_script(script: &str) {
    let path = Path::new(script);
    let mut files = vec![PathBuf::from(script)];
    if path.is_dir() {
        match std::fs::read_dir(path) {
            Ok(entries) => {
                files = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
                files.sort();
            }
            Err(e) => {
                warn!("unable to list scripts in {script}: {e}");
                return;
            }
        }
    }
    for file in files {
        if !file.exists() {
            continue;
        }
        match std::process::Command::new("/bin/bash").arg(&file).status() {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("script {} exited with {status}", file.display()),
            Err(e) => warn!("unable to execute script {}: {e}", file.display()),
        }
    }
}

fn sh(cmdline: &str, dir: Option<&Path>) -> bool {
    let mut cmd = std::process::Command::new("sh");
    cmd.arg("-c")
        .arg(cmdline)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.status().map(|s| s.success()).unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct ShepherdOptions {
    pub name: String,
    pub pid_file: PathBuf,
    pub status_check_command: Option<String>,
    pub started_status_script: Option<String>,
    pub directory: Option<PathBuf>,
    pub umask: Option<u32>,
    pub argv: Vec<String>,
}

/// The shepherd entry point. Returns the process exit code: 0 when the
/// daemon was observed up (including a shutdown request arriving later),
/// 127 when it never came up.
pub async fn run_shepherd(opts: ShepherdOptions) -> i32 {
    let probe_now =
        || probe(opts.status_check_command.as_deref(), Some(opts.pid_file.as_path()));

    if probe_now() {
        info!(
            "process for {} was already running; not relaunching",
            opts.name
        );
    } else {
        // the pid file's reappearance is how we know the daemon started
        if opts.pid_file.exists()
            && let Err(e) = std::fs::remove_file(&opts.pid_file)
        {
            warn!("unable to remove stale pid file {}: {e}", opts.pid_file.display());
        }
        if let Err(e) = daemonize(&opts) {
            error!("couldn't launch {}: {e}", opts.name);
            return 127;
        }
        for _ in 0..10 {
            if opts.pid_file.exists() {
                break;
            }
            time::sleep(Duration::from_secs(1)).await;
        }
        if let Some(script) = &opts.started_status_script
            && !sh(script, opts.directory.as_deref())
        {
            error!("bad start status for {}", opts.name);
            return 127;
        }
    }

    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("unable to register SIGTERM handler: {e}");
            return 127;
        }
    };

    let mut exit_code = 127;
    loop {
        if probe_now() {
            exit_code = 0;
        } else {
            // the daemon ended on its own; the pid file is stale now
            if opts.pid_file.exists() {
                let _ = std::fs::remove_file(&opts.pid_file);
            }
            break;
        }
        tokio::select! {
            _ = time::sleep(Duration::from_secs(1)) => {}
            _ = term.recv() => {
                // supervisor shutdown: leave the daemon and its pid file alone
                return exit_code;
            }
        }
    }
    exit_code
}

/// Launch the target decoupled from the shepherd: its own session, null
/// stdio. The intermediate child is reaped in the background so the probe
/// never sees a zombie.
fn daemonize(opts: &ShepherdOptions) -> std::io::Result<()> {
    let Some(program) = opts.argv.first() else {
        return Err(std::io::Error::other("empty command"));
    };
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(&opts.argv[1..])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(dir) = &opts.directory {
        cmd.current_dir(dir);
    }
    let umask = opts.umask;
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::umask(umask.unwrap_or(0) as libc::mode_t);
            Ok(())
        });
    }
    let mut child = cmd.spawn()?;
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn pid_file_parsing() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "12345").unwrap();
        f.flush().unwrap();
        assert_eq!(read_pid_file(f.path()), Some(12345));

        let mut g = tempfile::NamedTempFile::new().unwrap();
        writeln!(g, "not-a-pid").unwrap();
        g.flush().unwrap();
        assert_eq!(read_pid_file(g.path()), None);

        assert_eq!(read_pid_file(Path::new("/nonexistent/pid")), None);
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id() as i32));
        assert!(!pid_alive(0));
    }

    #[test]
    fn probe_prefers_check_command() {
        assert!(probe(Some("true"), None));
        assert!(!probe(Some("false"), None));
        assert!(!probe(None, None));
    }
}

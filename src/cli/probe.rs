use crate::Result;
use crate::process::detached::{self, ShepherdOptions};
use std::path::PathBuf;

/// Internal: shepherd for a detached process. Launches the target, waits for
/// its pid file, then polls the status probe until it fails.
#[derive(Debug, clap::Args)]
pub struct Probe {
    #[clap(long)]
    name: String,
    #[clap(long)]
    pid_file: PathBuf,
    #[clap(long)]
    status_check: Option<String>,
    #[clap(long)]
    started_script: Option<String>,
    #[clap(long)]
    directory: Option<PathBuf>,
    #[clap(long)]
    umask: Option<u32>,
    /// The command to daemonise
    #[clap(last = true)]
    argv: Vec<String>,
}

impl Probe {
    pub async fn run(&self) -> Result<()> {
        let code = detached::run_shepherd(ShepherdOptions {
            name: self.name.clone(),
            pid_file: self.pid_file.clone(),
            status_check_command: self.status_check.clone(),
            started_status_script: self.started_script.clone(),
            directory: self.directory.clone(),
            umask: self.umask,
            argv: self.argv.clone(),
        })
        .await;
        std::process::exit(code);
    }
}

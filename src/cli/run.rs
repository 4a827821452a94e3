use crate::ipc::server::IpcServer;
use crate::states::SupervisorState;
use crate::supervisor::Supervisor;
use crate::{Result, config, env, logger};
use miette::IntoDiagnostic;

/// Run the warden daemon in the foreground
#[derive(Debug, clap::Args)]
pub struct Run {
    /// Fork into the background instead
    #[clap(short = 'd', long)]
    daemon: bool,
}

impl Run {
    pub async fn run(&self) -> Result<()> {
        if self.daemon {
            debug!("starting daemon in background");
            duct::cmd!(&*env::WARDEN_BIN, "run")
                .stdout_null()
                .stderr_null()
                .start()
                .into_diagnostic()?;
            return Ok(());
        }

        logger::attach_file();
        loop {
            let configs = config::load(&env::WARDEN_CONFIG)?;
            let mut supervisor = Supervisor::new(configs);
            let ipc = IpcServer::new()?;
            let mood = supervisor.run(ipc).await?;
            if mood != SupervisorState::Restarting {
                break;
            }
            info!("restart requested, re-reading config");
        }
        Ok(())
    }
}

use crate::Result;
use crate::ipc::client::IpcClient;

/// Re-read the config file and report what changed (no side effects)
#[derive(Debug, clap::Args)]
pub struct Reread {}

impl Reread {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;
        let (added, changed, removed) = client.reload_config().await?;
        if added.is_empty() && changed.is_empty() && removed.is_empty() {
            info!("no config changes");
            return Ok(());
        }
        for name in &added {
            println!("{name}: available");
        }
        for name in &changed {
            println!("{name}: changed");
        }
        for name in &removed {
            println!("{name}: disappeared");
        }
        Ok(())
    }
}

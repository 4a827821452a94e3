use crate::Result;
use crate::ipc::IpcRequest;
use crate::ipc::client::IpcClient;

/// Restart the daemon: stop everything, re-read the config and start over
#[derive(Debug, clap::Args)]
pub struct Reload {}

impl Reload {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;
        client.call(IpcRequest::Restart).await?;
        info!("restart requested");
        Ok(())
    }
}

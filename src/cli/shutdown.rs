use crate::Result;
use crate::ipc::IpcRequest;
use crate::ipc::client::IpcClient;

/// Shut the daemon down, stopping every supervised process
#[derive(Debug, clap::Args)]
pub struct Shutdown {}

impl Shutdown {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;
        client.call(IpcRequest::Shutdown).await?;
        info!("shutdown requested");
        Ok(())
    }
}

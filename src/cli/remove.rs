use crate::Result;
use crate::ipc::IpcRequest;
use crate::ipc::client::IpcClient;

/// Deactivate a stopped process group
#[derive(Debug, clap::Args)]
pub struct Remove {
    /// Group names
    names: Vec<String>,
}

impl Remove {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;
        for name in &self.names {
            client
                .call(IpcRequest::RemoveProcessGroup { name: name.clone() })
                .await?;
            info!("{name}: group removed");
        }
        Ok(())
    }
}

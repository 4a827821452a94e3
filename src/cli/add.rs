use crate::Result;
use crate::ipc::IpcRequest;
use crate::ipc::client::IpcClient;

/// Activate a process group from the last-read config
#[derive(Debug, clap::Args)]
pub struct Add {
    /// Group names
    names: Vec<String>,
}

impl Add {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;
        for name in &self.names {
            client
                .call(IpcRequest::AddProcessGroup { name: name.clone() })
                .await?;
            info!("{name}: group added");
        }
        Ok(())
    }
}

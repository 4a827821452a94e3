use crate::Result;
use crate::ipc::IpcRequest;
use crate::ipc::client::IpcClient;

/// Clear process log files
#[derive(Debug, clap::Args)]
pub struct Clear {
    /// Process names ("name" or "group:name")
    names: Vec<String>,
    /// Clear the daemon's own log instead
    #[clap(long)]
    main: bool,
}

impl Clear {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;
        if self.main {
            client.call(IpcRequest::ClearLog).await?;
            info!("cleared daemon log");
            return Ok(());
        }
        for name in &self.names {
            client
                .call(IpcRequest::ClearProcessLogs { name: name.clone() })
                .await?;
            info!("{name}: logs cleared");
        }
        Ok(())
    }
}

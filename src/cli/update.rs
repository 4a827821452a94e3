use crate::Result;
use crate::ipc::IpcRequest;
use crate::ipc::client::IpcClient;

/// Re-read the config and apply the changes: add new groups, update changed
/// ones, stop and remove groups that disappeared
#[derive(Debug, clap::Args)]
pub struct Update {
    /// Restrict to these group names
    names: Vec<String>,
}

impl Update {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;
        let (added, changed, removed) = client.reload_config().await?;

        let selected = |name: &String| self.names.is_empty() || self.names.contains(name);

        for name in removed.iter().filter(|n| selected(n)) {
            let _ = client
                .request(IpcRequest::StopProcessGroup {
                    name: name.clone(),
                    wait: true,
                })
                .await?;
            client
                .call(IpcRequest::RemoveProcessGroup { name: name.clone() })
                .await?;
            info!("{name}: stopped and removed");
        }
        for name in changed.iter().filter(|n| selected(n)) {
            client
                .call(IpcRequest::UpdateProcessGroup { name: name.clone() })
                .await?;
            info!("{name}: updated");
        }
        for name in added.iter().filter(|n| selected(n)) {
            client
                .call(IpcRequest::AddProcessGroup { name: name.clone() })
                .await?;
            info!("{name}: added");
        }
        Ok(())
    }
}

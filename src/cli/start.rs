use crate::Result;
use crate::cli::expand_targets;
use crate::ipc::client::IpcClient;
use crate::ipc::{IpcRequest, IpcResponse};

/// Start process(es)
#[derive(Debug, clap::Args)]
pub struct Start {
    /// Namespecs ("name", "group:name", "group:*") or a config type
    /// (domain|nodes|waveforms|process)
    names: Vec<String>,
    /// Start even if the process is disabled
    #[clap(short, long)]
    force: bool,
    /// Return immediately instead of waiting for RUNNING
    #[clap(long)]
    no_wait: bool,
    /// Start every configured process
    #[clap(short, long)]
    all: bool,
}

impl Start {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;
        let wait = !self.no_wait;
        if self.all {
            let rsp = client.call(IpcRequest::StartAllProcesses { wait }).await?;
            if let IpcResponse::GroupResult(results) = rsp {
                IpcClient::report_group_result(&results);
            }
            return Ok(());
        }
        for name in expand_targets(&client, &self.names).await? {
            let rsp = client
                .call(IpcRequest::StartProcess {
                    name: name.clone(),
                    force: self.force,
                    wait,
                })
                .await?;
            match rsp {
                IpcResponse::GroupResult(results) => IpcClient::report_group_result(&results),
                _ => info!("{name}: started"),
            }
        }
        Ok(())
    }
}

use crate::Result;
use crate::cli::expand_targets;
use crate::ipc::client::IpcClient;
use crate::ipc::{IpcRequest, IpcResponse};

/// Stop process(es)
#[derive(Debug, clap::Args)]
pub struct Stop {
    /// Namespecs ("name", "group:name", "group:*") or a config type
    /// (domain|nodes|waveforms|process)
    names: Vec<String>,
    /// Return immediately instead of waiting for the stop to land
    #[clap(long)]
    no_wait: bool,
    /// Stop every running process
    #[clap(short, long)]
    all: bool,
}

impl Stop {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;
        let wait = !self.no_wait;
        if self.all {
            let rsp = client.call(IpcRequest::StopAllProcesses { wait }).await?;
            if let IpcResponse::GroupResult(results) = rsp {
                IpcClient::report_group_result(&results);
            }
            return Ok(());
        }
        for name in expand_targets(&client, &self.names).await? {
            let rsp = client
                .call(IpcRequest::StopProcess {
                    name: name.clone(),
                    wait,
                })
                .await?;
            match rsp {
                IpcResponse::GroupResult(results) => IpcClient::report_group_result(&results),
                _ => info!("{name}: stopped"),
            }
        }
        Ok(())
    }
}

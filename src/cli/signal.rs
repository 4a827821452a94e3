use crate::Result;
use crate::cli::expand_targets;
use crate::ipc::client::IpcClient;
use crate::ipc::{IpcRequest, IpcResponse};

/// Send a signal to process(es)
#[derive(Debug, clap::Args)]
pub struct Signal {
    /// Signal name or number ("TERM", "SIGHUP", "9")
    signal: String,
    /// Namespecs ("name", "group:name", "group:*") or a config type
    /// (domain|nodes|waveforms|process)
    names: Vec<String>,
    /// Signal every running process
    #[clap(short, long)]
    all: bool,
}

impl Signal {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;
        if self.all {
            let rsp = client
                .call(IpcRequest::SignalAllProcesses {
                    signal: self.signal.clone(),
                })
                .await?;
            if let IpcResponse::GroupResult(results) = rsp {
                IpcClient::report_group_result(&results);
            }
            return Ok(());
        }
        for name in expand_targets(&client, &self.names).await? {
            let rsp = client
                .call(IpcRequest::SignalProcess {
                    name: name.clone(),
                    signal: self.signal.clone(),
                })
                .await?;
            match rsp {
                IpcResponse::GroupResult(results) => IpcClient::report_group_result(&results),
                _ => info!("{name}: signalled {}", self.signal),
            }
        }
        Ok(())
    }
}

use crate::Result;
use crate::cli::expand_targets;
use crate::ipc::client::IpcClient;
use crate::ipc::{IpcRequest, IpcResponse};

/// Restart process(es): stop, then start
#[derive(Debug, clap::Args)]
pub struct Restart {
    /// Namespecs ("name", "group:name", "group:*") or a config type
    /// (domain|nodes|waveforms|process)
    names: Vec<String>,
    /// Start even if the process is disabled
    #[clap(short, long)]
    force: bool,
}

impl Restart {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;
        for name in expand_targets(&client, &self.names).await? {
            // a process that isn't running is fine to "restart"
            let rsp = client
                .request(IpcRequest::StopProcess {
                    name: name.clone(),
                    wait: true,
                })
                .await?;
            if let IpcResponse::Fault { name: fault, message, .. } = &rsp
                && fault != "NOT_RUNNING"
            {
                warn!("{name}: stop failed: {message}");
            }
            let rsp = client
                .call(IpcRequest::StartProcess {
                    name: name.clone(),
                    force: self.force,
                    wait: true,
                })
                .await?;
            match rsp {
                IpcResponse::GroupResult(results) => IpcClient::report_group_result(&results),
                _ => info!("{name}: restarted"),
            }
        }
        Ok(())
    }
}

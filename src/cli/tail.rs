use crate::Result;
use crate::ipc::client::IpcClient;
use crate::ipc::{IpcRequest, IpcResponse};
use miette::miette;
use std::time::Duration;

/// Show the tail of a process log
#[derive(Debug, clap::Args)]
pub struct Tail {
    /// Process name ("name" or "group:name")
    name: String,
    /// Tail the stderr log instead of stdout
    #[clap(long)]
    stderr: bool,
    /// Number of bytes to show
    #[clap(short = 'n', long, default_value_t = 1600)]
    bytes: i64,
    /// Keep following the log
    #[clap(short, long)]
    follow: bool,
}

impl Tail {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;

        let read = |offset: i64, length: i64| {
            let req = if self.stderr {
                IpcRequest::TailProcessStderrLog {
                    name: self.name.clone(),
                    offset,
                    length,
                }
            } else {
                IpcRequest::TailProcessStdoutLog {
                    name: self.name.clone(),
                    offset,
                    length,
                }
            };
            req
        };

        let rsp = client.call(read(0, self.bytes)).await?;
        let IpcResponse::Tail {
            bytes,
            mut offset,
            overflow,
        } = rsp
        else {
            return Err(miette!("unexpected response"));
        };
        if overflow {
            debug!("log longer than {} bytes, starting at the end", self.bytes);
        }
        print!("{bytes}");

        while self.follow {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let rsp = client.call(read(offset, 8192)).await?;
            if let IpcResponse::Tail {
                bytes,
                offset: next,
                ..
            } = rsp
            {
                print!("{bytes}");
                offset = next;
            }
        }
        Ok(())
    }
}

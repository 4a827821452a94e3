use crate::Result;
use crate::ipc::client::IpcClient;

/// Print the daemon pid, or a process pid
#[derive(Debug, clap::Args)]
pub struct Pid {
    /// Process name ("name" or "group:name"); omit for the daemon itself
    name: Option<String>,
}

impl Pid {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;
        match &self.name {
            Some(name) => {
                let info = client.get_process_info(name).await?;
                println!("{}", info.pid);
            }
            None => println!("{}", client.get_pid().await?),
        }
        Ok(())
    }
}

use crate::ipc::{IpcRequest, IpcResponse, deserialize, fs_name, serialize};
use crate::rpc::{ConfigInfo, ProcStatus, ProcessInfo};
use crate::{Result, env};
use interprocess::local_socket::tokio::{RecvHalf, SendHalf};
use interprocess::local_socket::traits::tokio::Stream;
use miette::{Context, IntoDiagnostic, miette};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

pub struct IpcClient {
    recv: Mutex<BufReader<RecvHalf>>,
    send: Mutex<SendHalf>,
}

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_DELAY: Duration = Duration::from_millis(200);
/// Deferred operations (start --wait on a slow service, stop with a long
/// stopwaitsecs) can legitimately take a while.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

impl IpcClient {
    pub async fn connect() -> Result<Self> {
        let client = Self::connect_("main").await?;
        trace!("connected to IPC socket");
        let rsp = client.request(IpcRequest::Connect).await?;
        if !rsp.is_ok() {
            return Err(miette!("unexpected connect response: {rsp:?}"));
        }
        debug!("connected to warden daemon");
        Ok(client)
    }

    async fn connect_(name: &str) -> Result<Self> {
        let mut last_err = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            match interprocess::local_socket::tokio::Stream::connect(fs_name(name)?).await {
                Ok(conn) => {
                    let (recv, send) = conn.split();
                    return Ok(Self {
                        recv: Mutex::new(BufReader::new(recv)),
                        send: Mutex::new(send),
                    });
                }
                Err(err) => {
                    debug!("failed to connect to IPC socket (attempt {attempt}): {err:?}");
                    last_err = Some(err);
                    tokio::time::sleep(CONNECT_DELAY).await;
                }
            }
        }
        Err(miette!(
            help = "is the daemon running? start it with: warden run",
            "could not connect to the warden daemon at {}: {:?}",
            env::IPC_SOCK_MAIN.display(),
            last_err
        ))
    }

    async fn send(&self, msg: IpcRequest) -> Result<()> {
        let mut msg = serialize(&msg)?;
        if msg.contains(&0) {
            return Err(miette!("IPC message contains null byte"));
        }
        msg.push(0);
        let mut send = self.send.lock().await;
        send.write_all(&msg)
            .await
            .into_diagnostic()
            .wrap_err("failed to send IPC message")?;
        Ok(())
    }

    async fn read(&self, timeout: Duration) -> Result<IpcResponse> {
        let mut recv = self.recv.lock().await;
        let mut bytes = Vec::new();
        match tokio::time::timeout(timeout, recv.read_until(0, &mut bytes)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(miette!("failed to read IPC response: {err}")),
            Err(_) => {
                return Err(miette!(
                    "timed out waiting for the daemon after {}s",
                    timeout.as_secs()
                ));
            }
        }
        if bytes.is_empty() {
            return Err(miette!("connection closed by the daemon"));
        }
        deserialize(&bytes).wrap_err("failed to deserialize IPC response")
    }

    pub async fn request(&self, msg: IpcRequest) -> Result<IpcResponse> {
        self.send(msg).await?;
        self.read(REQUEST_TIMEOUT).await
    }

    /// Request, turning a fault response into a diagnostic error.
    pub async fn call(&self, msg: IpcRequest) -> Result<IpcResponse> {
        match self.request(msg).await? {
            IpcResponse::Fault { code, name, message } => {
                Err(miette!("{name} ({code}): {message}"))
            }
            rsp => Ok(rsp),
        }
    }

    pub async fn get_all_process_info(&self) -> Result<Vec<ProcessInfo>> {
        match self.call(IpcRequest::GetAllProcessInfo).await? {
            IpcResponse::AllProcessInfo(infos) => Ok(infos),
            rsp => Err(miette!("unexpected response: {rsp:?}")),
        }
    }

    pub async fn get_process_info(&self, name: &str) -> Result<ProcessInfo> {
        let req = IpcRequest::GetProcessInfo {
            name: name.to_string(),
        };
        match self.call(req).await? {
            IpcResponse::ProcessInfo(info) => Ok(*info),
            rsp => Err(miette!("unexpected response: {rsp:?}")),
        }
    }

    pub async fn get_config_info(&self, name: Option<String>) -> Result<Vec<ConfigInfo>> {
        match self.call(IpcRequest::GetConfigInfo { name }).await? {
            IpcResponse::ConfigInfo(infos) => Ok(infos),
            rsp => Err(miette!("unexpected response: {rsp:?}")),
        }
    }

    pub async fn reload_config(&self) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
        match self.call(IpcRequest::ReloadConfig).await? {
            IpcResponse::ReloadResult {
                added,
                changed,
                removed,
            } => Ok((added, changed, removed)),
            rsp => Err(miette!("unexpected response: {rsp:?}")),
        }
    }

    /// Print the per-member results of a group operation.
    pub fn report_group_result(results: &[ProcStatus]) {
        for status in results {
            let namespec = crate::config::make_namespec(&status.group, &status.name);
            if status.status == crate::error::FAULT_SUCCESS {
                info!("{namespec}: {}", status.description);
            } else {
                error!("{namespec}: {} ({})", status.description, status.status);
            }
        }
    }

    pub async fn get_pid(&self) -> Result<u32> {
        match self.call(IpcRequest::GetPid).await? {
            IpcResponse::Pid(pid) => Ok(pid),
            rsp => Err(miette!("unexpected response: {rsp:?}")),
        }
    }
}

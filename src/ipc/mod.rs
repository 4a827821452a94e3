//! IPC wire types shared by the daemon and the CLI client.
//!
//! Requests mirror the control-plane operations one to one; responses carry
//! either the operation result or a fault with its stable integer code.
//! Messages are JSON (or MessagePack with IPC_JSON=false), NUL-terminated on
//! the local socket.

use crate::Result;
use crate::env;
use crate::error::Fault;
use crate::rpc::{ConfigInfo, ProcStatus, ProcessInfo};
use interprocess::local_socket::{GenericFilePath, Name, ToFsName};
use miette::{Context, IntoDiagnostic};

pub(crate) mod client;
pub(crate) mod server;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, strum::Display, strum::EnumIs)]
pub enum IpcRequest {
    Connect,
    StartProcess { name: String, force: bool, wait: bool },
    StartProcessGroup { name: String, force: bool, wait: bool },
    StartAllProcesses { wait: bool },
    StopProcess { name: String, wait: bool },
    StopProcessGroup { name: String, wait: bool },
    StopAllProcesses { wait: bool },
    SignalProcess { name: String, signal: String },
    SignalProcessGroup { name: String, signal: String },
    SignalAllProcesses { signal: String },
    GetProcessInfo { name: String },
    GetAllProcessInfo,
    GetConfigInfo { name: Option<String> },
    ReloadConfig,
    AddProcessGroup { name: String },
    RemoveProcessGroup { name: String },
    UpdateProcessGroup { name: String },
    ReadProcessStdoutLog { name: String, offset: i64, length: i64 },
    ReadProcessStderrLog { name: String, offset: i64, length: i64 },
    TailProcessStdoutLog { name: String, offset: i64, length: i64 },
    TailProcessStderrLog { name: String, offset: i64, length: i64 },
    ClearProcessLogs { name: String },
    SendProcessStdin { name: String, chars: String },
    SendRemoteCommEvent { kind: String, data: String },
    ReadLog { offset: i64, length: i64 },
    ClearLog,
    GetState,
    GetPid,
    Shutdown,
    Restart,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, strum::Display, strum::EnumIs)]
#[allow(clippy::large_enum_variant)]
pub enum IpcResponse {
    Ok,
    Bool(bool),
    Fault {
        code: i32,
        name: String,
        message: String,
    },
    ProcessInfo(Box<ProcessInfo>),
    AllProcessInfo(Vec<ProcessInfo>),
    ConfigInfo(Vec<ConfigInfo>),
    ReloadResult {
        added: Vec<String>,
        changed: Vec<String>,
        removed: Vec<String>,
    },
    GroupResult(Vec<ProcStatus>),
    UpdateResult {
        members: Vec<String>,
    },
    Log(String),
    Tail {
        bytes: String,
        offset: i64,
        overflow: bool,
    },
    State {
        code: i32,
        name: String,
    },
    Pid(u32),
}

impl IpcResponse {
    pub fn from_fault(fault: &Fault) -> Self {
        IpcResponse::Fault {
            code: fault.code(),
            name: fault.name().to_string(),
            message: fault.to_string(),
        }
    }
}

fn fs_name(name: &str) -> Result<Name<'_>> {
    let path = env::IPC_SOCK_DIR.join(name).with_extension("sock");
    let fs_name = path.to_fs_name::<GenericFilePath>().into_diagnostic()?;
    Ok(fs_name)
}

fn serialize<T: serde::Serialize>(msg: &T) -> Result<Vec<u8>> {
    if *env::IPC_JSON {
        serde_json::to_vec(msg)
            .into_diagnostic()
            .wrap_err("failed to serialize IPC message as JSON")
    } else {
        rmp_serde::to_vec(msg)
            .into_diagnostic()
            .wrap_err("failed to serialize IPC message as MessagePack")
    }
}

fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut bytes = bytes.to_vec();
    bytes.pop();
    let preview = std::str::from_utf8(&bytes).unwrap_or("<binary>");
    trace!("msg: {:?}", preview);
    if *env::IPC_JSON {
        serde_json::from_slice(&bytes)
            .into_diagnostic()
            .wrap_err("failed to deserialize IPC JSON message")
    } else {
        rmp_serde::from_slice(&bytes)
            .into_diagnostic()
            .wrap_err("failed to deserialize IPC MessagePack message")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_response_carries_stable_code() {
        let rsp = IpcResponse::from_fault(&Fault::NotRunning("radio:rx".to_string()));
        match rsp {
            IpcResponse::Fault { code, name, message } => {
                assert_eq!(code, 70);
                assert_eq!(name, "NOT_RUNNING");
                assert!(message.contains("radio:rx"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn requests_round_trip_through_the_wire_format() {
        let req = IpcRequest::StartProcess {
            name: "radio:rx".to_string(),
            force: true,
            wait: false,
        };
        let mut bytes = serde_json::to_vec(&req).unwrap();
        bytes.push(0);
        let back: IpcRequest = deserialize(&bytes).unwrap();
        match back {
            IpcRequest::StartProcess { name, force, wait } => {
                assert_eq!(name, "radio:rx");
                assert!(force);
                assert!(!wait);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

//! IPC between the CLI and the running daemon.
//!
//! One JSON object per line over a Unix domain socket: the client writes a
//! command, the daemon answers with a response and closes the connection.

use std::path::{Path, PathBuf};
use thiserror::Error;

mod server;
mod types;
mod unix_socket;

pub use server::IpcServerHandle;
pub use types::*;
pub use unix_socket::IpcServer;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Failed to bind: {0}")]
    BindFailed(String),

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    RecvFailed(String),

    #[error("Daemon not running")]
    NotRunning,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

/// Get the IPC socket path.
pub fn ipc_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("reveille.sock")
}

/// Parse one command line as received on the socket.
pub fn parse_command(line: &str) -> Result<IpcCommand, IpcError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(IpcError::InvalidCommand("empty command".into()));
    }
    serde_json::from_str(line).map_err(|e| IpcError::InvalidCommand(e.to_string()))
}

/// IPC client for CLI communication with the daemon.
pub struct IpcClient {
    inner: unix_socket::IpcClientInner,
}

impl IpcClient {
    /// Connect to the daemon.
    pub fn connect() -> Result<Self, IpcError> {
        Self::connect_to(&ipc_path())
    }

    pub fn connect_to(path: &Path) -> Result<Self, IpcError> {
        Ok(Self {
            inner: unix_socket::IpcClientInner::connect(path)?,
        })
    }

    /// Send a command and wait for response.
    pub fn send(&mut self, cmd: IpcCommand) -> Result<IpcResponse, IpcError> {
        self.inner.send(&cmd)
    }
}

/// Connect, send one command and return the response.
pub fn request(cmd: IpcCommand) -> Result<IpcResponse, IpcError> {
    IpcClient::connect()?.send(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmId;
    use tempfile::tempdir;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("{\"cmd\":\"ping\"}\n").unwrap(), IpcCommand::Ping);
        assert!(matches!(parse_command("   "), Err(IpcError::InvalidCommand(_))));
        assert!(matches!(parse_command("ping"), Err(IpcError::InvalidCommand(_))));
    }

    #[test]
    fn test_connect_without_daemon() {
        let dir = tempdir().unwrap();
        let result = IpcClient::connect_to(&dir.path().join("missing.sock"));
        assert!(matches!(result, Err(IpcError::NotRunning)));
    }

    #[test]
    fn test_request_response_over_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reveille.sock");
        let server = IpcServer::bind(&path).unwrap();

        let mut handle = IpcServerHandle::spawn(server, |cmd| match cmd {
            IpcCommand::Ping => IpcResponse::pong(),
            IpcCommand::Dismiss { alarm_id: Some(id) } if id.as_str() == "wake" => {
                IpcResponse::dismissed(crate::engine::DismissOutcome::Dismissed)
            }
            _ => IpcResponse::error("unsupported"),
        })
        .unwrap();

        let response = IpcClient::connect_to(&path)
            .unwrap()
            .send(IpcCommand::Ping)
            .unwrap();
        assert!(response.ok);

        let response = IpcClient::connect_to(&path)
            .unwrap()
            .send(IpcCommand::Dismiss {
                alarm_id: Some(AlarmId::from("wake")),
            })
            .unwrap();
        assert!(matches!(
            response.data,
            Some(IpcResponseData::Dismissed { .. })
        ));

        let response = IpcClient::connect_to(&path)
            .unwrap()
            .send(IpcCommand::Foreground)
            .unwrap();
        assert!(!response.ok);

        handle.shutdown();
    }
}

//! Unix domain socket IPC (works on Linux and macOS).

use super::{parse_command, IpcCommand, IpcError, IpcResponse};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub type Responder = Box<dyn FnOnce(IpcResponse) + Send>;

/// IPC server listening for commands.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind at the default socket path.
    pub fn new() -> Result<Self, IpcError> {
        Self::bind(super::ipc_path())
    }

    /// Bind and create server.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, IpcError> {
        let path = path.into();

        // Remove stale socket
        if path.exists() {
            std::fs::remove_file(&path).ok();
        }

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let listener = UnixListener::bind(&path)
            .map_err(|e| IpcError::BindFailed(format!("{}: {}", path.display(), e)))?;

        listener
            .set_nonblocking(true)
            .map_err(|e| IpcError::BindFailed(e.to_string()))?;

        info!("IPC listening on {}", path.display());
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to receive a command (non-blocking).
    /// Returns command and a responder function.
    pub fn try_recv(&self) -> Option<(IpcCommand, Responder)> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                // Accepted sockets inherit non-blocking mode on some platforms
                stream.set_nonblocking(false).ok()?;
                stream.set_read_timeout(Some(Duration::from_secs(1))).ok()?;
                stream
                    .set_write_timeout(Some(Duration::from_secs(1)))
                    .ok()?;

                let mut reader = BufReader::new(stream.try_clone().ok()?);
                let mut line = String::new();

                if reader.read_line(&mut line).ok()? > 0 {
                    let respond = move |response: IpcResponse| {
                        let mut s = stream;
                        if let Ok(json) = serde_json::to_string(&response) {
                            let _ = writeln!(s, "{}", json);
                            let _ = s.flush();
                        }
                    };
                    match parse_command(&line) {
                        Ok(cmd) => {
                            debug!("IPC command: {:?}", cmd);
                            return Some((cmd, Box::new(respond)));
                        }
                        Err(e) => {
                            warn!("IPC parse error: {}", e);
                            respond(IpcResponse::error(&e.to_string()));
                        }
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => debug!("IPC accept error: {}", e),
        }
        None
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// IPC client for sending commands.
pub struct IpcClientInner {
    stream: UnixStream,
}

impl IpcClientInner {
    /// Connect to daemon.
    pub fn connect(path: &Path) -> Result<Self, IpcError> {
        if !path.exists() {
            return Err(IpcError::NotRunning);
        }

        let stream = UnixStream::connect(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                IpcError::NotRunning
            } else {
                IpcError::ConnectFailed(e.to_string())
            }
        })?;

        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
        stream.set_write_timeout(Some(Duration::from_secs(5))).ok();

        Ok(Self { stream })
    }

    /// Send command and get response.
    pub fn send(&mut self, cmd: &IpcCommand) -> Result<IpcResponse, IpcError> {
        let json = serde_json::to_string(cmd).map_err(|e| IpcError::SendFailed(e.to_string()))?;

        writeln!(self.stream, "{}", json).map_err(|e| IpcError::SendFailed(e.to_string()))?;
        self.stream
            .flush()
            .map_err(|e| IpcError::SendFailed(e.to_string()))?;

        let mut reader = BufReader::new(&self.stream);
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| IpcError::RecvFailed(e.to_string()))?;
        if n == 0 {
            return Err(IpcError::ConnectionClosed);
        }

        serde_json::from_str(&line).map_err(|e| IpcError::RecvFailed(e.to_string()))
    }
}

//! Background thread serving IPC commands.

use super::unix_socket::IpcServer;
use super::{IpcCommand, IpcResponse};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error};

/// How long the accept loop sleeps when no client is waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to the running IPC thread.
pub struct IpcServerHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl IpcServerHandle {
    /// Start serving `server` on a dedicated thread. `handler` runs on that
    /// thread for every command.
    pub fn spawn<F>(server: IpcServer, handler: F) -> std::io::Result<Self>
    where
        F: Fn(IpcCommand) -> IpcResponse + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let thread = std::thread::Builder::new()
            .name("reveille-ipc".into())
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    match server.try_recv() {
                        Some((cmd, respond)) => respond(handler(cmd)),
                        None => std::thread::sleep(POLL_INTERVAL),
                    }
                }
                debug!("IPC thread exiting");
            })?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Signal server shutdown and wait for the thread.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("IPC thread panicked");
            }
        }
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

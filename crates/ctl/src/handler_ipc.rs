//! IPC control handler
//!
//! Single-peer Unix-socket transport. The one connection slot is keyed by a
//! fixed literal and msg ids pass through unmasked; a newly accepted peer
//! replaces the previous one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::handler::{Handler, HandlerCore};
use crate::message::Message;

/// Connection-slot key of the single IPC peer.
pub const IPC_CLIENT_KEY: &str = "ipc client";

/// Unix-socket transport handler.
pub struct IpcCtlHandler {
    core: Arc<HandlerCore>,
    listener: Mutex<Option<UnixListener>>,
    path: PathBuf,
}

impl IpcCtlHandler {
    /// Bind the socket path; a stale socket file is removed first.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;

        Ok(Self {
            core: Arc::new(HandlerCore::new(format!("ctl_ipc_{}", path.display()))),
            listener: Mutex::new(Some(listener)),
            path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Handler for IpcCtlHandler {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn conn_name(&self) -> String {
        format!("ipc://{}", self.path.display())
    }

    fn conn_count(&self) -> usize {
        self.core.conn_count()
    }

    fn init(&self, cancel: CancellationToken, broadcast: broadcast::Receiver<Arc<Message>>) {
        self.core.init(cancel, broadcast);
    }

    async fn start(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| Error::HandlerUnavailable(self.name().to_string()))?;

        self.core.spawn_dispatch();

        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(accept_loop(core, listener));
        self.core.track(handle);

        info!(path = %self.path.display(), "ipc ctl handler started");

        Ok(())
    }

    fn commands(&self) -> Option<mpsc::Receiver<Message>> {
        self.core.take_commands()
    }

    async fn publish(&self, msg: Arc<Message>, budget: Duration) -> Result<()> {
        self.core.publish(msg, budget).await
    }

    fn release(&self) {
        self.core.release();
        let _ = std::fs::remove_file(&self.path);
    }

    async fn join(&self) {
        self.core.join().await;
    }
}

async fn accept_loop(core: Arc<HandlerCore>, listener: UnixListener) {
    let cancel = core.cancel_token();

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _)) => {
                // single peer: a fresh connection takes over the slot
                let (read, write) = stream.into_split();

                let epoch = core.add_connection(IPC_CLIENT_KEY.to_string(), 0, write);

                let reader = tokio::spawn(Arc::clone(&core).run_conn_reader(
                    IPC_CLIENT_KEY.to_string(),
                    epoch,
                    0,
                    read,
                ));
                core.track(reader);

                info!("ipc ctl client connected");
            }
            Err(err) => {
                error!(error = %err, "accept ipc client failed, handler exiting");
                break;
            }
        }
    }
}

//! IPC control client

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tracing::info;

use crate::client::{ClientCore, CtlClient, LoopHook, ResultHandler, StateHandler};
use crate::cmd::Command;
use crate::error::{Error, Result};
use crate::message::Message;

/// Control client over the server's Unix socket.
pub struct IpcCtlClient {
    core: Arc<ClientCore>,
    read: Mutex<Option<OwnedReadHalf>>,
    write: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl IpcCtlClient {
    /// Connect to the server socket path.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await?;
        let (read, write) = stream.into_split();

        info!(path = %path.display(), "ipc ctl client connected");

        Ok(Self {
            core: Arc::new(ClientCore::new(path.display().to_string())),
            read: Mutex::new(Some(read)),
            write: tokio::sync::Mutex::new(write),
        })
    }
}

#[async_trait]
impl CtlClient for IpcCtlClient {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn cmd_seq(&self) -> u64 {
        self.core.cmd_seq()
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<Message>> {
        self.core.subscribe()
    }

    async fn start(&self) -> Result<()> {
        let read = self
            .read
            .lock()
            .take()
            .ok_or(Error::ConnectionClosed)?;
        self.core.spawn_reader(read);

        self.command(&Command::new("info")).await?;
        info!(client = %self.name(), "initial info command sent");

        Ok(())
    }

    async fn command(&self, cmd: &Command) -> Result<u64> {
        let msg = self.core.next_command(cmd)?;

        let mut line = serde_json::to_vec(&msg)?;
        line.push(b'\n');

        let mut write = self.write.lock().await;
        write.write_all(&line).await.map_err(|err| {
            self.core.cancel_token().cancel();
            Error::Io(err)
        })?;

        Ok(msg.msg_id)
    }

    fn message_loop(
        &self,
        name: &str,
        pre_run: Option<LoopHook>,
        on_state: Option<StateHandler>,
        on_result: Option<ResultHandler>,
        post_run: Option<LoopHook>,
    ) -> Result<()> {
        self.core
            .message_loop(name, pre_run, on_state, on_result, post_run)
    }

    async fn release(&self) {
        let _ = self.write.lock().await.shutdown().await;
        self.core.release().await;
    }
}

/// Connect a control client by URI: `ipc://<path>` or `tcp://<host:port>`.
pub async fn connect_uri(uri: &str) -> Result<Box<dyn CtlClient>> {
    if let Some(path) = uri.strip_prefix("ipc://") {
        Ok(Box::new(IpcCtlClient::connect(path).await?))
    } else if let Some(addr) = uri.strip_prefix("tcp://") {
        Ok(Box::new(crate::client_tcp::TcpCtlClient::connect(addr).await?))
    } else {
        Err(Error::UnsupportedScheme(uri.to_string()))
    }
}

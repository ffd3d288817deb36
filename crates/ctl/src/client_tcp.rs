//! TCP control client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::info;

use crate::client::{ClientCore, CtlClient, LoopHook, ResultHandler, StateHandler};
use crate::cmd::Command;
use crate::error::{Error, Result};
use crate::message::Message;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Control client over a TCP connection.
pub struct TcpCtlClient {
    core: Arc<ClientCore>,
    read: Mutex<Option<OwnedReadHalf>>,
    write: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl TcpCtlClient {
    /// Dial the control server.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectionClosed)??;

        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();

        info!(addr = %addr, "tcp ctl client connected");

        Ok(Self {
            core: Arc::new(ClientCore::new(addr.to_string())),
            read: Mutex::new(Some(read)),
            write: tokio::sync::Mutex::new(write),
        })
    }
}

#[async_trait]
impl CtlClient for TcpCtlClient {
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

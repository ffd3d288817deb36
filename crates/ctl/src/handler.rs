//! Transport handler abstraction
//!
//! A handler owns one listening transport. Inbound commands from all of its
//! connections are forwarded to the server through a single command stream;
//! outbound results are routed back to the issuing connection through the
//! per-handler command cache, and broadcasts go to every connection.
//!
//! `HandlerCore` carries the transport-independent machinery; the TCP and
//! IPC handlers wrap it around their listeners.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::message::{Message, MsgType};

/// Budget for forwarding one inbound command to the server.
pub const INGRESS_TIMEOUT: Duration = Duration::from_secs(5);

const COMMAND_BUFFER: usize = 10;
const EGRESS_BUFFER: usize = 16;
const CONN_BUFFER: usize = 32;

/// Capability set every control transport provides.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    /// The listening endpoint, for introspection.
    fn conn_name(&self) -> String;

    fn conn_count(&self) -> usize;

    /// Attach the handler to the server scope and its broadcast feed.
    fn init(&self, cancel: CancellationToken, broadcast: broadcast::Receiver<Arc<Message>>);

    /// Begin accepting connections and dispatching egress messages.
    async fn start(&self) -> Result<()>;

    /// Take the inbound command stream; yields once.
    fn commands(&self) -> Option<mpsc::Receiver<Message>>;

    /// Queue a result or broadcast for delivery.
    async fn publish(&self, msg: Arc<Message>, budget: Duration) -> Result<()>;

    /// Forced shutdown: stop accepting, drop connections, close the
    /// command stream.
    fn release(&self);

    /// Wait for all handler tasks to drain.
    async fn join(&self);
}

struct ConnHandle {
    tx: mpsc::Sender<Arc<Message>>,
    // distinguishes re-used keys (IPC slot takeover) during cleanup
    epoch: u64,
}

/// Transport-independent handler machinery.
pub(crate) struct HandlerCore {
    name: String,
    cancel: Mutex<CancellationToken>,

    commands_tx: Mutex<Option<mpsc::Sender<Message>>>,
    commands_rx: Mutex<Option<mpsc::Receiver<Message>>>,

    egress_tx: mpsc::Sender<Arc<Message>>,
    egress_rx: Mutex<Option<mpsc::Receiver<Arc<Message>>>>,
    broadcast_rx: Mutex<Option<broadcast::Receiver<Arc<Message>>>>,

    connections: DashMap<String, ConnHandle>,
    command_cache: DashMap<u64, String>,
    conn_epoch: std::sync::atomic::AtomicU64,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HandlerCore {
    pub(crate) fn new(name: String) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (egress_tx, egress_rx) = mpsc::channel(EGRESS_BUFFER);

        Self {
            name,
            cancel: Mutex::new(CancellationToken::new()),
            commands_tx: Mutex::new(Some(commands_tx)),
            commands_rx: Mutex::new(Some(commands_rx)),
            egress_tx,
            egress_rx: Mutex::new(Some(egress_rx)),
            broadcast_rx: Mutex::new(None),
            connections: DashMap::new(),
            command_cache: DashMap::new(),
            conn_epoch: std::sync::atomic::AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn init(
        &self,
        cancel: CancellationToken,
        broadcast: broadcast::Receiver<Arc<Message>>,
    ) {
        *self.cancel.lock() = cancel;
        *self.broadcast_rx.lock() = Some(broadcast);
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    pub(crate) fn conn_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn take_commands(&self) -> Option<mpsc::Receiver<Message>> {
        self.commands_rx.lock().take()
    }

    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub(crate) async fn publish(&self, msg: Arc<Message>, budget: Duration) -> Result<()> {
        timeout(budget, self.egress_tx.send(msg))
            .await
            .map_err(|_| Error::PublishTimeout(budget))?
            .map_err(|_| Error::HandlerUnavailable(self.name.clone()))
    }

    /// Spawn the egress dispatch loop.
    pub(crate) fn spawn_dispatch(self: &Arc<Self>) {
        let Some(egress_rx) = self.egress_rx.lock().take() else {
            return;
        };
        let broadcast_rx = self.broadcast_rx.lock().take();

        let core = Arc::clone(self);
        let handle = tokio::spawn(core.dispatch_loop(egress_rx, broadcast_rx));
        self.track(handle);
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut egress_rx: mpsc::Receiver<Arc<Message>>,
        broadcast_rx: Option<broadcast::Receiver<Arc<Message>>>,
    ) {
        let cancel = self.cancel_token();
        let mut broadcast_rx = broadcast_rx;

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = egress_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                rsp = recv_broadcast(&mut broadcast_rx) => match rsp {
                    BroadcastItem::Msg(msg) => msg,
                    BroadcastItem::Lagged(n) => {
                        warn!(handler = %self.name, dropped = n, "broadcast feed lagged");
                        continue;
                    }
                    BroadcastItem::Closed => break,
                },
            };

            self.dispatch(msg);
        }

        info!(handler = %self.name, "egress dispatch closed");
    }

    fn dispatch(&self, msg: Arc<Message>) {
        match msg.msg_type {
            MsgType::BroadCast => {
                for entry in self.connections.iter() {
                    if entry.value().tx.try_send(Arc::clone(&msg)).is_err() {
                        warn!(
                            handler = %self.name,
                            conn = %entry.key(),
                            "connection write queue full, broadcast dropped"
                        );
                    }
                }
            }
            MsgType::Result => {
                let Some((_, conn_key)) = self.command_cache.remove(&msg.msg_id) else {
                    error!(handler = %self.name, msg = %msg, "no command writer found");
                    return;
                };

                match self.connections.get(&conn_key) {
                    Some(conn) => {
                        if conn.tx.try_send(msg).is_err() {
                            error!(
                                handler = %self.name,
                                conn = %conn_key,
                                "write command result failed"
                            );
                        }
                    }
                    None => {
                        error!(
                            handler = %self.name,
                            conn = %conn_key,
                            "result for a gone connection"
                        );
                    }
                }
            }
            _ => {
                error!(handler = %self.name, msg = %msg, "invalid egress msg type");
            }
        }
    }

    /// Register a connection and spawn its writer task.
    ///
    /// The writer strips the session mask from outgoing msg ids; broadcasts
    /// (id zero) pass through verbatim.
    pub(crate) fn add_connection<W>(self: &Arc<Self>, key: String, mask: u64, write: W) -> u64
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let epoch = self
            .conn_epoch
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(CONN_BUFFER);
        self.connections.insert(key.clone(), ConnHandle { tx, epoch });

        let core = Arc::clone(self);
        let handle = tokio::spawn(core.run_conn_writer(key, epoch, mask, rx, write));
        self.track(handle);

        epoch
    }

    async fn run_conn_writer<W>(
        self: Arc<Self>,
        key: String,
        epoch: u64,
        mask: u64,
        mut rx: mpsc::Receiver<Arc<Message>>,
        mut write: W,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = self.cancel_token();

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let mut out = (*msg).clone();
            if out.msg_id > 0 {
                out.msg_id ^= mask;
            }

            let mut line = match serde_json::to_vec(&out) {
                Ok(line) => line,
                Err(err) => {
                    error!(error = %err, msg = %out, "marshal egress message failed");
                    continue;
                }
            };
            line.push(b'\n');

            if let Err(err) = write.write_all(&line).await {
                error!(error = %err, conn = %key, "write to connection failed");
                break;
            }
        }

        self.connections.remove_if(&key, |_, conn| conn.epoch == epoch);
        debug!(handler = %self.name, conn = %key, "connection writer closed");
    }

    /// Per-connection reader: line-delimited JSON ingress.
    pub(crate) async fn run_conn_reader<R>(
        self: Arc<Self>,
        key: String,
        epoch: u64,
        mask: u64,
        read: R,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let cancel = self.cancel_token();
        let mut lines = BufReader::new(read).lines();

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        self.ingress_line(&key, mask, &line).await;
                    }
                }
                Ok(None) => {
                    debug!(conn = %key, "connection closed by peer");
                    break;
                }
                Err(err) => {
                    error!(error = %err, conn = %key, "read from connection failed");
                    break;
                }
            }
        }

        self.connections.remove_if(&key, |_, conn| conn.epoch == epoch);
    }

    async fn ingress_line(&self, conn_key: &str, mask: u64, line: &str) {
        let mut msg: Message = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(err) => {
                error!(error = %err, conn = %conn_key, "unmarshal inbound message failed");
                return;
            }
        };

        if msg.msg_id > 0 {
            msg.msg_id = (msg.msg_id & 0xFFFF_FFFF) | mask;
            self.command_cache.insert(msg.msg_id, conn_key.to_string());
        }

        let tx = match self.commands_tx.lock().clone() {
            Some(tx) => tx,
            None => {
                warn!(handler = %self.name, "command stream released, message dropped");
                return;
            }
        };

        match timeout(INGRESS_TIMEOUT, tx.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!(handler = %self.name, "ctl server command stream closed"),
            Err(_) => warn!(handler = %self.name, "forward command to ctl server timed out"),
        }
    }

    /// Tear the handler down: cancel tasks, close the command stream,
    /// forget connections.
    pub(crate) fn release(&self) {
        self.cancel.lock().cancel();
        *self.commands_tx.lock() = None;
        self.connections.clear();
        self.command_cache.clear();
    }

    pub(crate) async fn join(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();

        for task in tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    error!(handler = %self.name, error = %err, "handler task aborted");
                }
            }
        }
    }
}

enum BroadcastItem {
    Msg(Arc<Message>),
    Lagged(u64),
    Closed,
}

async fn recv_broadcast(rx: &mut Option<broadcast::Receiver<Arc<Message>>>) -> BroadcastItem {
    match rx {
        Some(rx) => match rx.recv().await {
            Ok(msg) => BroadcastItem::Msg(msg),
            Err(broadcast::error::RecvError::Lagged(n)) => BroadcastItem::Lagged(n),
            Err(broadcast::error::RecvError::Closed) => BroadcastItem::Closed,
        },
        // no broadcast feed attached; park forever
        None => std::future::pending().await,
    }
}

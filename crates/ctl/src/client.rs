//! Control client
//!
//! A `CtlClient` keeps one connection to the server, numbers its commands
//! with a session-monotonic sequence, and republishes everything the server
//! sends onto a local pub/sub bus. `message_loop` subscribers demultiplex
//! results and state broadcasts off that bus; every loop is tracked so one
//! release tears the whole session down, with post-run hooks guaranteed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use frontrank_core::State;

use crate::cmd::{CmdResult, Command};
use crate::error::{Error, Result};
use crate::message::{Message, MsgType};

const BUS_BUFFER: usize = 64;

/// State-broadcast callback of a message loop.
pub type StateHandler = Box<dyn Fn(&State) -> Result<()> + Send + Sync>;
/// Command-result callback of a message loop.
pub type ResultHandler = Box<dyn Fn(&CmdResult) -> Result<()> + Send + Sync>;
/// One-shot hook run before a loop starts or after it terminates.
pub type LoopHook = Box<dyn FnOnce() -> Result<()> + Send>;

/// Client-side counterpart of the control server.
#[async_trait]
pub trait CtlClient: Send + Sync {
    fn name(&self) -> &str;

    /// Highest command sequence issued so far.
    fn cmd_seq(&self) -> u64;

    /// Subscribe to the raw inbound message bus.
    fn subscribe(&self) -> broadcast::Receiver<Arc<Message>>;

    /// Spawn the reader and send the initial `info` probe.
    async fn start(&self) -> Result<()>;

    /// Send one command; returns the msg id its result will carry.
    async fn command(&self, cmd: &Command) -> Result<u64>;

    /// Spawn a demultiplexing loop over the message bus.
    ///
    /// Absent callbacks fall back to logging; `post_run` runs exactly once
    /// when the loop terminates, however it terminates.
    fn message_loop(
        &self,
        name: &str,
        pre_run: Option<LoopHook>,
        on_state: Option<StateHandler>,
        on_result: Option<ResultHandler>,
        post_run: Option<LoopHook>,
    ) -> Result<()>;

    /// Close the connection and every message loop.
    async fn release(&self);
}

/// Transport-independent client machinery.
pub(crate) struct ClientCore {
    name: String,
    cancel: CancellationToken,
    seq: AtomicU64,
    bus: broadcast::Sender<Arc<Message>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientCore {
    pub(crate) fn new(name: String) -> Self {
        let (bus, _) = broadcast::channel(BUS_BUFFER);

        Self {
            name,
            cancel: CancellationToken::new(),
            seq: AtomicU64::new(0),
            bus,
            loops: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn cmd_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Arc<Message>> {
        self.bus.subscribe()
    }

    /// Build the next command frame of this session.
    pub(crate) fn next_command(&self, cmd: &Command) -> Result<Message> {
        Message::command(self.seq.fetch_add(1, Ordering::SeqCst) + 1, cmd)
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the inbound reader over a line-delimited JSON stream.
    pub(crate) fn spawn_reader<R>(self: &Arc<Self>, read: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let core = Arc::clone(self);

        tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();

            loop {
                let line = tokio::select! {
                    _ = core.cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };

                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }

                        match serde_json::from_str::<Message>(&line) {
                            Ok(msg) => {
                                if core.bus.send(Arc::new(msg)).is_err() {
                                    debug!(client = %core.name, "no bus subscribers");
                                }
                            }
                            Err(err) => {
                                error!(error = %err, "unmarshal inbound message failed");
                            }
                        }
                    }
                    Ok(None) => {
                        info!(client = %core.name, "ctl connection closed");
                        break;
                    }
                    Err(err) => {
                        error!(error = %err, "read ctl connection failed");
                        break;
                    }
                }
            }

            // connection gone: close every message loop
            core.cancel.cancel();
        });
    }

    pub(crate) fn message_loop(
        self: &Arc<Self>,
        name: &str,
        pre_run: Option<LoopHook>,
        on_state: Option<StateHandler>,
        on_result: Option<ResultHandler>,
        post_run: Option<LoopHook>,
    ) -> Result<()> {
        if let Some(pre_run) = pre_run {
            pre_run()?;
        }

        let mut rx = self.bus.subscribe();
        let cancel = self.cancel.clone();
        let name = name.to_string();
        let client = self.name.clone();

        info!(client = %client, name = %name, "message loop subscribed");

        let handle = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(msg) => msg,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(name = %name, dropped = n, "message loop lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                dispatch_message(&name, &msg, &on_state, &on_result);
            }

            if let Some(post_run) = post_run {
                if let Err(err) = post_run() {
                    error!(name = %name, error = %err, "message loop post run failed");
                }
            }

            info!(name = %name, "message loop exit");
        });

        self.loops.lock().push(handle);

        Ok(())
    }

    /// Cancel the session and wait for every loop to finish.
    pub(crate) async fn release(&self) {
        self.cancel.cancel();

        let loops: Vec<_> = self.loops.lock().drain(..).collect();
        for handle in loops {
            let _ = handle.await;
        }
    }
}

fn dispatch_message(
    name: &str,
    msg: &Message,
    on_state: &Option<StateHandler>,
    on_result: &Option<ResultHandler>,
) {
    match msg.msg_type {
        MsgType::Result => match msg.get_result() {
            Ok(result) => {
                let outcome = match on_result {
                    Some(on_result) => on_result(&result),
                    None => log_result(&result),
                };

                if let Err(err) = outcome {
                    error!(name = %name, error = %err, "message loop handle result failed");
                }
            }
            Err(err) => error!(error = %err, "get result message failed"),
        },
        MsgType::BroadCast => match msg.get_state() {
            Ok(state) => {
                let outcome = match on_state {
                    Some(on_state) => on_state(&state),
                    None => log_state(&state),
                };

                if let Err(err) = outcome {
                    error!(name = %name, error = %err, "message loop handle state failed");
                }
            }
            // broadcasts also carry plain notices, e.g. server shutdown
            Err(_) => info!(name = %name, notice = %msg.data, "ctl notice"),
        },
        _ => {
            warn!(name = %name, msg = %msg, "unsupported msg from ctl server");
        }
    }
}

fn log_state(state: &State) -> Result<()> {
    info!(
        timestamp = %state.timestamp,
        priority = ?state.addr_list,
        "latency state notified"
    );
    Ok(())
}

fn log_result(result: &CmdResult) -> Result<()> {
    if result.is_ok() {
        info!(cmd = %result.cmd_name, message = %result.message, "command succeeded");
    } else {
        error!(
            cmd = %result.cmd_name,
            rtn = result.rtn,
            message = %result.message,
            "command execution failed"
        );
    }
    Ok(())
}

/// Wait on a bus subscription for the result pairing with `msg_id`.
pub async fn wait_result(
    rx: &mut broadcast::Receiver<Arc<Message>>,
    msg_id: u64,
    budget: Duration,
) -> Result<CmdResult> {
    let deadline = tokio::time::Instant::now() + budget;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(Error::PublishTimeout(budget));
        }

        let msg = timeout(remaining, rx.recv())
            .await
            .map_err(|_| Error::PublishTimeout(budget))?
            .map_err(|_| Error::ConnectionClosed)?;

        if msg.msg_type == MsgType::Result && msg.msg_id == msg_id {
            return msg.get_result();
        }
    }
}

//! Control server
//!
//! `CtlServer` fans commands in from every transport handler, executes them
//! one at a time against the latency client, and fans state broadcasts out
//! through a single pub/sub channel that every handler replays to its
//! connections.
//!
//! The handler set is dynamic at runtime: each handler's command stream is
//! drained by its own forwarder task into one union channel, and a handler
//! whose stream closes simply drops out of the select set.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use frontrank_core::{
    BackendAddr, LatencyClient, QueryConfig, Reporter, Result as CoreResult, State,
};

use crate::error::{Error, Result};
use crate::exec;
use crate::handler::Handler;
use crate::handler_ipc::IpcCtlHandler;
use crate::handler_tcp::TcpCtlHandler;
use crate::message::Message;

/// Name of the pseudo-reporter feeding the broadcast channel.
pub const CONTROLLER_REPORTER: &str = "controller";

/// Budget for handing a result back to the originating handler.
const EGRESS_TIMEOUT: Duration = Duration::from_secs(3);

const BROADCAST_BUFFER: usize = 64;
const UNION_BUFFER: usize = 16;

/// Handler-set descriptor, built from connection URIs.
#[derive(Default)]
pub struct HandlerSetConfig {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerSetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transport by URI: `ipc://<path>` or `tcp://<host:port>`.
    pub async fn uri(mut self, uri: &str) -> Result<Self> {
        if let Some(path) = uri.strip_prefix("ipc://") {
            info!(conn = %path, "creating ipc ctl handler");
            self.handlers.push(Arc::new(IpcCtlHandler::bind(path)?));
        } else if let Some(addr) = uri.strip_prefix("tcp://") {
            info!(conn = %addr, "creating tcp ctl handler");
            self.handlers.push(Arc::new(TcpCtlHandler::bind(addr).await?));
        } else {
            return Err(Error::UnsupportedScheme(uri.to_string()));
        }

        Ok(self)
    }

    /// Add a pre-built handler.
    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Run parameters remembered across a `stop`/`start` cycle.
#[derive(Default)]
pub(crate) struct StoredRun {
    pub(crate) addr: Option<BackendAddr>,
    pub(crate) sink: Option<PathBuf>,
    pub(crate) interval: Duration,
    pub(crate) config: Option<QueryConfig>,
}

/// Handler introspection entry of the `info` command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandlerInfo {
    pub name: String,
    pub conn: String,
    pub clients: usize,
}

/// Multi-transport command/broadcast hub.
pub struct CtlServer {
    cancel: CancellationToken,
    broadcast: broadcast::Sender<Arc<Message>>,

    handlers: Mutex<Vec<Arc<dyn Handler>>>,
    drained: Mutex<Vec<Arc<dyn Handler>>>,

    instance: RwLock<Option<Arc<LatencyClient>>>,
    stored: Mutex<StoredRun>,

    started: AtomicBool,
    stopped: AtomicBool,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl CtlServer {
    /// Build the server and wire every handler into its scope and
    /// broadcast feed.
    pub fn new(cancel: &CancellationToken, cfg: HandlerSetConfig) -> Result<Arc<Self>> {
        if cfg.is_empty() {
            return Err(Error::ServerArgs("no ctl handlers".to_string()));
        }

        let cancel = cancel.child_token();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_BUFFER);

        for handler in &cfg.handlers {
            debug!(hdl = handler.name(), "connecting ctl handler broadcast");
            handler.init(cancel.child_token(), broadcast_tx.subscribe());
        }

        Ok(Arc::new(Self {
            cancel,
            broadcast: broadcast_tx,
            handlers: Mutex::new(cfg.handlers),
            drained: Mutex::new(Vec::new()),
            instance: RwLock::new(None),
            stored: Mutex::new(StoredRun::default()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            run_task: Mutex::new(None),
        }))
    }

    /// Attach the latency client, register the controller reporter and
    /// start every handler plus the dispatch loop.
    pub async fn start(self: &Arc<Self>, client: Arc<LatencyClient>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        *self.instance.write() = Some(Arc::clone(&client));
        self.connect_controller(&client)?;

        let handlers = self.handlers.lock().clone();
        for handler in &handlers {
            handler.start().await?;
        }

        let (union_tx, union_rx) = mpsc::channel(UNION_BUFFER);

        for (idx, handler) in handlers.iter().enumerate() {
            let Some(mut commands) = handler.commands() else {
                warn!(hdl = handler.name(), "handler command stream already taken");
                continue;
            };

            let union_tx = union_tx.clone();
            let name = handler.name().to_string();

            tokio::spawn(async move {
                while let Some(msg) = commands.recv().await {
                    if union_tx.send((idx, msg)).await.is_err() {
                        break;
                    }
                }
                info!(hdl = %name, "handler command stream closed, dropped from select set");
            });
        }

        let server = Arc::clone(self);
        *self.run_task.lock() = Some(tokio::spawn(server.run_forever(handlers, union_rx)));

        info!("ctl server started");

        Ok(())
    }

    /// Register the broadcast-feeding reporter on the latency client.
    ///
    /// The reporter captures only the broadcast sender, never the server,
    /// so client and server do not keep each other alive.
    fn connect_controller(&self, client: &LatencyClient) -> Result<()> {
        client
            .add_reporter(
                CONTROLLER_REPORTER,
                Arc::new(ControllerReporter {
                    broadcast: self.broadcast.clone(),
                }),
            )
            .map_err(Error::Core)
    }

    pub fn latency_client(&self) -> Option<Arc<LatencyClient>> {
        self.instance.read().clone()
    }

    pub fn latest_state(&self) -> Option<State> {
        self.latency_client().and_then(|c| c.last_state())
    }

    pub fn handler_infos(&self) -> Vec<HandlerInfo> {
        self.handlers
            .lock()
            .iter()
            .map(|h| HandlerInfo {
                name: h.name().to_string(),
                conn: h.conn_name(),
                clients: h.conn_count(),
            })
            .collect()
    }

    /// Publish a pre-built message to every connected client.
    pub fn publish_broadcast(&self, msg: Message) {
        if self.broadcast.send(Arc::new(msg)).is_err() {
            debug!("no ctl broadcast subscribers");
        }
    }

    /// Stop and join the latency client, remembering its run parameters
    /// for a later `start` command.
    pub(crate) async fn stop_latency_client(&self) -> Result<()> {
        let client = self
            .instance
            .write()
            .take()
            .ok_or_else(|| Error::ServerArgs("no latency client".to_string()))?;

        {
            let mut stored = self.stored.lock();
            stored.addr = Some(client.backend_addr().clone());
            stored.sink = client.sink_path().map(|p| p.to_path_buf());
            stored.interval = client.interval();
            stored.config = Some((*client.config()).clone());
        }
        info!("latency client run parameters stored");

        client.stop();
        client.join().await.map_err(Error::Core)
    }

    /// Reconstruct a latency client from stored parameters merged with
    /// command kwargs, start it and re-register the controller reporter.
    pub(crate) async fn start_latency_client(
        &self,
        kwargs: &HashMap<String, String>,
    ) -> Result<Arc<LatencyClient>> {
        if self.instance.read().is_some() {
            return Err(Error::ServerArgs(
                "latency client already started".to_string(),
            ));
        }

        let mut kwargs = kwargs.clone();

        let schema = kwargs.remove("schema");
        let host = kwargs.remove("host");
        let port = kwargs.remove("port");
        let sink = kwargs.remove("sink");
        let interval = kwargs.remove("interval");

        let (stored_addr, stored_sink, stored_interval, stored_cfg) = {
            let stored = self.stored.lock();
            (
                stored.addr.clone(),
                stored.sink.clone(),
                stored.interval,
                stored.config.clone(),
            )
        };

        let addr = match (schema, host, port) {
            (Some(schema), Some(host), Some(port)) => BackendAddr::new(
                schema,
                host,
                port.parse::<u16>()
                    .map_err(|e| Error::ServerArgs(format!("port: {e}")))?,
            ),
            _ => stored_addr
                .ok_or_else(|| Error::ServerArgs("no backend address".to_string()))?,
        };

        let sink = sink.map(PathBuf::from).or(stored_sink);

        let interval = match interval {
            Some(raw) => humantime::parse_duration(&raw)
                .map_err(|e| Error::ServerArgs(format!("interval: {e}")))?,
            None => stored_interval,
        };

        let mut config = stored_cfg.unwrap_or_else(QueryConfig::with_defaults);
        config.merge(&kwargs).map_err(Error::Core)?;

        info!(
            addr = %addr,
            interval = ?interval,
            query_cfg = %config,
            "reinitiating latency client"
        );

        let client = Arc::new(
            LatencyClient::init(&self.cancel, addr, sink, config)
                .await
                .map_err(Error::Core)?,
        );

        client.start(interval).map_err(Error::Core)?;
        self.connect_controller(&client)?;

        *self.instance.write() = Some(Arc::clone(&client));

        Ok(client)
    }

    async fn run_forever(
        self: Arc<Self>,
        handlers: Vec<Arc<dyn Handler>>,
        mut union_rx: mpsc::Receiver<(usize, Message)>,
    ) {
        loop {
            let (idx, msg) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = union_rx.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            debug!(hdl_idx = idx, msg = %msg, "message received from handler");

            let cmd = match msg.get_command() {
                Ok(cmd) => cmd,
                Err(err) => {
                    error!(error = %err, msg = %msg, "received a non-command message");
                    continue;
                }
            };

            let result = exec::execute(&self, &cmd).await;

            let rsp = match Message::result(msg.msg_id, &result) {
                Ok(rsp) => rsp,
                Err(err) => {
                    error!(error = %err, "marshal result failed");
                    continue;
                }
            };

            match handlers.get(idx) {
                Some(handler) => {
                    if let Err(err) = handler.publish(Arc::new(rsp), EGRESS_TIMEOUT).await {
                        error!(error = %err, hdl = handler.name(), "write result to handler failed");
                    }
                }
                None => error!(hdl_idx = idx, "result for an unknown handler"),
            }
        }

        self.publish_broadcast(Message {
            msg_id: 0,
            msg_type: crate::message::MsgType::BroadCast,
            data: serde_json::json!("server shutting down..."),
        });

        self.stop();
    }

    /// Release the broadcast, then every handler in order, then clear the
    /// handler list.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        // break the client<->server cycle before tearing transports down
        if let Some(client) = self.latency_client() {
            let _ = client.remove_reporter(CONTROLLER_REPORTER);
        }

        self.cancel.cancel();

        let mut handlers = self.handlers.lock();
        for handler in handlers.iter() {
            handler.release();
        }

        self.drained.lock().append(&mut handlers);

        info!("ctl server stopped");
    }

    /// Block until every handler and the dispatch loop have drained.
    pub async fn join(&self) {
        let run_task = self.run_task.lock().take();
        if let Some(task) = run_task {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    error!(error = %err, "ctl dispatch task aborted");
                }
            }
        }

        let handlers: Vec<_> = {
            let mut drained = self.drained.lock();
            let mut active = self.handlers.lock();
            drained.drain(..).chain(active.drain(..)).collect()
        };

        for handler in handlers {
            handler.join().await;
        }
    }
}

/// Serializes each published state into a broadcast frame.
struct ControllerReporter {
    broadcast: broadcast::Sender<Arc<Message>>,
}

#[async_trait]
impl Reporter for ControllerReporter {
    async fn report(&self, state: Arc<State>) -> CoreResult<()> {
        match Message::broadcast(&state) {
            Ok(msg) => {
                if self.broadcast.send(Arc::new(msg)).is_err() {
                    debug!("no ctl clients subscribed, broadcast dropped");
                } else {
                    debug!(timestamp = %state.timestamp, "state broadcast to ctl clients");
                }
            }
            Err(err) => {
                error!(error = %err, "marshal state broadcast failed");
            }
        }

        Ok(())
    }
}

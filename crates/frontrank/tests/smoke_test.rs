//! Smoke tests for the latency pipeline and its control plane
//!
//! Each test runs the full stack: a stub search backend, a real
//! `LatencyClient`, a `CtlServer` listening on real sockets, and clients
//! speaking the line-delimited JSON wire format.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use axum::extract::State as AxumState;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use frontrank_core::{BackendAddr, LatencyClient, QueryConfig};
use frontrank_ctl::{
    wait_result, CmdResult, Command, CtlClient, CtlServer, HandlerSetConfig, IpcCtlClient,
    IpcCtlHandler, Message, MsgType, ResultKey, TcpCtlHandler,
};
use frontrank_plugin::FrontPlugin;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Stub search backend
// =============================================================================

#[derive(Clone, Default)]
struct StubBackend {
    responses: Arc<StdMutex<VecDeque<Value>>>,
}

impl StubBackend {
    fn push(&self, rsp: Value) {
        self.responses.lock().unwrap().push_back(rsp);
    }
}

fn es_fronts(fronts: &[(&str, f64)]) -> Value {
    let buckets: Vec<Value> = fronts
        .iter()
        .map(|(addr, priority)| {
            json!({
                "key": addr,
                "doc_count": 100,
                "exchange_latency_percents": { "values": { "50.0": priority } },
                "exchange_latency_extra": {
                    "avg": priority,
                    "min": priority,
                    "max": priority,
                    "variance": 1.0,
                    "std_deviation": 1.0,
                    "std_deviation_sampling": 1.0
                },
                "exchange_latency_prority": { "value": priority }
            })
        })
        .collect();

    json!({
        "hits": { "total": { "value": 0 }, "hits": [] },
        "aggregations": { "aggs_results": { "buckets": buckets } }
    })
}

async fn stub_search(AxumState(stub): AxumState<StubBackend>) -> Json<Value> {
    let mut responses = stub.responses.lock().unwrap();
    let rsp = if responses.len() > 1 {
        responses.pop_front().unwrap()
    } else {
        responses
            .front()
            .cloned()
            .unwrap_or_else(|| es_fronts(&[("A", 1.0), ("B", 2.0)]))
    };

    Json(rsp)
}

async fn spawn_stub(stub: StubBackend) -> SocketAddr {
    let app = Router::new()
        .route(
            "/",
            get(|| async { Json(json!({ "version": { "number": "7.17.9" } })) }),
        )
        .route("/{index}/_search", post(stub_search))
        .with_state(stub);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

// =============================================================================
// Harness: stub + latency client + ctl server on real sockets
// =============================================================================

struct Harness {
    stub: StubBackend,
    cancel: CancellationToken,
    client: Arc<LatencyClient>,
    server: Arc<CtlServer>,
    tcp_addr: SocketAddr,
    ipc_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

async fn start_harness(interval: Duration) -> Harness {
    let stub = StubBackend::default();
    let backend_addr = spawn_stub(stub.clone()).await;

    let cancel = CancellationToken::new();

    let client = Arc::new(
        LatencyClient::init(
            &cancel,
            BackendAddr::new("http", "127.0.0.1", backend_addr.port()),
            None,
            QueryConfig::with_defaults(),
        )
        .await
        .unwrap(),
    );

    let dir = tempfile::tempdir().unwrap();
    let ipc_path = dir.path().join("ctl.sock");

    let tcp = Arc::new(TcpCtlHandler::bind("127.0.0.1:0").await.unwrap());
    let tcp_addr = tcp.local_addr();
    let ipc = Arc::new(IpcCtlHandler::bind(&ipc_path).unwrap());

    let handlers = HandlerSetConfig::new().handler(tcp).handler(ipc);

    let server = CtlServer::new(&cancel, handlers).unwrap();

    client.start(interval).unwrap();
    server.start(Arc::clone(&client)).await.unwrap();

    Harness {
        stub,
        cancel,
        client,
        server,
        tcp_addr,
        ipc_path,
        _dir: dir,
    }
}

impl Harness {
    async fn shutdown(self) {
        self.cancel.cancel();
        self.client.stop();
        let _ = self.client.join().await;
        self.server.stop();
        self.server.join().await;
    }
}

// =============================================================================
// Raw wire-level TCP client
// =============================================================================

struct RawClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();

        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn send(&mut self, msg: &Message) {
        let mut line = serde_json::to_vec(msg).unwrap();
        line.push(b'\n');
        self.write.write_all(&line).await.unwrap();
    }

    async fn next(&mut self) -> Message {
        let line = timeout(WAIT, self.lines.next_line())
            .await
            .expect("frame within budget")
            .unwrap()
            .expect("connection open");

        serde_json::from_str(&line).unwrap()
    }

    /// Skip broadcasts until a result frame arrives.
    async fn next_result(&mut self) -> Message {
        loop {
            let msg = self.next().await;
            if msg.msg_type == MsgType::Result {
                return msg;
            }
        }
    }

    /// Skip results until a broadcast frame arrives.
    async fn next_broadcast(&mut self) -> Message {
        loop {
            let msg = self.next().await;
            if msg.msg_type == MsgType::BroadCast {
                return msg;
            }
        }
    }
}

// =============================================================================
// Test plugin
// =============================================================================

#[derive(Default)]
struct TestPlugin {
    reports: AtomicUsize,
    joins: AtomicUsize,
}

impl FrontPlugin for TestPlugin {
    fn init(&self, _cfg_path: &str) -> frontrank_plugin::Result<()> {
        Ok(())
    }

    fn report_fronts(&self, _fronts: &[String]) -> frontrank_plugin::Result<()> {
        self.reports.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {}

    fn join(&self) -> frontrank_plugin::Result<()> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_two_tcp_clients_own_result_ids() {
    let harness = start_harness(Duration::from_millis(50)).await;

    let mut c1 = RawClient::connect(harness.tcp_addr).await;
    let mut c2 = RawClient::connect(harness.tcp_addr).await;

    // both clients use msg id 1; the handler must keep them apart
    c1.send(&Message::command(1, &Command::new("state")).unwrap())
        .await;
    c2.send(&Message::command(1, &Command::new("state")).unwrap())
        .await;

    let r1 = c1.next_result().await;
    let r2 = c2.next_result().await;

    assert_eq!(r1.msg_id, 1, "client 1 sees its own id");
    assert_eq!(r2.msg_id, 1, "client 2 sees its own id");

    // broadcasts after a poll reach both clients with msg id 0
    let b1 = c1.next_broadcast().await;
    let b2 = c2.next_broadcast().await;
    assert_eq!(b1.msg_id, 0);
    assert_eq!(b2.msg_id, 0);

    let state = b1.get_state().unwrap();
    assert_eq!(state.addr_list, vec!["A".to_string(), "B".to_string()]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_suspend_resume_commands() {
    let harness = start_harness(Duration::from_millis(50)).await;

    let mut client = RawClient::connect(harness.tcp_addr).await;

    client
        .send(&Message::command(1, &Command::new("suspend")).unwrap())
        .await;
    let rsp = client.next_result().await.get_result().unwrap();
    assert!(rsp.is_ok(), "first suspend succeeds: {rsp:?}");

    client
        .send(&Message::command(2, &Command::new("suspend")).unwrap())
        .await;
    let rsp = client.next_result().await.get_result().unwrap();
    assert_eq!(rsp.rtn, 1, "second suspend is a no-op");

    assert!(harness.client.is_suspended());

    client
        .send(&Message::command(3, &Command::new("resume")).unwrap())
        .await;
    let rsp = client.next_result().await.get_result().unwrap();
    assert!(rsp.is_ok(), "resume succeeds: {rsp:?}");

    assert!(!harness.client.is_suspended());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_period_command_changes_interval() {
    let harness = start_harness(Duration::from_secs(30)).await;

    let mut client = RawClient::connect(harness.tcp_addr).await;

    let cmd = Command::new("period").arg("interval", "100ms");
    client.send(&Message::command(1, &cmd).unwrap()).await;

    let rsp = client.next_result().await.get_result().unwrap();
    assert!(rsp.is_ok(), "{rsp:?}");

    let origin: Option<String> = rsp.decode(ResultKey::Origin).unwrap();
    assert_eq!(origin.as_deref(), Some("30s"));
    let interval: Option<String> = rsp.decode(ResultKey::Interval).unwrap();
    assert_eq!(interval.as_deref(), Some("100ms"));

    assert_eq!(harness.client.interval(), Duration::from_millis(100));

    // the rendezvous re-poll produces a broadcast right away
    let within = timeout(Duration::from_millis(400), client.next_broadcast()).await;
    assert!(within.is_ok(), "re-poll broadcast within 400ms");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_period_command_rejects_bad_interval() {
    let harness = start_harness(Duration::from_secs(30)).await;

    let mut client = RawClient::connect(harness.tcp_addr).await;

    for (id, bad) in [(1u64, "soon"), (2, "0s")] {
        let cmd = Command::new("period").arg("interval", bad);
        client.send(&Message::command(id, &cmd).unwrap()).await;

        let rsp = client.next_result().await.get_result().unwrap();
        assert_eq!(rsp.rtn, 1, "interval {bad:?} rejected: {rsp:?}");
    }

    assert_eq!(harness.client.interval(), Duration::from_secs(30));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_config_and_query_commands() {
    let harness = start_harness(Duration::from_millis(50)).await;

    let mut client = RawClient::connect(harness.tcp_addr).await;

    let cmd = Command::new("config").arg("least", "25");
    client.send(&Message::command(1, &cmd).unwrap()).await;

    let rsp = client.next_result().await.get_result().unwrap();
    assert!(rsp.is_ok(), "{rsp:?}");

    let cfg: QueryConfig = rsp.decode(ResultKey::Config).unwrap().unwrap();
    assert_eq!(cfg.agg_count, 25);
    assert_eq!(harness.client.config().agg_count, 25);

    let cmd = Command::new("query").arg("least", "99");
    client.send(&Message::command(2, &cmd).unwrap()).await;

    let rsp = client.next_result().await.get_result().unwrap();
    assert!(rsp.is_ok(), "{rsp:?}");

    let state: frontrank_core::State = rsp.decode(ResultKey::State).unwrap().unwrap();
    assert_eq!(state.config.agg_count, 99, "one-off kwargs merged");
    assert_eq!(
        harness.client.config().agg_count,
        25,
        "running config untouched by query"
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unknown_command_rejected() {
    let harness = start_harness(Duration::from_millis(50)).await;

    let mut client = RawClient::connect(harness.tcp_addr).await;
    client
        .send(&Message::command(1, &Command::new("frobnicate")).unwrap())
        .await;

    let rsp = client.next_result().await.get_result().unwrap();
    assert_eq!(rsp.rtn, 1);
    assert_eq!(rsp.message, "unsupported command");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_info_command_lists_runtime() {
    let harness = start_harness(Duration::from_millis(50)).await;

    let mut client = RawClient::connect(harness.tcp_addr).await;
    client
        .send(&Message::command(1, &Command::new("info")).unwrap())
        .await;

    let rsp = client.next_result().await.get_result().unwrap();
    assert!(rsp.is_ok(), "{rsp:?}");

    let interval: Option<String> = rsp.decode(ResultKey::Interval).unwrap();
    assert!(interval.is_some());

    let handlers: Vec<Value> = rsp.decode(ResultKey::Handlers).unwrap().unwrap();
    assert_eq!(handlers.len(), 2, "tcp + ipc handlers listed");

    let _plugins: Vec<Value> = rsp.decode(ResultKey::Plugins).unwrap().unwrap();

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unplugin_removes_reporter_and_joins_once() {
    let harness = start_harness(Duration::from_millis(50)).await;

    // wire a static plugin the way the plugin command would
    let plugin = Arc::new(TestPlugin::default());
    frontrank_plugin::register_static("smoke_gateway", plugin.clone()).unwrap();

    struct Bridge(Arc<TestPlugin>);

    #[async_trait::async_trait]
    impl frontrank_core::Reporter for Bridge {
        async fn report(
            &self,
            state: Arc<frontrank_core::State>,
        ) -> frontrank_core::Result<()> {
            self.0
                .report_fronts(&state.addr_list)
                .map_err(|e| frontrank_core::Error::Reporter(e.to_string()))
        }
    }

    harness
        .client
        .add_reporter("smoke_gateway", Arc::new(Bridge(plugin.clone())))
        .unwrap();

    // wait until the plugin observed at least one ranking
    timeout(WAIT, async {
        while plugin.reports.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("plugin reports while registered");

    let mut client = RawClient::connect(harness.tcp_addr).await;
    let cmd = Command::new("unplugin").arg("plugin", "smoke_gateway");
    client.send(&Message::command(1, &cmd).unwrap()).await;

    let rsp = client.next_result().await.get_result().unwrap();
    assert!(rsp.is_ok(), "{rsp:?}");

    assert!(frontrank_plugin::get("smoke_gateway").is_none());
    assert_eq!(plugin.joins.load(Ordering::SeqCst), 1, "join exactly once");

    // no further reports after unplugin
    let settled = plugin.reports.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(plugin.reports.load(Ordering::SeqCst), settled);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_plugin_command_rejects_missing_lib() {
    let harness = start_harness(Duration::from_millis(50)).await;

    let mut client = RawClient::connect(harness.tcp_addr).await;

    let cmd = Command::new("plugin")
        .arg("plugin", "ghost")
        .arg("config", "/tmp/ghost.toml")
        .arg("lib", "/nonexistent");
    client.send(&Message::command(1, &cmd).unwrap()).await;

    let rsp = client.next_result().await.get_result().unwrap();
    assert_eq!(rsp.rtn, 1);
    assert!(rsp.message.contains("create plugin failed"), "{rsp:?}");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_stop_then_start_rebuilds_client() {
    let harness = start_harness(Duration::from_millis(50)).await;
    harness.stub.push(es_fronts(&[("A", 1.0)]));

    let mut client = RawClient::connect(harness.tcp_addr).await;

    client
        .send(&Message::command(1, &Command::new("stop")).unwrap())
        .await;
    let rsp = client.next_result().await.get_result().unwrap();
    assert!(rsp.is_ok(), "{rsp:?}");
    assert!(harness.server.latency_client().is_none());

    // every other command now fails
    client
        .send(&Message::command(2, &Command::new("state")).unwrap())
        .await;
    let rsp = client.next_result().await.get_result().unwrap();
    assert_eq!(rsp.rtn, 1);
    assert_eq!(rsp.message, "no latency client");

    // start reconstructs from the stored run parameters
    let cmd = Command::new("start").arg("interval", "50ms");
    client.send(&Message::command(3, &cmd).unwrap()).await;
    let rsp = client.next_result().await.get_result().unwrap();
    assert!(rsp.is_ok(), "{rsp:?}");
    assert!(harness.server.latency_client().is_some());

    // broadcasts flow again through the re-registered controller
    let broadcast = client.next_broadcast().await;
    assert!(broadcast.get_state().is_ok());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_ipc_client_session() {
    let harness = start_harness(Duration::from_millis(50)).await;

    let client = IpcCtlClient::connect(&harness.ipc_path).await.unwrap();
    let mut rx = client.subscribe();

    client.start().await.unwrap();

    // the initial probe is always msg id 1 and answers as info
    let info = wait_result(&mut rx, 1, WAIT).await.unwrap();
    assert_eq!(info.cmd_name, "info");
    assert!(info.is_ok(), "{info:?}");

    let msg_id = client.command(&Command::new("state")).await.unwrap();
    assert_eq!(msg_id, 2, "session sequence is monotonic");

    let state_rsp: CmdResult = wait_result(&mut rx, msg_id, WAIT).await.unwrap();
    assert_eq!(state_rsp.cmd_name, "state");

    client.release().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn test_message_loop_demultiplexes_and_runs_post_hook() {
    let harness = start_harness(Duration::from_millis(50)).await;

    let client = IpcCtlClient::connect(&harness.ipc_path).await.unwrap();
    client.start().await.unwrap();

    let states = Arc::new(AtomicUsize::new(0));
    let results = Arc::new(AtomicUsize::new(0));
    let post_runs = Arc::new(AtomicUsize::new(0));

    let states_in = Arc::clone(&states);
    let results_in = Arc::clone(&results);
    let post_in = Arc::clone(&post_runs);

    client
        .message_loop(
            "smoke",
            None,
            Some(Box::new(move |_state| {
                states_in.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            Some(Box::new(move |_result| {
                results_in.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            Some(Box::new(move || {
                post_in.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        )
        .unwrap();

    client.command(&Command::new("state")).await.unwrap();

    timeout(WAIT, async {
        while states.load(Ordering::SeqCst) == 0 || results.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("loop sees both results and broadcasts");

    client.release().await;
    assert_eq!(post_runs.load(Ordering::SeqCst), 1, "post run exactly once");

    harness.shutdown().await;
}

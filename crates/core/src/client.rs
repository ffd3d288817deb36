//! Latency client
//!
//! `LatencyClient` owns the query-report pipeline: a querier task polls the
//! search backend, publishes each ranked snapshot, and a dispatcher task
//! fans the snapshot out to every registered reporter. Configuration and
//! interval live in shared cells so the control plane can reconfigure a
//! running client; the re-poll signal is a rendezvous, so a reconfiguration
//! call returns only once the querier has picked the change up for its next
//! poll.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendAddr, SearchBackend};
use crate::config::QueryConfig;
use crate::error::{Error, Result};
use crate::reporter::{Reporter, ReporterRegistry};
use crate::state::{self, LatencyReport, State};

/// Budget for handing a fresh state to the dispatcher.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the state channel between querier and dispatcher.
const NOTIFY_BUFFER: usize = 10;

type ReloadAck = oneshot::Sender<()>;

/// Periodic querier and reporter hub for exchange-front latency rankings.
pub struct LatencyClient {
    run: CancellationToken,
    backend: SearchBackend,
    sink: Option<PathBuf>,

    cfg: RwLock<Arc<QueryConfig>>,
    interval_nanos: AtomicU64,
    last_report: RwLock<Option<Arc<LatencyReport>>>,

    suspended: AtomicBool,
    suspend_gate: watch::Sender<bool>,

    reload_tx: mpsc::Sender<ReloadAck>,
    reload_rx: Mutex<Option<mpsc::Receiver<ReloadAck>>>,

    started: AtomicBool,
    querier: Mutex<Option<JoinHandle<Result<()>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,

    reporters: ReporterRegistry,
}

impl LatencyClient {
    /// Connect the backend, recover the sink file and build an idle client.
    ///
    /// The client is scoped under `cancel`: cancelling the parent token
    /// tears the run loop down.
    pub async fn init(
        cancel: &CancellationToken,
        addr: BackendAddr,
        sink: Option<PathBuf>,
        config: QueryConfig,
    ) -> Result<Self> {
        let backend = SearchBackend::connect(addr).await?;

        let recovered = match &sink {
            Some(path) => {
                let report = state::read_report(path).await?;
                if let Some(report) = &report {
                    info!(
                        path = %path.display(),
                        timestamp = %report.timestamp,
                        fronts = report.latency_list.len(),
                        "recovered latency report from sink"
                    );
                }
                report
            }
            None => None,
        };

        let (reload_tx, reload_rx) = mpsc::channel(1);
        let (suspend_gate, _) = watch::channel(false);

        Ok(Self {
            run: cancel.child_token(),
            backend,
            sink,
            cfg: RwLock::new(Arc::new(config)),
            interval_nanos: AtomicU64::new(0),
            last_report: RwLock::new(recovered.map(Arc::new)),
            suspended: AtomicBool::new(false),
            suspend_gate,
            reload_tx,
            reload_rx: Mutex::new(Some(reload_rx)),
            started: AtomicBool::new(false),
            querier: Mutex::new(None),
            dispatcher: Mutex::new(None),
            reporters: ReporterRegistry::new(),
        })
    }

    /// Spawn the querier and dispatcher tasks.
    ///
    /// A zero interval runs exactly one poll and exits.
    pub fn start(self: &Arc<Self>, interval: Duration) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let reload_rx = self
            .reload_rx
            .lock()
            .take()
            .ok_or(Error::AlreadyStarted)?;

        if interval.is_zero() {
            info!("onetime latency client run");
        } else {
            info!(interval = ?interval, "starting latency client");
        }
        self.interval_nanos
            .store(interval.as_nanos() as u64, Ordering::SeqCst);

        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_BUFFER);

        *self.querier.lock() = Some(tokio::spawn(
            Arc::clone(self).run_querier(reload_rx, notify_tx),
        ));
        *self.dispatcher.lock() = Some(tokio::spawn(
            Arc::clone(self).run_dispatcher(notify_rx),
        ));

        Ok(())
    }

    /// Pause polling. Returns false when already suspended.
    pub fn suspend(&self) -> bool {
        let changed = self
            .suspended
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();

        if changed {
            let _ = self.suspend_gate.send(true);
            info!("latency querier suspended");
        }

        changed
    }

    /// Resume polling. Returns false when not suspended.
    pub fn resume(&self) -> bool {
        let changed = self
            .suspended
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();

        if changed {
            let _ = self.suspend_gate.send(false);
            info!("latency querier resumed");
        }

        changed
    }

    /// Swap the poll interval and trigger an immediate re-poll.
    ///
    /// Returns the previous interval; a non-positive interval is rejected
    /// and the previous value kept.
    pub async fn change_interval(&self, interval: Duration) -> Duration {
        let old = self.interval();

        if interval.is_zero() {
            warn!(interval = ?interval, "invalid interval, keeping current");
            return old;
        }

        self.interval_nanos
            .store(interval.as_nanos() as u64, Ordering::SeqCst);
        self.request_repoll().await;

        old
    }

    /// Merge overrides onto the current config, install the result and
    /// trigger an immediate re-poll.
    pub async fn set_config(&self, kwargs: &HashMap<String, String>) -> Result<()> {
        let mut cfg = (*self.config()).clone();
        cfg.merge(kwargs)?;

        *self.cfg.write() = Arc::new(cfg);
        self.request_repoll().await;

        Ok(())
    }

    /// One-shot query on an ephemeral config; the running state, the sink
    /// and the current config stay untouched.
    pub async fn query_latency(&self, kwargs: &HashMap<String, String>) -> Result<State> {
        let mut cfg = (*self.config()).clone();
        cfg.merge(kwargs)?;

        let latency_list = self.backend.search(&cfg).await?;

        Ok(State::new(Utc::now(), cfg, latency_list))
    }

    pub fn add_reporter(&self, name: &str, reporter: Arc<dyn Reporter>) -> Result<()> {
        self.reporters.add(name, reporter)
    }

    pub fn remove_reporter(&self, name: &str) -> Result<()> {
        self.reporters.remove(name)
    }

    pub fn reporter_names(&self) -> Vec<String> {
        self.reporters.names()
    }

    /// Latest ranking, derived from the persisted report and the current
    /// config; `None` until the first non-empty poll (or sink recovery).
    pub fn last_state(&self) -> Option<State> {
        let report = self.last_report.read().clone()?;
        Some(State::from_report(&report, &self.config()))
    }

    pub fn config(&self) -> Arc<QueryConfig> {
        Arc::clone(&self.cfg.read())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos.load(Ordering::SeqCst))
    }

    pub fn backend_addr(&self) -> &BackendAddr {
        self.backend.addr()
    }

    pub fn sink_path(&self) -> Option<&Path> {
        self.sink.as_deref()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Cancel the run loop; a suspended querier is resumed first so it can
    /// observe the cancellation.
    pub fn stop(&self) {
        if self.run.is_cancelled() {
            return;
        }

        self.resume();
        self.run.cancel();
        info!("stopping latency query & report runner");
    }

    /// Block until the querier terminated and every reporter drained.
    /// Returns the querier's terminal error, if any.
    pub async fn join(&self) -> Result<()> {
        let querier = self.querier.lock().take();
        let dispatcher = self.dispatcher.lock().take();

        let result = match querier {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(err) => {
                    error!(error = %err, "querier task aborted");
                    Ok(())
                }
            },
            None => Ok(()),
        };

        if let Some(handle) = dispatcher {
            if let Err(err) = handle.await {
                error!(error = %err, "reporter dispatcher aborted");
            }
        }

        result
    }

    async fn request_repoll(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        let (ack_tx, ack_rx) = oneshot::channel();

        tokio::select! {
            _ = self.run.cancelled() => {}
            sent = self.reload_tx.send(ack_tx) => {
                if sent.is_ok() {
                    tokio::select! {
                        _ = self.run.cancelled() => {}
                        _ = ack_rx => {}
                    }
                }
            }
        }
    }

    async fn run_querier(
        self: Arc<Self>,
        mut reload_rx: mpsc::Receiver<ReloadAck>,
        notify_tx: mpsc::Sender<Arc<State>>,
    ) -> Result<()> {
        let result = self.query_loop(&mut reload_rx, &notify_tx).await;

        // terminating the querier tears the whole run down
        self.run.cancel();

        if let Err(err) = &result {
            error!(error = %err, "latency querier terminated");
        }

        result
    }

    async fn query_loop(
        &self,
        reload_rx: &mut mpsc::Receiver<ReloadAck>,
        notify_tx: &mpsc::Sender<Arc<State>>,
    ) -> Result<()> {
        let mut gate = self.suspend_gate.subscribe();

        loop {
            tokio::select! {
                _ = self.run.cancelled() => return Ok(()),
                open = gate.wait_for(|suspended| !*suspended) => {
                    if open.is_err() {
                        return Ok(());
                    }
                }
            }

            if self.run.is_cancelled() {
                return Ok(());
            }

            let cfg = self.config();

            let result = tokio::select! {
                _ = self.run.cancelled() => return Ok(()),
                result = self.backend.search(&cfg) => result,
            };

            match result {
                Err(err) => {
                    error!(error = %err, "query latency failed");
                    if self.interval().is_zero() {
                        return Err(err);
                    }
                }
                Ok(latency_list) => {
                    let state = self.install_state(&cfg, latency_list).await;

                    match timeout(NOTIFY_TIMEOUT, notify_tx.send(state)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => return Ok(()),
                        Err(_) => {
                            error!(timeout = ?NOTIFY_TIMEOUT, "publish latency state timed out");
                        }
                    }
                }
            }

            let interval = self.interval();
            if interval.is_zero() {
                info!("no interval specified, one time running");
                return Ok(());
            }

            tokio::select! {
                _ = self.run.cancelled() => return Ok(()),
                ack = reload_rx.recv() => {
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                        info!("reload acknowledged, re-polling immediately");
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn install_state(
        &self,
        cfg: &QueryConfig,
        latency_list: Vec<crate::latency::ExFrontLatency>,
    ) -> Arc<State> {
        let state = Arc::new(State::new(Utc::now(), cfg.clone(), latency_list));

        if state.latency_list.is_empty() {
            debug!("empty latency result, skip sink");
            return state;
        }

        let report = Arc::new(LatencyReport::from_state(&state));
        *self.last_report.write() = Some(Arc::clone(&report));

        if let Some(path) = &self.sink {
            if let Err(err) = state::write_report(path, &report).await {
                error!(
                    error = %err,
                    path = %path.display(),
                    "sink latency report failed"
                );
            }
        }

        state
    }

    async fn run_dispatcher(self: Arc<Self>, mut notify_rx: mpsc::Receiver<Arc<State>>) {
        while let Some(state) = notify_rx.recv().await {
            info!(priority = ?state.addr_list, "reporting latency ranking");

            for (name, reporter) in self.reporters.snapshot() {
                debug!(reporter = %name, "sending latency state to reporter");

                if let Err(err) = reporter.report(Arc::clone(&state)).await {
                    error!(error = %err, reporter = %name, "reporter failed");
                }
            }
        }

        info!("latency notify channel closed, reporters drained");
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;

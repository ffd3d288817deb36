//! `watch` - periodic polling, optional control plane

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use frontrank_core::{LatencyClient, QueryConfig};
use frontrank_ctl::{CtlServer, HandlerSetConfig};

use crate::cmd::{watch_signals, BackendArgs, QueryArgs};

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    #[command(flatten)]
    pub query: QueryArgs,

    /// Poll interval
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    pub interval: Duration,

    /// Run once and exit; overrides --interval
    #[arg(long)]
    pub once: bool,

    /// Control-plane URIs (ipc://<path> or tcp://<host:port>), repeatable
    #[arg(long = "ctl")]
    pub ctl: Vec<String>,
}

pub async fn run(args: WatchArgs) -> Result<()> {
    let cancel = CancellationToken::new();
    watch_signals(cancel.clone());

    let mut interval = args.interval;
    if args.once || args.query.has_absolute_from() {
        info!(
            once = args.once,
            "args conflict with --interval, one-shot run"
        );
        interval = Duration::ZERO;
    }

    let mut cfg = QueryConfig::with_defaults();
    args.query.apply(&mut cfg)?;

    let client = Arc::new(
        LatencyClient::init(&cancel, args.backend.addr(), args.backend.sink.clone(), cfg)
            .await?,
    );

    client.add_reporter("console", Arc::new(super::report::ConsoleReporter))?;

    let server = if args.ctl.is_empty() {
        None
    } else {
        let mut handlers = HandlerSetConfig::new();
        for uri in &args.ctl {
            handlers = handlers.uri(uri).await?;
        }

        Some(CtlServer::new(&cancel, handlers)?)
    };

    client.start(interval)?;

    if let Some(server) = &server {
        server.start(Arc::clone(&client)).await?;
    }

    let run_result = client.join().await;

    if let Some(server) = &server {
        server.stop();
        server.join().await;
    }

    run_result?;

    Ok(())
}

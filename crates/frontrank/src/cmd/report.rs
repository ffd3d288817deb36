//! `report` - one-shot query, print the ranking

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use tokio_util::sync::CancellationToken;

use frontrank_core::{LatencyClient, QueryConfig, Reporter, State};

use crate::cmd::{watch_signals, BackendArgs, QueryArgs};

#[derive(Args, Debug)]
pub struct ReportArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    #[command(flatten)]
    pub query: QueryArgs,
}

pub async fn run(args: ReportArgs) -> Result<()> {
    let cancel = CancellationToken::new();
    watch_signals(cancel.clone());

    let mut cfg = QueryConfig::with_defaults();
    args.query.apply(&mut cfg)?;

    let client = Arc::new(
        LatencyClient::init(&cancel, args.backend.addr(), args.backend.sink.clone(), cfg)
            .await?,
    );

    client.add_reporter("console", Arc::new(ConsoleReporter))?;

    client.start(Duration::ZERO)?;
    client.join().await?;

    Ok(())
}

/// Prints each ranking to stdout.
pub(crate) struct ConsoleReporter;

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn report(&self, state: Arc<State>) -> frontrank_core::Result<()> {
        println!("# latency ranking @ {}", state.timestamp.to_rfc3339());

        if state.latency_list.is_empty() {
            println!("  (no fronts matched)");
            return Ok(());
        }

        for (rank, latency) in state.latency_list.iter().enumerate() {
            println!(
                "{:>3}. {:<28} priority={:<12.3} avg={:<10.3} p50={:<10.3} docs={}",
                rank + 1,
                latency.front_addr,
                latency.priority,
                latency.avg_latency,
                latency.percents.get(50.0).unwrap_or_default(),
                latency.doc_count,
            );
        }

        Ok(())
    }
}

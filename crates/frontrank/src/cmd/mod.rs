//! CLI subcommands and shared argument groups

pub mod ctl;
pub mod report;
pub mod watch;

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use frontrank_core::{BackendAddr, QueryConfig};

/// Search-backend connection arguments.
#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    /// Backend URL schema
    #[arg(long, default_value = "http")]
    pub schema: String,

    /// Backend host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Backend port
    #[arg(long, default_value_t = 9200)]
    pub port: u16,

    /// Sink file holding the latest ranking
    #[arg(long)]
    pub sink: Option<PathBuf>,
}

impl BackendArgs {
    pub fn addr(&self) -> BackendAddr {
        BackendAddr::new(self.schema.clone(), self.host.clone(), self.port)
    }
}

/// Query-config overrides, routed through the config key set.
#[derive(Args, Debug, Clone, Default)]
pub struct QueryArgs {
    /// Relative window, e.g. 5m or 1h
    #[arg(long)]
    pub before: Option<String>,

    /// Time range pairs, e.g. "from=2025-03-01T09:30:00,to=..."
    #[arg(long)]
    pub range: Option<String>,

    /// Tick-to-order lower bound, picoseconds
    #[arg(long)]
    pub tick_from: Option<i64>,

    /// Tick-to-order upper bound, picoseconds (0 = unfiltered)
    #[arg(long)]
    pub tick_to: Option<i64>,

    /// Percentiles, e.g. "[25,50,99]"
    #[arg(long)]
    pub percents: Option<String>,

    /// Max aggregation buckets
    #[arg(long)]
    pub agg: Option<usize>,

    /// Minimum documents per bucket
    #[arg(long)]
    pub least: Option<usize>,

    /// Client-id filters, e.g. "[ua001,ua002]"
    #[arg(long)]
    pub user: Option<String>,

    /// Priority script, e.g. "params.mid + params.stdev"
    #[arg(long)]
    pub sort: Option<String>,
}

impl QueryArgs {
    /// Flatten the set overrides into config kwargs.
    pub fn kwargs(&self) -> HashMap<String, String> {
        let mut kwargs = HashMap::new();

        let pairs: [(&str, Option<String>); 9] = [
            ("before", self.before.clone()),
            ("range", self.range.clone()),
            ("from", self.tick_from.map(|v| v.to_string())),
            ("to", self.tick_to.map(|v| v.to_string())),
            ("percents", self.percents.clone()),
            ("agg", self.agg.map(|v| v.to_string())),
            ("least", self.least.map(|v| v.to_string())),
            ("user", self.user.clone()),
            ("sort", self.sort.clone()),
        ];

        for (key, value) in pairs {
            if let Some(value) = value {
                kwargs.insert(key.to_string(), value);
            }
        }

        kwargs
    }

    /// Apply the set overrides onto a config.
    pub fn apply(&self, cfg: &mut QueryConfig) -> frontrank_core::Result<()> {
        for (key, value) in self.kwargs() {
            cfg.set(&key, &value)?;
        }

        Ok(())
    }

    pub fn has_absolute_from(&self) -> bool {
        self.range
            .as_deref()
            .map(|r| r.contains("from="))
            .unwrap_or(false)
    }
}

/// Cancel the root token on SIGINT/SIGTERM/SIGQUIT.
pub fn watch_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(_) => return cancel.cancel(),
            };
            let mut quit = match signal(SignalKind::quit()) {
                Ok(quit) => quit,
                Err(_) => return cancel.cancel(),
            };

            tokio::select! {
                _ = ctrl_c => info!("interrupt received"),
                _ = term.recv() => info!("terminate received"),
                _ = quit.recv() => info!("quit received"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("interrupt received");
        }

        cancel.cancel();
    });
}

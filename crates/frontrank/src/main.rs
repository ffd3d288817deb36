//! frontrank - exchange-front latency ranking tool
//!
//! # Usage
//!
//! ```bash
//! # one-shot query, print the ranking
//! frontrank report --host stats.internal --before 15m
//!
//! # poll every minute, expose the control plane on IPC and TCP
//! frontrank watch --interval 1m \
//!     --ctl ipc:///tmp/frontrank.sock --ctl tcp://0.0.0.0:4100
//!
//! # drive a running watcher
//! frontrank ctl --uri ipc:///tmp/frontrank.sock --cmd suspend
//! frontrank ctl --uri tcp://127.0.0.1:4100 --cmd period --interval 30s
//! ```

mod cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exchange-front latency ranking tool
#[derive(Parser, Debug)]
#[command(name = "frontrank")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one query and print the ranking
    Report(cmd::report::ReportArgs),

    /// Poll periodically; optionally expose the control plane
    Watch(cmd::watch::WatchArgs),

    /// Send a command to a running watcher
    Ctl(cmd::ctl::CtlArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Command::Report(args) => cmd::report::run(args).await,
        Command::Watch(args) => cmd::watch::run(args).await,
        Command::Ctl(args) => cmd::ctl::run(args).await,
    }
}

/// Initialize the tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

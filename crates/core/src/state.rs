//! Poll snapshots and the persisted latency report
//!
//! A `State` is produced atomically by one poll and never mutated after
//! publication; consumers share it behind `Arc`. The `LatencyReport` is the
//! sink-file form used for cold-restart recovery.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::QueryConfig;
use crate::error::Result;
use crate::latency::ExFrontLatency;

/// Snapshot of one poll: ranking order, per-front statistics and the config
/// the poll ran with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct State {
    pub timestamp: DateTime<Utc>,
    pub addr_list: Vec<String>,
    pub latency_list: Vec<ExFrontLatency>,
    pub config: QueryConfig,
}

impl State {
    /// Build a snapshot from a ranked latency list; the address list is
    /// derived so `addr_list[i]` always matches `latency_list[i]`.
    pub fn new(
        timestamp: DateTime<Utc>,
        config: QueryConfig,
        latency_list: Vec<ExFrontLatency>,
    ) -> Self {
        let addr_list = latency_list
            .iter()
            .map(|l| l.front_addr.clone())
            .collect();

        Self {
            timestamp,
            addr_list,
            latency_list,
            config,
        }
    }

    /// Rebuild a snapshot from a persisted report and the current config.
    pub fn from_report(report: &LatencyReport, config: &QueryConfig) -> Self {
        Self::new(
            report.timestamp,
            config.clone(),
            report.latency_list.clone(),
        )
    }
}

/// Sink-file form of the latest successful poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatencyReport {
    pub timestamp: DateTime<Utc>,
    pub config: QueryConfig,
    #[serde(rename = "Latency")]
    pub latency_list: Vec<ExFrontLatency>,
}

impl LatencyReport {
    pub fn from_state(state: &State) -> Self {
        Self {
            timestamp: state.timestamp,
            config: state.config.clone(),
            latency_list: state.latency_list.clone(),
        }
    }
}

/// Replace the sink file with the given report.
///
/// The write goes to a sibling temp file first and lands via rename so a
/// concurrent reader never observes a partial report.
pub async fn write_report(path: &Path, report: &LatencyReport) -> Result<()> {
    let data = serde_json::to_vec(report)?;

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &data).await?;
    tokio::fs::rename(&tmp, path).await?;

    debug!(path = %path.display(), fronts = report.latency_list.len(), "latency report sinked");

    Ok(())
}

/// Read the sink file if it exists.
///
/// A missing file yields `None`; an unparseable file is logged and treated
/// as absent so a stale sink never blocks startup.
pub async fn read_report(path: &Path) -> Result<Option<LatencyReport>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    match serde_json::from_slice(&data) {
        Ok(report) => Ok(Some(report)),
        Err(err) => {
            warn!(
                error = %err,
                path = %path.display(),
                "unparseable latency report ignored"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;

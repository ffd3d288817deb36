//! frontrank-core - exchange-front latency polling and ranking
//!
//! This crate owns the data path of frontrank:
//!
//! - [`QueryConfig`] - immutable snapshot of the backend query parameters
//! - [`SearchBackend`] - HTTP executor for the latency aggregation
//! - [`State`] / [`LatencyReport`] - published snapshots and the sink file
//! - [`Reporter`] / [`ReporterRegistry`] - named sinks for every snapshot
//! - [`LatencyClient`] - the periodic querier and reporter hub
//!
//! The control plane (frontrank-ctl) drives a `LatencyClient` through the
//! operations exposed here; nothing in this crate knows about transports.

mod backend;
mod client;
mod config;
mod error;
mod latency;
mod reporter;
mod state;

pub use backend::{BackendAddr, SearchBackend, INDEX_PATTERN};
pub use client::LatencyClient;
pub use config::{
    QueryConfig, Tick2Order, TimeKey, TimeRange, AGGREGATION_FIELD, AGGREGATION_RESULTS,
    AGGREGATION_TERM, DEFAULT_SORT, EXCHANGE_LATENCY_EXTRA, EXCHANGE_LATENCY_PERCENTS,
    EXCHANGE_LATENCY_PRIORITY, TICK2ORDER_FIELD, TIMERANGE_FIELD, USERS_FIELD,
};
pub use error::{Error, Result};
pub use latency::{ExFrontLatency, PercentMap};
pub use reporter::{Reporter, ReporterRegistry};
pub use state::{read_report, write_report, LatencyReport, State};

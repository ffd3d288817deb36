//! Query configuration
//!
//! `QueryConfig` is an immutable snapshot of the backend query parameters.
//! Overrides arrive as string key/value pairs from the CLI or the control
//! plane through [`QueryConfig::set`]; [`QueryConfig::make_query`] renders
//! the snapshot into the backend's filter and aggregation JSON.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Document timestamp field.
pub const TIMERANGE_FIELD: &str = "captureTimestamp";
/// Client-id filter field.
pub const USERS_FIELD: &str = "用户代码";
/// Tick-to-order latency field, picoseconds.
pub const TICK2ORDER_FIELD: &str = "mdLatency";

/// Terms-aggregation key field, one bucket per front address.
pub const AGGREGATION_TERM: &str = "exchangeAddr.keyword";
/// Exchange round-trip latency field aggregated per bucket.
pub const AGGREGATION_FIELD: &str = "交易所延迟";
/// Name of the top-level aggregation in requests and responses.
pub const AGGREGATION_RESULTS: &str = "aggs_results";

pub const EXCHANGE_LATENCY_PERCENTS: &str = "exchange_latency_percents";
pub const EXCHANGE_LATENCY_EXTRA: &str = "exchange_latency_extra";
pub const EXCHANGE_LATENCY_PRIORITY: &str = "exchange_latency_prority";

/// Default priority script: the 50th percentile.
pub const DEFAULT_SORT: &str = "params.mid";

const TIMESTAMP_INPUT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Keys of the time-range mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeKey {
    Before,
    From,
    To,
    Bucket,
    Size,
}

impl TimeKey {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "before" => Some(Self::Before),
            "from" => Some(Self::From),
            "to" => Some(Self::To),
            "bucket" => Some(Self::Bucket),
            "size" => Some(Self::Size),
            _ => None,
        }
    }
}

/// Query time window.
///
/// Holds the raw key/value pairs; the concrete `[from, to]` expression pair
/// is resolved on demand by [`TimeRange::get_range`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeRange(BTreeMap<TimeKey, String>);

impl TimeRange {
    pub fn before(duration: impl Into<String>) -> Self {
        let mut range = Self::default();
        range.0.insert(TimeKey::Before, duration.into());
        range
    }

    pub fn get(&self, key: TimeKey) -> Option<&str> {
        self.0.get(&key).map(String::as_str)
    }

    /// Merge a comma-separated `key=value` list into the range.
    ///
    /// A bare value without `=` is shorthand for `before`. Absolute `from`/
    /// `to` timestamps are parsed in the local timezone and reformatted to
    /// RFC3339; relative `before` durations pass through untouched.
    pub fn set(&mut self, expr: &str) -> Result<()> {
        for pair in expr.split(',').map(str::trim) {
            match pair.split_once('=') {
                None => {
                    self.0.insert(TimeKey::Before, pair.to_string());
                }
                Some((key, value)) => {
                    let key = TimeKey::parse(key)
                        .ok_or_else(|| Error::InvalidTimeRange(pair.to_string()))?;
                    let value = match key {
                        TimeKey::From | TimeKey::To => parse_local_timestamp(value)?,
                        _ => value.to_string(),
                    };
                    self.0.insert(key, value);
                }
            }
        }

        Ok(())
    }

    /// Resolve the concrete `[from, to]` expression pair.
    ///
    /// Precedence: `from`&`to` > `from` alone (`to` = now) > `before` >
    /// default window of the last five minutes.
    pub fn get_range(&self) -> [String; 2] {
        let before = self.get(TimeKey::Before).unwrap_or_default();
        let from = self.get(TimeKey::From).unwrap_or_default();
        let to = self.get(TimeKey::To).unwrap_or_default();

        match (from, to, before) {
            (f, t, _) if !f.is_empty() && !t.is_empty() => [f.to_string(), t.to_string()],
            (f, _, _) if !f.is_empty() => [f.to_string(), "now".to_string()],
            (_, _, b) if !b.is_empty() => [format!("now-{b}"), "now".to_string()],
            _ => {
                warn!(range = ?self.0, "no usable time range, fallback to before[5m]");
                ["now-5m".to_string(), "now".to_string()]
            }
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [from, to] = self.get_range();
        write!(f, "[{from} ~ {to}]")
    }
}

fn parse_local_timestamp(value: &str) -> Result<String> {
    let naive = NaiveDateTime::parse_from_str(value, TIMESTAMP_INPUT_FORMAT)
        .map_err(|e| Error::InvalidTimeRange(format!("{value}: {e}")))?;

    Local
        .from_local_datetime(&naive)
        .single()
        .map(|ts| ts.to_rfc3339())
        .ok_or_else(|| Error::InvalidTimeRange(format!("{value}: ambiguous local time")))
}

/// Tick-to-order filter range in picoseconds. `to == 0` disables the filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Tick2Order {
    pub from: i64,
    pub to: i64,
}

impl fmt::Display for Tick2Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} us ~ {} us]",
            self.from as f64 / 1_000_000.0,
            self.to as f64 / 1_000_000.0
        )
    }
}

/// Immutable snapshot of the backend query parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct QueryConfig {
    pub time_range: TimeRange,
    #[serde(rename = "Tick2Order")]
    pub tick2order: Tick2Order,
    pub users: Vec<String>,
    pub data_size: usize,
    pub agg_size: usize,
    pub agg_count: usize,
    pub quantile: Vec<f64>,
    pub sort_by: String,
}

impl QueryConfig {
    /// The stock configuration: last five minutes, no filters.
    pub fn with_defaults() -> Self {
        Self {
            time_range: TimeRange::before("5m"),
            ..Default::default()
        }
    }

    /// Apply one string override.
    ///
    /// Supported keys: `before | range | from | to | percents | agg |
    /// least | user | sort`. `from`/`to` set the tick-to-order window;
    /// timestamp bounds go through `range`. Unknown keys fail.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key.to_ascii_lowercase().as_str() {
            "before" | "range" => self.time_range.set(value)?,
            "from" => {
                self.tick2order.from = parse_int(key, value)?;
            }
            "to" => {
                self.tick2order.to = parse_int(key, value)?;
            }
            "percents" => {
                self.quantile = split_list(value)
                    .map(|v| {
                        v.parse::<f64>()
                            .map_err(|e| Error::InvalidQueryConfig(format!("percents {v:?}: {e}")))
                    })
                    .collect::<Result<_>>()?;
            }
            "agg" => {
                self.agg_size = parse_int(key, value)?;
            }
            "least" => {
                self.agg_count = parse_int(key, value)?;
            }
            "user" => {
                self.users = split_list(value).map(str::to_string).collect();
            }
            "sort" => {
                self.sort_by = value.to_string();
            }
            _ => return Err(Error::UnsupportedConfigKey(key.to_string())),
        }

        Ok(())
    }

    /// Apply a set of overrides; `config` carries a full JSON replacement.
    pub fn merge(&mut self, kwargs: &std::collections::HashMap<String, String>) -> Result<()> {
        if let Some(raw) = kwargs.get("config") {
            *self = serde_json::from_str(raw)?;
        }

        for (key, value) in kwargs {
            if key == "config" {
                continue;
            }
            self.set(key, value)?;
        }

        Ok(())
    }

    /// Render the `(filter, aggregation)` pair of the backend query.
    ///
    /// The filter combines the resolved time window with the optional user
    /// and tick-to-order terms. The aggregation buckets documents per front
    /// address, ordered ascending by the median sub-bucket, and attaches
    /// percentiles, extended stats and the priority bucket script.
    pub fn make_query(&self) -> (Value, Value) {
        let [from, to] = self.time_range.get_range();

        let mut filters = vec![json!({
            "range": {
                TIMERANGE_FIELD: {
                    "gte": from,
                    "lte": to,
                    "format": "strict_date_optional_time",
                }
            }
        })];

        if !self.users.is_empty() {
            filters.push(json!({ "terms": { USERS_FIELD: self.users } }));
        }

        if self.tick2order.to != 0 {
            filters.push(json!({
                "range": {
                    TICK2ORDER_FIELD: {
                        "gte": self.tick2order.from,
                        "lte": self.tick2order.to,
                    }
                }
            }));
        }

        info!(query_cfg = %self, "data filter config");

        let query = json!({ "bool": { "filter": filters } });

        let sort_by = if self.sort_by.is_empty() {
            DEFAULT_SORT
        } else {
            &self.sort_by
        };

        let mut percentiles = json!({ "field": AGGREGATION_FIELD });
        if !self.quantile.is_empty() {
            percentiles["percents"] = json!(self.quantile);
        }

        let mut terms = json!({
            "field": AGGREGATION_TERM,
            "order": [ { format!("{EXCHANGE_LATENCY_PERCENTS}.50"): "asc" } ],
            "min_doc_count": self.agg_count,
        });
        if self.agg_size > 0 {
            terms["size"] = json!(self.agg_size);
        }

        let aggregation = json!({
            "terms": terms,
            "aggs": {
                EXCHANGE_LATENCY_PERCENTS: { "percentiles": percentiles },
                EXCHANGE_LATENCY_EXTRA: {
                    "extended_stats": { "field": AGGREGATION_FIELD }
                },
                EXCHANGE_LATENCY_PRIORITY: {
                    "bucket_script": {
                        "buckets_path": {
                            "mid": format!("{EXCHANGE_LATENCY_PERCENTS}.50"),
                            "avg": format!("{EXCHANGE_LATENCY_EXTRA}.avg"),
                            "stdev": format!("{EXCHANGE_LATENCY_EXTRA}.std_deviation"),
                            "sample_stdev":
                                format!("{EXCHANGE_LATENCY_EXTRA}.std_deviation_sampling"),
                        },
                        "script": sort_by,
                    }
                },
            }
        });

        (query, aggregation)
    }
}

impl fmt::Display for QueryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueryConfig{{TimeRange:{} Tick2Order:{} Users:{:?} DataSize:{} AggSize:{} AggCount:{} Quantiles:{:?} SortBy:{:?}}}",
            self.time_range,
            self.tick2order,
            self.users,
            self.data_size,
            self.agg_size,
            self.agg_count,
            self.quantile,
            self.sort_by,
        )
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| Error::InvalidQueryConfig(format!("{key} {value:?}: {e}")))
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

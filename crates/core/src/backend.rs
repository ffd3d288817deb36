//! Search-backend client
//!
//! Executes the latency aggregation against an HTTP search backend and
//! decodes the bucketed response into ranked [`ExFrontLatency`] entries.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::{QueryConfig, AGGREGATION_RESULTS};
use crate::error::{Error, Result};
use crate::latency::{ExFrontLatency, PercentMap};

/// Index pattern covering the time-partitioned latency statistics.
pub const INDEX_PATTERN: &str = "alldelaystatistics202*";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend connection address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAddr {
    pub schema: String,
    pub host: String,
    pub port: u16,
}

impl BackendAddr {
    pub fn new(schema: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            schema: schema.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.schema, self.host, self.port)
    }
}

/// HTTP client for the latency-statistics search backend.
pub struct SearchBackend {
    http: reqwest::Client,
    addr: BackendAddr,
    base_url: String,
}

impl SearchBackend {
    /// Connect and probe the backend version.
    pub async fn connect(addr: BackendAddr) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;

        let backend = Self {
            http,
            base_url: addr.to_string(),
            addr,
        };

        let version = backend.version().await?;
        info!(version = %version, addr = %backend.base_url, "latency search backend connected");

        Ok(backend)
    }

    pub fn addr(&self) -> &BackendAddr {
        &self.addr
    }

    /// Fetch the backend version string.
    pub async fn version(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct Root {
            version: RootVersion,
        }

        #[derive(Deserialize)]
        struct RootVersion {
            number: String,
        }

        let root: Root = self
            .http
            .get(&self.base_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(root.version.number)
    }

    /// Run one latency aggregation with the given config.
    ///
    /// The returned list is sorted ascending by priority; ties keep the
    /// backend bucket order.
    pub async fn search(&self, cfg: &QueryConfig) -> Result<Vec<ExFrontLatency>> {
        let (query, aggregation) = cfg.make_query();

        let body = json!({
            "size": cfg.data_size,
            "query": query,
            "aggs": { AGGREGATION_RESULTS: aggregation },
        });

        let rsp = self
            .http
            .post(format!("{}/{}/_search", self.base_url, INDEX_PATTERN))
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::ReadResponse(e.to_string()))?;

        let rsp: SearchResponse = rsp
            .json()
            .await
            .map_err(|e| Error::ReadResponse(e.to_string()))?;

        parse_response(rsp)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Hits,
    aggregations: Option<Aggregations>,
}

#[derive(Debug, Default, Deserialize)]
struct Hits {
    #[serde(default)]
    total: HitsTotal,
    #[serde(default)]
    hits: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct HitsTotal {
    #[serde(default)]
    value: i64,
}

#[derive(Debug, Deserialize)]
struct Aggregations {
    #[serde(rename = "aggs_results")]
    results: Option<TermsResults>,
}

#[derive(Debug, Deserialize)]
struct TermsResults {
    #[serde(default)]
    buckets: Vec<Bucket>,
}

#[derive(Debug, Deserialize)]
struct Bucket {
    key: Value,
    #[serde(default)]
    doc_count: i64,
    #[serde(rename = "exchange_latency_percents")]
    percents: Option<PercentilesResult>,
    #[serde(rename = "exchange_latency_extra")]
    extra: Option<ExtendedStatsResult>,
    #[serde(rename = "exchange_latency_prority")]
    priority: Option<ScriptValue>,
}

#[derive(Debug, Deserialize)]
struct PercentilesResult {
    #[serde(default)]
    values: HashMap<String, Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct ExtendedStatsResult {
    avg: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    variance: Option<f64>,
    std_deviation: Option<f64>,
    #[serde(default)]
    std_deviation_sampling: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ScriptValue {
    value: Option<f64>,
}

fn parse_response(rsp: SearchResponse) -> Result<Vec<ExFrontLatency>> {
    if rsp.hits.total.value > 0 {
        for hit in &rsp.hits.hits {
            debug!(record = %hit, "hits data");
        }
    }

    let buckets = rsp
        .aggregations
        .and_then(|a| a.results)
        .map(|r| r.buckets)
        .unwrap_or_default();

    let mut latency_list = Vec::with_capacity(buckets.len());

    for bucket in buckets {
        latency_list.push(parse_bucket(bucket)?);
    }

    latency_list.sort_by(|l, r| l.priority.total_cmp(&r.priority));

    Ok(latency_list)
}

fn parse_bucket(bucket: Bucket) -> Result<ExFrontLatency> {
    let front_addr = bucket
        .key
        .as_str()
        .ok_or_else(|| Error::ParseAggregation {
            bucket: bucket.key.to_string(),
            what: "front addr",
        })?
        .to_string();

    let missing = |what: &'static str| Error::ParseAggregation {
        bucket: front_addr.clone(),
        what,
    };

    let percentiles = bucket.percents.ok_or_else(|| missing("latency percents"))?;
    let extra = bucket.extra.ok_or_else(|| missing("latency extra"))?;
    let priority = bucket
        .priority
        .and_then(|p| p.value)
        .ok_or_else(|| missing("latency priority"))?;

    let sample_stdev = match extra.std_deviation_sampling {
        Some(raw) => serde_json::from_value(raw)
            .map_err(|_| missing("sample standard deviation"))?,
        None => 0.0,
    };

    let mut percents = PercentMap::new();
    for (key, value) in percentiles.values {
        let percent = key.parse::<f64>().unwrap_or_default();
        percents.insert(percent, value.unwrap_or_default());
    }

    Ok(ExFrontLatency {
        front_addr,
        max_latency: extra.max.unwrap_or_default(),
        min_latency: extra.min.unwrap_or_default(),
        avg_latency: extra.avg.unwrap_or_default(),
        var_latency: extra.variance.unwrap_or_default(),
        stdev_latency: extra.std_deviation.unwrap_or_default(),
        sample_stdev_latency: sample_stdev,
        percents,
        priority,
        doc_count: bucket.doc_count,
    })
}

#[cfg(test)]
#[path = "backend_test.rs"]
mod tests;

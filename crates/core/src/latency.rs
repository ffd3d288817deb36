//! Per-front latency statistics
//!
//! `ExFrontLatency` carries the aggregated round-trip statistics of one
//! exchange front together with the priority score used for ranking.
//! `PercentMap` holds the percentile results; its JSON form uses the
//! percentile as the key, formatted without a trailing `.0` so integer
//! percentiles serialize the way the backend emits them.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Percentile → latency mapping, ordered ascending by percentile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PercentMap(Vec<(f64, f64)>);

impl PercentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value of one percentile.
    pub fn insert(&mut self, percent: f64, value: f64) {
        match self
            .0
            .binary_search_by(|(k, _)| k.total_cmp(&percent))
        {
            Ok(idx) => self.0[idx].1 = value,
            Err(idx) => self.0.insert(idx, (percent, value)),
        }
    }

    pub fn get(&self, percent: f64) -> Option<f64> {
        self.0
            .binary_search_by(|(k, _)| k.total_cmp(&percent))
            .ok()
            .map(|idx| self.0[idx].1)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.0.iter().copied()
    }

    fn format_key(percent: f64) -> String {
        if percent.fract() == 0.0 {
            format!("{}", percent as i64)
        } else {
            format!("{}", percent)
        }
    }
}

impl FromIterator<(f64, f64)> for PercentMap {
    fn from_iter<T: IntoIterator<Item = (f64, f64)>>(iter: T) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Serialize for PercentMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(&Self::format_key(*k), v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PercentMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PercentVisitor;

        impl<'de> Visitor<'de> for PercentVisitor {
            type Value = PercentMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of percentile keys to latency values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = PercentMap::new();
                while let Some((key, value)) = access.next_entry::<String, f64>()? {
                    let percent = key
                        .parse::<f64>()
                        .map_err(|e| serde::de::Error::custom(format!("percent key {key:?}: {e}")))?;
                    map.insert(percent, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(PercentVisitor)
    }
}

impl fmt::Display for PercentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, (k, v)) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}", Self::format_key(*k), v)?;
        }
        f.write_str("]")
    }
}

/// Aggregated latency statistics of a single exchange front.
///
/// `priority` is the ranking score: ascending, lower is better. The field
/// names on the wire match the sink/broadcast JSON format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExFrontLatency {
    pub front_addr: String,
    pub max_latency: f64,
    pub min_latency: f64,
    pub avg_latency: f64,
    pub var_latency: f64,
    pub stdev_latency: f64,
    pub sample_stdev_latency: f64,
    pub percents: PercentMap,
    pub priority: f64,
    pub doc_count: i64,
}

impl fmt::Display for ExFrontLatency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FrontLatency{{FrontAddr:{} Priority:{} Min:{} Max:{} Avg:{} Var:{} Stdev:{} SampleStdev:{} Percents:{} DocCount:{}}}",
            self.front_addr,
            self.priority,
            self.min_latency,
            self.max_latency,
            self.avg_latency,
            self.var_latency,
            self.stdev_latency,
            self.sample_stdev_latency,
            self.percents,
            self.doc_count,
        )
    }
}

#[cfg(test)]
#[path = "latency_test.rs"]
mod tests;

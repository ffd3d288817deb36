//! Tests for PercentMap and ExFrontLatency

use super::*;

fn sample_latency() -> ExFrontLatency {
    ExFrontLatency {
        front_addr: "tcp://10.1.2.3:41205".to_string(),
        max_latency: 1900.0,
        min_latency: 120.0,
        avg_latency: 410.5,
        var_latency: 1021.33,
        stdev_latency: 31.95,
        sample_stdev_latency: 32.11,
        percents: [(25.0, 210.0), (50.0, 380.0), (99.9, 1850.5)]
            .into_iter()
            .collect(),
        priority: 380.0,
        doc_count: 1873,
    }
}

#[test]
fn test_percent_map_insert_ordered() {
    let mut map = PercentMap::new();
    map.insert(99.0, 3.0);
    map.insert(50.0, 1.0);
    map.insert(75.0, 2.0);

    let keys: Vec<f64> = map.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![50.0, 75.0, 99.0]);
}

#[test]
fn test_percent_map_insert_replaces() {
    let mut map = PercentMap::new();
    map.insert(50.0, 1.0);
    map.insert(50.0, 9.0);

    assert_eq!(map.len(), 1);
    assert_eq!(map.get(50.0), Some(9.0));
}

#[test]
fn test_percent_map_integer_keys() {
    let map: PercentMap = [(50.0, 380.0), (95.0, 1200.0)].into_iter().collect();

    let json = serde_json::to_string(&map).unwrap();
    assert!(json.contains("\"50\""), "integer key format: {json}");
    assert!(json.contains("\"95\""), "integer key format: {json}");
    assert!(!json.contains("50.0"), "no trailing fraction: {json}");
}

#[test]
fn test_percent_map_round_trip_non_integer_keys() {
    let map: PercentMap = [(50.0, 380.0), (99.9, 1850.5)].into_iter().collect();

    let json = serde_json::to_string(&map).unwrap();
    assert!(json.contains("\"99.9\""), "fractional key kept: {json}");

    let decoded: PercentMap = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, map);
}

#[test]
fn test_percent_map_rejects_bad_key() {
    let result = serde_json::from_str::<PercentMap>(r#"{"fifty": 1.0}"#);
    assert!(result.is_err());
}

#[test]
fn test_front_latency_round_trip() {
    let latency = sample_latency();

    let json = serde_json::to_string(&latency).unwrap();
    let decoded: ExFrontLatency = serde_json::from_str(&json).unwrap();

    assert_eq!(decoded, latency);
}

#[test]
fn test_front_latency_wire_names() {
    let json = serde_json::to_value(sample_latency()).unwrap();

    for key in [
        "FrontAddr",
        "MaxLatency",
        "MinLatency",
        "AvgLatency",
        "VarLatency",
        "StdevLatency",
        "SampleStdevLatency",
        "Percents",
        "Priority",
        "DocCount",
    ] {
        assert!(json.get(key).is_some(), "missing wire field {key}");
    }
}

#[test]
fn test_front_latency_display_lists_percents() {
    let rendered = sample_latency().to_string();
    assert!(rendered.contains("tcp://10.1.2.3:41205"));
    assert!(rendered.contains("50:380"));
    assert!(rendered.contains("99.9:1850.5"));
}

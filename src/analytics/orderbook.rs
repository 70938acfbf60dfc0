//! Historical scans over a token's orderbook snapshot series

use super::price_level::{level_price, shape_name};
use crate::store::{RawSnapshot, SnapshotSeries, StoreError};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;
/// Snapshots examined by a best-price scan
pub const BEST_PRICE_SCAN: usize = 100;
const SAMPLE_COUNT: usize = 3;
const RAW_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderbookHistory {
    pub token_id: String,
    /// Payload objects, newest first, each with `_timestamp` set to its score
    pub snapshots: Vec<Value>,
    pub total_snapshots: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSearch {
    pub target_price: f64,
    pub target_found: bool,
    pub target_found_timestamp: Option<i64>,
    pub target_found_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestPriceReport {
    pub token_id: String,
    pub best_price: Option<f64>,
    pub best_timestamp: Option<i64>,
    pub current_price: Option<f64>,
    pub difference: Option<f64>,
    pub snapshots_checked: usize,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetSearch>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SnapshotSample {
    Parsed {
        timestamp: i64,
        asks_count: usize,
        asks_sample: Option<Vec<Value>>,
        asks_type: Option<&'static str>,
        raw_keys: Vec<String>,
    },
    Unparsable {
        error: String,
        raw: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleReport {
    pub token_id: String,
    pub samples: Vec<SnapshotSample>,
}

pub struct OrderbookAnalyzer {
    series: Arc<dyn SnapshotSeries>,
}

impl OrderbookAnalyzer {
    pub fn new(series: Arc<dyn SnapshotSeries>) -> Self {
        Self { series }
    }

    /// Newest `limit` snapshots, `Ok(None)` for an unknown token
    ///
    /// A `limit` of 0 returns the whole series.
    ///
    /// Without `include_empty`, snapshots with neither asks nor bids are
    /// dropped. If that leaves nothing, the newest snapshot is returned alone
    /// so the caller still sees what the book last looked like.
    pub async fn history(
        &self,
        token_id: &str,
        limit: usize,
        include_empty: bool,
    ) -> Result<Option<OrderbookHistory>, StoreError> {
        if !self.series.series_exists(token_id).await? {
            return Ok(None);
        }

        let limit = if limit == 0 { usize::MAX } else { limit };
        let entries = self.series.read_newest_snapshots(token_id, limit).await?;

        let mut snapshots: Vec<Value> = entries
            .iter()
            .filter_map(annotated)
            .filter(|payload| include_empty || has_levels(payload, "asks") || has_levels(payload, "bids"))
            .collect();

        if snapshots.is_empty() {
            if let Some(newest) = entries.first().and_then(annotated) {
                snapshots.push(newest);
            }
        }

        let total_snapshots = self.series.snapshot_count(token_id).await?;

        Ok(Some(OrderbookHistory {
            token_id: token_id.to_string(),
            snapshots,
            total_snapshots,
        }))
    }

    /// Lowest first-ask price across the newest snapshots
    ///
    /// With a target, also finds the most recent snapshot whose first ask was
    /// at or below it.
    pub async fn best_price(
        &self,
        token_id: &str,
        target_price: Option<f64>,
    ) -> Result<Option<BestPriceReport>, StoreError> {
        if !self.series.series_exists(token_id).await? {
            return Ok(None);
        }

        let entries = self.series.read_newest_snapshots(token_id, BEST_PRICE_SCAN).await?;
        Ok(Some(scan_best_price(token_id, &entries, target_price)))
    }

    /// Raw-format samples of the newest snapshots
    pub async fn samples(&self, token_id: &str) -> Result<Option<SampleReport>, StoreError> {
        if !self.series.series_exists(token_id).await? {
            return Ok(None);
        }

        let entries = self.series.read_newest_snapshots(token_id, SAMPLE_COUNT).await?;
        let samples = entries.iter().map(sample).collect();

        Ok(Some(SampleReport {
            token_id: token_id.to_string(),
            samples,
        }))
    }
}

/// Best-price scan over snapshots ordered newest first
pub fn scan_best_price(token_id: &str, entries: &[RawSnapshot], target_price: Option<f64>) -> BestPriceReport {
    let mut current_price: Option<f64> = None;
    let mut best: Option<(f64, i64)> = None;
    let mut target_hit: Option<(f64, i64)> = None;

    for snapshot in entries {
        let price = match first_ask_price(snapshot) {
            Some(price) => price,
            None => continue,
        };

        if current_price.is_none() {
            current_price = Some(price);
        }
        if best.map_or(true, |(best_price, _)| price < best_price) {
            best = Some((price, snapshot.score));
        }
        if let Some(target) = target_price {
            if price <= target && target_hit.is_none() {
                target_hit = Some((price, snapshot.score));
            }
        }
    }

    let difference = match (current_price, best) {
        (Some(current), Some((best_price, _))) => Some(round4(current - best_price)),
        _ => None,
    };

    BestPriceReport {
        token_id: token_id.to_string(),
        best_price: best.map(|(price, _)| price),
        best_timestamp: best.map(|(_, ts)| ts),
        current_price,
        difference,
        snapshots_checked: entries.len(),
        target: target_price.map(|target| TargetSearch {
            target_price: target,
            target_found: target_hit.is_some(),
            target_found_timestamp: target_hit.map(|(_, ts)| ts),
            target_found_price: target_hit.map(|(price, _)| price),
        }),
    }
}

fn first_ask_price(snapshot: &RawSnapshot) -> Option<f64> {
    let payload: Value = serde_json::from_str(&snapshot.payload).ok()?;
    let first = payload.get("asks")?.as_array()?.first()?;
    level_price(first).ok()
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Parse a payload object and stamp it with its score
fn annotated(snapshot: &RawSnapshot) -> Option<Value> {
    let mut payload: Map<String, Value> = match serde_json::from_str(&snapshot.payload) {
        Ok(Value::Object(map)) => map,
        _ => return None,
    };
    payload.insert("_timestamp".to_string(), Value::from(snapshot.score));
    Some(Value::Object(payload))
}

fn has_levels(payload: &Value, side: &str) -> bool {
    payload
        .get(side)
        .and_then(Value::as_array)
        .map_or(false, |levels| !levels.is_empty())
}

fn sample(snapshot: &RawSnapshot) -> SnapshotSample {
    let payload: Map<String, Value> = match serde_json::from_str::<Value>(&snapshot.payload) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            return SnapshotSample::Unparsable {
                error: format!("payload is a JSON {}, not an object", shape_name(&other)),
                raw: preview(&snapshot.payload),
            }
        }
        Err(e) => {
            return SnapshotSample::Unparsable {
                error: e.to_string(),
                raw: preview(&snapshot.payload),
            }
        }
    };

    let asks: &[Value] = payload
        .get("asks")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    SnapshotSample::Parsed {
        timestamp: snapshot.score,
        asks_count: asks.len(),
        asks_sample: (!asks.is_empty()).then(|| asks.iter().take(2).cloned().collect()),
        asks_type: asks.first().map(shape_name),
        raw_keys: payload.keys().cloned().collect(),
    }
}

fn preview(raw: &str) -> String {
    raw.chars().take(RAW_PREVIEW_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteLogStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> Arc<SqliteLogStore> {
        Arc::new(SqliteLogStore::open(dir.path().join("books.db")).unwrap())
    }

    /// Asks listed newest to oldest; scores count down from 300
    fn seed_asks(store: &SqliteLogStore, token: &str, asks: &[f64]) {
        for (i, price) in asks.iter().enumerate().rev() {
            let score = 300 - (i as i64) * 100;
            store
                .add_snapshot_json(token, score, &json!({"asks": [[price, 10]], "bids": []}))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_best_price_current_and_difference() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        seed_asks(&store, "X", &[1.2, 0.9, 1.5]);

        let analyzer = OrderbookAnalyzer::new(store);
        let report = analyzer.best_price("X", None).await.unwrap().unwrap();

        assert_eq!(report.current_price, Some(1.2));
        assert_eq!(report.best_price, Some(0.9));
        assert_eq!(report.best_timestamp, Some(200));
        assert_eq!(report.difference, Some(0.3));
        assert_eq!(report.snapshots_checked, 3);
        assert!(report.target.is_none());
    }

    #[tokio::test]
    async fn test_best_price_target() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        seed_asks(&store, "X", &[1.2, 0.9, 1.5]);

        let analyzer = OrderbookAnalyzer::new(store);
        let hit = analyzer.best_price("X", Some(1.0)).await.unwrap().unwrap();
        let target = hit.target.unwrap();
        assert!(target.target_found);
        assert_eq!(target.target_found_price, Some(0.9));
        assert_eq!(target.target_found_timestamp, Some(200));

        let miss = analyzer.best_price("X", Some(0.5)).await.unwrap().unwrap();
        let target = miss.target.unwrap();
        assert!(!target.target_found);
        assert_eq!(target.target_found_price, None);
    }

    #[tokio::test]
    async fn test_best_price_is_stable() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        seed_asks(&store, "X", &[0.7, 0.6, 0.8, 0.65]);

        let analyzer = OrderbookAnalyzer::new(store);
        let first = analyzer.best_price("X", Some(0.66)).await.unwrap();
        let second = analyzer.best_price("X", Some(0.66)).await.unwrap();
        assert_eq!(first, second);
        assert!(first.unwrap().difference.unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_best_price_skips_bad_asks() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.add_snapshot("X", 100, r#"{"asks": [{"p": "0.4"}]}"#).unwrap();
        store.add_snapshot("X", 200, r#"{"asks": [[0, 5]]}"#).unwrap();
        store.add_snapshot("X", 300, "not json").unwrap();
        store.add_snapshot("X", 400, r#"{"bids": [[0.3, 1]]}"#).unwrap();

        let analyzer = OrderbookAnalyzer::new(store);
        let report = analyzer.best_price("X", None).await.unwrap().unwrap();
        assert_eq!(report.current_price, Some(0.4));
        assert_eq!(report.best_price, Some(0.4));
        assert_eq!(report.difference, Some(0.0));
        assert_eq!(report.snapshots_checked, 4);
    }

    #[tokio::test]
    async fn test_unknown_series_is_absent() {
        let dir = tempdir().unwrap();
        let analyzer = OrderbookAnalyzer::new(open_store(&dir));

        assert!(analyzer.best_price("nope", None).await.unwrap().is_none());
        assert!(analyzer.history("nope", 100, false).await.unwrap().is_none());
        assert!(analyzer.samples("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_falls_back_to_newest_empty() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.add_snapshot_json("X", 100, &json!({"asks": [], "bids": []})).unwrap();
        store.add_snapshot_json("X", 200, &json!({"asks": []})).unwrap();

        let analyzer = OrderbookAnalyzer::new(store);
        let history = analyzer.history("X", DEFAULT_HISTORY_LIMIT, false).await.unwrap().unwrap();

        assert_eq!(history.total_snapshots, 2);
        assert_eq!(history.snapshots, vec![json!({"asks": [], "_timestamp": 200})]);

        let everything = analyzer.history("X", DEFAULT_HISTORY_LIMIT, true).await.unwrap().unwrap();
        assert_eq!(everything.snapshots.len(), 2);
    }

    #[tokio::test]
    async fn test_history_filters_and_annotates() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.add_snapshot_json("X", 100, &json!({"asks": [[0.5, 1]]})).unwrap();
        store.add_snapshot_json("X", 200, &json!({"asks": []})).unwrap();
        store.add_snapshot("X", 300, "{broken").unwrap();
        store.add_snapshot_json("X", 400, &json!({"bids": [[0.4, 1]]})).unwrap();

        let analyzer = OrderbookAnalyzer::new(store);
        let history = analyzer.history("X", 10, false).await.unwrap().unwrap();

        let stamps: Vec<i64> = history
            .snapshots
            .iter()
            .map(|s| s["_timestamp"].as_i64().unwrap())
            .collect();
        assert_eq!(stamps, vec![400, 100]);
        assert_eq!(history.total_snapshots, 4);

        let limited = analyzer.history("X", 1, false).await.unwrap().unwrap();
        assert_eq!(limited.snapshots.len(), 1);
        assert_eq!(limited.total_snapshots, 4);
    }

    #[tokio::test]
    async fn test_history_zero_limit_is_whole_series() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        for score in [100, 200, 300] {
            store.add_snapshot_json("X", score, &json!({"asks": [[0.5, 1]]})).unwrap();
        }

        let analyzer = OrderbookAnalyzer::new(store);
        let history = analyzer.history("X", 0, true).await.unwrap().unwrap();

        let stamps: Vec<i64> = history
            .snapshots
            .iter()
            .map(|s| s["_timestamp"].as_i64().unwrap())
            .collect();
        assert_eq!(stamps, vec![300, 200, 100]);
    }

    #[tokio::test]
    async fn test_samples_describe_format() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.add_snapshot_json("X", 100, &json!({"asks": [[0.5, 1], [0.6, 2], [0.7, 3]]})).unwrap();
        store.add_snapshot("X", 200, "garbage payload").unwrap();

        let analyzer = OrderbookAnalyzer::new(store);
        let report = analyzer.samples("X").await.unwrap().unwrap();
        assert_eq!(report.samples.len(), 2);

        assert!(matches!(
            &report.samples[0],
            SnapshotSample::Unparsable { raw, .. } if raw == "garbage payload"
        ));
        match &report.samples[1] {
            SnapshotSample::Parsed {
                timestamp,
                asks_count,
                asks_sample,
                asks_type,
                raw_keys,
            } => {
                assert_eq!(*timestamp, 100);
                assert_eq!(*asks_count, 3);
                assert_eq!(asks_sample.as_ref().map(Vec::len), Some(2));
                assert_eq!(*asks_type, Some("array"));
                assert_eq!(raw_keys, &vec!["asks".to_string()]);
            }
            other => panic!("expected parsed sample, got {:?}", other),
        }
    }
}

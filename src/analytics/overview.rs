//! Dashboard-style summary queries over the aggregate, log and series

use crate::store::{AggregateCounts, EventLog, LogEntry, SnapshotSeries, StoreError};
use serde::Serialize;
use std::sync::Arc;

pub const DEFAULT_TOKEN_LIMIT: usize = 100;
pub const DEFAULT_HISTORY_COUNT: usize = 50;
pub const DEFAULT_ORDERBOOK_LIMIT: usize = 100;
/// Newest entries inspected when checking whether a source is alive
const STATUS_LOOKBACK: usize = 5;
const ACTIVE_WITHIN_MS: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    Count,
    Name,
}

impl std::str::FromStr for SortBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "count" => Ok(SortBy::Count),
            "name" => Ok(SortBy::Name),
            other => Err(format!("Unknown sort key: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenCount {
    pub id: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total_detections: i64,
    pub unique_tokens: usize,
    pub orderbooks_count: usize,
    pub top_token: Option<TokenCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenListing {
    pub tokens: Vec<TokenCount>,
    /// Matches before the limit was applied
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenDetail {
    pub id: String,
    pub count: i64,
    pub has_orderbook: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderbookListing {
    pub orderbooks: Vec<String>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub source_id: String,
    pub running: bool,
    pub last_activity: Option<i64>,
}

pub struct Overview {
    log: Arc<dyn EventLog>,
    series: Arc<dyn SnapshotSeries>,
    counts: Arc<dyn AggregateCounts>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl Overview {
    pub fn new(
        log: Arc<dyn EventLog>,
        series: Arc<dyn SnapshotSeries>,
        counts: Arc<dyn AggregateCounts>,
    ) -> Self {
        Self::with_clock(log, series, counts, Box::new(|| chrono::Utc::now().timestamp_millis()))
    }

    pub fn with_clock(
        log: Arc<dyn EventLog>,
        series: Arc<dyn SnapshotSeries>,
        counts: Arc<dyn AggregateCounts>,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            log,
            series,
            counts,
            now_fn,
        }
    }

    pub async fn stats(&self) -> Result<Stats, StoreError> {
        let counts = self.counts.all_counts().await?;
        let orderbooks_count = self.series.list_series().await?.len();

        let total_detections: i64 = counts.iter().map(|(_, count)| count).sum();

        // Strictly greater keeps the first token in id order on ties
        let mut top_token: Option<TokenCount> = None;
        for (id, count) in &counts {
            let best = top_token.as_ref().map_or(0, |top| top.count);
            if *count > best {
                top_token = Some(TokenCount {
                    id: id.clone(),
                    count: *count,
                });
            }
        }

        Ok(Stats {
            total_detections,
            unique_tokens: counts.len(),
            orderbooks_count,
            top_token,
        })
    }

    pub async fn list_tokens(
        &self,
        search: Option<&str>,
        sort_by: SortBy,
        limit: usize,
    ) -> Result<TokenListing, StoreError> {
        let needle = search.map(str::to_lowercase);

        let mut tokens: Vec<TokenCount> = self
            .counts
            .all_counts()
            .await?
            .into_iter()
            .filter(|(id, _)| matches_search(id, needle.as_deref()))
            .map(|(id, count)| TokenCount { id, count })
            .collect();

        match sort_by {
            SortBy::Count => tokens.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.id.cmp(&b.id))),
            SortBy::Name => tokens.sort_by(|a, b| a.id.cmp(&b.id)),
        }

        let total = tokens.len();
        tokens.truncate(limit);

        Ok(TokenListing { tokens, total })
    }

    pub async fn token(&self, token_id: &str) -> Result<Option<TokenDetail>, StoreError> {
        let count = match self.counts.token_count(token_id).await? {
            Some(count) => count,
            None => return Ok(None),
        };

        Ok(Some(TokenDetail {
            id: token_id.to_string(),
            count,
            has_orderbook: self.series.series_exists(token_id).await?,
        }))
    }

    /// Newest raw log entries, newest first
    pub async fn stream_history(&self, count: usize) -> Result<Vec<LogEntry>, StoreError> {
        self.log.read_newest(count).await
    }

    pub async fn list_orderbooks(&self, search: Option<&str>, limit: usize) -> Result<OrderbookListing, StoreError> {
        let needle = search.map(str::to_lowercase);

        let mut orderbooks: Vec<String> = self
            .series
            .list_series()
            .await?
            .into_iter()
            .filter(|id| matches_search(id, needle.as_deref()))
            .collect();

        let total = orderbooks.len();
        orderbooks.truncate(limit);

        Ok(OrderbookListing { orderbooks, total })
    }

    /// Whether `source_id` reported recently
    ///
    /// Only the last few log entries are inspected, so a source drowned out by
    /// busier ones reads as idle.
    pub async fn source_status(&self, source_id: &str) -> Result<SourceStatus, StoreError> {
        let entries = self.log.read_newest(STATUS_LOOKBACK).await?;

        let last_activity = entries
            .iter()
            .find(|entry| entry.source_id.as_deref() == Some(source_id))
            .map(|entry| entry.id.timestamp_ms());

        let running = last_activity.map_or(false, |ts| (self.now_fn)() - ts <= ACTIVE_WITHIN_MS);

        Ok(SourceStatus {
            source_id: source_id.to_string(),
            running,
            last_activity,
        })
    }
}

fn matches_search(id: &str, needle: Option<&str>) -> bool {
    needle.map_or(true, |needle| id.to_lowercase().contains(needle))
}

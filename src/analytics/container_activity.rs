//! Per-source activity over the newest part of the log

use crate::store::{EventLog, LogEntry, StoreError, UNKNOWN_SOURCE};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerStat {
    pub source_id: String,
    pub detections: u64,
    pub unique_tokens: usize,
    pub first_seen: Option<i64>,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityReport {
    pub containers: Vec<ContainerStat>,
    /// Entries read, malformed ones included
    pub total_entries: usize,
}

#[derive(Default)]
struct Tally {
    detections: u64,
    tokens: HashSet<String>,
    first_seen: Option<i64>,
    last_seen: Option<i64>,
}

/// Summarise `entries`, which must be newest-first
///
/// `last_seen` is the first timestamp met in scan order and `first_seen` the
/// last one, so both describe the newest-first order of the window rather
/// than the min/max of the timestamps themselves. Only detector-reported
/// timestamps count: rows without one (or with an unparsable one) leave both
/// fields untouched, so a source may end up with `None`.
pub fn summarize(entries: &[LogEntry]) -> ActivityReport {
    let mut tallies: HashMap<String, Tally> = HashMap::new();

    for entry in entries {
        let source = entry.source_id.as_deref().unwrap_or(UNKNOWN_SOURCE);
        let tally = tallies.entry(source.to_string()).or_default();

        tally.detections += 1;
        if let Some(token) = &entry.token_id {
            tally.tokens.insert(token.clone());
        }

        let Some(ts) = entry
            .timestamp
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
        else {
            continue;
        };
        if tally.last_seen.is_none() {
            tally.last_seen = Some(ts);
        }
        tally.first_seen = Some(ts);
    }

    let mut containers: Vec<ContainerStat> = tallies
        .into_iter()
        .map(|(source_id, tally)| ContainerStat {
            source_id,
            detections: tally.detections,
            unique_tokens: tally.tokens.len(),
            first_seen: tally.first_seen,
            last_seen: tally.last_seen,
        })
        .collect();

    containers.sort_by(|a, b| {
        b.detections
            .cmp(&a.detections)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });

    ActivityReport {
        containers,
        total_entries: entries.len(),
    }
}

pub struct ContainerActivity {
    log: Arc<dyn EventLog>,
}

impl ContainerActivity {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    pub async fn report(&self, window_size: usize) -> Result<ActivityReport, StoreError> {
        let entries = self.log.read_newest(window_size).await?;
        Ok(summarize(&entries))
    }
}

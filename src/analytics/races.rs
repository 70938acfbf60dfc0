//! Detection races: several sources reporting the same (token, count)
//!
//! Two detectors that both report `count = 5` for a token saw the same fifth
//! occurrence, so the one whose entry landed in the log first won that race.
//! Arrival time is the millis part of the log id, never a detector-supplied
//! timestamp.

use crate::store::{Event, EventLog, LogEntry, StoreError, StreamId};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Most races returned by one scan; `total_races` is never capped
pub const MAX_RACES: usize = 100;
pub const DEFAULT_WINDOW_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RacePlacement {
    pub place: usize,
    pub source_id: String,
    pub timestamp: i64,
    /// Millis behind the winner
    pub diff_ms: i64,
    pub is_fastest: bool,
    pub id: StreamId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Race {
    pub token_id: String,
    pub count: i64,
    pub participants: usize,
    pub winner: String,
    pub results: Vec<RacePlacement>,
    pub time_spread_ms: i64,
}

impl Race {
    fn leader(&self) -> Option<&RacePlacement> {
        self.results.first()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceReport {
    pub races: Vec<Race>,
    pub total_races: usize,
}

/// Group `entries` into races
///
/// Malformed entries are skipped. With `max_spread_ms > 0`, groups whose
/// first and last arrival are further apart than that are not races.
pub fn find_races(entries: &[LogEntry], max_spread_ms: i64) -> RaceReport {
    let mut groups: HashMap<(String, i64), Vec<Event>> = HashMap::new();

    for entry in entries {
        match Event::from_entry(entry) {
            Ok(event) => groups
                .entry((event.token_id.clone(), event.count))
                .or_default()
                .push(event),
            Err(e) => log::debug!("⚠️  Race scan skipping {}: {}", entry.id, e),
        }
    }

    let mut races: Vec<Race> = groups
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .filter_map(|((token_id, count), members)| rank_group(token_id, count, members, max_spread_ms))
        .collect();

    // Most recent winner first
    races.sort_by(|a, b| match (a.leader(), b.leader()) {
        (Some(a), Some(b)) => b
            .timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.id.cmp(&a.id)),
        _ => Ordering::Equal,
    });

    let total_races = races.len();
    races.truncate(MAX_RACES);

    RaceReport { races, total_races }
}

fn rank_group(token_id: String, count: i64, mut members: Vec<Event>, max_spread_ms: i64) -> Option<Race> {
    members.sort_by(|a, b| {
        a.timestamp_ms()
            .cmp(&b.timestamp_ms())
            .then_with(|| a.id.cmp(&b.id))
    });

    let first_ts = members.first()?.timestamp_ms();
    let last_ts = members.last()?.timestamp_ms();
    let time_spread_ms = last_ts - first_ts;

    if max_spread_ms > 0 && time_spread_ms > max_spread_ms {
        return None;
    }

    let results: Vec<RacePlacement> = members
        .into_iter()
        .enumerate()
        .map(|(i, event)| RacePlacement {
            place: i + 1,
            timestamp: event.timestamp_ms(),
            diff_ms: event.timestamp_ms() - first_ts,
            is_fastest: i == 0,
            id: event.id,
            source_id: event.source_id,
        })
        .collect();

    let winner = results.first()?.source_id.clone();

    Some(Race {
        token_id,
        count,
        participants: results.len(),
        winner,
        results,
        time_spread_ms,
    })
}

/// Runs race scans over the newest part of the log
pub struct RaceDetector {
    log: Arc<dyn EventLog>,
}

impl RaceDetector {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    pub async fn detect(&self, window_size: usize, max_spread_ms: i64) -> Result<RaceReport, StoreError> {
        let entries = self.log.read_newest(window_size).await?;
        let report = find_races(&entries, max_spread_ms);

        log::debug!(
            "🏁 Race scan: {} entries, {} races",
            entries.len(),
            report.total_races
        );

        Ok(report)
    }
}

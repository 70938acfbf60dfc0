//! Backend traits the analytics core reads through
//!
//! The core never touches SQL directly: tail readers, the broadcaster and the
//! batch scanners all hold an `Arc<dyn ...>` of one of these traits, handed in
//! at construction time.

use super::types::{LogEntry, RawSnapshot, StreamId};
use async_trait::async_trait;
use tokio::sync::watch;

#[derive(Debug)]
pub enum StoreError {
    Database(rusqlite::Error),
    Io(std::io::Error),
    /// Explicit append id not strictly greater than the current tail
    NonMonotonicId { last: StreamId, attempted: StreamId },
    /// `0-0` is the start cursor of every reader and cannot hold an entry
    ReservedId(StreamId),
    /// Backend could not be reached or answered garbage
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::NonMonotonicId { last, attempted } => write!(
                f,
                "Append id {} is not greater than log tail {}",
                attempted, last
            ),
            StoreError::ReservedId(id) => write!(f, "Append id {} is reserved", id),
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Append-only, strictly ordered detection log
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Id of the newest entry, `None` for an empty log
    async fn last_id(&self) -> Result<Option<StreamId>, StoreError>;

    /// Up to `count` entries with id strictly greater than `after`, ascending
    async fn read_after(&self, after: StreamId, count: usize) -> Result<Vec<LogEntry>, StoreError>;

    /// The newest `count` entries, newest first
    async fn read_newest(&self, count: usize) -> Result<Vec<LogEntry>, StoreError>;

    /// Wake-up channel for appends made through this handle
    ///
    /// `None` means the backend cannot notify and readers fall back to polling.
    fn subscribe_appends(&self) -> Option<watch::Receiver<StreamId>>;
}

/// Per-token ranked market-depth series
#[async_trait]
pub trait SnapshotSeries: Send + Sync {
    async fn series_exists(&self, token_id: &str) -> Result<bool, StoreError>;

    /// The newest `limit` snapshots, descending by score
    async fn read_newest_snapshots(
        &self,
        token_id: &str,
        limit: usize,
    ) -> Result<Vec<RawSnapshot>, StoreError>;

    async fn snapshot_count(&self, token_id: &str) -> Result<u64, StoreError>;

    /// Token ids that own a series, ascending
    async fn list_series(&self) -> Result<Vec<String>, StoreError>;
}

/// Running `token_id -> latest count` map maintained on ingestion
#[async_trait]
pub trait AggregateCounts: Send + Sync {
    async fn token_count(&self, token_id: &str) -> Result<Option<i64>, StoreError>;

    /// Every tracked token, ascending by id
    async fn all_counts(&self) -> Result<Vec<(String, i64)>, StoreError>;
}

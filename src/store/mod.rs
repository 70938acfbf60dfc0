//! Detection log store
//!
//! ```text
//! detectors ──append──▶ detection_events (millis-seq ordered ledger)
//!                 └───▶ token_counts     (token_id → latest count, same tx)
//! scrapers  ──add────▶ orderbook_snapshots (token_id, score, payload)
//! ```
//!
//! The analytics side only sees the `EventLog`, `SnapshotSeries` and
//! `AggregateCounts` traits.

pub mod log_backend;
pub mod record;
pub mod sqlite_store;
pub mod types;

pub use log_backend::{AggregateCounts, EventLog, SnapshotSeries, StoreError};
pub use record::{DetectionRecord, Event, RecordError, UNKNOWN_SOURCE};
pub use sqlite_store::SqliteLogStore;
pub use types::{InvalidStreamId, LogEntry, RawSnapshot, StreamId};

//! Detection analytics
//!
//! Independent detector processes append "token X seen N times" records to a
//! shared log; scrapers append orderbook snapshots per token. This crate tails
//! that log for live observers and answers historical questions about it.
//!
//! ```text
//! SqliteLogStore ──▶ stream_core::LiveBroadcaster ──▶ subscribers
//!       │
//!       └────────▶ analytics::{RaceDetector, ContainerActivity,
//!                             OrderbookAnalyzer, Overview}
//! ```

pub mod analytics;
pub mod config;
pub mod sqlite_pragma;
pub mod store;
pub mod stream_core;

pub use config::{AppConfig, ConfigError};
pub use store::{DetectionRecord, Event, LogEntry, SqliteLogStore, StoreError, StreamId};

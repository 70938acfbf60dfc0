//! Read-only scans over the detection log and snapshot series
//!
//! ```text
//! detection_events (newest N) ──▶ RaceDetector       (same token+count, ranked by arrival)
//!                             └─▶ ContainerActivity  (per-source tallies)
//! orderbook_snapshots         ──▶ OrderbookAnalyzer  (history, best price, samples)
//! token_counts + series       ──▶ Overview           (stats, listings, liveness)
//! ```

pub mod container_activity;
pub mod orderbook;
pub mod overview;
pub mod price_level;
pub mod races;

pub use container_activity::{ActivityReport, ContainerActivity, ContainerStat};
pub use orderbook::{BestPriceReport, OrderbookAnalyzer, OrderbookHistory, SampleReport, SnapshotSample};
pub use overview::{Overview, SortBy, Stats, TokenCount, TokenDetail};
pub use price_level::{Level, LevelError, PriceLevel};
pub use races::{find_races, Race, RaceDetector, RacePlacement, RaceReport};

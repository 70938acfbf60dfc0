//! Live tailing of the detection log
//!
//! ```text
//! detection_events ──read_after──▶ TailReader (own cursor)
//!                                      │
//!             LiveBroadcaster ── one task per subscriber ──▶ mpsc ──▶ observer
//! ```

pub mod broadcaster;
pub mod cursor;

pub use broadcaster::{BroadcastConfig, LiveBroadcaster, LiveMessage, LiveUpdate, Subscription};
pub use cursor::{StartPosition, TailOptions, TailRead, TailReader};

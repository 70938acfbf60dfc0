//! Row types shared by the event log and the snapshot series

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Composite log position `<unix_millis>-<seq>`
///
/// Ordering is numeric on `(millis, seq)`, which is exactly append order.
/// `seq` disambiguates entries appended within the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamId {
    pub millis: u64,
    pub seq: u64,
}

impl StreamId {
    /// Position before every entry
    pub const ORIGIN: StreamId = StreamId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Smallest id strictly greater than `self`
    pub fn successor(&self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self::new(self.millis, seq),
            None => Self::new(self.millis + 1, 0),
        }
    }

    /// Arrival instant used for race ranking
    pub fn timestamp_ms(&self) -> i64 {
        self.millis as i64
    }
}

impl Ord for StreamId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for StreamId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidStreamId(pub String);

impl fmt::Display for InvalidStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid stream id: {:?}", self.0)
    }
}

impl std::error::Error for InvalidStreamId {}

impl FromStr for StreamId {
    type Err = InvalidStreamId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidStreamId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        let millis = millis.parse::<u64>().map_err(|_| invalid())?;
        let seq = seq.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self::new(millis, seq))
    }
}

impl Serialize for StreamId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One raw row of the event log
///
/// Detectors write every field as text, so nothing here is validated yet.
/// `Event::from_entry` turns it into a typed detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: StreamId,
    pub token_id: Option<String>,
    pub count: Option<String>,
    pub source_id: Option<String>,
    pub timestamp: Option<String>,
}

/// One ranked entry of a token's market-depth series, payload still unparsed
#[derive(Debug, Clone, PartialEq)]
pub struct RawSnapshot {
    pub score: i64,
    pub payload: String,
}

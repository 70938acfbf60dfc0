//! Detection records: the JSON detectors emit and the typed event we analyse

use super::types::{LogEntry, StreamId};
use serde::{Deserialize, Deserializer, Serialize};

pub const UNKNOWN_SOURCE: &str = "unknown";

#[derive(Debug)]
pub enum RecordError {
    Json(serde_json::Error),
    MissingField(&'static str),
    InvalidCount(String),
}

impl From<serde_json::Error> for RecordError {
    fn from(err: serde_json::Error) -> Self {
        RecordError::Json(err)
    }
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Json(e) => write!(f, "Malformed record JSON: {}", e),
            RecordError::MissingField(name) => write!(f, "Missing field: {}", name),
            RecordError::InvalidCount(raw) => write!(f, "Invalid count: {:?}", raw),
        }
    }
}

impl std::error::Error for RecordError {}

/// A detection as a detector reports it, before it gets a log position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub token_id: String,
    /// Cumulative occurrence count after this detection (not a delta)
    #[serde(deserialize_with = "de_count")]
    pub count: i64,
    #[serde(alias = "container_id", default = "unknown_source")]
    pub source_id: String,
    /// Millis the detector stamped itself, if it did
    #[serde(default, deserialize_with = "de_opt_millis")]
    pub timestamp: Option<i64>,
}

impl DetectionRecord {
    pub fn new(token_id: impl Into<String>, count: i64, source_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            count,
            source_id: source_id.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    /// Parse one detector record (one JSON object per line)
    pub fn from_json(line: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(line)?)
    }
}

fn unknown_source() -> String {
    UNKNOWN_SOURCE.to_string()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Int(i64),
    Float(f64),
    Str(String),
}

fn de_count<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Int(v) => Ok(v),
        NumOrStr::Float(v) if v.fract() == 0.0 => Ok(v as i64),
        NumOrStr::Float(v) => Err(serde::de::Error::custom(format!("non-integer count {}", v))),
        NumOrStr::Str(s) => parse_count(&s).map_err(serde::de::Error::custom),
    }
}

fn de_opt_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<NumOrStr>::deserialize(deserializer)? {
        Some(NumOrStr::Int(v)) => Some(v),
        Some(NumOrStr::Float(v)) => Some(v as i64),
        Some(NumOrStr::Str(s)) => s.trim().parse::<i64>().ok(),
        None => None,
    })
}

pub(crate) fn parse_count(raw: &str) -> Result<i64, RecordError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| RecordError::InvalidCount(raw.to_string()))
}

/// A well-formed detection read back from the log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: StreamId,
    pub token_id: String,
    pub count: i64,
    pub source_id: String,
    pub reported_at: Option<i64>,
}

impl Event {
    /// Validate a raw log row
    ///
    /// `token_id` and an integer `count` are required; a missing source is
    /// attributed to `"unknown"`; an unparsable detector timestamp is dropped.
    pub fn from_entry(entry: &LogEntry) -> Result<Self, RecordError> {
        let token_id = entry
            .token_id
            .clone()
            .ok_or(RecordError::MissingField("token_id"))?;
        let count = parse_count(
            entry
                .count
                .as_deref()
                .ok_or(RecordError::MissingField("count"))?,
        )?;
        let source_id = entry
            .source_id
            .clone()
            .unwrap_or_else(unknown_source);
        let reported_at = entry
            .timestamp
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok());

        Ok(Self {
            id: entry.id,
            token_id,
            count,
            source_id,
            reported_at,
        })
    }

    /// Arrival instant, taken from the log id rather than any payload field
    pub fn timestamp_ms(&self) -> i64 {
        self.id.timestamp_ms()
    }
}

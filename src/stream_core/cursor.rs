//! Resumable tail cursor over the detection log
//!
//! Each reader owns its position. `next` blocks until something newer than the
//! position shows up, the per-call timeout passes (an idle tick), or the
//! owner cancels. Appends made through the same store handle wake the reader
//! immediately; appends from other processes are picked up by polling.

use crate::store::{Event, EventLog, StoreError, StreamId};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where a new reader starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// After whatever is the tail at open time: only entries appended later
    Latest,
    /// After an explicit id
    After(StreamId),
}

impl FromStr for StartPosition {
    type Err = crate::store::InvalidStreamId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "$" | "latest" => Ok(StartPosition::Latest),
            other => Ok(StartPosition::After(other.parse()?)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TailOptions {
    /// Max entries handed out per wake
    pub batch_size: usize,
    /// How often to re-check the log when no append signal arrives
    pub poll_interval: Duration,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Outcome of one `next` call
#[derive(Debug, Clone, PartialEq)]
pub enum TailRead {
    /// Non-empty, ascending by id
    Batch(Vec<Event>),
    /// Nothing new within the timeout
    Idle,
    /// The owner closed the reader
    Cancelled,
}

pub struct TailReader {
    log: Arc<dyn EventLog>,
    position: StreamId,
    options: TailOptions,
    appends: Option<watch::Receiver<StreamId>>,
    cancel: CancellationToken,
}

impl TailReader {
    pub async fn open(
        log: Arc<dyn EventLog>,
        start: StartPosition,
        options: TailOptions,
    ) -> Result<Self, StoreError> {
        Self::open_with_cancel(log, start, options, CancellationToken::new()).await
    }

    /// Open a reader that stops when `cancel` fires
    pub async fn open_with_cancel(
        log: Arc<dyn EventLog>,
        start: StartPosition,
        options: TailOptions,
        cancel: CancellationToken,
    ) -> Result<Self, StoreError> {
        // Subscribe before resolving the tail so no append slips between the two
        let appends = log.subscribe_appends();
        let position = match start {
            StartPosition::Latest => log.last_id().await?.unwrap_or(StreamId::ORIGIN),
            StartPosition::After(id) => id,
        };

        log::debug!("📖 Tail reader opened at {}", position);

        Ok(Self {
            log,
            position,
            options: TailOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
            appends,
            cancel,
        })
    }

    /// Id of the last entry handed out (or the start position)
    pub fn position(&self) -> StreamId {
        self.position
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the reader; an in-flight `next` returns `Cancelled` right away
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait up to `timeout` for entries newer than the current position
    ///
    /// Malformed entries are consumed (the position moves past them) but never
    /// returned. A read failure is returned as-is and leaves the position
    /// untouched, so the next call retries the same range.
    pub async fn next(&mut self, timeout: Duration) -> Result<TailRead, StoreError> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(TailRead::Cancelled);
            }

            let entries = self
                .log
                .read_after(self.position, self.options.batch_size)
                .await?;

            if let Some(last) = entries.last() {
                self.position = last.id;
                let events: Vec<Event> = entries
                    .iter()
                    .filter_map(|entry| match Event::from_entry(entry) {
                        Ok(event) => Some(event),
                        Err(e) => {
                            log::debug!("⚠️  Skipping malformed entry {}: {}", entry.id, e);
                            None
                        }
                    })
                    .collect();

                if !events.is_empty() {
                    return Ok(TailRead::Batch(events));
                }
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(TailRead::Idle);
            }
            let wait = (deadline - now).min(self.options.poll_interval);

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(TailRead::Cancelled),
                _ = wait_for_append(&mut self.appends) => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

async fn wait_for_append(appends: &mut Option<watch::Receiver<StreamId>>) {
    match appends {
        Some(rx) => {
            if rx.changed().await.is_err() {
                // Store handle dropped; polling still covers us
                std::future::pending::<()>().await
            }
        }
        None => std::future::pending::<()>().await,
    }
}

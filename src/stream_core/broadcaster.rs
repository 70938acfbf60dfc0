//! Live fan-out of the detection log
//!
//! Every subscriber gets its own task and its own `TailReader`; there is no
//! shared cursor. A slow subscriber fills its own bounded channel and its task
//! simply stops reading the log until the consumer catches up.

use super::cursor::{StartPosition, TailOptions, TailRead, TailReader};
use crate::store::{Event, EventLog, StreamId};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub batch_size: usize,
    /// Max wait per tail read before a heartbeat goes out
    pub block: Duration,
    pub poll_interval: Duration,
    /// Pause after a read error before retrying
    pub error_backoff: Duration,
    /// Per-subscriber message buffer
    pub channel_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(250),
            error_backoff: Duration::from_secs(1),
            channel_buffer: 256,
        }
    }
}

/// One detection as pushed to live observers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveUpdate {
    pub id: StreamId,
    pub token_id: String,
    pub count: i64,
    pub source_id: String,
    /// When the broadcaster picked the entry up (RFC3339)
    pub timestamp: String,
}

impl LiveUpdate {
    fn from_event(event: Event) -> Self {
        Self {
            id: event.id,
            token_id: event.token_id,
            count: event.count,
            source_id: event.source_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveMessage {
    Update(LiveUpdate),
    /// Nothing new within one block interval
    Heartbeat,
    /// The tail read failed; the subscription stays open and retries
    Error(String),
}

impl LiveMessage {
    /// Render as a server-sent-events frame
    pub fn to_sse_frame(&self) -> String {
        match self {
            LiveMessage::Update(update) => match serde_json::to_string(update) {
                Ok(json) => format!("data: {}\n\n", json),
                Err(e) => format!("data: {}\n\n", serde_json::json!({ "error": e.to_string() })),
            },
            LiveMessage::Heartbeat => ": heartbeat\n\n".to_string(),
            LiveMessage::Error(message) => {
                format!("data: {}\n\n", serde_json::json!({ "error": message }))
            }
        }
    }
}

/// Receiving end of one live subscription
///
/// Dropping it (or calling `close`) stops the subscriber task promptly, even
/// if it is blocked in a tail read.
pub struct Subscription {
    rx: mpsc::Receiver<LiveMessage>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<LiveMessage> {
        self.rx.recv().await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Close and wait for the subscriber task to finish
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                log::warn!("⚠️  Subscriber task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct LiveBroadcaster {
    log: Arc<dyn EventLog>,
    config: BroadcastConfig,
    active: Arc<AtomicUsize>,
}

impl LiveBroadcaster {
    pub fn new(log: Arc<dyn EventLog>, config: BroadcastConfig) -> Self {
        Self {
            log,
            config,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of subscriber tasks still running
    pub fn active_subscribers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Attach a new observer starting at `start`
    pub fn subscribe(&self, start: StartPosition) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.channel_buffer.max(1));
        let cancel = CancellationToken::new();

        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());
        let log = self.log.clone();
        let config = self.config.clone();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            run_subscriber(log, start, config, tx, task_cancel).await;
        });

        Subscription {
            rx,
            cancel,
            handle: Some(handle),
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_subscriber(
    log: Arc<dyn EventLog>,
    start: StartPosition,
    config: BroadcastConfig,
    tx: mpsc::Sender<LiveMessage>,
    cancel: CancellationToken,
) {
    let options = TailOptions {
        batch_size: config.batch_size,
        poll_interval: config.poll_interval,
    };

    // Opening resolves `Latest`, which itself can fail; retry like any read
    let mut reader = loop {
        match TailReader::open_with_cancel(log.clone(), start, options.clone(), cancel.clone()).await {
            Ok(reader) => break reader,
            Err(e) => {
                log::warn!("⚠️  Live subscriber could not open tail: {}", e);
                if !deliver(&tx, &cancel, LiveMessage::Error(e.to_string())).await
                    || !backoff(&cancel, config.error_backoff).await
                {
                    return;
                }
            }
        }
    };

    log::info!("📡 Live subscriber attached at {}", reader.position());

    loop {
        let read = tokio::select! {
            read = reader.next(config.block) => read,
            _ = tx.closed() => break,
        };

        match read {
            Ok(TailRead::Batch(events)) => {
                for event in events {
                    if !deliver(&tx, &cancel, LiveMessage::Update(LiveUpdate::from_event(event))).await {
                        return finish(&reader);
                    }
                }
            }
            Ok(TailRead::Idle) => {
                if !deliver(&tx, &cancel, LiveMessage::Heartbeat).await {
                    break;
                }
            }
            Ok(TailRead::Cancelled) => break,
            Err(e) => {
                log::error!("❌ Live tail read failed at {}: {}", reader.position(), e);
                if !deliver(&tx, &cancel, LiveMessage::Error(e.to_string())).await
                    || !backoff(&cancel, config.error_backoff).await
                {
                    break;
                }
            }
        }
    }

    finish(&reader)
}

fn finish(reader: &TailReader) {
    log::info!("👋 Live subscriber detached at {}", reader.position());
}

/// Send one message; false once the subscriber is gone
async fn deliver(tx: &mpsc::Sender<LiveMessage>, cancel: &CancellationToken, message: LiveMessage) -> bool {
    tokio::select! {
        sent = tx.send(message) => sent.is_ok(),
        _ = cancel.cancelled() => false,
    }
}

/// Sleep after an error; false if cancelled meanwhile
async fn backoff(cancel: &CancellationToken, pause: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => true,
        _ = cancel.cancelled() => false,
    }
}

//! Analytics Runtime
//!
//! Opens the detection store, attaches a live subscriber that logs every new
//! detection, and periodically logs race and per-source activity reports.
//!
//! Usage:
//!   cargo run --release --bin analytics_runtime
//!
//! Environment variables: see `AppConfig::from_env` (DETECTION_DB_PATH,
//! TAIL_BLOCK_MS, RACE_WINDOW_SIZE, REPORT_INTERVAL_SECS, ...)

use detection_analytics::analytics::{ContainerActivity, Overview, RaceDetector};
use detection_analytics::stream_core::{LiveBroadcaster, LiveMessage, StartPosition};
use detection_analytics::{AppConfig, SqliteLogStore};
use dotenv::dotenv;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 Detection Analytics Runtime");

    let config = AppConfig::from_env()?;
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Log max length: {}", config.event_log_max_len);
    info!("   ├─ Tail: batch {} / block {}ms", config.tail_batch_size, config.tail_block_ms);
    info!(
        "   ├─ Races: window {} / max spread {}ms",
        config.race_window_size, config.race_max_spread_ms
    );
    info!("   └─ Report interval: {}s", config.report_interval_secs);

    let store = Arc::new(SqliteLogStore::open(&config.db_path)?.with_max_len(config.event_log_max_len));

    let broadcaster = LiveBroadcaster::new(store.clone(), config.broadcast_config());
    let races = RaceDetector::new(store.clone());
    let activity = ContainerActivity::new(store.clone());
    let overview = Overview::new(store.clone(), store.clone(), store.clone());

    let shutdown = CancellationToken::new();

    // Live feed
    let mut subscription = broadcaster.subscribe(StartPosition::Latest);
    let live_shutdown = shutdown.clone();
    let live_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = live_shutdown.cancelled() => break,
                message = subscription.recv() => message,
            };

            match message {
                Some(LiveMessage::Update(update)) => info!(
                    "📨 {} {} → {} (from {})",
                    update.id, update.token_id, update.count, update.source_id
                ),
                Some(LiveMessage::Heartbeat) => log::trace!("💓 heartbeat"),
                Some(LiveMessage::Error(e)) => warn!("⚠️  Live feed error: {}", e),
                None => break,
            }
        }
        subscription.shutdown().await;
    });

    // Periodic reports
    let report_shutdown = shutdown.clone();
    let window_size = config.race_window_size;
    let max_spread_ms = config.race_max_spread_ms;
    let report_every = Duration::from_secs(config.report_interval_secs.max(1));
    let report_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(report_every);
        loop {
            tokio::select! {
                _ = report_shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match overview.stats().await {
                Ok(stats) => {
                    let top = stats
                        .top_token
                        .map(|t| format!("{} ({})", t.id, t.count))
                        .unwrap_or_else(|| "-".to_string());
                    info!(
                        "📊 Stats: {} detections | {} tokens | {} orderbooks | top {}",
                        stats.total_detections, stats.unique_tokens, stats.orderbooks_count, top
                    );
                }
                Err(e) => error!("❌ Stats query failed: {}", e),
            }

            match races.detect(window_size, max_spread_ms).await {
                Ok(report) => {
                    info!("🏁 Races: {} in last {} entries", report.total_races, window_size);
                    for race in report.races.iter().take(5) {
                        let behind = race
                            .results
                            .iter()
                            .skip(1)
                            .map(|r| format!("{} +{}ms", r.source_id, r.diff_ms))
                            .collect::<Vec<_>>()
                            .join(", ");
                        info!(
                            "   ├─ {} #{}: {} won ({})",
                            race.token_id, race.count, race.winner, behind
                        );
                    }
                }
                Err(e) => error!("❌ Race scan failed: {}", e),
            }

            match activity.report(window_size).await {
                Ok(report) => {
                    for container in &report.containers {
                        info!(
                            "   ├─ {}: {} detections, {} tokens",
                            container.source_id, container.detections, container.unique_tokens
                        );
                    }
                    info!("   └─ {} entries scanned", report.total_entries);
                }
                Err(e) => error!("❌ Activity scan failed: {}", e),
            }
        }
    });

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }

    shutdown.cancel();
    for task in [live_task, report_task] {
        if let Err(e) = task.await {
            error!("❌ Task ended abnormally: {}", e);
        }
    }

    info!("✅ Analytics runtime stopped ({} live subscribers left)", broadcaster.active_subscribers());
    Ok(())
}

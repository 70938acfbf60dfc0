//! Mock Detector
//!
//! Stand-in for a real detector process during development. Picks a random
//! tracked token every 2-5 seconds, bumps its count by one and appends the
//! detection to the shared log.
//!
//! Usage:
//!   cargo run --bin mock_detector -- [--first-therm] [--print-transcript] [--verbose]
//!
//! Environment variables:
//!   DETECTION_DB_PATH - SQLite database path (default: data/detections.db)
//!   DETECTOR_NAME     - source id written on every record (default: mock-detector)

use detection_analytics::store::AggregateCounts;
use detection_analytics::{AppConfig, DetectionRecord, SqliteLogStore, StoreError, StreamId};
use dotenv::dotenv;
use log::{error, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use std::env;
use std::time::Duration;

const DEFAULT_TOKENS: [&str; 5] = [
    "KXTRUMPMENTION-26JAN10-CHIN_YES",
    "KXTRUMPMENTION-26JAN22-NATO_YES",
    "KXVANCEMENTION-26JAN24-ABOR_YES",
    "KXMAMDANIMENTION-26FEB17-SNOW_YES",
    "KXCONGRESSMENTION-26JAN08-WHIS_YES",
];
/// Used when every tracked token is a bare numeric id
const NUMERIC_FALLBACK_LIMIT: usize = 20;
const MIN_INTERVAL_MS: u64 = 2_000;
const MAX_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Default, PartialEq)]
struct Flags {
    first_therm: bool,
    print_transcript: bool,
    verbose: bool,
}

impl Flags {
    /// Unknown arguments are ignored so real detector command lines still work
    fn parse(args: impl Iterator<Item = String>) -> Self {
        let mut flags = Flags::default();
        for arg in args {
            match arg.as_str() {
                "--first-therm" => flags.first_therm = true,
                "--print-transcript" => flags.print_transcript = true,
                "--verbose" | "-v" => flags.verbose = true,
                _ => {}
            }
        }
        flags
    }
}

/// Tokens to simulate, preferring the text ids already tracked
fn candidate_tokens(tracked: Vec<String>) -> Vec<String> {
    if tracked.is_empty() {
        return DEFAULT_TOKENS.iter().map(|t| t.to_string()).collect();
    }

    let text: Vec<String> = tracked
        .iter()
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .cloned()
        .collect();

    if text.is_empty() {
        tracked.into_iter().take(NUMERIC_FALLBACK_LIMIT).collect()
    } else {
        text
    }
}

/// Bump `token_id` by one and append the detection
async fn simulate_detection(
    store: &SqliteLogStore,
    token_id: &str,
    detector_name: &str,
) -> Result<(StreamId, i64), StoreError> {
    let count = store.token_count(token_id).await?.unwrap_or(0) + 1;
    let record = DetectionRecord::new(token_id, count, detector_name)
        .with_timestamp(chrono::Utc::now().timestamp_millis());
    let id = store.append(&record)?;
    Ok((id, count))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let flags = Flags::parse(env::args().skip(1));

    let default_filter = if flags.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .init();

    let config = AppConfig::from_env()?;
    let detector_name = env::var("DETECTOR_NAME").unwrap_or_else(|_| "mock-detector".to_string());

    info!("🤖 Mock Detector");
    info!("   ├─ Name: {}", detector_name);
    info!("   ├─ Database: {}", config.db_path);
    info!("   └─ Flags: {:?}", flags);

    let store = SqliteLogStore::open(&config.db_path)?.with_max_len(config.event_log_max_len);

    let tracked: Vec<String> = store.all_counts().await?.into_iter().map(|(id, _)| id).collect();
    if tracked.is_empty() {
        warn!("⚠️  No tracked tokens yet, using defaults");
    }
    let tokens = candidate_tokens(tracked);
    info!("📋 Simulating {} tokens", tokens.len());

    let mut detections: u64 = 0;

    loop {
        let token_id = match tokens.choose(&mut rand::thread_rng()) {
            Some(token) => token.clone(),
            None => break,
        };

        match simulate_detection(&store, &token_id, &detector_name).await {
            Ok((id, count)) => {
                detections += 1;
                if flags.print_transcript {
                    let word = token_id.rsplit('-').next().unwrap_or(&token_id);
                    info!("📝 Transcript: detected '{}' in speech", word);
                }
                info!("🎯 #{} | {} → count: {} ({})", detections, token_id, count, id);
            }
            Err(e) => {
                error!("❌ Append failed: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        }

        if flags.first_therm {
            info!("🏁 --first-therm: stopping after the first detection");
            break;
        }

        let pause = Duration::from_millis(rand::thread_rng().gen_range(MIN_INTERVAL_MS..=MAX_INTERVAL_MS));
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("⚠️  Received CTRL+C, shutting down...");
                break;
            }
        }
    }

    info!("👋 Done. Total detections: {}", detections);
    Ok(())
}

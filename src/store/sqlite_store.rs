//! SQLite-backed detection log, aggregate counts and snapshot series
//!
//! One `SqliteLogStore` is opened at process start and shared as an `Arc` by
//! every component. Each append takes the database write lock before reading
//! the tail, so id assignment and the aggregate update share one transaction
//! even when several processes write to the same file.

use super::log_backend::{AggregateCounts, EventLog, SnapshotSeries, StoreError};
use super::record::{parse_count, DetectionRecord};
use super::types::{LogEntry, RawSnapshot, StreamId};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS detection_events (
        millis INTEGER NOT NULL,
        seq INTEGER NOT NULL,
        token_id TEXT,
        count_text TEXT,
        source_id TEXT,
        reported_at TEXT,
        PRIMARY KEY (millis, seq)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS token_counts (
        token_id TEXT PRIMARY KEY,
        count INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS orderbook_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        token_id TEXT NOT NULL,
        score INTEGER NOT NULL,
        payload TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_snapshots_token_score
        ON orderbook_snapshots(token_id, score DESC, id DESC);
";

const ENTRY_COLUMNS: &str = "millis, seq, token_id, count_text, source_id, reported_at";

/// Log row for a record; the id is filled in at write time
fn record_entry(record: &DetectionRecord) -> LogEntry {
    LogEntry {
        id: StreamId::ORIGIN,
        token_id: Some(record.token_id.clone()),
        count: Some(record.count.to_string()),
        source_id: Some(record.source_id.clone()),
        timestamp: record.timestamp.map(|ts| ts.to_string()),
    }
}

pub struct SqliteLogStore {
    conn: Mutex<Connection>,
    appends: watch::Sender<StreamId>,
    max_len: Option<usize>,
    /// Wall clock in unix millis (swappable for tests)
    now_fn: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl SqliteLogStore {
    /// Open (or create) the store at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_clock(
            db_path,
            Box::new(|| chrono::Utc::now().timestamp_millis().max(0) as u64),
        )
    }

    /// Open with a custom millisecond clock, used for deterministic ids
    pub fn open_with_clock(
        db_path: impl AsRef<Path>,
        now_fn: Box<dyn Fn() -> u64 + Send + Sync>,
    ) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;
        conn.execute_batch(SCHEMA)?;

        let tail = Self::last_id_locked(&conn)?.unwrap_or(StreamId::ORIGIN);
        let (appends, _) = watch::channel(tail);

        log::info!("📥 Detection store opened: {} (tail={})", db_path.display(), tail);

        Ok(Self {
            conn: Mutex::new(conn),
            appends,
            max_len: None,
            now_fn,
        })
    }

    /// Keep at most `max_len` newest events; older ones are trimmed on append
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = (max_len > 0).then_some(max_len);
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))
    }

    /// Append a detection with an auto-generated id and update its aggregate
    pub fn append(&self, record: &DetectionRecord) -> Result<StreamId, StoreError> {
        self.write_entry(record_entry(record), |last| {
            let now = (self.now_fn)();
            let id = match last {
                Some(last) if now <= last.millis => last.successor(),
                _ => StreamId::new(now, 0),
            };
            // 0-0 is the readers' start cursor and never delivered
            Ok(if id == StreamId::ORIGIN { id.successor() } else { id })
        })
    }

    /// Append a detection at an explicit id (replays, imports)
    pub fn append_at(&self, id: StreamId, record: &DetectionRecord) -> Result<StreamId, StoreError> {
        self.import_entry(&LogEntry {
            id,
            ..record_entry(record)
        })?;
        Ok(id)
    }

    /// Append a raw log row as-is
    ///
    /// The aggregate is only touched when the row carries a token and an
    /// integer count; the row itself is always stored.
    pub fn import_entry(&self, entry: &LogEntry) -> Result<(), StoreError> {
        let attempted = entry.id;
        self.write_entry(entry.clone(), |last| {
            if attempted == StreamId::ORIGIN {
                return Err(StoreError::ReservedId(attempted));
            }
            match last {
                Some(last) if attempted <= last => Err(StoreError::NonMonotonicId { last, attempted }),
                _ => Ok(attempted),
            }
        })?;
        Ok(())
    }

    /// Pick the id and write the row under one IMMEDIATE transaction
    ///
    /// The write lock is taken before the tail is read, so handles on other
    /// connections (or processes) commit in id order and never reuse an id.
    fn write_entry(
        &self,
        mut entry: LogEntry,
        assign_id: impl FnOnce(Option<StreamId>) -> Result<StreamId, StoreError>,
    ) -> Result<StreamId, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        entry.id = assign_id(Self::last_id_locked(&tx)?)?;

        tx.execute(
            "INSERT INTO detection_events (millis, seq, token_id, count_text, source_id, reported_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.id.millis as i64,
                entry.id.seq as i64,
                entry.token_id,
                entry.count,
                entry.source_id,
                entry.timestamp,
            ],
        )?;

        // Last writer wins: the newest appended count replaces whatever was there
        if let (Some(token_id), Some(Ok(count))) = (
            entry.token_id.as_deref(),
            entry.count.as_deref().map(parse_count),
        ) {
            tx.execute(
                "INSERT INTO token_counts (token_id, count) VALUES (?1, ?2)
                 ON CONFLICT(token_id) DO UPDATE SET count = excluded.count",
                params![token_id, count],
            )?;
        }

        if let Some(max_len) = self.max_len {
            let trimmed = tx.execute(
                "DELETE FROM detection_events WHERE (millis, seq) IN (
                     SELECT millis, seq FROM detection_events
                     ORDER BY millis DESC, seq DESC
                     LIMIT -1 OFFSET ?1
                 )",
                params![max_len as i64],
            )?;
            if trimmed > 0 {
                log::debug!("✂️  Trimmed {} old detection events", trimmed);
            }
        }

        tx.commit()?;
        drop(conn);

        log::debug!("✅ Appended detection {}", entry.id);
        self.appends.send_replace(entry.id);
        Ok(entry.id)
    }

    fn last_id_locked(conn: &Connection) -> Result<Option<StreamId>, StoreError> {
        let last = conn
            .query_row(
                "SELECT millis, seq FROM detection_events ORDER BY millis DESC, seq DESC LIMIT 1",
                [],
                |row| Ok(StreamId::new(row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
            )
            .optional()?;
        Ok(last)
    }

    fn map_entry(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
        Ok(LogEntry {
            id: StreamId::new(row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64),
            token_id: row.get(2)?,
            count: row.get(3)?,
            source_id: row.get(4)?,
            timestamp: row.get(5)?,
        })
    }

    /// Drop a token's aggregate count (token lifecycle is owned elsewhere)
    pub fn remove_token(&self, token_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM token_counts WHERE token_id = ?1", params![token_id])?;
        Ok(removed > 0)
    }

    /// Add one snapshot to a token's ranked series
    pub fn add_snapshot(&self, token_id: &str, score: i64, payload: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO orderbook_snapshots (token_id, score, payload) VALUES (?1, ?2, ?3)",
            params![token_id, score, payload],
        )?;
        Ok(())
    }

    pub fn add_snapshot_json(
        &self,
        token_id: &str,
        score: i64,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.add_snapshot(token_id, score, &payload.to_string())
    }
}

#[async_trait]
impl EventLog for SqliteLogStore {
    async fn last_id(&self) -> Result<Option<StreamId>, StoreError> {
        let conn = self.conn()?;
        Self::last_id_locked(&conn)
    }

    async fn read_after(&self, after: StreamId, count: usize) -> Result<Vec<LogEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM detection_events
             WHERE millis > ?1 OR (millis = ?1 AND seq > ?2)
             ORDER BY millis ASC, seq ASC
             LIMIT ?3",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![after.millis as i64, after.seq as i64, count as i64],
            Self::map_entry,
        )?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    async fn read_newest(&self, count: usize) -> Result<Vec<LogEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM detection_events ORDER BY millis DESC, seq DESC LIMIT ?1",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![count as i64], Self::map_entry)?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn subscribe_appends(&self) -> Option<watch::Receiver<StreamId>> {
        Some(self.appends.subscribe())
    }
}

#[async_trait]
impl SnapshotSeries for SqliteLogStore {
    async fn series_exists(&self, token_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT 1 FROM orderbook_snapshots WHERE token_id = ?1 LIMIT 1")?;
        Ok(stmt.exists(params![token_id])?)
    }

    async fn read_newest_snapshots(
        &self,
        token_id: &str,
        limit: usize,
    ) -> Result<Vec<RawSnapshot>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT score, payload FROM orderbook_snapshots
             WHERE token_id = ?1
             ORDER BY score DESC, id DESC
             LIMIT ?2",
        )?;
        // Negative LIMIT is unbounded in SQLite
        let limit = i64::try_from(limit).unwrap_or(-1);
        let rows = stmt.query_map(params![token_id, limit], |row| {
            Ok(RawSnapshot {
                score: row.get(0)?,
                payload: row.get(1)?,
            })
        })?;
        let snapshots = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(snapshots)
    }

    async fn snapshot_count(&self, token_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orderbook_snapshots WHERE token_id = ?1",
            params![token_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn list_series(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT token_id FROM orderbook_snapshots ORDER BY token_id ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let tokens = rows.collect::<Result<Vec<String>, _>>()?;
        Ok(tokens)
    }
}

#[async_trait]
impl AggregateCounts for SqliteLogStore {
    async fn token_count(&self, token_id: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.conn()?;
        let count = conn
            .query_row(
                "SELECT count FROM token_counts WHERE token_id = ?1",
                params![token_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count)
    }

    async fn all_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT token_id, count FROM token_counts ORDER BY token_id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let counts = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn store_with_clock(dir: &tempfile::TempDir, clock: Arc<AtomicU64>) -> SqliteLogStore {
        SqliteLogStore::open_with_clock(
            dir.path().join("detections.db"),
            Box::new(move || clock.load(Ordering::SeqCst)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_auto_ids_disambiguate_same_millisecond() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(AtomicU64::new(5_000));
        let store = store_with_clock(&dir, clock.clone());

        let a = store.append(&DetectionRecord::new("X", 1, "a")).unwrap();
        let b = store.append(&DetectionRecord::new("X", 2, "b")).unwrap();
        clock.store(5_010, Ordering::SeqCst);
        let c = store.append(&DetectionRecord::new("X", 3, "c")).unwrap();

        assert_eq!(a, StreamId::new(5_000, 0));
        assert_eq!(b, StreamId::new(5_000, 1));
        assert_eq!(c, StreamId::new(5_010, 0));
    }

    #[tokio::test]
    async fn test_clock_going_backwards_keeps_ids_increasing() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(AtomicU64::new(9_000));
        let store = store_with_clock(&dir, clock.clone());

        let first = store.append(&DetectionRecord::new("X", 1, "a")).unwrap();
        clock.store(8_000, Ordering::SeqCst);
        let second = store.append(&DetectionRecord::new("X", 2, "a")).unwrap();

        assert!(second > first);
        assert_eq!(second, StreamId::new(9_000, 1));
    }

    #[tokio::test]
    async fn test_aggregate_is_last_writer_wins() {
        let dir = tempdir().unwrap();
        let store = SqliteLogStore::open(dir.path().join("d.db")).unwrap();

        store.append_at(StreamId::new(1, 0), &DetectionRecord::new("X", 5, "a")).unwrap();
        // A lagging detector reports a smaller count later; it still wins
        store.append_at(StreamId::new(2, 0), &DetectionRecord::new("X", 3, "b")).unwrap();

        assert_eq!(store.token_count("X").await.unwrap(), Some(3));
        assert_eq!(store.token_count("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_explicit_ids_must_increase() {
        let dir = tempdir().unwrap();
        let store = SqliteLogStore::open(dir.path().join("d.db")).unwrap();

        store.append_at(StreamId::new(10, 0), &DetectionRecord::new("X", 1, "a")).unwrap();
        let err = store
            .append_at(StreamId::new(10, 0), &DetectionRecord::new("X", 2, "a"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NonMonotonicId { .. }));
    }

    #[tokio::test]
    async fn test_origin_id_is_rejected() {
        let dir = tempdir().unwrap();
        let store = SqliteLogStore::open(dir.path().join("d.db")).unwrap();
        let mut rx = store.subscribe_appends().unwrap();

        let err = store
            .append_at(StreamId::ORIGIN, &DetectionRecord::new("X", 1, "a"))
            .unwrap_err();
        assert!(matches!(err, StoreError::ReservedId(id) if id == StreamId::ORIGIN));

        assert!(store.read_newest(10).await.unwrap().is_empty());
        assert_eq!(store.token_count("X").await.unwrap(), None);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_zero_clock_skips_origin() {
        let dir = tempdir().unwrap();
        let store = store_with_clock(&dir, Arc::new(AtomicU64::new(0)));

        let id = store.append(&DetectionRecord::new("X", 1, "a")).unwrap();
        assert_eq!(id, StreamId::new(0, 1));
        assert_eq!(store.read_after(StreamId::ORIGIN, 10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_handles_on_one_file_append_in_order() {
        const PER_WRITER: usize = 200;

        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let reader = SqliteLogStore::open(&path).unwrap();

        let writers: Vec<_> = ["det-1", "det-2"]
            .into_iter()
            .map(|source| {
                // Own connection each, like separate detector processes
                let store = SqliteLogStore::open(&path).unwrap();
                std::thread::spawn(move || {
                    (1..=PER_WRITER)
                        .map(|count| store.append(&DetectionRecord::new("X", count as i64, source)))
                        .filter(Result::is_err)
                        .count()
                })
            })
            .collect();

        // Tail while the writers run; a row committed behind the cursor would be lost
        let mut cursor = StreamId::ORIGIN;
        let mut seen = Vec::new();
        let mut running = true;
        while running {
            running = writers.iter().any(|w| !w.is_finished());
            loop {
                let batch = reader.read_after(cursor, 16).await.unwrap();
                let Some(last) = batch.last() else { break };
                cursor = last.id;
                seen.extend(batch.into_iter().map(|e| e.id));
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        let failed: usize = writers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(failed, 0);

        assert_eq!(reader.read_newest(1_000).await.unwrap().len(), 2 * PER_WRITER);
        assert_eq!(seen.len(), 2 * PER_WRITER);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_read_after_and_newest() {
        let dir = tempdir().unwrap();
        let store = SqliteLogStore::open(dir.path().join("d.db")).unwrap();
        for i in 1..=5u64 {
            store
                .append_at(StreamId::new(100, i), &DetectionRecord::new("X", i as i64, "a"))
                .unwrap();
        }

        let after = store.read_after(StreamId::new(100, 2), 2).await.unwrap();
        let ids: Vec<_> = after.iter().map(|e| e.id.seq).collect();
        assert_eq!(ids, vec![3, 4]);

        let newest = store.read_newest(3).await.unwrap();
        let ids: Vec<_> = newest.iter().map(|e| e.id.seq).collect();
        assert_eq!(ids, vec![5, 4, 3]);

        assert_eq!(store.last_id().await.unwrap(), Some(StreamId::new(100, 5)));
    }

    #[tokio::test]
    async fn test_malformed_rows_are_stored_but_not_counted() {
        let dir = tempdir().unwrap();
        let store = SqliteLogStore::open(dir.path().join("d.db")).unwrap();

        store
            .import_entry(&LogEntry {
                id: StreamId::new(1, 0),
                token_id: Some("X".to_string()),
                count: Some("lots".to_string()),
                source_id: None,
                timestamp: None,
            })
            .unwrap();

        assert_eq!(store.read_newest(10).await.unwrap().len(), 1);
        assert!(store.all_counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_max_len_trims_oldest() {
        let dir = tempdir().unwrap();
        let store = SqliteLogStore::open(dir.path().join("d.db")).unwrap().with_max_len(3);
        for i in 1..=5u64 {
            store
                .append_at(StreamId::new(i, 0), &DetectionRecord::new("X", i as i64, "a"))
                .unwrap();
        }

        let newest = store.read_newest(10).await.unwrap();
        let ids: Vec<_> = newest.iter().map(|e| e.id.millis).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_append_notifies_subscribers() {
        let dir = tempdir().unwrap();
        let store = SqliteLogStore::open(dir.path().join("d.db")).unwrap();
        let mut rx = store.subscribe_appends().unwrap();

        let id = store.append(&DetectionRecord::new("X", 1, "a")).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), id);
    }

    #[tokio::test]
    async fn test_reopen_resumes_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.db");
        {
            let store = SqliteLogStore::open(&path).unwrap();
            store.append_at(StreamId::new(77, 3), &DetectionRecord::new("X", 1, "a")).unwrap();
        }
        let store = SqliteLogStore::open(&path).unwrap();
        assert_eq!(store.last_id().await.unwrap(), Some(StreamId::new(77, 3)));
        assert_eq!(*store.subscribe_appends().unwrap().borrow(), StreamId::new(77, 3));
    }

    #[tokio::test]
    async fn test_snapshot_series() {
        let dir = tempdir().unwrap();
        let store = SqliteLogStore::open(dir.path().join("d.db")).unwrap();

        store.add_snapshot("B", 10, r#"{"asks":[]}"#).unwrap();
        store.add_snapshot("A", 30, r#"{"asks":[[1,1]]}"#).unwrap();
        store.add_snapshot("A", 20, r#"{"asks":[[2,1]]}"#).unwrap();

        assert!(store.series_exists("A").await.unwrap());
        assert!(!store.series_exists("C").await.unwrap());
        assert_eq!(store.snapshot_count("A").await.unwrap(), 2);
        assert_eq!(store.list_series().await.unwrap(), vec!["A", "B"]);

        let newest = store.read_newest_snapshots("A", 1).await.unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].score, 30);

        let all = store.read_newest_snapshots("A", usize::MAX).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_token() {
        let dir = tempdir().unwrap();
        let store = SqliteLogStore::open(dir.path().join("d.db")).unwrap();
        store.append(&DetectionRecord::new("X", 1, "a")).unwrap();

        assert!(store.remove_token("X").unwrap());
        assert!(!store.remove_token("X").unwrap());
        assert_eq!(store.token_count("X").await.unwrap(), None);
    }
}

//! Shared SQLite tuning applied to every connection we open

use rusqlite::Connection;

/// Apply the PRAGMA set used by both the writer and reader sides
///
/// - `journal_mode = WAL` so tail readers never block appends
/// - `synchronous = NORMAL` (safe with WAL)
/// - `temp_store = MEMORY`
/// - 256MB mmap, 64MB page cache
/// - checkpoint every 1000 pages
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", 268_435_456i64)?;
    conn.pragma_update(None, "cache_size", -65_536i64)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

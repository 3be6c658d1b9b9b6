//! SQLite table storage.
//!
//! Every table the pipeline persists lives in a SQLite database file: the
//! per-file progress tables, the consolidated `logs` table, and the derived
//! statistics tables. Log tables are keyed by `ts_us`, the adjusted timestamp
//! in microseconds since the Unix epoch, so the primary key doubles as the
//! time index.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};

use crate::error::{Error, Result};
use crate::models::{Level, LogRecord};

/// Name of the consolidated table in `logs.sqlite`.
pub const FINAL_TABLE: &str = "logs";

pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Fold the write-ahead log into the main file so it can be moved on its own.
pub async fn checkpoint(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(pool)
        .await?;
    Ok(())
}

/// Turn a source path into a valid table name.
///
/// Every character that is not ASCII alphanumeric becomes `_`. Names that
/// would start with a digit are prefixed with `t_`.
pub fn normalize_table_name(path: &str) -> String {
    let name: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("t_{}", name)
    } else {
        name
    }
}

pub fn to_micros(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_micros()
}

pub fn from_micros(us: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(us).map(|dt| dt.naive_utc())
}

pub async fn create_log_table(pool: &SqlitePool, table: &str) -> Result<()> {
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            ts_us INTEGER PRIMARY KEY,
            ts TEXT NOT NULL,
            level TEXT NOT NULL,
            source_file TEXT NOT NULL,
            source_line INTEGER NOT NULL,
            content TEXT,
            thread_id TEXT
        )
        "#
    ))
    .execute(pool)
    .await?;
    Ok(())
}

/// Replace the contents of `table` with `records` in a single transaction.
pub async fn write_log_table(pool: &SqlitePool, table: &str, records: &[LogRecord]) -> Result<()> {
    create_log_table(pool, table).await?;

    let mut tx = pool.begin().await?;
    sqlx::query(&format!(r#"DELETE FROM "{table}""#))
        .execute(&mut *tx)
        .await?;
    insert_records(&mut tx, table, records).await?;
    tx.commit().await?;
    Ok(())
}

/// Append `records` to an existing `table` in a single transaction.
pub async fn append_log_records(
    pool: &SqlitePool,
    table: &str,
    records: &[LogRecord],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    insert_records(&mut tx, table, records).await?;
    tx.commit().await?;
    Ok(())
}

async fn insert_records(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    records: &[LogRecord],
) -> Result<()> {
    let insert = format!(
        r#"INSERT INTO "{table}" (ts_us, ts, level, source_file, source_line, content, thread_id)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#
    );
    for record in records {
        sqlx::query(&insert)
            .bind(to_micros(record.timestamp))
            .bind(record.timestamp.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
            .bind(record.level.as_str())
            .bind(&record.source_file)
            .bind(record.source_line as i64)
            .bind(&record.content)
            .bind(&record.thread_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Read a log table back in timestamp order. `limit` caps the row count.
pub async fn read_log_table(
    pool: &SqlitePool,
    table: &str,
    limit: Option<i64>,
) -> Result<Vec<LogRecord>> {
    let rows = sqlx::query(&format!(
        r#"SELECT ts_us, level, source_file, source_line, content, thread_id
           FROM "{table}" ORDER BY ts_us ASC LIMIT ?"#
    ))
    .bind(limit.unwrap_or(-1))
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        let ts_us: i64 = row.get("ts_us");
        let timestamp = from_micros(ts_us).ok_or_else(|| {
            Error::Database(sqlx::Error::Decode(
                format!("timestamp out of range: {}", ts_us).into(),
            ))
        })?;
        let level: String = row.get("level");
        let source_line: i64 = row.get("source_line");
        records.push(LogRecord {
            timestamp,
            level: Level::from_str(&level).unwrap_or(Level::Other(level)),
            source_file: row.get("source_file"),
            source_line: source_line as u32,
            content: row.get("content"),
            thread_id: row.get("thread_id"),
        });
    }
    Ok(records)
}

pub async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let exists: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(table)
            .fetch_one(pool)
            .await?;
    Ok(exists)
}

pub async fn list_tables(pool: &SqlitePool) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await?;
    Ok(names)
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(&format!(r#"SELECT COUNT(*) FROM "{table}""#))
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(us: i64, line: u32) -> LogRecord {
        LogRecord {
            timestamp: from_micros(us).unwrap(),
            level: Level::Info,
            source_file: "PrintJob".to_string(),
            source_line: line,
            content: Some(format!("message {}", line)),
            thread_id: None,
        }
    }

    #[test]
    fn test_normalize_table_name() {
        assert_eq!(
            normalize_table_name("logs/server.log.3"),
            "logs_server_log_3"
        );
        assert_eq!(
            normalize_table_name(r"C:\bugs\ABC-123-45678\server.log"),
            "C__bugs_ABC_123_45678_server_log"
        );
        assert_eq!(normalize_table_name("2011/server.log"), "t_2011_server_log");
    }

    #[test]
    fn test_micros_roundtrip_keeps_precision() {
        let ts = NaiveDateTime::parse_from_str("2011-03-10 15:10:34.687001", "%Y-%m-%d %H:%M:%S%.f")
            .unwrap();
        assert_eq!(from_micros(to_micros(ts)), Some(ts));
    }

    #[tokio::test]
    async fn test_write_and_read_table() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = connect(&tmp.path().join("t.sqlite")).await.unwrap();

        let records = vec![record(2_000, 2), record(1_000, 1), record(3_000, 3)];
        write_log_table(&pool, "server_log", &records).await.unwrap();

        assert!(table_exists(&pool, "server_log").await.unwrap());
        assert!(!table_exists(&pool, "other").await.unwrap());
        assert_eq!(count_rows(&pool, "server_log").await.unwrap(), 3);
        assert_eq!(list_tables(&pool).await.unwrap(), vec!["server_log"]);

        let back = read_log_table(&pool, "server_log", None).await.unwrap();
        let lines: Vec<u32> = back.iter().map(|r| r.source_line).collect();
        assert_eq!(lines, vec![1, 2, 3]);
        assert_eq!(back[0].content.as_deref(), Some("message 1"));

        let limited = read_log_table(&pool, "server_log", Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);

        // Rewriting replaces rather than appends.
        write_log_table(&pool, "server_log", &records[..1]).await.unwrap();
        assert_eq!(count_rows(&pool, "server_log").await.unwrap(), 1);

        pool.close().await;
    }
}

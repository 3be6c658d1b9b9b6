//! Run overview.
//!
//! Prints what a finished run contains: overall time span and rate, record
//! counts per level, and the per-file history that produced the
//! consolidated table. Used by `logtab summary` to sanity-check a load
//! before running statistics on it.

use anyhow::{bail, Result};
use sqlx::Row;

use crate::batch::{FINAL_DB, HISTORY_FILE};
use crate::config::Config;
use crate::db;
use crate::history::History;

/// Aggregate figures over a consolidated table.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub records: i64,
    pub first: Option<String>,
    pub last: Option<String>,
    pub hours: f64,
    pub per_level: Vec<(String, i64)>,
    pub source_files: i64,
}

impl RunSummary {
    pub fn per_hour(&self) -> f64 {
        if self.hours > 0.0 {
            self.records as f64 / self.hours
        } else {
            self.records as f64
        }
    }
}

pub async fn summarize(pool: &sqlx::SqlitePool) -> Result<RunSummary> {
    let table = db::FINAL_TABLE;
    let row = sqlx::query(&format!(
        r#"SELECT COUNT(*) AS n, MIN(ts_us) AS first_us, MAX(ts_us) AS last_us,
                  COUNT(DISTINCT source_file) AS files
           FROM "{table}""#
    ))
    .fetch_one(pool)
    .await?;

    let records: i64 = row.get("n");
    let first_us: Option<i64> = row.get("first_us");
    let last_us: Option<i64> = row.get("last_us");
    let hours = match (first_us, last_us) {
        (Some(a), Some(b)) => (b - a) as f64 / 3_600_000_000.0,
        _ => 0.0,
    };
    let format = |us: Option<i64>| {
        us.and_then(db::from_micros)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
    };

    let level_rows = sqlx::query(&format!(
        r#"SELECT level, COUNT(*) AS n FROM "{table}" GROUP BY level ORDER BY n DESC, level"#
    ))
    .fetch_all(pool)
    .await?;
    let per_level = level_rows
        .iter()
        .map(|r| (r.get::<String, _>("level"), r.get::<i64, _>("n")))
        .collect();

    Ok(RunSummary {
        records,
        first: format(first_us),
        last: format(last_us),
        hours,
        per_level,
        source_files: row.get("files"),
    })
}

/// Run the summary command for run `name`.
pub async fn run_summary(config: &Config, name: &str) -> Result<()> {
    let run_dir = config.run_dir(name);
    let logs_path = run_dir.join(FINAL_DB);
    if !logs_path.exists() {
        bail!(
            "No consolidated table for run '{}' at {}. Run `logtab load` first.",
            name,
            logs_path.display()
        );
    }

    let pool = db::connect(&logs_path).await?;
    let summary = summarize(&pool).await;
    pool.close().await;
    let summary = summary?;
    let history = History::load(&run_dir.join(HISTORY_FILE))?;

    println!("Run {}", name);
    println!("================================");
    println!();
    println!("  Table:         {}", logs_path.display());
    println!("  Records:       {}", summary.records);
    if let (Some(first), Some(last)) = (&summary.first, &summary.last) {
        println!("  From:          {}", first);
        println!("  To:            {}", last);
    }
    println!("  Span:          {:.2} hours", summary.hours);
    println!("  Per hour:      {:.1}", summary.per_hour());
    println!("  Source files:  {}", summary.source_files);

    if !summary.per_level.is_empty() {
        println!();
        println!("  By level:");
        for (level, n) in &summary.per_level {
            println!("  {:<24} {:>10}", level, n);
        }
    }

    if !history.is_empty() {
        println!();
        println!("  Log files:");
        println!(
            "  {:<40} {:>8} {:>8}   {:<19} {:<19}",
            "PATH", "RECORDS", "SECS", "START", "END"
        );
        println!("  {}", "-".repeat(100));
        let mut entries: Vec<_> = history.entries().collect();
        entries.sort_by_key(|e| e.start);
        for e in entries {
            println!(
                "  {:<40} {:>8} {:>8.2}   {:<19} {:<19}",
                e.path,
                e.record_count,
                e.load_secs,
                e.start.format("%Y-%m-%d %H:%M:%S"),
                e.end.format("%Y-%m-%d %H:%M:%S")
            );
            for header in &e.header_lines {
                println!("      {}", header);
            }
        }
    }
    println!();

    Ok(())
}

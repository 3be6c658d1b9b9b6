//! Message-type frequency and correlation statistics.
//!
//! Reads the consolidated table of a run, groups records by
//! [`MessageTypeKey`], turns each group into a per-bucket frequency series
//! and correlates every pair of sufficiently frequent series. Results go to
//! `stats.sqlite` next to the consolidated table, which is only read.
//!
//! # Buckets
//!
//! The bucket width starts at `base_bucket_secs` and widens (in multiples of
//! the base) until the whole span fits in `max_buckets`. Buckets are aligned
//! to multiples of the width since the Unix epoch.
//!
//! Each bucket is divided into `fine_steps_per_bucket` steps. Counts per
//! step are smoothed with a centred rolling mean spanning
//! `smoothing_buckets` buckets and summed back into buckets. A bucket
//! without records is `0.0`, never missing.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use chrono::NaiveDateTime;
use sqlx::SqlitePool;

use crate::batch::FINAL_DB;
use crate::config::{Config, StatsConfig};
use crate::db;
use crate::models::{LogRecord, MessageTypeKey};

/// File name of the derived statistics database inside a run directory.
pub const STATS_DB: &str = "stats.sqlite";

const MICROS_PER_SEC: i64 = 1_000_000;

/// Bucket layout over one time span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketPlan {
    /// Start of the first bucket, in microseconds since the epoch.
    pub start_us: i64,
    pub width_us: i64,
    pub count: usize,
    /// Width of one smoothing step.
    pub step_us: i64,
    pub steps_per_bucket: usize,
}

impl BucketPlan {
    pub fn for_span(start: NaiveDateTime, end: NaiveDateTime, cfg: &StatsConfig) -> Self {
        let start_us = db::to_micros(start);
        let end_us = db::to_micros(end).max(start_us);
        let base = cfg.base_bucket_secs * MICROS_PER_SEC;
        let span = end_us - start_us;

        let needed = (span + cfg.max_buckets - 1) / cfg.max_buckets;
        let mut width = round_up(needed.max(base), base);
        let (mut aligned, mut count) = layout(start_us, end_us, width);
        // Alignment can push the last record into one extra bucket.
        while count > cfg.max_buckets as usize {
            width += base;
            (aligned, count) = layout(start_us, end_us, width);
        }

        let steps_per_bucket = cfg.fine_steps_per_bucket as usize;
        Self {
            start_us: aligned,
            width_us: width,
            count,
            step_us: (width / cfg.fine_steps_per_bucket).max(1),
            steps_per_bucket,
        }
    }

    pub fn bucket_start(&self, index: usize) -> i64 {
        self.start_us + index as i64 * self.width_us
    }

    /// Fine-step index of `ts_us`, clamped into the plan.
    fn step_index(&self, ts_us: i64) -> usize {
        let offset = (ts_us - self.start_us).max(0);
        let bucket = ((offset / self.width_us) as usize).min(self.count - 1);
        let within = offset - bucket as i64 * self.width_us;
        let step = ((within / self.step_us) as usize).min(self.steps_per_bucket - 1);
        bucket * self.steps_per_bucket + step
    }
}

fn round_up(value: i64, multiple: i64) -> i64 {
    ((value + multiple - 1) / multiple) * multiple
}

fn layout(start_us: i64, end_us: i64, width: i64) -> (i64, usize) {
    let aligned = start_us.div_euclid(width) * width;
    let count = ((end_us - aligned) / width) as usize + 1;
    (aligned, count)
}

/// Smoothed per-bucket frequency of `timestamps` (microseconds) over `plan`.
pub fn frequency_series(timestamps: &[i64], plan: &BucketPlan, cfg: &StatsConfig) -> Vec<f64> {
    let n = plan.count * plan.steps_per_bucket;
    let mut counts = vec![0u64; n];
    for &ts in timestamps {
        counts[plan.step_index(ts)] += 1;
    }

    let mut prefix = vec![0u64; n + 1];
    for (i, c) in counts.iter().enumerate() {
        prefix[i + 1] = prefix[i] + c;
    }

    let window = (cfg.smoothing_buckets as usize * plan.steps_per_bucket).max(1);
    let mut buckets = vec![0.0f64; plan.count];
    for i in 0..n {
        let lo = i.saturating_sub(window / 2);
        let hi = (i + (window - 1) / 2).min(n - 1);
        let sum = prefix[hi + 1] - prefix[lo];
        if sum > 0 {
            buckets[i / plan.steps_per_bucket] += sum as f64 / (hi - lo + 1) as f64;
        }
    }
    buckets
}

/// Pearson correlation coefficient, `None` when either series is constant.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;

    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}

/// Symmetric matrix of pairwise [`pearson`] coefficients.
pub fn correlation_matrix(series: &[Vec<f64>]) -> Vec<Vec<Option<f64>>> {
    let n = series.len();
    let mut matrix = vec![vec![None; n]; n];
    for i in 0..n {
        for j in i..n {
            let r = pearson(&series[i], &series[j]);
            matrix[i][j] = r;
            matrix[j][i] = r;
        }
    }
    matrix
}

/// One distinct message type seen in the consolidated table.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageTypeStats {
    pub key: MessageTypeKey,
    pub count: u64,
    pub first: NaiveDateTime,
    pub last: NaiveDateTime,
    /// Frequent enough to take part in the correlation matrix.
    pub correlated: bool,
}

#[derive(Debug, Clone)]
pub struct StatsReport {
    pub plan: BucketPlan,
    pub records: u64,
    pub types: Vec<MessageTypeStats>,
    /// Indices into `types` of the correlated message types, in matrix order.
    pub kept: Vec<usize>,
    pub series: Vec<Vec<f64>>,
    pub correlations: Vec<Vec<Option<f64>>>,
}

/// Compute statistics over `records`; `None` when there are no records.
pub fn compute_stats(records: &[LogRecord], cfg: &StatsConfig) -> Option<StatsReport> {
    let first = records.iter().map(|r| r.timestamp).min()?;
    let last = records.iter().map(|r| r.timestamp).max()?;
    let plan = BucketPlan::for_span(first, last, cfg);

    let mut groups: BTreeMap<MessageTypeKey, Vec<NaiveDateTime>> = BTreeMap::new();
    for record in records {
        groups.entry(record.key()).or_default().push(record.timestamp);
    }

    let mut types = Vec::with_capacity(groups.len());
    let mut kept = Vec::new();
    let mut series = Vec::new();
    for (i, (key, times)) in groups.into_iter().enumerate() {
        let correlated = times.len() as u64 >= cfg.min_observations;
        if correlated {
            let micros: Vec<i64> = times.iter().map(|t| db::to_micros(*t)).collect();
            series.push(frequency_series(&micros, &plan, cfg));
            kept.push(i);
        }
        types.push(MessageTypeStats {
            key,
            count: times.len() as u64,
            first: times.iter().copied().min().unwrap_or(first),
            last: times.iter().copied().max().unwrap_or(last),
            correlated,
        });
    }

    let correlations = correlation_matrix(&series);
    Some(StatsReport {
        plan,
        records: records.len() as u64,
        types,
        kept,
        series,
        correlations,
    })
}

async fn write_report(pool: &SqlitePool, report: &StatsReport) -> Result<()> {
    let mut tx = pool.begin().await?;
    for table in ["message_types", "frequencies", "correlations"] {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE message_types (
            key_id INTEGER PRIMARY KEY,
            label TEXT NOT NULL,
            level TEXT NOT NULL,
            source_file TEXT NOT NULL,
            source_line INTEGER NOT NULL,
            count INTEGER NOT NULL,
            first_ts TEXT NOT NULL,
            last_ts TEXT NOT NULL,
            correlated INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE frequencies (
            key_id INTEGER NOT NULL,
            bucket INTEGER NOT NULL,
            bucket_start TEXT NOT NULL,
            value REAL NOT NULL,
            PRIMARY KEY (key_id, bucket)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE correlations (
            key_a INTEGER NOT NULL,
            key_b INTEGER NOT NULL,
            r REAL,
            PRIMARY KEY (key_a, key_b)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    for (id, t) in report.types.iter().enumerate() {
        sqlx::query(
            r#"INSERT INTO message_types
               (key_id, label, level, source_file, source_line, count, first_ts, last_ts, correlated)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(id as i64)
        .bind(t.key.label())
        .bind(t.key.level.as_str())
        .bind(&t.key.source_file)
        .bind(t.key.source_line as i64)
        .bind(t.count as i64)
        .bind(format_ts(t.first))
        .bind(format_ts(t.last))
        .bind(t.correlated)
        .execute(&mut *tx)
        .await?;
    }

    for (row, values) in report.series.iter().enumerate() {
        let key_id = report.kept[row] as i64;
        for (bucket, value) in values.iter().enumerate() {
            let start = db::from_micros(report.plan.bucket_start(bucket))
                .map(format_ts)
                .unwrap_or_default();
            sqlx::query(
                "INSERT INTO frequencies (key_id, bucket, bucket_start, value) VALUES (?, ?, ?, ?)",
            )
            .bind(key_id)
            .bind(bucket as i64)
            .bind(start)
            .bind(*value)
            .execute(&mut *tx)
            .await?;
        }
    }

    for (i, row) in report.correlations.iter().enumerate() {
        for (j, r) in row.iter().enumerate() {
            sqlx::query("INSERT INTO correlations (key_a, key_b, r) VALUES (?, ?, ?)")
                .bind(report.kept[i] as i64)
                .bind(report.kept[j] as i64)
                .bind(*r)
                .execute(&mut *tx)
                .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

fn format_ts(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Strongest off-diagonal correlations, by absolute value.
pub fn top_pairs(report: &StatsReport, n: usize) -> Vec<(usize, usize, f64)> {
    let mut pairs = Vec::new();
    for (i, row) in report.correlations.iter().enumerate() {
        for (j, r) in row.iter().enumerate().skip(i + 1) {
            if let Some(r) = r {
                pairs.push((report.kept[i], report.kept[j], *r));
            }
        }
    }
    pairs.sort_by(|a, b| b.2.abs().total_cmp(&a.2.abs()));
    pairs.truncate(n);
    pairs
}

/// Run the stats command: compute statistics for `name` and print a summary.
pub async fn run_stats(config: &Config, name: &str, max_entries: Option<i64>) -> Result<()> {
    let run_dir = config.run_dir(name);
    let logs_path = run_dir.join(FINAL_DB);
    if !logs_path.exists() {
        bail!(
            "No consolidated table for run '{}' at {}. Run `logtab load` first.",
            name,
            logs_path.display()
        );
    }

    let logs = db::connect(&logs_path).await?;
    let records = db::read_log_table(&logs, db::FINAL_TABLE, max_entries).await;
    logs.close().await;
    let records = records?;

    let Some(report) = compute_stats(&records, &config.stats) else {
        bail!("Run '{}' has no records", name);
    };

    let stats_path = run_dir.join(STATS_DB);
    let pool = db::connect(&stats_path).await?;
    let written = write_report(&pool, &report).await;
    pool.close().await;
    written?;

    println!("Statistics for {}", name);
    println!("================================");
    println!();
    println!("  Records:        {}", report.records);
    println!(
        "  Buckets:        {} x {}s",
        report.plan.count,
        report.plan.width_us / MICROS_PER_SEC
    );
    println!("  Message types:  {}", report.types.len());
    println!(
        "  Correlated:     {} (>= {} observations)",
        report.kept.len(),
        config.stats.min_observations
    );
    println!("  Output:         {}", stats_path.display());

    let pairs = top_pairs(&report, 10);
    if !pairs.is_empty() {
        println!();
        println!("  Strongest correlations:");
        println!("  {:<32} {:<32} {:>7}", "A", "B", "R");
        println!("  {}", "-".repeat(73));
        for (a, b, r) in pairs {
            println!(
                "  {:<32} {:<32} {:>7.3}",
                report.types[a].key.label(),
                report.types[b].key.label(),
                r
            );
        }
    }
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Level;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn record(at: &str, file: &str, line: u32) -> LogRecord {
        LogRecord {
            timestamp: ts(at),
            level: Level::Info,
            source_file: file.to_string(),
            source_line: line,
            content: None,
            thread_id: None,
        }
    }

    #[test]
    fn test_one_day_uses_base_width() {
        let cfg = StatsConfig::default();
        let plan = BucketPlan::for_span(ts("2011-01-01 00:00:00"), ts("2011-01-01 23:59:59"), &cfg);
        assert_eq!(plan.width_us, 60 * MICROS_PER_SEC);
        assert_eq!(plan.count, 1440);
        assert_eq!(plan.step_us, MICROS_PER_SEC);
    }

    #[test]
    fn test_longer_span_widens_buckets() {
        let cfg = StatsConfig::default();
        let plan = BucketPlan::for_span(ts("2011-01-01 00:00:00"), ts("2011-01-03 00:00:00"), &cfg);
        assert_eq!(plan.width_us % (60 * MICROS_PER_SEC), 0);
        assert!(plan.width_us > 60 * MICROS_PER_SEC);
        assert!(plan.count <= 1440);
    }

    #[test]
    fn test_buckets_are_aligned() {
        let cfg = StatsConfig::default();
        let plan = BucketPlan::for_span(ts("2011-01-01 00:00:30"), ts("2011-01-01 00:05:10"), &cfg);
        assert_eq!(plan.start_us, db::to_micros(ts("2011-01-01 00:00:00")));
        assert_eq!(plan.count, 6);
    }

    #[test]
    fn test_smoothing_preserves_interior_mass() {
        let cfg = StatsConfig::default();
        let plan = BucketPlan::for_span(ts("2011-01-01 00:00:00"), ts("2011-01-01 00:04:59"), &cfg);
        let event = db::to_micros(ts("2011-01-01 00:02:30"));

        let series = frequency_series(&[event], &plan, &cfg);
        assert_eq!(series.len(), 5);
        let total: f64 = series.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(series[2] > series[0]);
    }

    #[test]
    fn test_empty_buckets_are_zero() {
        let cfg = StatsConfig::default();
        let plan = BucketPlan::for_span(ts("2011-01-01 00:00:00"), ts("2011-01-01 00:09:59"), &cfg);
        let event = db::to_micros(ts("2011-01-01 00:00:10"));

        let series = frequency_series(&[event], &plan, &cfg);
        assert_eq!(series.len(), 10);
        assert!(series[0] > 0.0);
        assert_eq!(series[9], 0.0);
        assert!(series.iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn test_pearson() {
        let a = [1.0, 2.0, 3.0, 4.0];
        assert!((pearson(&a, &[2.0, 4.0, 6.0, 8.0]).unwrap() - 1.0).abs() < 1e-12);
        assert!((pearson(&a, &[4.0, 3.0, 2.0, 1.0]).unwrap() + 1.0).abs() < 1e-12);
        assert_eq!(pearson(&a, &[5.0, 5.0, 5.0, 5.0]), None);
        assert_eq!(pearson(&[1.0], &[1.0]), None);
    }

    #[test]
    fn test_correlation_matrix_is_symmetric() {
        let series = vec![vec![1.0, 0.0, 2.0], vec![0.0, 1.0, 1.0], vec![3.0, 1.0, 0.0]];
        let m = correlation_matrix(&series);
        for i in 0..3 {
            assert!((m[i][i].unwrap() - 1.0).abs() < 1e-12);
            for j in 0..3 {
                assert_eq!(m[i][j], m[j][i]);
            }
        }
    }

    #[test]
    fn test_compute_stats_filters_rare_types() {
        let cfg = StatsConfig {
            min_observations: 3,
            ..StatsConfig::default()
        };
        let mut records = Vec::new();
        for m in 0..5 {
            records.push(record(&format!("2011-01-01 00:0{}:00", m), "PrintJob", 22));
            records.push(record(&format!("2011-01-01 00:0{}:30", m), "Spooler", 7));
        }
        records.push(record("2011-01-01 00:03:00", "Rare", 1));

        let report = compute_stats(&records, &cfg).unwrap();
        assert_eq!(report.records, 11);
        assert_eq!(report.types.len(), 3);
        assert_eq!(report.kept.len(), 2);
        assert_eq!(report.correlations.len(), 2);
        let rare = report
            .types
            .iter()
            .find(|t| t.key.source_file == "Rare")
            .unwrap();
        assert!(!rare.correlated);
        assert_eq!(rare.count, 1);
    }

    #[test]
    fn test_compute_stats_empty() {
        assert!(compute_stats(&[], &StatsConfig::default()).is_none());
    }

    #[tokio::test]
    async fn test_run_stats_writes_stats_db_only() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.store.root = tmp.path().to_path_buf();
        config.stats.min_observations = 2;

        let run_dir = config.run_dir("run");
        let logs = db::connect(&run_dir.join(FINAL_DB)).await.unwrap();
        let records: Vec<LogRecord> = (0..6)
            .map(|i| record(&format!("2011-01-01 00:0{}:00", i), "PrintJob", 22))
            .collect();
        db::write_log_table(&logs, db::FINAL_TABLE, &records)
            .await
            .unwrap();
        logs.close().await;
        let before = std::fs::read(run_dir.join(FINAL_DB)).unwrap();

        run_stats(&config, "run", None).await.unwrap();

        assert_eq!(std::fs::read(run_dir.join(FINAL_DB)).unwrap(), before);
        let pool = db::connect(&run_dir.join(STATS_DB)).await.unwrap();
        assert_eq!(db::count_rows(&pool, "message_types").await.unwrap(), 1);
        assert_eq!(db::count_rows(&pool, "frequencies").await.unwrap(), 6);
        assert_eq!(db::count_rows(&pool, "correlations").await.unwrap(), 1);
        pool.close().await;
    }
}

//! Cross-file ordering check and concatenation.
//!
//! Rotated log files are expected to partition time: sorted by start, each
//! file must end strictly before the next one starts. If that does not hold
//! the consolidated timestamp index would no longer be ordered, so the
//! check runs before anything is concatenated.

use sqlx::SqlitePool;
use tracing::info;

use crate::db;
use crate::error::{Error, Result};
use crate::history::History;

/// Return history keys sorted by start time, failing on any overlap.
pub fn check_ordering(history: &History) -> Result<Vec<String>> {
    let mut entries: Vec<_> = history.entries().collect();
    entries.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.path.cmp(&b.path)));

    for (i, entry) in entries.iter().enumerate() {
        info!(
            index = i,
            start = %entry.start,
            end = %entry.end,
            path = %entry.path,
            "time range by log file"
        );
    }

    for pair in entries.windows(2) {
        let (first, second) = (pair[0], pair[1]);
        if first.end >= second.start {
            return Err(Error::Overlap {
                first: first.path.clone(),
                first_start: first.start,
                first_end: first.end,
                second: second.path.clone(),
                second_start: second.start,
                second_end: second.end,
            });
        }
    }

    Ok(entries.into_iter().map(|e| e.path.clone()).collect())
}

/// Copy each per-file table, in `ordered_paths` order, into `target` in `output`.
///
/// Returns the number of rows copied.
pub async fn concatenate(
    progress: &SqlitePool,
    ordered_paths: &[String],
    output: &SqlitePool,
    target: &str,
) -> Result<u64> {
    db::create_log_table(output, target).await?;

    let mut total = 0u64;
    for path in ordered_paths {
        let table = db::normalize_table_name(path);
        let records = db::read_log_table(progress, &table, None).await?;

        db::append_log_records(output, target, &records).await?;
        total += records.len() as u64;
    }

    Ok(total)
}

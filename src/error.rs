//! Error taxonomy for the ingestion pipeline.
//!
//! Noise lines are not errors: the decoder reports them as `Ok(None)`. The
//! variants here are the failures a caller may want to tell apart, such as
//! skipping a file that produced no records while aborting on overlapping
//! file ranges.

use std::path::PathBuf;

use chrono::NaiveDateTime;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The line looked like a log record but one of its fields could not be parsed.
    #[error("malformed log line ({reason}): {line}")]
    MalformedLine { line: String, reason: String },

    /// A source file yielded zero decodable records.
    #[error("could not process {}: no decodable log records", path.display())]
    NoRecords { path: PathBuf },

    /// Two source files cover overlapping time ranges.
    #[error(
        "log files overlap in time:\n  {first} [{first_start} .. {first_end}]\n  {second} [{second_start} .. {second_end}]"
    )]
    Overlap {
        first: String,
        first_start: NaiveDateTime,
        first_end: NaiveDateTime,
        second: String,
        second_start: NaiveDateTime,
        second_end: NaiveDateTime,
    },

    /// A history file exists but the consolidated table does not.
    #[error(
        "{} exists but {} does not; there appears to be a partial conversion (rerun with --force to resume)",
        history.display(),
        store.display()
    )]
    PartialConversion { history: PathBuf, store: PathBuf },

    #[error("invalid pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

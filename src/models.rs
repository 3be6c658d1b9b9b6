//! Core data models used throughout logtable.
//!
//! These types represent the decoded records, per-file tables and
//! bookkeeping entries that flow through the ingestion pipeline.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Severity token of a log line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    /// Any other all-caps token (e.g. `FATAL`, `DEV`).
    Other(String),
}

impl Level {
    pub fn as_str(&self) -> &str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
            Level::Other(s) => s,
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(format!("not an upper-case level token: '{}'", s));
        }
        Ok(match s {
            "ERROR" => Level::Error,
            "WARN" => Level::Warn,
            "INFO" => Level::Info,
            "DEBUG" => Level::Debug,
            "TRACE" => Level::Trace,
            other => Level::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// How much of each line the decoder extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMode {
    /// Timestamp, level and `File:line` only.
    #[default]
    Simple,
    /// Everything, including message text and thread id.
    Extra,
}

/// One decoded log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: NaiveDateTime,
    pub level: Level,
    pub source_file: String,
    pub source_line: u32,
    /// Present in [`DecodeMode::Extra`] only.
    pub content: Option<String>,
    /// Present in [`DecodeMode::Extra`] only.
    pub thread_id: Option<String>,
}

impl LogRecord {
    pub fn key(&self) -> MessageTypeKey {
        MessageTypeKey {
            level: self.level.clone(),
            source_file: self.source_file.clone(),
            source_line: self.source_line,
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<5} {}:{}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.6f"),
            self.level,
            self.source_file,
            self.source_line
        )?;
        if let Some(content) = &self.content {
            write!(f, " - {}", content)?;
        }
        if let Some(thread) = &self.thread_id {
            write!(f, " [{}]", thread)?;
        }
        Ok(())
    }
}

/// Identifies recurrences of the same log statement in the producing application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageTypeKey {
    pub level: Level,
    pub source_file: String,
    pub source_line: u32,
}

impl MessageTypeKey {
    /// `File:line` uniquely names a message type in practice.
    pub fn label(&self) -> String {
        format!("{}:{}", self.source_file, self.source_line)
    }
}

/// Bookkeeping about one ingested source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHistoryEntry {
    pub path: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub record_count: u64,
    pub load_secs: f64,
    #[serde(default)]
    pub header_lines: Vec<String>,
}

/// All records decoded from one source file, timestamps already made unique.
#[derive(Debug, Clone)]
pub struct LogTable {
    pub path: PathBuf,
    pub records: Vec<LogRecord>,
    pub header_lines: Vec<String>,
    pub malformed_lines: u64,
}

impl LogTable {
    /// First adjusted timestamp. Tables are never empty.
    pub fn start(&self) -> NaiveDateTime {
        self.records[0].timestamp
    }

    pub fn end(&self) -> NaiveDateTime {
        self.records[self.records.len() - 1].timestamp
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

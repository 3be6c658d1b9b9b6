//! Load progress reporting.
//!
//! Reports observable progress during `logtab load` and `logtab batch` so
//! users see which file is being decoded and how many are left.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Files matched for a run, before any decoding.
    Discovered { run: String, files: u64 },
    /// `n` of `total` files are done; `path` was the last one handled.
    Ingesting {
        run: String,
        n: u64,
        total: u64,
        path: String,
        records: u64,
    },
    /// A file was already in the history and was not decoded again.
    Skipped { run: String, path: String },
    /// Per-file tables are being merged into the consolidated table.
    Consolidating { run: String, records: u64 },
}

/// Reports load progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the batch store.
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "load ABC-123-45678.0  ingesting  3 / 12 files".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Discovered { run, files } => {
                format!("load {}  found {} files\n", run, format_number(*files))
            }
            ProgressEvent::Ingesting {
                run,
                n,
                total,
                path,
                records,
            } => format!(
                "load {}  ingesting  {} / {} files  ({}: {} records)\n",
                run,
                format_number(*n),
                format_number(*total),
                path,
                format_number(*records)
            ),
            ProgressEvent::Skipped { run, path } => {
                format!("load {}  already loaded  {}\n", run, path)
            }
            ProgressEvent::Consolidating { run, records } => {
                format!(
                    "load {}  consolidating  {} records\n",
                    run,
                    format_number(*records)
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Discovered { run, files } => serde_json::json!({
                "event": "progress",
                "run": run,
                "phase": "discovered",
                "files": files
            }),
            ProgressEvent::Ingesting {
                run,
                n,
                total,
                path,
                records,
            } => serde_json::json!({
                "event": "progress",
                "run": run,
                "phase": "ingesting",
                "n": n,
                "total": total,
                "path": path,
                "records": records
            }),
            ProgressEvent::Skipped { run, path } => serde_json::json!({
                "event": "progress",
                "run": run,
                "phase": "skipped",
                "path": path
            }),
            ProgressEvent::Consolidating { run, records } => serde_json::json!({
                "event": "progress",
                "run": run,
                "phase": "consolidating",
                "records": records
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}

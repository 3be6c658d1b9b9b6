//! Line search over raw log files.
//!
//! `logtab show` decodes files in extra mode and prints the raw lines of the
//! records that pass a [`ShowFilter`], optionally with surrounding context.
//! Timestamps are printed exactly as logged. Nothing is written to disk;
//! this is the quick look before committing to a load.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::batch::find_log_files;
use crate::config::Config;
use crate::decode::{decode_line, DecodeOptions};
use crate::error::Error;
use crate::models::{DecodeMode, Level, LogRecord};

/// Lines announcing the version of the service that wrote the log.
pub const VERSION_MARKERS: &[&str] = &[
    "Starting the print provider service",
    "CUPS Provider Version:",
    "Starting application server version:",
];

/// What `run_show` prints for each file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShowMode {
    /// Matching records in file order, with context.
    #[default]
    Matches,
    /// Matching records ordered by severity, then timestamp.
    ByLevel,
    /// Lines containing one of [`VERSION_MARKERS`].
    Versions,
}

/// Which records to print. Text comparisons ignore case.
#[derive(Debug, Clone, Default)]
pub struct ShowFilter {
    /// Empty means every level.
    pub levels: Vec<Level>,
    pub include: Option<String>,
    pub exclude: Option<String>,
    pub thread: Option<String>,
    pub since: Option<NaiveDateTime>,
    pub until: Option<NaiveDateTime>,
    /// Only match records at least this many seconds after the previous one.
    pub gap_secs: Option<f64>,
    /// Context records printed before each match.
    pub before: usize,
    /// Context records printed after each match.
    pub after: usize,
    /// Also print the non-record lines (stack traces and the like) that
    /// follow each printed record.
    pub plain: bool,
}

impl ShowFilter {
    fn matches(&self, record: &LogRecord, previous: Option<&LogRecord>) -> bool {
        if !self.levels.is_empty() && !self.levels.contains(&record.level) {
            return false;
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp > until {
                return false;
            }
        }

        let content = record.content.as_deref().unwrap_or("").to_lowercase();
        if let Some(include) = &self.include {
            if !content.contains(&include.to_lowercase()) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if content.contains(&exclude.to_lowercase()) {
                return false;
            }
        }
        if let Some(thread) = &self.thread {
            let id = record.thread_id.as_deref().unwrap_or("").to_lowercase();
            if !id.contains(&thread.to_lowercase()) {
                return false;
            }
        }

        if let Some(gap) = self.gap_secs {
            let Some(prev) = previous else {
                return false;
            };
            let elapsed = (record.timestamp - prev.timestamp).num_microseconds();
            match elapsed {
                Some(us) if us as f64 >= gap * 1_000_000.0 => {}
                _ => return false,
            }
        }
        true
    }
}

/// Indices of matching records plus their context, ascending.
///
/// The second element holds the indices that matched themselves.
pub fn select(records: &[LogRecord], filter: &ShowFilter) -> (Vec<usize>, BTreeSet<usize>) {
    let mut hits = BTreeSet::new();
    for (i, record) in records.iter().enumerate() {
        let previous = i.checked_sub(1).map(|p| &records[p]);
        if filter.matches(record, previous) {
            hits.insert(i);
        }
    }

    let mut shown = BTreeSet::new();
    for &i in &hits {
        let lo = i.saturating_sub(filter.before);
        let hi = (i + filter.after).min(records.len().saturating_sub(1));
        shown.extend(lo..=hi);
    }
    (shown.into_iter().collect(), hits)
}

/// One raw file as `show` sees it.
#[derive(Debug, Clone, Default)]
pub struct ShowFile {
    pub lines: Vec<String>,
    pub records: Vec<LogRecord>,
    /// `records[i]` was decoded from `lines[line_of[i]]`.
    pub line_of: Vec<usize>,
}

impl ShowFile {
    /// Decode `lines`, keeping the raw timestamps. Lines that do not decode
    /// stay in `lines` as plain text.
    pub fn from_lines(lines: Vec<String>, decode: &DecodeOptions) -> Self {
        let mut records = Vec::new();
        let mut line_of = Vec::new();
        for (n, line) in lines.iter().enumerate() {
            match decode_line(line, decode) {
                Ok(Some(record)) => {
                    records.push(record);
                    line_of.push(n);
                }
                Ok(None) => {}
                Err(e) => debug!(line_no = n + 1, error = %e, "treating malformed line as plain text"),
            }
        }
        Self {
            lines,
            records,
            line_of,
        }
    }

    pub fn read(path: &Path, decode: &DecodeOptions) -> crate::error::Result<Self> {
        let mut lines = Vec::new();
        for_each_line(path, |line| {
            lines.push(line.to_string());
            true
        })?;
        Ok(Self::from_lines(lines, decode))
    }

    /// Raw text of the lines following record `i` up to the next record.
    fn plain_after(&self, i: usize) -> &[String] {
        let start = self.line_of[i] + 1;
        let end = self.line_of.get(i + 1).copied().unwrap_or(self.lines.len());
        &self.lines[start..end]
    }
}

/// Call `f` with every line of `path` until it returns `false`.
fn for_each_line(path: &Path, mut f: impl FnMut(&str) -> bool) -> crate::error::Result<()> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| Error::io(path, e))?;
        if n == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&buf);
        if !f(text.trim_end_matches(['\n', '\r'])) {
            return Ok(());
        }
    }
}

/// Raw timestamp of the first record in `path`, reading no further than that record.
pub fn first_record_time(
    path: &Path,
    decode: &DecodeOptions,
) -> crate::error::Result<Option<NaiveDateTime>> {
    let mut first = None;
    for_each_line(path, |line| match decode_line(line, decode) {
        Ok(Some(record)) => {
            first = Some(record.timestamp);
            false
        }
        _ => true,
    })?;
    Ok(first)
}

/// Order `paths` by their first record, dropping files without one.
pub fn order_by_first_record(
    paths: &[PathBuf],
    decode: &DecodeOptions,
) -> crate::error::Result<Vec<PathBuf>> {
    let mut keyed = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(first) = first_record_time(path, decode)? {
            keyed.push((first, path.clone()));
        }
    }
    keyed.sort();
    Ok(keyed.into_iter().map(|(_, p)| p).collect())
}

/// Output lines for [`ShowMode::Matches`], or `None` when nothing matched.
///
/// Matches are prefixed with a space and context with `.`; `--` separates
/// runs that are not adjacent in the file.
pub fn render_matches(file: &ShowFile, filter: &ShowFilter) -> Option<Vec<String>> {
    let (shown, hits) = select(&file.records, filter);
    if hits.is_empty() {
        return None;
    }

    let mut out = Vec::new();
    let mut last: Option<usize> = None;
    for i in shown {
        if matches!(last, Some(l) if i > l + 1) {
            out.push("--".to_string());
        }
        let marker = if hits.contains(&i) { ' ' } else { '.' };
        out.push(format!("{}{}", marker, file.lines[file.line_of[i]]));
        if filter.plain {
            out.extend(file.plain_after(i).iter().map(|l| format!("{}{}", marker, l)));
        }
        last = Some(i);
    }
    Some(out)
}

/// Raw lines of the matching records, most severe first, then by timestamp.
pub fn render_by_level(file: &ShowFile, filter: &ShowFilter) -> Vec<String> {
    let (_, hits) = select(&file.records, filter);
    let mut order: Vec<usize> = hits.into_iter().collect();
    order.sort_by(|&a, &b| {
        let (a, b) = (&file.records[a], &file.records[b]);
        a.level.cmp(&b.level).then(a.timestamp.cmp(&b.timestamp))
    });
    order
        .into_iter()
        .map(|i| file.lines[file.line_of[i]].clone())
        .collect()
}

/// Lines containing one of [`VERSION_MARKERS`].
pub fn version_lines(file: &ShowFile) -> Vec<&str> {
    file.lines
        .iter()
        .filter(|l| VERSION_MARKERS.iter().any(|m| l.contains(*m)))
        .map(String::as_str)
        .collect()
}

/// Run the show command over every file matched by `pattern`.
pub async fn run_show(
    config: &Config,
    pattern: &str,
    filter: &ShowFilter,
    mode: ShowMode,
) -> Result<()> {
    let files = find_log_files(pattern, &config.ingest.exclude_globs)?;
    if files.is_empty() {
        println!("No files match {}", pattern);
        return Ok(());
    }

    let decode = config.ingest.decode_options(DecodeMode::Extra);
    let ordered = {
        let (files, decode) = (files.clone(), decode.clone());
        tokio::task::spawn_blocking(move || order_by_first_record(&files, &decode)).await??
    };
    if ordered.len() < files.len() {
        warn!(
            skipped = files.len() - ordered.len(),
            "files without decodable records"
        );
    }

    let mut versions_found = false;
    for path in ordered {
        let file = {
            let (path, decode) = (path.clone(), decode.clone());
            tokio::task::spawn_blocking(move || ShowFile::read(&path, &decode)).await??
        };

        match mode {
            ShowMode::Matches => {
                println!("{} {}", path.display(), "-".repeat(40));
                match render_matches(&file, filter) {
                    Some(lines) => lines.iter().for_each(|l| println!("{}", l)),
                    None => println!("No matches found in {}", path.display()),
                }
            }
            ShowMode::ByLevel => {
                println!("{} {}", path.display(), "-".repeat(40));
                let lines = render_by_level(&file, filter);
                if lines.is_empty() {
                    println!("No matches found in {}", path.display());
                }
                lines.iter().for_each(|l| println!("{}", l));
            }
            ShowMode::Versions => {
                let lines = version_lines(&file);
                if !lines.is_empty() {
                    versions_found = true;
                    println!("{} {}", path.display(), "-".repeat(40));
                    lines.iter().for_each(|l| println!("{}", l));
                }
            }
        }
    }

    if mode == ShowMode::Versions && !versions_found {
        println!("No version lines found in {}", pattern);
    }
    Ok(())
}

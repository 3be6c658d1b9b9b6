//! File ingester.
//!
//! Streams a log file through the [line decoder](crate::decode), keeps the
//! leading comment header, and rebuilds a strictly increasing timestamp
//! index over the decoded records.
//!
//! [`FileIngester`] wraps [`ingest_file`] with a per-run cache so that a
//! file consulted twice (first to order the file list, then to read its
//! records) is only decoded once. The cache is owned by whoever runs the
//! batch and is dropped with it.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::decode::{decode_line, is_header_line, DecodeOptions};
use crate::error::{Error, Result};
use crate::models::LogTable;
use crate::timestamps::make_timestamps_unique;

/// Everything the ingester needs besides the path.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub decode: DecodeOptions,
    pub header_max_lines: usize,
    pub boundary_nudge: bool,
}

/// Decode every line of `path` without touching the timestamps.
///
/// The returned table may be empty. Bytes that are not valid UTF-8 are
/// replaced rather than rejected.
pub fn scan_file(path: &Path, opts: &IngestOptions) -> Result<LogTable> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::new(file);

    let mut records = Vec::new();
    let mut header_lines = Vec::new();
    let mut malformed_lines = 0u64;
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| Error::io(path, e))?;
        if n == 0 {
            break;
        }
        line_no += 1;

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);

        match decode_line(line, &opts.decode) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {
                if records.is_empty() && line_no <= opts.header_max_lines && is_header_line(line) {
                    header_lines.push(line.trim().to_string());
                }
            }
            Err(e) => {
                debug!(path = %path.display(), line_no, error = %e, "dropping malformed line");
                malformed_lines += 1;
            }
        }
    }

    if malformed_lines > 0 {
        warn!(
            path = %path.display(),
            malformed_lines,
            "dropped lines that looked like records but did not parse"
        );
    }

    Ok(LogTable {
        path: path.to_path_buf(),
        records,
        header_lines,
        malformed_lines,
    })
}

/// Decode `path` and make its timestamps strictly increasing.
///
/// A file without a single decodable record is reported as
/// [`Error::NoRecords`]; callers skip it rather than abort.
pub fn ingest_file(path: &Path, opts: &IngestOptions) -> Result<LogTable> {
    let mut table = scan_file(path, opts)?;
    if table.records.is_empty() {
        return Err(Error::NoRecords {
            path: path.to_path_buf(),
        });
    }

    let mut ts: Vec<NaiveDateTime> = table.records.iter().map(|r| r.timestamp).collect();
    make_timestamps_unique(&mut ts, opts.boundary_nudge);
    for (record, t) in table.records.iter_mut().zip(ts) {
        record.timestamp = t;
    }

    Ok(table)
}

/// Hit/miss counters of a [`FileIngester`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub calls: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.calls - self.misses
    }
}

/// Ingests files on the blocking pool and caches the results for one run.
pub struct FileIngester {
    options: IngestOptions,
    cache: HashMap<PathBuf, Arc<LogTable>>,
    stats: CacheStats,
}

impl FileIngester {
    pub fn new(options: IngestOptions) -> Self {
        Self {
            options,
            cache: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    /// Ingest `path`, decoding it only on the first request.
    pub async fn ingest(&mut self, path: &Path) -> Result<Arc<LogTable>> {
        self.stats.calls += 1;
        if let Some(table) = self.cache.get(path) {
            return Ok(Arc::clone(table));
        }
        self.stats.misses += 1;

        let owned = path.to_path_buf();
        let options = self.options.clone();
        let table = tokio::task::spawn_blocking(move || ingest_file(&owned, &options)).await??;
        let table = Arc::new(table);
        self.cache.insert(path.to_path_buf(), Arc::clone(&table));
        Ok(table)
    }

    /// First adjusted timestamp of `path`, or `None` when it has no records.
    pub async fn first_timestamp(&mut self, path: &Path) -> Result<Option<NaiveDateTime>> {
        match self.ingest(path).await {
            Ok(table) => Ok(Some(table.start())),
            Err(Error::NoRecords { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Order `paths` by their first record, dropping files without records.
    pub async fn sort_by_first_timestamp(&mut self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut keyed = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(first) = self.first_timestamp(path).await? {
                keyed.push((first, path.clone()));
            }
        }
        keyed.sort();
        Ok(keyed.into_iter().map(|(_, p)| p).collect())
    }

    /// Drop a cached table once its records have been persisted.
    pub fn evict(&mut self, path: &Path) {
        self.cache.remove(path);
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

//! Resumable batch ingestion.
//!
//! A [`BatchStore`] turns a list of rotated log files into one consolidated
//! table. Each run owns a directory `<root>/<name>/`:
//!
//! | Path | Contents |
//! |------|----------|
//! | `logs.sqlite` | consolidated table `logs` |
//! | `history.json` | provenance copy of the history |
//! | `temp/<digest>.sqlite` | one table per ingested file |
//! | `temp/<digest>.history.json` | history, rewritten after every file |
//!
//! `<digest>` is derived from the sorted input list, so a different file set
//! never resumes from someone else's intermediate state.
//!
//! # Resume Rules
//!
//! - `logs.sqlite` present: nothing to do.
//! - intermediate history present, `logs.sqlite` absent: a previous run was
//!   interrupted. Without `force` this is an error; with `force` the files
//!   already in the history are kept and the rest are ingested.

use std::path::{Path, PathBuf};
use std::time::Instant;

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::aggregate::{check_ordering, concatenate};
use crate::config::Config;
use crate::db;
use crate::error::{Error, Result};
use crate::history::History;
use crate::ingest::{FileIngester, IngestOptions};
use crate::models::{DecodeMode, FileHistoryEntry};
use crate::progress::{ProgressEvent, ProgressReporter};

/// File name of the consolidated database inside a run directory.
pub const FINAL_DB: &str = "logs.sqlite";
/// File name of the provenance history inside a run directory.
pub const HISTORY_FILE: &str = "history.json";
/// Intermediate state lives below this directory.
pub const TEMP_DIR: &str = "temp";

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub ingest: IngestOptions,
    /// Only the first `max_files` paths (after sorting) are used.
    pub max_files: Option<usize>,
}

/// Result of [`BatchStore::save_all_logs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The consolidated table already existed; nothing was touched.
    AlreadyComplete,
    Completed {
        /// Files in the final history.
        files: usize,
        /// Rows in the consolidated table.
        records: u64,
        /// Files skipped because they had no records.
        skipped: usize,
    },
}

pub struct BatchStore {
    name: String,
    run_dir: PathBuf,
    paths: Vec<PathBuf>,
    digest: String,
    ingester: FileIngester,
}

impl BatchStore {
    pub fn new(root: &Path, name: &str, paths: Vec<PathBuf>, options: BatchOptions) -> Self {
        let mut paths = paths;
        paths.sort();
        paths.dedup();
        if let Some(max) = options.max_files {
            paths.truncate(max);
        }
        let digest = path_list_digest(&paths);

        Self {
            name: name.to_string(),
            run_dir: root.join(name),
            paths,
            digest,
            ingester: FileIngester::new(options.ingest),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn final_path(&self) -> PathBuf {
        self.run_dir.join(FINAL_DB)
    }

    pub fn history_path(&self) -> PathBuf {
        self.run_dir.join(HISTORY_FILE)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.run_dir.join(TEMP_DIR)
    }

    pub fn progress_db_path(&self) -> PathBuf {
        self.temp_dir().join(format!("{}.sqlite", self.digest))
    }

    pub fn progress_history_path(&self) -> PathBuf {
        self.temp_dir().join(format!("{}.history.json", self.digest))
    }

    /// Ingest every file and write the consolidated table.
    pub async fn save_all_logs(
        &mut self,
        force: bool,
        progress: &dyn ProgressReporter,
    ) -> Result<SaveOutcome> {
        let final_path = self.final_path();
        if final_path.exists() {
            info!(run = %self.name, "consolidated table already exists");
            return Ok(SaveOutcome::AlreadyComplete);
        }

        let history_path = self.progress_history_path();
        if history_path.exists() && !force {
            return Err(Error::PartialConversion {
                history: history_path,
                store: final_path,
            });
        }

        let pool = db::connect(&self.progress_db_path()).await?;
        let result = self.ingest_all(&pool, &history_path, progress).await;
        let result = match result {
            Ok((history, skipped)) => self.consolidate(&pool, &history, progress).await.map(
                |records| SaveOutcome::Completed {
                    files: history.len(),
                    records,
                    skipped,
                },
            ),
            Err(e) => Err(e),
        };
        pool.close().await;
        self.ingester.clear();
        result
    }

    async fn ingest_all(
        &mut self,
        pool: &SqlitePool,
        history_path: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<(History, usize)> {
        let mut history = History::load(history_path)?;

        // Entries whose table never made it to disk are redone.
        let tables = db::list_tables(pool).await?;
        let stale: Vec<String> = history
            .entries()
            .filter(|e| !tables.contains(&db::normalize_table_name(&e.path)))
            .map(|e| e.path.clone())
            .collect();
        for path in stale {
            warn!(path = %path, "history entry without a stored table; ingesting again");
            history.remove(&path);
        }

        progress.report(ProgressEvent::Discovered {
            run: self.name.clone(),
            files: self.paths.len() as u64,
        });

        let total = self.paths.len() as u64;
        let mut skipped = 0usize;
        let paths = self.paths.clone();
        for (i, path) in paths.iter().enumerate() {
            let key = path.to_string_lossy().to_string();
            if history.contains(&key) {
                progress.report(ProgressEvent::Skipped {
                    run: self.name.clone(),
                    path: key,
                });
                continue;
            }

            let started = Instant::now();
            let table = match self.ingester.ingest(path).await {
                Ok(table) => table,
                Err(Error::NoRecords { path }) => {
                    warn!(path = %path.display(), "could not process file: no decodable records");
                    skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            db::write_log_table(pool, &db::normalize_table_name(&key), &table.records).await?;
            history.insert(FileHistoryEntry {
                path: key.clone(),
                start: table.start(),
                end: table.end(),
                record_count: table.len() as u64,
                load_secs: started.elapsed().as_secs_f64(),
                header_lines: table.header_lines.clone(),
            });
            history.save(history_path)?;
            self.ingester.evict(path);

            progress.report(ProgressEvent::Ingesting {
                run: self.name.clone(),
                n: i as u64 + 1,
                total,
                path: key,
                records: table.len() as u64,
            });
        }

        Ok((history, skipped))
    }

    async fn consolidate(
        &self,
        pool: &SqlitePool,
        history: &History,
        progress: &dyn ProgressReporter,
    ) -> Result<u64> {
        if history.is_empty() {
            return Err(Error::NoRecords {
                path: self.run_dir.clone(),
            });
        }

        let ordered = check_ordering(history)?;
        progress.report(ProgressEvent::Consolidating {
            run: self.name.clone(),
            records: history.total_records(),
        });

        let tmp = self.run_dir.join(format!("{}.tmp", FINAL_DB));
        remove_sqlite_files(&tmp)?;

        let output = db::connect(&tmp).await?;
        let copied = match concatenate(pool, &ordered, &output, db::FINAL_TABLE).await {
            Ok(n) => db::checkpoint(&output).await.map(|_| n),
            Err(e) => Err(e),
        };
        output.close().await;
        let copied = copied?;
        remove_wal_files(&tmp)?;

        let final_path = self.final_path();
        std::fs::rename(&tmp, &final_path).map_err(|e| Error::io(&final_path, e))?;
        history.save(&self.history_path())?;

        info!(run = %self.name, files = history.len(), records = copied, "wrote consolidated table");
        Ok(copied)
    }

    /// Remove the intermediate state of this run. See [`cleanup_run`].
    pub fn cleanup(&self) -> Result<bool> {
        cleanup_run(&self.run_dir)
    }
}

/// Remove `temp/` below `run_dir`, returning whether there was anything to remove.
///
/// Refuses while the consolidated table is missing, since the intermediate
/// state is the only way to resume. Once it exists no load of this run reads
/// `temp/` again, whatever file list produced it.
pub fn cleanup_run(run_dir: &Path) -> Result<bool> {
    let final_path = run_dir.join(FINAL_DB);
    if !final_path.exists() {
        return Err(Error::io(
            &final_path,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "consolidated table missing; keeping intermediate files so the load can resume",
            ),
        ));
    }

    let temp = run_dir.join(TEMP_DIR);
    if !temp.exists() {
        return Ok(false);
    }
    std::fs::remove_dir_all(&temp).map_err(|e| Error::io(&temp, e))?;
    info!(dir = %temp.display(), "removed intermediate files");
    Ok(true)
}

/// Options of `logtab load`.
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    pub name: String,
    pub pattern: String,
    pub force: bool,
    pub cleanup: bool,
    pub extra: bool,
    pub max_files: Option<usize>,
}

/// Run the load command: ingest the files matched by `req.pattern` into run `req.name`.
pub async fn run_load(
    config: &Config,
    req: &LoadRequest,
    progress: &dyn ProgressReporter,
) -> anyhow::Result<()> {
    let files = find_log_files(&req.pattern, &config.ingest.exclude_globs)?;
    if files.is_empty() {
        anyhow::bail!("No log files match '{}'", req.pattern);
    }

    let mode = if req.extra {
        DecodeMode::Extra
    } else {
        config.ingest.mode
    };
    let options = BatchOptions {
        ingest: config.ingest.ingest_options(mode),
        max_files: req.max_files,
    };
    let mut store = BatchStore::new(&config.store.root, &req.name, files, options);

    println!("Loading {} files into {}", store.paths().len(), store.run_dir().display());
    match store.save_all_logs(req.force, progress).await? {
        SaveOutcome::AlreadyComplete => {
            println!("already complete: {}", store.final_path().display());
        }
        SaveOutcome::Completed {
            files,
            records,
            skipped,
        } => {
            println!("  files:   {}", files);
            println!("  records: {}", records);
            if skipped > 0 {
                println!("  skipped: {} (no records)", skipped);
            }
            println!("ok");
        }
    }

    if req.cleanup {
        store.cleanup()?;
    }
    Ok(())
}

/// Run the cleanup command: drop every intermediate file of run `name`.
pub fn run_cleanup(config: &Config, name: &str) -> anyhow::Result<()> {
    let run_dir = config.run_dir(name);
    if cleanup_run(&run_dir)? {
        println!("removed {}", run_dir.join(TEMP_DIR).display());
    } else {
        println!("nothing to clean up");
    }
    Ok(())
}

/// Remove a SQLite database together with its WAL side files.
fn remove_sqlite_files(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|e| Error::io(path, e))?;
    }
    remove_wal_files(path)
}

fn remove_wal_files(path: &Path) -> Result<()> {
    for suffix in ["-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        let side = PathBuf::from(name);
        if side.exists() {
            std::fs::remove_file(&side).map_err(|e| Error::io(&side, e))?;
        }
    }
    Ok(())
}

fn path_list_digest(paths: &[PathBuf]) -> String {
    let mut hasher = Sha256::new();
    for path in paths {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(b"\n");
    }
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Expand a shell-style glob into the sorted list of matching files.
///
/// Files whose name matches one of `exclude_globs` (archives, by default)
/// are dropped. A pattern without wildcards names a single file.
pub fn find_log_files(pattern: &str, exclude_globs: &[String]) -> Result<Vec<PathBuf>> {
    let exclude_set = build_globset(exclude_globs)?;
    let excluded = |path: &Path| {
        path.file_name()
            .map(|n| exclude_set.is_match(Path::new(n)))
            .unwrap_or(false)
    };

    let (base, rest) = split_glob_base(pattern);
    if rest.is_empty() {
        let path = PathBuf::from(pattern);
        if path.is_file() && !excluded(&path) {
            return Ok(vec![path]);
        }
        return Ok(Vec::new());
    }

    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| Error::Pattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?
        .compile_matcher();

    let walk_root = if base.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        base.clone()
    };
    let mut walker = WalkDir::new(&walk_root);
    if !rest.contains("**") {
        walker = walker.max_depth(rest.split('/').count());
    }

    let mut files = Vec::new();
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = if base.as_os_str().is_empty() {
            entry
                .path()
                .strip_prefix(".")
                .unwrap_or(entry.path())
                .to_path_buf()
        } else {
            entry.path().to_path_buf()
        };
        if matcher.is_match(&path) && !excluded(&path) {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

/// Split `pattern` into the literal directory prefix and the wildcard part.
fn split_glob_base(pattern: &str) -> (PathBuf, String) {
    let is_glob = |s: &str| s.contains(['*', '?', '[', '{']);
    let parts: Vec<&str> = pattern.split('/').collect();
    match parts.iter().position(|p| is_glob(p)) {
        None => (PathBuf::from(pattern), String::new()),
        Some(i) => {
            let base = parts[..i].join("/");
            let base = if base.is_empty() && pattern.starts_with('/') {
                "/".to_string()
            } else {
                base
            };
            (PathBuf::from(base), parts[i..].join("/"))
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| Error::Pattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?);
    }
    builder.build().map_err(|e| Error::Pattern {
        pattern: patterns.join(","),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use chrono::NaiveDateTime;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn log_lines(start_min: u32, count: u32) -> String {
        (0..count)
            .map(|i| {
                format!(
                    "2011-01-01 00:{:02}:00,000 INFO PrintJob:{} - step {} [t-1]\n",
                    start_min + i,
                    10 + i,
                    i
                )
            })
            .collect()
    }

    #[test]
    fn test_split_glob_base() {
        assert_eq!(
            split_glob_base("bugs/ABC/server.log*"),
            (PathBuf::from("bugs/ABC"), "server.log*".to_string())
        );
        assert_eq!(
            split_glob_base("server.log*"),
            (PathBuf::new(), "server.log*".to_string())
        );
        assert_eq!(
            split_glob_base("/var/log/**/server.log"),
            (PathBuf::from("/var/log"), "**/server.log".to_string())
        );
        assert_eq!(
            split_glob_base("plain/server.log"),
            (PathBuf::from("plain/server.log"), String::new())
        );
    }

    #[test]
    fn test_find_log_files_excludes_archives() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(tmp.path(), "server.log", "");
        write(tmp.path(), "server.log.1", "");
        write(tmp.path(), "server.log.2.zip", "");
        write(tmp.path(), "other.txt", "");
        std::fs::create_dir(tmp.path().join("server.log.d")).unwrap();

        let pattern = format!("{}/server.log*", tmp.path().display());
        let excludes = vec!["*.zip".to_string()];
        let files = find_log_files(&pattern, &excludes).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["server.log", "server.log.1"]);
    }

    #[test]
    fn test_find_log_files_does_not_descend_without_double_star() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("nested")).unwrap();
        write(tmp.path(), "server.log", "");
        write(&tmp.path().join("nested"), "server.log", "");

        let flat = find_log_files(&format!("{}/server.lo?", tmp.path().display()), &[]).unwrap();
        assert_eq!(flat.len(), 1);

        let deep = find_log_files(&format!("{}/**/server.log", tmp.path().display()), &[]).unwrap();
        assert_eq!(deep.len(), 2);
        assert!(deep[0].ends_with("nested/server.log"));
    }

    #[tokio::test]
    async fn test_save_all_logs_and_rerun_is_noop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = write(tmp.path(), "server.log.2", &log_lines(0, 5));
        let b = write(tmp.path(), "server.log.1", &log_lines(30, 3));
        let root = tmp.path().join("runs");

        let mut store = BatchStore::new(&root, "run", vec![b, a], BatchOptions::default());
        let outcome = store.save_all_logs(false, &NoProgress).await.unwrap();
        assert_eq!(
            outcome,
            SaveOutcome::Completed {
                files: 2,
                records: 8,
                skipped: 0
            }
        );
        assert!(store.final_path().exists());
        assert!(store.history_path().exists());

        let before = std::fs::read(store.final_path()).unwrap();
        let outcome = store.save_all_logs(false, &NoProgress).await.unwrap();
        assert_eq!(outcome, SaveOutcome::AlreadyComplete);
        assert_eq!(std::fs::read(store.final_path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_partial_history_requires_force() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = write(tmp.path(), "server.log.1", &log_lines(0, 5));
        let b = write(tmp.path(), "server.log.2", &log_lines(30, 3));
        let root = tmp.path().join("runs");
        let paths = vec![a.clone(), b];

        // Simulate an interrupted run: one file ingested, no final table.
        {
            let mut partial = BatchStore::new(
                &root,
                "run",
                paths.clone(),
                BatchOptions::default(),
            );
            let pool = db::connect(&partial.progress_db_path()).await.unwrap();
            let table = partial.ingester.ingest(&a).await.unwrap();
            let key = a.to_string_lossy().to_string();
            db::write_log_table(&pool, &db::normalize_table_name(&key), &table.records)
                .await
                .unwrap();
            let mut history = History::new();
            history.insert(FileHistoryEntry {
                path: key,
                start: table.start(),
                end: table.end(),
                record_count: table.len() as u64,
                load_secs: 0.0,
                header_lines: vec![],
            });
            history.save(&partial.progress_history_path()).unwrap();
            pool.close().await;
        }

        let mut store = BatchStore::new(&root, "run", paths, BatchOptions::default());
        let err = store.save_all_logs(false, &NoProgress).await.unwrap_err();
        assert!(matches!(err, Error::PartialConversion { .. }));
        assert!(!store.final_path().exists());

        let outcome = store.save_all_logs(true, &NoProgress).await.unwrap();
        assert_eq!(
            outcome,
            SaveOutcome::Completed {
                files: 2,
                records: 8,
                skipped: 0
            }
        );
        assert_eq!(History::load(&store.history_path()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_force_reingests_history_entry_without_table() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = write(tmp.path(), "server.log.1", &log_lines(0, 5));
        let b = write(tmp.path(), "server.log.2", &log_lines(30, 3));
        let root = tmp.path().join("runs");
        let paths = vec![a.clone(), b];

        // The history claims file a, but its table was never written.
        let store = BatchStore::new(&root, "run", paths.clone(), BatchOptions::default());
        let key = a.to_string_lossy().to_string();
        let at = NaiveDateTime::parse_from_str("2011-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let mut history = History::new();
        history.insert(FileHistoryEntry {
            path: key.clone(),
            start: at,
            end: at,
            record_count: 99,
            load_secs: 0.0,
            header_lines: vec![],
        });
        history.save(&store.progress_history_path()).unwrap();
        let pool = db::connect(&store.progress_db_path()).await.unwrap();
        assert!(db::list_tables(&pool).await.unwrap().is_empty());
        pool.close().await;

        let mut store = BatchStore::new(&root, "run", paths, BatchOptions::default());
        let outcome = store.save_all_logs(true, &NoProgress).await.unwrap();
        assert_eq!(
            outcome,
            SaveOutcome::Completed {
                files: 2,
                records: 8,
                skipped: 0
            }
        );

        let history = History::load(&store.history_path()).unwrap();
        assert_eq!(history.get(&key).unwrap().record_count, 5);
        let pool = db::connect(&store.progress_db_path()).await.unwrap();
        let table = db::normalize_table_name(&key);
        assert_eq!(db::count_rows(&pool, &table).await.unwrap(), 5);
        pool.close().await;

        let pool = db::connect(&store.final_path()).await.unwrap();
        assert_eq!(db::count_rows(&pool, db::FINAL_TABLE).await.unwrap(), 8);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_empty_file_is_skipped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = write(tmp.path(), "server.log", &log_lines(0, 2));
        let b = write(tmp.path(), "server.log.1", "nothing to see\n");
        let root = tmp.path().join("runs");

        let mut store = BatchStore::new(&root, "run", vec![a, b], BatchOptions::default());
        let outcome = store.save_all_logs(false, &NoProgress).await.unwrap();
        assert_eq!(
            outcome,
            SaveOutcome::Completed {
                files: 1,
                records: 2,
                skipped: 1
            }
        );
    }

    #[tokio::test]
    async fn test_max_files_truncates_sorted_list() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = write(tmp.path(), "server.log.1", &log_lines(0, 2));
        let b = write(tmp.path(), "server.log.2", &log_lines(30, 2));
        let options = BatchOptions {
            max_files: Some(1),
            ..BatchOptions::default()
        };

        let store = BatchStore::new(tmp.path(), "run", vec![b, a.clone()], options);
        assert_eq!(store.paths(), &[a]);
    }

    #[tokio::test]
    async fn test_cleanup_removes_intermediate_state() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = write(tmp.path(), "server.log", &log_lines(0, 2));
        let root = tmp.path().join("runs");

        let mut store = BatchStore::new(&root, "run", vec![a], BatchOptions::default());
        assert!(store.cleanup().is_err());

        store.save_all_logs(false, &NoProgress).await.unwrap();
        assert!(store.progress_db_path().exists());
        // State left behind by a different file list of the same run.
        std::fs::write(store.temp_dir().join("0123456789abcdef.sqlite"), b"").unwrap();

        assert!(store.cleanup().unwrap());
        assert!(!store.temp_dir().exists());
        assert!(store.final_path().exists());

        // The command path shares the policy and finds nothing left.
        assert!(!cleanup_run(store.run_dir()).unwrap());
    }
}

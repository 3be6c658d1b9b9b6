//! Cross-directory batch processing.
//!
//! `logtab batch` walks a tree of bug-report directories, finds those with
//! rotated server logs and runs one independent load + statistics job per
//! directory. Jobs share nothing but the static work list; each writes only
//! to its own run directory, so there is no locking. A failed job is logged
//! and never undoes the others.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use globset::Glob;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};
use walkdir::WalkDir;

use crate::batch::{BatchOptions, BatchStore, TEMP_DIR};
use crate::config::{BatchConfig, Config};
use crate::progress::ProgressReporter;
use crate::stats;

/// One directory to load, under the run name `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Find every directory below `top_dir` that qualifies for a job.
///
/// A directory qualifies when it holds at least `min_logs` files matching
/// `file_pattern` (archives excluded) and its path contains an id matched
/// by `dir_id_pattern`. Jobs are named `<id>.<n>`, numbering the
/// directories of one id in path order.
pub fn discover_jobs(
    top_dir: &Path,
    batch: &BatchConfig,
    exclude_globs: &[String],
) -> Result<Vec<Job>> {
    let file_matcher = Glob::new(&batch.file_pattern)
        .with_context(|| format!("invalid file pattern '{}'", batch.file_pattern))?
        .compile_matcher();
    let mut excludes = Vec::with_capacity(exclude_globs.len());
    for pattern in exclude_globs {
        excludes.push(Glob::new(pattern)?.compile_matcher());
    }
    let id_re = Regex::new(&batch.dir_id_pattern)
        .with_context(|| format!("invalid id pattern '{}'", batch.dir_id_pattern))?;

    let mut by_id: BTreeMap<String, Vec<(PathBuf, Vec<PathBuf>)>> = BTreeMap::new();
    for entry in WalkDir::new(top_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = entry.path();

        let mut files = Vec::new();
        for child in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?
        {
            let child = child?;
            if !child.file_type()?.is_file() {
                continue;
            }
            let name = child.file_name();
            let name = Path::new(&name);
            if file_matcher.is_match(name) && !excludes.iter().any(|m| m.is_match(name)) {
                files.push(child.path());
            }
        }
        if files.is_empty() || files.len() < batch.min_logs {
            continue;
        }

        let Some(id) = id_re.find(&dir.to_string_lossy()).map(|m| m.as_str().to_string())
        else {
            info!(dir = %dir.display(), "skipping directory without an id");
            continue;
        };
        files.sort();
        by_id.entry(id).or_default().push((dir.to_path_buf(), files));
    }

    let mut jobs = Vec::new();
    for (id, mut dirs) in by_id {
        dirs.sort_by(|a, b| a.0.cmp(&b.0));
        for (n, (dir, files)) in dirs.into_iter().enumerate() {
            jobs.push(Job {
                name: format!("{}.{}", id, n),
                dir,
                files,
            });
        }
    }
    Ok(jobs)
}

/// Limits applied to every job of a pool run.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolOptions {
    pub workers: usize,
    pub max_files: Option<usize>,
    pub max_entries: Option<i64>,
}

/// Load a fresh run for `job`, compute its statistics and drop the intermediate files.
pub async fn process_job(
    config: &Config,
    job: &Job,
    options: PoolOptions,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    let run_dir = config.run_dir(&job.name);
    if run_dir.exists() {
        std::fs::remove_dir_all(&run_dir)
            .with_context(|| format!("Failed to reset {}", run_dir.display()))?;
    }

    let batch_options = BatchOptions {
        ingest: config.ingest.ingest_options(config.ingest.mode),
        max_files: options.max_files,
    };
    let mut store = BatchStore::new(
        &config.store.root,
        &job.name,
        job.files.clone(),
        batch_options,
    );
    store.save_all_logs(false, progress).await?;
    stats::run_stats(config, &job.name, options.max_entries).await?;

    let temp = run_dir.join(TEMP_DIR);
    if temp.exists() {
        std::fs::remove_dir_all(&temp)
            .with_context(|| format!("Failed to remove {}", temp.display()))?;
    }
    Ok(())
}

/// Run `jobs` with at most `options.workers` in flight.
///
/// Returns `true` when every job succeeded.
pub async fn run_jobs(
    config: Arc<Config>,
    jobs: Vec<Job>,
    options: PoolOptions,
    progress: Arc<dyn ProgressReporter>,
) -> bool {
    let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));
    let mut set = JoinSet::new();

    for job in jobs {
        let config = Arc::clone(&config);
        let semaphore = Arc::clone(&semaphore);
        let progress = Arc::clone(&progress);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = process_job(&config, &job, options, progress.as_ref()).await;
            (job, result)
        });
    }

    let mut all_ok = true;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((job, Ok(()))) => info!(job = %job.name, dir = %job.dir.display(), "job finished"),
            Ok((job, Err(e))) => {
                let reason = format!("{:#}", e);
                error!(job = %job.name, dir = %job.dir.display(), error = %reason, "job failed");
                all_ok = false;
            }
            Err(e) => {
                error!(error = %e, "job panicked");
                all_ok = false;
            }
        }
    }
    all_ok
}

/// Run the batch command over `top_dir`.
pub async fn run_batch(
    config: Config,
    top_dir: &Path,
    options: PoolOptions,
    progress: Arc<dyn ProgressReporter>,
) -> Result<()> {
    let jobs = discover_jobs(top_dir, &config.batch, &config.ingest.exclude_globs)?;
    if jobs.is_empty() {
        println!("No directories with log files under {}", top_dir.display());
        return Ok(());
    }

    println!("{} jobs, {} workers", jobs.len(), options.workers.max(1));
    for job in &jobs {
        println!("  {:<24} {:>4} files  {}", job.name, job.files.len(), job.dir.display());
    }

    let total = jobs.len();
    if run_jobs(Arc::new(config), jobs, options, progress).await {
        println!("ok");
        Ok(())
    } else {
        anyhow::bail!("one or more of {} jobs failed", total)
    }
}

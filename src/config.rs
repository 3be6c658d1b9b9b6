use anyhow::{Context, Result};
use globset::Glob;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::decode::DecodeOptions;
use crate::ingest::IngestOptions;
use crate::models::DecodeMode;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default)]
    pub mode: DecodeMode,
    #[serde(default = "default_content_max_len")]
    pub content_max_len: usize,
    #[serde(default = "default_header_max_lines")]
    pub header_max_lines: usize,
    #[serde(default = "default_legacy_year")]
    pub legacy_year: i32,
    #[serde(default)]
    pub boundary_nudge: bool,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            mode: DecodeMode::Simple,
            content_max_len: default_content_max_len(),
            header_max_lines: default_header_max_lines(),
            legacy_year: default_legacy_year(),
            boundary_nudge: false,
            exclude_globs: default_exclude_globs(),
        }
    }
}

impl IngestConfig {
    pub fn decode_options(&self, mode: DecodeMode) -> DecodeOptions {
        DecodeOptions {
            mode,
            content_max_len: self.content_max_len,
            legacy_year: self.legacy_year,
        }
    }

    pub fn ingest_options(&self, mode: DecodeMode) -> IngestOptions {
        IngestOptions {
            decode: self.decode_options(mode),
            header_max_lines: self.header_max_lines,
            boundary_nudge: self.boundary_nudge,
        }
    }
}

fn default_content_max_len() -> usize {
    256
}
fn default_header_max_lines() -> usize {
    20
}
fn default_legacy_year() -> i32 {
    2011
}
fn default_exclude_globs() -> Vec<String> {
    ["*.zip", "*.gz", "*.bz2", "*.xz", "*.7z", "*.tar", "*.tgz", "*.rar"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    #[serde(default = "default_base_bucket_secs")]
    pub base_bucket_secs: i64,
    #[serde(default = "default_max_buckets")]
    pub max_buckets: i64,
    #[serde(default = "default_fine_steps")]
    pub fine_steps_per_bucket: i64,
    #[serde(default = "default_smoothing_buckets")]
    pub smoothing_buckets: i64,
    #[serde(default = "default_min_observations")]
    pub min_observations: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            base_bucket_secs: default_base_bucket_secs(),
            max_buckets: default_max_buckets(),
            fine_steps_per_bucket: default_fine_steps(),
            smoothing_buckets: default_smoothing_buckets(),
            min_observations: default_min_observations(),
        }
    }
}

fn default_base_bucket_secs() -> i64 {
    60
}
fn default_max_buckets() -> i64 {
    1440
}
fn default_fine_steps() -> i64 {
    60
}
fn default_smoothing_buckets() -> i64 {
    2
}
fn default_min_observations() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,
    #[serde(default = "default_min_logs")]
    pub min_logs: usize,
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    #[serde(default = "default_dir_id_pattern")]
    pub dir_id_pattern: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            file_pattern: default_file_pattern(),
            min_logs: default_min_logs(),
            jobs: default_jobs(),
            dir_id_pattern: default_dir_id_pattern(),
        }
    }
}

fn default_file_pattern() -> String {
    "server.log*".to_string()
}
fn default_min_logs() -> usize {
    1
}
fn default_jobs() -> usize {
    1
}
fn default_dir_id_pattern() -> String {
    r"[A-Z]{3}-\d{3}-\d{5}".to_string()
}

impl Config {
    /// Directory holding every artifact of the run `name`.
    pub fn run_dir(&self, name: &str) -> PathBuf {
        self.store.root.join(name)
    }
}

/// Load the configuration at `path`, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<Config> {
    let config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate ingest
    if config.ingest.content_max_len == 0 {
        anyhow::bail!("ingest.content_max_len must be > 0");
    }
    if config.ingest.header_max_lines == 0 {
        anyhow::bail!("ingest.header_max_lines must be > 0");
    }
    if !(1970..=9999).contains(&config.ingest.legacy_year) {
        anyhow::bail!("ingest.legacy_year must be in [1970, 9999]");
    }
    for pattern in &config.ingest.exclude_globs {
        Glob::new(pattern)
            .with_context(|| format!("ingest.exclude_globs: invalid glob '{}'", pattern))?;
    }

    // Validate stats
    if config.stats.base_bucket_secs <= 0 {
        anyhow::bail!("stats.base_bucket_secs must be > 0");
    }
    if config.stats.max_buckets <= 0 {
        anyhow::bail!("stats.max_buckets must be > 0");
    }
    if config.stats.fine_steps_per_bucket <= 0 {
        anyhow::bail!("stats.fine_steps_per_bucket must be > 0");
    }
    if config.stats.smoothing_buckets <= 0 {
        anyhow::bail!("stats.smoothing_buckets must be > 0");
    }

    // Validate batch
    if config.batch.jobs == 0 {
        anyhow::bail!("batch.jobs must be > 0");
    }
    Regex::new(&config.batch.dir_id_pattern).with_context(|| {
        format!(
            "batch.dir_id_pattern: invalid regex '{}'",
            config.batch.dir_id_pattern
        )
    })?;

    Ok(())
}

//! # logtable CLI (`logtab`)
//!
//! The `logtab` binary turns rotated application server logs into SQLite
//! tables and derives message-type statistics from them.
//!
//! ## Usage
//!
//! ```bash
//! logtab --config ./config/logtab.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `logtab load <name> --glob <pattern>` | Ingest log files into the run `<name>` |
//! | `logtab cleanup <name>` | Delete the intermediate files of a finished run |
//! | `logtab summary <name>` | Print time span, level counts and file history |
//! | `logtab stats <name>` | Compute message-type frequencies and correlations |
//! | `logtab show <glob>` | Print matching lines from raw log files |
//! | `logtab batch <top_dir>` | Load every bug-report directory below `top_dir` |
//!
//! ## Examples
//!
//! ```bash
//! # Load a directory of rotated logs, keeping message text and thread ids
//! logtab load ABC-123-45678 --glob 'bugs/ABC-123-45678/server.log*' --extra
//!
//! # Resume an interrupted load
//! logtab load ABC-123-45678 --glob 'bugs/ABC-123-45678/server.log*' --force
//!
//! # Errors mentioning XMLRPC, with two lines of context
//! logtab show 'bugs/ABC-123-45678/server.log*' -E --include xmlrpc --before 2
//!
//! # Errors with their stack traces, most severe first
//! logtab show 'bugs/ABC-123-45678/server.log*' -E --plain --sort
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use logtable::batch::{self, LoadRequest};
use logtable::config::load_config;
use logtable::decode::parse_timestamp;
use logtable::models::Level;
use logtable::pool::{self, PoolOptions};
use logtable::progress::{ProgressMode, ProgressReporter};
use logtable::show::{self, ShowFilter, ShowMode};
use logtable::{stats, summary};

/// logtable: load rotated server logs into SQLite and analyse them.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "logtab",
    about = "Load rotated server logs into SQLite tables and analyse them",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/logtab.toml")]
    config: PathBuf,

    /// Log pipeline decisions (skipped files, ordering, timings) to stderr.
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Progress on stderr: off, human, or json. Default: human when stderr is a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Ingest log files into a run.
    ///
    /// Every file matched by the glob is decoded, stored as its own table,
    /// checked for time overlap with the others and concatenated into
    /// `<root>/<name>/logs.sqlite`. Re-running a finished load does nothing.
    Load {
        /// Run name; becomes the output directory.
        name: String,

        /// Shell-style glob selecting the log files. Archives are excluded.
        #[arg(long, short = 'g')]
        glob: String,

        /// Resume a load whose intermediate history exists but never finished.
        #[arg(long, short = 'f')]
        force: bool,

        /// Delete intermediate files once the consolidated table is written.
        #[arg(long, short = 'c')]
        cleanup: bool,

        /// Keep message text and thread ids.
        #[arg(long, short = 'x')]
        extra: bool,

        /// Only load the first N files.
        #[arg(long, short = 'n')]
        max_files: Option<usize>,
    },

    /// Delete the intermediate files of a finished run.
    Cleanup {
        /// Run name.
        name: String,
    },

    /// Show what a run contains.
    Summary {
        /// Run name.
        name: String,
    },

    /// Compute message-type frequencies and correlations for a run.
    ///
    /// Results are written to `<root>/<name>/stats.sqlite`.
    Stats {
        /// Run name.
        name: String,

        /// Only use the first N records.
        #[arg(long, short = 'e')]
        max_entries: Option<i64>,
    },

    /// Print matching lines from raw log files.
    Show {
        /// Shell-style glob selecting the log files.
        glob: String,

        /// Show ERROR lines.
        #[arg(short = 'E')]
        error: bool,

        /// Show INFO lines.
        #[arg(short = 'I')]
        info: bool,

        /// Show DEBUG lines.
        #[arg(short = 'D')]
        debug: bool,

        /// Only lines whose message contains this text.
        #[arg(long, short = 'i')]
        include: Option<String>,

        /// Drop lines whose message contains this text.
        #[arg(long, short = 'e')]
        exclude: Option<String>,

        /// Only lines whose thread id contains this text.
        #[arg(long, short = 't')]
        thread: Option<String>,

        /// Only lines at or after this timestamp.
        #[arg(long)]
        since: Option<String>,

        /// Only lines at or before this timestamp.
        #[arg(long)]
        until: Option<String>,

        /// Context lines before each match.
        #[arg(long, short = 'B', default_value = "0")]
        before: usize,

        /// Context lines after each match.
        #[arg(long, short = 'A', default_value = "0")]
        after: usize,

        /// Only lines at least this many seconds after the previous line.
        #[arg(long)]
        gap: Option<f64>,

        /// Also print non-record lines (stack traces) following each printed line.
        #[arg(long, short = 'p')]
        plain: bool,

        /// List matching lines by severity, then timestamp.
        #[arg(long, short = 's', conflicts_with = "versions")]
        sort: bool,

        /// Only print the lines announcing the server version.
        #[arg(long)]
        versions: bool,
    },

    /// Load and analyse every bug-report directory below a top directory.
    ///
    /// Each directory becomes the run `<id>.<n>`; failures are reported at
    /// the end and do not stop other directories.
    Batch {
        /// Directory tree to scan.
        top_dir: PathBuf,

        /// Skip directories with fewer log files than this.
        #[arg(long, short = 'm')]
        min_logs: Option<usize>,

        /// Only load the first N files of each directory.
        #[arg(long, short = 'n')]
        max_files: Option<usize>,

        /// Only use the first N records for statistics.
        #[arg(long, short = 'e')]
        max_entries: Option<i64>,

        /// Number of directories processed concurrently.
        #[arg(long, short = 'j')]
        jobs: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "logtable=info"
    } else {
        "logtable=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut cfg = load_config(&cli.config)?;
    let progress_mode = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Load {
            name,
            glob,
            force,
            cleanup,
            extra,
            max_files,
        } => {
            let req = LoadRequest {
                name,
                pattern: glob,
                force,
                cleanup,
                extra,
                max_files,
            };
            let reporter = progress_mode.reporter();
            batch::run_load(&cfg, &req, reporter.as_ref()).await?;
        }
        Commands::Cleanup { name } => {
            batch::run_cleanup(&cfg, &name)?;
        }
        Commands::Summary { name } => {
            summary::run_summary(&cfg, &name).await?;
        }
        Commands::Stats { name, max_entries } => {
            stats::run_stats(&cfg, &name, max_entries).await?;
        }
        Commands::Show {
            glob,
            error,
            info,
            debug,
            include,
            exclude,
            thread,
            since,
            until,
            before,
            after,
            gap,
            plain,
            sort,
            versions,
        } => {
            let mut levels = Vec::new();
            if error {
                levels.push(Level::Error);
            }
            if info {
                levels.push(Level::Info);
            }
            if debug {
                levels.push(Level::Debug);
            }
            let year = cfg.ingest.legacy_year;
            let parse = |text: Option<String>| -> anyhow::Result<_> {
                text.map(|t| {
                    parse_timestamp(&t, year)
                        .map_err(anyhow::Error::msg)
                        .with_context(|| format!("invalid timestamp '{}'", t))
                })
                .transpose()
            };
            let filter = ShowFilter {
                levels,
                include,
                exclude,
                thread,
                since: parse(since)?,
                until: parse(until)?,
                gap_secs: gap,
                before,
                after,
                plain,
            };
            let mode = if versions {
                ShowMode::Versions
            } else if sort {
                ShowMode::ByLevel
            } else {
                ShowMode::Matches
            };
            show::run_show(&cfg, &glob, &filter, mode).await?;
        }
        Commands::Batch {
            top_dir,
            min_logs,
            max_files,
            max_entries,
            jobs,
        } => {
            if let Some(min_logs) = min_logs {
                cfg.batch.min_logs = min_logs;
            }
            let options = PoolOptions {
                workers: jobs.unwrap_or(cfg.batch.jobs),
                max_files,
                max_entries,
            };
            let reporter: Arc<dyn ProgressReporter> = Arc::from(progress_mode.reporter());
            pool::run_batch(cfg, &top_dir, options, reporter).await?;
        }
    }

    Ok(())
}

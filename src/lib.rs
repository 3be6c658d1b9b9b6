//! # logtable
//!
//! Turns rotated application server logs into SQLite tables and derives
//! message-type statistics from them.
//!
//! logtable decodes each log line into a fixed-shape [`models::LogRecord`],
//! stores every source file as its own table, verifies that the files
//! partition time, and concatenates them into one consolidated table per
//! run. Loads are resumable: progress is persisted after every file.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐   ┌───────────┐
//! │ server.log* │──▶│  Decoder +   │──▶│ Batch Store   │──▶│ logs.sqlite│
//! │  (glob)     │   │  Ingester    │   │ temp/ + hist  │   └─────┬─────┘
//! └─────────────┘   └─────────────┘   └──────────────┘         │
//!                                                              ▼
//!                                                       ┌────────────┐
//!                                                       │ stats.sqlite│
//!                                                       └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! logtab load ABC-123-45678 --glob 'bugs/ABC-123-45678/server.log*'
//! logtab summary ABC-123-45678
//! logtab stats ABC-123-45678
//! logtab cleanup ABC-123-45678
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Pipeline error taxonomy |
//! | [`decode`] | Line decoder (simple and extra mode) |
//! | [`timestamps`] | Strictly increasing timestamp index |
//! | [`ingest`] | Per-file ingestion and the per-run cache |
//! | [`db`] | SQLite table storage |
//! | [`history`] | Persisted per-file ingestion history |
//! | [`aggregate`] | Cross-file ordering check and concatenation |
//! | [`batch`] | Resumable batch store |
//! | [`stats`] | Frequencies and correlations |
//! | [`summary`] | Run overview |
//! | [`show`] | Line search over raw files |
//! | [`pool`] | Cross-directory job pool |
//! | [`progress`] | Load progress on stderr |

pub mod aggregate;
pub mod batch;
pub mod config;
pub mod db;
pub mod decode;
pub mod error;
pub mod history;
pub mod ingest;
pub mod models;
pub mod pool;
pub mod progress;
pub mod show;
pub mod stats;
pub mod summary;
pub mod timestamps;

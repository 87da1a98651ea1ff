//! # autorepack Core Library
//!
//! Repacks loosely organized folder trees into standard archive containers.
//!
//! A run walks every folder directly under the given roots, labels what it finds,
//! decides per folder whether to compress, flatten, merge with an existing
//! archive or leave it alone, and then executes those decisions with a
//! write-verify-delete sequence that never loses a source file.
//!
//! ## Key Modules
//!
//! - [`classify`]: Labels single entries and whole subtrees.
//! - [`plan`]: Turns a classified subtree into an ordered [`plan::RepackPlan`].
//! - [`writer`]: Executes one action through an [`archive::ArchiveBackend`].
//! - [`orchestrator`]: Drives a whole run across roots and worker threads.
//! - [`archive`]: Container formats (`zip`, `cbz`, `tar.zst`, `tar.xz`).
//!
//! ## Examples
//!
//! ```no_run
//! use autorepack::{RepackConfig, RepackOrchestrator};
//! use std::path::PathBuf;
//!
//! let config = RepackConfig {
//!     merge_duplicates: true,
//!     ..RepackConfig::default()
//! };
//! let report = RepackOrchestrator::new(config)
//!     .run(&[PathBuf::from("/data/downloads")])
//!     .expect("bad configuration or plan");
//! println!("{} succeeded, {} failed", report.succeeded, report.failed);
//! ```

pub mod archive;
pub mod classify;
pub mod cli;
pub mod cli_runner;
pub mod common;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod writer;

pub use config::RepackConfig;
pub use error::RepackError;
pub use orchestrator::{CancellationToken, RepackOrchestrator, SummaryReport};

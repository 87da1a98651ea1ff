use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{concurrency_from_signed, parse_file_types, RepackConfig};
use crate::error::ConfigurationError;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log more (-v for progress of each action, -vv for classification details).
    /// `RUST_LOG` takes precedence when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Repack every folder found directly under the given roots.
    #[command(alias = "r")]
    Run {
        /// One or more root directories.
        #[arg(required = true)]
        roots: Vec<PathBuf>,

        #[command(flatten)]
        options: RepackOptions,

        /// Print the summary as JSON on stdout.
        #[arg(long)]
        json: bool,

        /// Show a live progress line on stderr.
        #[arg(long)]
        progress: bool,
    },

    /// Show what `run` would do without writing anything.
    #[command(alias = "p")]
    Plan {
        /// One or more root directories.
        #[arg(required = true)]
        roots: Vec<PathBuf>,

        #[command(flatten)]
        options: RepackOptions,

        /// Print the plans as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
}

/// Options shared by `run` and `plan`. Flags override the config file.
#[derive(clap::Args, Clone, Debug, Default)]
pub struct RepackOptions {
    /// JSON config file (camelCase keys, e.g. `{"compressionLevel": 7}`).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Compression level (0-9). Higher levels are smaller and slower. [default: 5]
    #[arg(long)]
    pub level: Option<u8>,

    /// Archive format: zip, cbz, tar.zst or tar.xz. [default: zip]
    #[arg(long)]
    pub format: Option<String>,

    /// Remove sources once their archive has been verified.
    #[arg(long)]
    pub delete_source: bool,

    /// Remove folders whose content already sits in a same-named sibling archive.
    #[arg(long)]
    pub merge_duplicates: bool,

    /// Remove folders that contain no files.
    #[arg(long)]
    pub cleanup_empty: bool,

    /// Number of folders processed at the same time. [default: number of CPUs]
    #[arg(long, allow_negative_numbers = true)]
    pub concurrency: Option<i64>,

    /// Write every archive into this directory instead of next to its folder.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Leave folders whose path contains this keyword alone, on top of the
    /// built-in list (node_modules, .git, cache, ...). Repeatable.
    #[arg(long = "blacklist", value_name = "KEYWORD")]
    pub blacklist: Vec<String>,

    /// Only pack files of these types, e.g. `image,document`. Other files stay put.
    #[arg(long, value_delimiter = ',', value_name = "TYPE")]
    pub types: Vec<String>,

    /// Leave groups with fewer files than this alone. [default: 1]
    #[arg(long)]
    pub min_count: Option<usize>,
}

impl RepackOptions {
    /// Builds the run configuration: defaults, then the config file, then flags.
    pub fn to_config(&self) -> Result<RepackConfig, ConfigurationError> {
        let mut config = match &self.config {
            Some(path) => RepackConfig::load(path)?,
            None => RepackConfig::default(),
        };
        if let Some(level) = self.level {
            config.compression_level = level;
        }
        if let Some(format) = &self.format {
            config.archive_format = format.parse()?;
        }
        if let Some(n) = self.concurrency {
            config.concurrency = concurrency_from_signed(n)?;
        }
        if self.output_dir.is_some() {
            config.output_dir = self.output_dir.clone();
        }
        config.delete_source_after_success |= self.delete_source;
        config.merge_duplicates |= self.merge_duplicates;
        config.cleanup_empty_folders |= self.cleanup_empty;
        config.blacklist.extend(self.blacklist.iter().cloned());
        if !self.types.is_empty() {
            config.target_file_types = parse_file_types(&self.types)?;
        }
        if let Some(n) = self.min_count {
            config.min_file_count = n;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Parses command-line arguments using `clap`.
///
/// Exits the process with clap's usage message on malformed arguments.
pub fn parse() -> Args {
    Args::parse()
}

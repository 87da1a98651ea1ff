//! Run configuration.
//!
//! A [`RepackConfig`] is built once by the caller (CLI flags layered over an
//! optional JSON file) and passed by reference to every stage. There is no
//! process-wide configuration state.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveFormat;
use crate::classify::FileType;
use crate::error::ConfigurationError;

/// A middle ground between speed and size.
pub const DEFAULT_COMPRESSION_LEVEL: u8 = 5;
pub const MAX_COMPRESSION_LEVEL: u8 = 9;

/// Folders that are tool or cache output rather than user content.
pub const DEFAULT_BLACKLIST: &[&str] = &[
    "node_modules",
    "__pycache__",
    ".git",
    ".svn",
    "tmp",
    "temp",
    "cache",
    "logs",
    ".vscode",
    ".idea",
    ".vs",
];

/// Bounded retry for transient I/O failures while compressing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Holds all options for a repack run.
#[derive(Debug, Clone, PartialEq)]
pub struct RepackConfig {
    /// 0 (fastest) to 9 (smallest).
    pub compression_level: u8,
    pub archive_format: ArchiveFormat,
    pub delete_source_after_success: bool,
    /// Consolidate folders that duplicate a sibling archive instead of skipping them.
    pub merge_duplicates: bool,
    pub cleanup_empty_folders: bool,
    /// Number of subtrees processed at the same time.
    pub concurrency: usize,
    /// Put every produced archive here instead of next to its folder.
    pub output_dir: Option<PathBuf>,
    /// Folders whose path below the root contains one of these keywords
    /// (ignoring case) are left alone.
    pub blacklist: Vec<String>,
    /// Only files of these types are packed. Empty means every file.
    pub target_file_types: Vec<FileType>,
    /// Groups with fewer packable files than this are skipped.
    pub min_file_count: usize,
    pub retry: RetryPolicy,
}

impl Default for RepackConfig {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            archive_format: ArchiveFormat::default(),
            delete_source_after_success: false,
            merge_duplicates: false,
            cleanup_empty_folders: false,
            concurrency: num_cpus::get().max(1),
            output_dir: None,
            blacklist: DEFAULT_BLACKLIST.iter().map(|w| w.to_string()).collect(),
            target_file_types: Vec::new(),
            min_file_count: 1,
            retry: RetryPolicy::default(),
        }
    }
}

/// On-disk form of the configuration. Every key is optional; missing keys keep
/// their defaults.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ConfigFile {
    pub compression_level: Option<u8>,
    pub archive_format: Option<String>,
    pub delete_source_after_success: Option<bool>,
    pub merge_duplicates: Option<bool>,
    pub cleanup_empty_folders: Option<bool>,
    pub concurrency: Option<i64>,
    pub output_dir: Option<PathBuf>,
    pub blacklist: Option<Vec<String>>,
    pub target_file_types: Option<Vec<String>>,
    pub min_file_count: Option<usize>,
    pub retry: Option<RetryPolicy>,
}

impl RepackConfig {
    /// Reads a JSON config file and layers it over the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ConfigFile =
            serde_json::from_str(&raw).map_err(|source| ConfigurationError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let mut config = Self::default();
        config.apply(file)?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides the fields present in `file`.
    pub fn apply(&mut self, file: ConfigFile) -> Result<(), ConfigurationError> {
        if let Some(level) = file.compression_level {
            self.compression_level = level;
        }
        if let Some(format) = file.archive_format {
            self.archive_format = format.parse()?;
        }
        if let Some(v) = file.delete_source_after_success {
            self.delete_source_after_success = v;
        }
        if let Some(v) = file.merge_duplicates {
            self.merge_duplicates = v;
        }
        if let Some(v) = file.cleanup_empty_folders {
            self.cleanup_empty_folders = v;
        }
        if let Some(n) = file.concurrency {
            self.concurrency = concurrency_from_signed(n)?;
        }
        if file.output_dir.is_some() {
            self.output_dir = file.output_dir;
        }
        if let Some(words) = file.blacklist {
            self.blacklist = words;
        }
        if let Some(types) = file.target_file_types {
            self.target_file_types = parse_file_types(&types)?;
        }
        if let Some(n) = file.min_file_count {
            self.min_file_count = n;
        }
        if let Some(retry) = file.retry {
            self.retry = retry;
        }
        Ok(())
    }

    /// Rejects values no stage can work with. Called before any work starts.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.compression_level > MAX_COMPRESSION_LEVEL {
            return Err(ConfigurationError::InvalidLevel(self.compression_level));
        }
        if self.concurrency == 0 {
            return Err(ConfigurationError::InvalidConcurrency(0));
        }
        if self.min_file_count == 0 {
            return Err(ConfigurationError::InvalidMinFileCount);
        }
        if self.retry.attempts == 0 {
            return Err(ConfigurationError::InvalidRetry);
        }
        if let Some(dir) = &self.output_dir {
            if !dir.is_dir() {
                return Err(ConfigurationError::InvalidOutputDir(dir.clone()));
            }
        }
        Ok(())
    }

    /// True if `path` contains one of the blacklist keywords, ignoring case.
    pub fn is_blacklisted(&self, path: &str) -> bool {
        let path = path.to_lowercase();
        self.blacklist
            .iter()
            .any(|word| !word.is_empty() && path.contains(&word.to_lowercase()))
    }

    /// Whether `path` is one of the targeted file types.
    pub fn is_targeted(&self, path: &Path) -> bool {
        self.target_file_types.is_empty()
            || FileType::of(path).is_some_and(|t| self.target_file_types.contains(&t))
    }
}

/// Parses type names, dropping duplicates but keeping the given order.
pub fn parse_file_types<S: AsRef<str>>(names: &[S]) -> Result<Vec<FileType>, ConfigurationError> {
    let mut types = Vec::new();
    for name in names {
        let t: FileType = name.as_ref().parse()?;
        if !types.contains(&t) {
            types.push(t);
        }
    }
    Ok(types)
}

pub fn concurrency_from_signed(n: i64) -> Result<usize, ConfigurationError> {
    if n < 1 {
        return Err(ConfigurationError::InvalidConcurrency(n));
    }
    usize::try_from(n).map_err(|_| ConfigurationError::InvalidConcurrency(n))
}

use std::io;
use std::path::PathBuf;

use crate::common::ArchiveManifest;

/// Errors that abort a whole run. Everything else is contained per action and
/// only shows up in the [`SummaryReport`](crate::orchestrator::SummaryReport).
#[derive(Debug, thiserror::Error)]
pub enum RepackError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Planning(#[from] PlanningError),
}

/// An entry disappeared or became unreadable while the tree was being scanned.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("entry vanished during scan: '{}'", path.display())]
    Vanished { path: PathBuf },

    #[error("cannot read '{}': {source}", path.display())]
    Unreadable { path: PathBuf, source: io::Error },

    #[error("'{}' is a symbolic link leading outside its root", path.display())]
    OutsideRoot { path: PathBuf },
}

impl ClassificationError {
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            ClassificationError::Vanished { path }
        } else {
            ClassificationError::Unreadable { path, source }
        }
    }

    pub fn path(&self) -> &PathBuf {
        match self {
            ClassificationError::Vanished { path } => path,
            ClassificationError::Unreadable { path, .. } => path,
            ClassificationError::OutsideRoot { path } => path,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    /// A source entry was claimed by more than one action.
    #[error("'{}' is claimed by more than one action", path.display())]
    PartitionViolation { path: PathBuf },

    /// Two actions resolved to the same archive path.
    #[error("destination '{}' is targeted by more than one action", path.display())]
    DestinationConflict { path: PathBuf },

    #[error("symbolic link cycle detected at '{}'", path.display())]
    SymlinkCycle { path: PathBuf },

    #[error("cannot plan '{}': {reason}", path.display())]
    InvalidTree { path: PathBuf, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("destination '{}' already exists, refusing to overwrite", path.display())]
    DestinationExists { path: PathBuf },

    #[error("source '{}' is missing", path.display())]
    SourceMissing { path: PathBuf },

    #[error("archiver failed on '{}': {source}", destination.display())]
    Backend { destination: PathBuf, source: io::Error },

    #[error("archiver failed on '{}' after {attempts} attempts: {source}", destination.display())]
    RetriesExhausted {
        destination: PathBuf,
        attempts: u32,
        source: io::Error,
    },

    #[error("cannot remove source '{}': {source}", path.display())]
    Cleanup { path: PathBuf, source: io::Error },

    #[error("refusing to delete '{}' through symbolic link '{}'", path.display(), link.display())]
    LinkedSource { path: PathBuf, link: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error(
        "archive '{}' does not match its sources: expected {} members / {} bytes, found {} members / {} bytes",
        path.display(),
        expected.member_count,
        expected.total_size,
        actual.member_count,
        actual.total_size
    )]
    Mismatch {
        path: PathBuf,
        expected: ArchiveManifest,
        actual: ArchiveManifest,
    },

    #[error("cannot inspect archive '{}': {source}", path.display())]
    Unreadable { path: PathBuf, source: io::Error },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("compression level {0} is out of range (0-9)")]
    InvalidLevel(u8),

    #[error("unsupported archive format '{0}'")]
    UnsupportedFormat(String),

    #[error("concurrency must be at least 1, got {0}")]
    InvalidConcurrency(i64),

    #[error("unknown file type '{0}' (expected one of text, image, video, audio, document, archive, code, font, executable, model)")]
    UnknownFileType(String),

    #[error("minimum file count must be at least 1")]
    InvalidMinFileCount,

    #[error("retry attempts must be at least 1")]
    InvalidRetry,

    #[error("no root paths were supplied")]
    NoRoots,

    #[error("root path '{}' {reason}", path.display())]
    InvalidRoot { path: PathBuf, reason: &'static str },

    #[error("output directory '{}' is not a directory", .0.display())]
    InvalidOutputDir(PathBuf),

    #[error("cannot read config file '{}': {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("malformed config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Failure of a single action. Contained by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

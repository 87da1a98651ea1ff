//! Common utilities and types module.
// Shared structs used by the classifier, planner and writer.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::error::ClassificationError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    /// Sockets, fifos, dangling links and anything else we do not repack.
    Other,
}

/// Snapshot of a single filesystem node, taken when it was classified.
///
/// Never mutated: if the filesystem may have changed, take a new snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub modified_time: u64, // Unix timestamp
}

impl Entry {
    /// Reads the metadata of `path`, following symbolic links.
    pub fn snapshot(path: &Path) -> Result<Self, ClassificationError> {
        let meta = fs::metadata(path).map_err(|e| ClassificationError::from_io(path, e))?;
        Ok(Self::from_metadata(path.to_path_buf(), &meta))
    }

    pub(crate) fn from_metadata(path: PathBuf, meta: &fs::Metadata) -> Self {
        let kind = if meta.is_file() {
            EntryKind::File
        } else if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::Other
        };
        let modified_time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            path,
            kind,
            size: if kind == EntryKind::File { meta.len() } else { 0 },
            modified_time,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Final path component as a lossy string, or the whole path if there is none.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// What an archive holds, as far as verification cares.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveManifest {
    pub member_count: u64,
    pub total_size: u64,
}

impl ArchiveManifest {
    /// Expected manifest of an archive built from `sources`.
    pub fn of_entries<'a>(sources: impl IntoIterator<Item = &'a Entry>) -> Self {
        sources
            .into_iter()
            .filter(|e| e.is_file())
            .fold(Self::default(), |acc, e| Self {
                member_count: acc.member_count + 1,
                total_size: acc.total_size + e.size,
            })
    }
}

/// Archive member name for `path` relative to `base`, always `/`-separated.
pub fn member_name(path: &Path, base: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

//! Labels single filesystem entries.
//!
//! Directory labels depend only on the directory's [`DirShape`] and on whether a
//! sibling archive with the same stem exists, so [`PathClassifier::classify`]
//! and [`ClassifiedTree::scan`] always agree on unchanged state.

mod file_type;
mod tree;

pub use file_type::FileType;
pub use tree::{ClassifiedTree, NodeId, TreeNode};

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::common::{Entry, EntryKind};
use crate::error::ClassificationError;

/// Suffixes of already-compressed containers, longest first so that
/// `photos.tar.zst` strips to `photos` and not `photos.tar`.
const CONTAINER_SUFFIXES: &[&str] = &[
    ".tar.zst", ".tar.bz2", ".tar.gz", ".tar.xz", ".tzst", ".zip", ".cbz", ".cbr", ".rar",
    ".tar", ".tgz", ".txz", ".bz2", ".zst", ".7z", ".gz", ".xz",
];

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "label", rename_all = "snake_case")]
pub enum Classification {
    /// A plain file. `container` is set for archives, which are never recompressed.
    SingleFile { container: bool },
    /// No files anywhere below.
    EmptyFolder,
    /// Only files, no subdirectories.
    FlatFolder,
    /// Exactly one subdirectory and no files: a redundant wrapper.
    NestedSingleFolder,
    /// An archive with the same stem sits next to this folder.
    ArchiveLike { sibling: PathBuf },
    /// Loose files next to subdirectories, or several subdirectories.
    MixedFolder,
    /// Unreadable or not a regular file/directory.
    Unknown,
}

/// Immediate contents of a directory plus its recursive file count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirShape {
    pub files: usize,
    pub dirs: usize,
    pub containers: usize,
    pub descendant_files: u64,
}

/// Stateless classifier. No side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathClassifier;

impl PathClassifier {
    /// Classifies `entry` by reading the filesystem below it.
    pub fn classify(&self, entry: &Entry) -> Result<Classification, ClassificationError> {
        match entry.kind {
            EntryKind::File => Ok(Classification::SingleFile {
                container: is_container_path(&entry.path),
            }),
            EntryKind::Other => Ok(Classification::Unknown),
            EntryKind::Directory => {
                let shape = self.read_shape(&entry.path)?;
                Ok(self.classify_dir(&entry.path, &shape))
            }
        }
    }

    /// Decides the label of a directory from its shape.
    pub fn classify_dir(&self, path: &Path, shape: &DirShape) -> Classification {
        if shape.descendant_files == 0 {
            return Classification::EmptyFolder;
        }
        if let Some(sibling) = find_sibling_archive(path) {
            return Classification::ArchiveLike { sibling };
        }
        match (shape.files, shape.dirs) {
            (_, 0) => Classification::FlatFolder,
            (0, 1) => Classification::NestedSingleFolder,
            _ => Classification::MixedFolder,
        }
    }

    fn read_shape(&self, dir: &Path) -> Result<DirShape, ClassificationError> {
        let mut shape = DirShape::default();
        let listing = fs::read_dir(dir).map_err(|e| ClassificationError::from_io(dir, e))?;
        for child in listing {
            let child = child.map_err(|e| ClassificationError::from_io(dir, e))?;
            let path = child.path();
            // Follow links; a dangling one counts as neither file nor folder.
            let Ok(meta) = fs::metadata(&path) else { continue };
            if meta.is_dir() {
                shape.dirs += 1;
            } else if meta.is_file() {
                shape.files += 1;
                if is_container_path(&path) {
                    shape.containers += 1;
                }
            }
        }
        shape.descendant_files = WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count() as u64;
        Ok(shape)
    }
}

/// True for file names that end in a known archive suffix.
pub fn is_container_path(path: &Path) -> bool {
    path.file_name()
        .map(|n| strip_container_suffix(&n.to_string_lossy()).is_some())
        .unwrap_or(false)
}

/// `photos.tar.zst` -> `photos`. `None` if the name has no container suffix.
pub fn strip_container_suffix(name: &str) -> Option<&str> {
    CONTAINER_SUFFIXES.iter().find_map(|suffix| {
        let cut = name.len().checked_sub(suffix.len())?;
        if cut == 0 || !name.is_char_boundary(cut) {
            return None;
        }
        name[cut..]
            .eq_ignore_ascii_case(suffix)
            .then(|| &name[..cut])
    })
}

/// Looks for `<parent>/<dir name>.<archive ext>`.
pub fn find_sibling_archive(dir: &Path) -> Option<PathBuf> {
    let name = dir.file_name()?.to_string_lossy().into_owned();
    find_archive_in(dir.parent()?, &name)
}

/// First archive in `dir` whose name minus its container suffix is `stem`.
/// Picks by name so the result is stable.
pub fn find_archive_in(dir: &Path, stem: &str) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| {
            let file_name = e.file_name();
            let file_name = file_name.to_string_lossy();
            strip_container_suffix(&file_name) == Some(stem)
        })
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

//! Collision-safe archive destinations.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::archive::ArchiveFormat;

/// Upper bound on `name (n).ext` attempts before giving up on a directory.
const MAX_SUFFIX: u32 = 10_000;

/// Destinations already handed out during one run.
///
/// Shared by every plan of a run; together with the on-disk check this means two
/// actions never target the same path.
#[derive(Debug, Default)]
pub struct Reservations {
    taken: HashSet<PathBuf>,
}

impl Reservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks `dir/stem.ext`, or the first free `dir/stem (n).ext`, and reserves it.
    ///
    /// Returns `None` only when every suffix up to the bound is taken.
    pub fn reserve(&mut self, dir: &Path, stem: &str, format: ArchiveFormat) -> Option<PathBuf> {
        let candidate = (0..=MAX_SUFFIX)
            .map(|n| dir.join(disambiguate(stem, format, n)))
            .find(|path| !self.taken.contains(path) && !path.exists())?;
        self.taken.insert(candidate.clone());
        Some(candidate)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.taken.contains(path)
    }

    pub fn len(&self) -> usize {
        self.taken.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taken.is_empty()
    }
}

/// File name for attempt `n`: `stem.ext` for 0, `stem (n).ext` after that.
pub fn disambiguate(stem: &str, format: ArchiveFormat, n: u32) -> String {
    let ext = format.extension();
    if n == 0 {
        format!("{stem}.{ext}")
    } else {
        format!("{stem} ({n}).{ext}")
    }
}

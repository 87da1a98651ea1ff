//! Executes planned actions against an [`ArchiveBackend`].
//!
//! Every action is write, verify, then (optionally) delete. Sources are only
//! touched after the produced archive has been re-opened and its manifest
//! matched, so a failure at any step leaves at worst a source and an archive
//! side by side.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveBackend, CompressJob};
use crate::common::{ArchiveManifest, Entry};
use crate::config::RepackConfig;
use crate::error::{ActionError, ClassificationError, CompressionError, IntegrityError};
use crate::plan::{ActionKind, RepackAction};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RepackStatus {
    Success,
    Failed,
    Skipped,
}

/// Outcome of one action.
#[derive(Serialize, Debug, Clone)]
pub struct RepackResult {
    /// Root of the plan the action belongs to.
    pub unit: PathBuf,
    pub action_id: usize,
    pub kind: ActionKind,
    pub root: PathBuf,
    pub destination: Option<PathBuf>,
    pub status: RepackStatus,
    /// Error message for failures; reason for skips that were not planned.
    pub error: Option<String>,
    /// Source bytes consumed by a successful action.
    pub bytes_processed: u64,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

impl RepackResult {
    fn new(unit: &Path, action: &RepackAction, status: RepackStatus) -> Self {
        Self {
            unit: unit.to_path_buf(),
            action_id: action.id,
            kind: action.kind.clone(),
            root: action.root.path.clone(),
            destination: action.destination.clone(),
            status,
            error: None,
            bytes_processed: 0,
            bytes_written: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Result for an action that never started because the run was cancelled.
    pub fn cancelled(unit: &Path, action: &RepackAction) -> Self {
        Self {
            error: Some("run cancelled".into()),
            ..Self::new(unit, action, RepackStatus::Skipped)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RepackStatus::Success
    }
}

/// What a successful action produced.
struct Written {
    bytes_processed: u64,
    bytes_written: u64,
}

pub struct ArchiveWriter<'a> {
    backend: &'a dyn ArchiveBackend,
    config: &'a RepackConfig,
}

impl<'a> ArchiveWriter<'a> {
    pub fn new(backend: &'a dyn ArchiveBackend, config: &'a RepackConfig) -> Self {
        Self { backend, config }
    }

    /// Runs `action` to completion. Never panics and never returns early on
    /// failure: every problem ends up in the result.
    pub fn execute(&self, unit: &Path, action: &RepackAction) -> RepackResult {
        let started = Instant::now();
        let outcome = match &action.kind {
            ActionKind::Skip(reason) => {
                debug!(root = %action.root.path.display(), ?reason, "skipping");
                return RepackResult::new(unit, action, RepackStatus::Skipped);
            }
            ActionKind::CompressAsIs | ActionKind::Flatten | ActionKind::Selective => {
                self.compress_sequence(action)
            }
            ActionKind::Merge { sibling } => self.merge(action, sibling),
        };

        let mut result = match outcome {
            Ok(written) => {
                info!(
                    root = %action.root.path.display(),
                    destination = ?action.destination,
                    bytes = written.bytes_written,
                    "action succeeded"
                );
                RepackResult {
                    bytes_processed: written.bytes_processed,
                    bytes_written: written.bytes_written,
                    ..RepackResult::new(unit, action, RepackStatus::Success)
                }
            }
            Err(err) => {
                warn!(root = %action.root.path.display(), error = %err, "action failed");
                RepackResult {
                    error: Some(err.to_string()),
                    ..RepackResult::new(unit, action, RepackStatus::Failed)
                }
            }
        };
        result.elapsed = started.elapsed();
        result
    }

    /// Compress, verify, then delete the sources if configured.
    fn compress_sequence(&self, action: &RepackAction) -> Result<Written, ActionError> {
        let destination = action.destination.as_deref().ok_or_else(|| CompressionError::Backend {
            destination: action.root.path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "action has no destination"),
        })?;
        if destination.exists() {
            return Err(CompressionError::DestinationExists {
                path: destination.to_path_buf(),
            }
            .into());
        }

        let fresh = resnapshot(action)?;
        let expected = ArchiveManifest::of_entries(&fresh);
        let paths: Vec<PathBuf> = fresh.iter().map(|e| e.path.clone()).collect();
        let job = CompressJob {
            sources: &paths,
            base_dir: &action.base_dir,
            destination,
            level: self.config.compression_level,
            format: self.config.archive_format,
        };

        let bytes_written = self.compress_with_retry(&job)?;
        self.verify(destination, expected)?;

        if self.config.delete_source_after_success {
            delete_sources(action, &fresh)?;
        }
        Ok(Written {
            bytes_processed: expected.total_size,
            bytes_written,
        })
    }

    /// Drops the loose folder if the sibling archive already holds the same
    /// content, otherwise repacks it like any other folder.
    fn merge(&self, action: &RepackAction, sibling: &Path) -> Result<Written, ActionError> {
        let fresh = resnapshot(action)?;
        let expected = ArchiveManifest::of_entries(&fresh);

        match self.backend.inspect(sibling) {
            Ok(found) if found == expected => {
                info!(
                    folder = %action.root.path.display(),
                    sibling = %sibling.display(),
                    "sibling archive holds the same content, removing folder"
                );
                delete_sources(action, &fresh)?;
                Ok(Written {
                    bytes_processed: expected.total_size,
                    bytes_written: 0,
                })
            }
            Ok(found) => {
                info!(
                    folder = %action.root.path.display(),
                    ?expected,
                    ?found,
                    "sibling archive differs, repacking folder separately"
                );
                self.compress_sequence(action)
            }
            Err(e) => {
                warn!(sibling = %sibling.display(), error = %e, "cannot inspect sibling archive");
                self.compress_sequence(action)
            }
        }
    }

    fn compress_with_retry(&self, job: &CompressJob<'_>) -> Result<u64, CompressionError> {
        let retry = self.config.retry;
        let mut attempt = 1;
        loop {
            match self.backend.compress(job) {
                Ok(written) => return Ok(written),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(CompressionError::DestinationExists {
                        path: job.destination.to_path_buf(),
                    })
                }
                Err(e) if is_transient(&e) && attempt < retry.attempts => {
                    let delay = retry.delay(attempt);
                    warn!(
                        destination = %job.destination.display(),
                        attempt,
                        error = %e,
                        "transient failure, retrying in {:?}",
                        delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) if is_transient(&e) => {
                    return Err(CompressionError::RetriesExhausted {
                        destination: job.destination.to_path_buf(),
                        attempts: attempt,
                        source: e,
                    })
                }
                Err(e) => {
                    return Err(CompressionError::Backend {
                        destination: job.destination.to_path_buf(),
                        source: e,
                    })
                }
            }
        }
    }

    /// Re-opens the archive; on any mismatch the archive is removed.
    fn verify(&self, archive_path: &Path, expected: ArchiveManifest) -> Result<(), IntegrityError> {
        let err = match self.backend.inspect(archive_path) {
            Ok(actual) if actual == expected => return Ok(()),
            Ok(actual) => IntegrityError::Mismatch {
                path: archive_path.to_path_buf(),
                expected,
                actual,
            },
            Err(source) => IntegrityError::Unreadable {
                path: archive_path.to_path_buf(),
                source,
            },
        };
        if let Err(e) = archive::discard(archive_path) {
            warn!(path = %archive_path.display(), error = %e, "cannot remove unverified archive");
        }
        Err(err)
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::PermissionDenied
    )
}

/// Fresh snapshots of the action's sources; the plan may be stale.
fn resnapshot(action: &RepackAction) -> Result<Vec<Entry>, ActionError> {
    action
        .sources
        .iter()
        .map(|src| match Entry::snapshot(&src.path) {
            Ok(entry) => Ok(entry),
            Err(ClassificationError::Vanished { path }) => {
                Err(CompressionError::SourceMissing { path }.into())
            }
            Err(e) => Err(e.into()),
        })
        .collect()
}

/// Removes the sources, then any folder the removal left empty, up to and
/// including the action root when the action owns the whole folder.
///
/// Nothing is removed if any source sits below a symbolic link to a directory.
fn delete_sources(action: &RepackAction, sources: &[Entry]) -> Result<(), CompressionError> {
    let root = action.root.path.as_path();
    for entry in sources {
        if let Some(link) = linked_ancestor(root, &entry.path) {
            return Err(CompressionError::LinkedSource {
                path: entry.path.clone(),
                link,
            });
        }
    }

    for entry in sources {
        match fs::remove_file(&entry.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CompressionError::Cleanup {
                    path: entry.path.clone(),
                    source,
                })
            }
        }
    }
    if !action.owns_root {
        return Ok(());
    }

    let parents: BTreeSet<&Path> = sources
        .iter()
        .filter_map(|e| e.path.parent())
        .filter(|p| p.starts_with(root))
        .collect();
    // Reverse order visits children before their parents.
    for dir in parents.into_iter().rev() {
        let mut current = Some(dir);
        while let Some(d) = current.filter(|d| d.starts_with(root)) {
            if fs::remove_dir(d).is_err() {
                break;
            }
            debug!(path = %d.display(), "removed emptied folder");
            current = d.parent();
        }
    }
    Ok(())
}

/// First directory below `root` on the way to `path` that is a symbolic link.
fn linked_ancestor(root: &Path, path: &Path) -> Option<PathBuf> {
    path.parent()?
        .ancestors()
        .take_while(|dir| *dir != root && dir.starts_with(root))
        .find(|dir| {
            fs::symlink_metadata(dir)
                .map(|meta| meta.file_type().is_symlink())
                .unwrap_or(false)
        })
        .map(Path::to_path_buf)
}

//! Drives classify, plan and write over a set of roots.
//!
//! Every immediate subfolder of a root is an independent unit. Units are
//! classified in parallel, planned one after the other (so destination
//! suffixes come out the same on every run) and executed in parallel on a
//! dedicated rayon pool. Actions inside one plan always run in plan order.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::archive::{ArchiveBackend, NativeBackend};
use crate::classify::{ClassifiedTree, PathClassifier};
use crate::common::Entry;
use crate::config::RepackConfig;
use crate::error::{ClassificationError, ConfigurationError, RepackError};
use crate::plan::{check_partition, PlanScope, RepackPlan, RepackPlanner};
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::writer::{ArchiveWriter, RepackResult, RepackStatus};

/// Run-level stop signal, observed before each action starts.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a caller needs to render the outcome of a run.
#[derive(Serialize, Debug, Clone)]
pub struct SummaryReport {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Source bytes consumed by successful actions.
    pub bytes_processed: u64,
    pub bytes_written: u64,
    pub cancelled: bool,
    /// Entries left out of the plan because they could not be read.
    pub classification_errors: Vec<String>,
    pub removed_empty_dirs: Vec<PathBuf>,
    /// Ordered by unit, then by position in the unit's plan.
    pub results: Vec<RepackResult>,
}

impl SummaryReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// Plans produced without executing anything.
#[derive(Serialize, Debug, Clone)]
pub struct PlannedRun {
    pub plans: Vec<RepackPlan>,
    pub classification_errors: Vec<String>,
}

impl PlannedRun {
    pub fn action_count(&self) -> usize {
        self.plans.iter().map(|p| p.actions.len()).sum()
    }
}

#[derive(Default)]
struct SummaryAggregator {
    results: Vec<RepackResult>,
    succeeded: usize,
    failed: usize,
    skipped: usize,
    bytes_processed: u64,
    bytes_written: u64,
    cancelled: bool,
    removed_empty_dirs: Vec<PathBuf>,
}

impl SummaryAggregator {
    fn record(&mut self, result: RepackResult) {
        match result.status {
            RepackStatus::Success => self.succeeded += 1,
            RepackStatus::Failed => self.failed += 1,
            RepackStatus::Skipped => self.skipped += 1,
        }
        self.bytes_processed += result.bytes_processed;
        self.bytes_written += result.bytes_written;
        self.results.push(result);
    }

    fn into_report(
        mut self,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        classification_errors: Vec<String>,
    ) -> SummaryReport {
        self.results
            .sort_by(|a, b| a.unit.cmp(&b.unit).then(a.action_id.cmp(&b.action_id)));
        self.removed_empty_dirs.sort();
        SummaryReport {
            started_at,
            elapsed,
            succeeded: self.succeeded,
            failed: self.failed,
            skipped: self.skipped,
            bytes_processed: self.bytes_processed,
            bytes_written: self.bytes_written,
            cancelled: self.cancelled,
            classification_errors,
            removed_empty_dirs: self.removed_empty_dirs,
            results: self.results,
        }
    }
}

/// What one root contributes before classification.
struct RootListing {
    root: Entry,
    canonical: PathBuf,
    loose_files: Vec<Entry>,
    units: Vec<PathBuf>,
    issues: Vec<ClassificationError>,
}

pub struct RepackOrchestrator {
    config: RepackConfig,
    backend: Box<dyn ArchiveBackend>,
    cancel: CancellationToken,
    progress: Option<Arc<ProgressCallback>>,
}

impl RepackOrchestrator {
    pub fn new(config: RepackConfig) -> Self {
        Self {
            config,
            backend: Box::new(NativeBackend),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_backend(mut self, backend: impl ArchiveBackend + 'static) -> Self {
        self.backend = Box::new(backend);
        self
    }

    pub fn with_progress(mut self, callback: Arc<ProgressCallback>) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RepackConfig {
        &self.config
    }

    /// Classifies and plans `roots` without writing anything.
    pub fn plan_only(&self, roots: &[PathBuf]) -> Result<PlannedRun, RepackError> {
        let pool = self.build_pool();
        self.prepare(roots, pool.as_ref())
    }

    /// Repacks every unit under `roots`.
    ///
    /// Configuration and planning problems abort before any write. Everything
    /// else is recorded per action and the run carries on.
    pub fn run(&self, roots: &[PathBuf]) -> Result<SummaryReport, RepackError> {
        let started_at = Utc::now();
        let started = Instant::now();
        info!(roots = roots.len(), concurrency = self.config.concurrency, "starting repack run");

        let pool = self.build_pool();
        let planned = self.prepare(roots, pool.as_ref())?;

        let tracker = ProgressTracker::new(self.progress.clone());
        tracker.plan_ready(planned.plans.len(), planned.action_count());

        let aggregator = Mutex::new(SummaryAggregator::default());
        let writer = ArchiveWriter::new(self.backend.as_ref(), &self.config);
        let execute = || {
            planned
                .plans
                .par_iter()
                .for_each(|plan| self.execute_plan(&writer, plan, &aggregator, &tracker));
        };
        match &pool {
            Some(pool) => pool.install(execute),
            None => execute(),
        }
        tracker.finish();

        let aggregator = aggregator.into_inner().unwrap_or_else(PoisonError::into_inner);
        let report = aggregator.into_report(started_at, started.elapsed(), planned.classification_errors);
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "repack run finished"
        );
        Ok(report)
    }

    fn build_pool(&self) -> Option<ThreadPool> {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.concurrency)
            .thread_name(|i| format!("autorepack-{i}"))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!(error = %e, "cannot build worker pool, using the global one");
                None
            }
        }
    }

    fn prepare(&self, roots: &[PathBuf], pool: Option<&ThreadPool>) -> Result<PlannedRun, RepackError> {
        self.config.validate().map_err(fatal)?;
        if roots.is_empty() {
            return Err(fatal(ConfigurationError::NoRoots));
        }
        let listings = list_roots(roots).map_err(fatal)?;

        // Classification is read-only, so units can be scanned in any order.
        let units: Vec<&PathBuf> = listings.iter().flat_map(|l| l.units.iter()).collect();
        let scan = || {
            units
                .par_iter()
                .map(|unit| ClassifiedTree::scan(unit, &PathClassifier))
                .collect::<Vec<_>>()
        };
        let mut scanned = match pool {
            Some(pool) => pool.install(scan),
            None => scan(),
        }
        .into_iter();

        let planner = RepackPlanner::new(&self.config);
        let mut scope = PlanScope::new();
        let mut plans = Vec::new();
        let mut classification_errors = Vec::new();

        for listing in &listings {
            for issue in &listing.issues {
                warn!(error = %issue, "entry left out of the plan");
                classification_errors.push(issue.to_string());
            }
            if !listing.loose_files.is_empty() {
                let plan = planner
                    .plan_loose_files(&listing.root, listing.loose_files.clone(), &mut scope)
                    .map_err(fatal)?;
                plans.push(plan);
            }
            for unit in &listing.units {
                let tree = match scanned.next() {
                    Some(Ok(tree)) => tree,
                    Some(Err(e)) => {
                        warn!(unit = %unit.display(), error = %e, "unit skipped");
                        classification_errors.push(e.to_string());
                        continue;
                    }
                    None => break,
                };
                for issue in tree.issues() {
                    warn!(error = %issue, "entry left out of the plan");
                    classification_errors.push(issue.to_string());
                }
                let plan = planner.plan(&tree, &mut scope).map_err(fatal)?;
                if !plan.is_empty() {
                    plans.push(plan);
                }
            }
        }

        // Each plan is disjoint on its own; this covers files reached from two units.
        check_partition(plans.iter().flat_map(|p| p.actions.iter())).map_err(fatal)?;
        debug!(plans = plans.len(), "planning complete");
        Ok(PlannedRun {
            plans,
            classification_errors,
        })
    }

    fn execute_plan(
        &self,
        writer: &ArchiveWriter<'_>,
        plan: &RepackPlan,
        aggregator: &Mutex<SummaryAggregator>,
        tracker: &ProgressTracker,
    ) {
        let mut cancelled = false;
        for action in &plan.actions {
            let result = if self.cancel.is_cancelled() {
                cancelled = true;
                RepackResult::cancelled(&plan.root, action)
            } else {
                tracker.action_started(&plan.root, action.id, &action.root.path, &action.kind);
                writer.execute(&plan.root, action)
            };
            tracker.action_finished(&result);
            let mut agg = aggregator.lock().unwrap_or_else(PoisonError::into_inner);
            agg.cancelled |= cancelled;
            agg.record(result);
        }

        // Empty folders go last so nothing still being merged disappears.
        if cancelled || self.cancel.is_cancelled() {
            return;
        }
        let removed: Vec<PathBuf> = plan.cleanup.iter().flat_map(|dir| remove_empty_tree(dir)).collect();
        if !removed.is_empty() {
            let mut agg = aggregator.lock().unwrap_or_else(PoisonError::into_inner);
            agg.removed_empty_dirs.extend(removed);
        }
    }
}

fn fatal(err: impl Into<RepackError>) -> RepackError {
    let err = err.into();
    error!(error = %err, "repack run aborted");
    err
}

/// Lists every root, dropping exact duplicates and rejecting roots nested in
/// one another.
fn list_roots(roots: &[PathBuf]) -> Result<Vec<RootListing>, ConfigurationError> {
    let mut listings: Vec<RootListing> = Vec::new();
    for root in roots {
        let listing = list_root(root)?;
        if listings.iter().any(|l| l.canonical == listing.canonical) {
            warn!(root = %root.display(), "root given more than once, ignoring repeat");
            continue;
        }
        let overlaps = listings.iter().any(|l| {
            l.canonical.starts_with(&listing.canonical) || listing.canonical.starts_with(&l.canonical)
        });
        if overlaps {
            return Err(ConfigurationError::InvalidRoot {
                path: root.clone(),
                reason: "overlaps another root",
            });
        }
        listings.push(listing);
    }
    Ok(listings)
}

/// Splits a root into its loose files and its subfolders, both in name order.
/// Links leading outside the root are left out and reported. Links staying
/// inside it are aliases and are left out silently.
fn list_root(root: &Path) -> Result<RootListing, ConfigurationError> {
    let invalid = |reason| ConfigurationError::InvalidRoot {
        path: root.to_path_buf(),
        reason,
    };
    let entry = Entry::snapshot(root).map_err(|_| invalid("does not exist"))?;
    if !entry.is_dir() {
        return Err(invalid("is not a directory"));
    }
    let canonical = fs::canonicalize(root).map_err(|_| invalid("cannot be read"))?;

    let mut children: Vec<PathBuf> = fs::read_dir(root)
        .map_err(|_| invalid("cannot be read"))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    children.sort();

    let mut loose_files = Vec::new();
    let mut units = Vec::new();
    let mut issues = Vec::new();
    for child in children {
        if fs::symlink_metadata(&child).is_ok_and(|m| m.file_type().is_symlink()) {
            match fs::canonicalize(&child) {
                Ok(target) if !target.starts_with(&canonical) => {
                    issues.push(ClassificationError::OutsideRoot { path: child });
                    continue;
                }
                // Its target is planned under its own path.
                Ok(target) => {
                    debug!(path = %child.display(), target = %target.display(), "ignoring link into the root");
                    continue;
                }
                Err(_) => {}
            }
        }
        match Entry::snapshot(&child) {
            Ok(e) if e.is_dir() => units.push(child),
            Ok(e) if e.is_file() => loose_files.push(e),
            Ok(_) => debug!(path = %child.display(), "ignoring special file"),
            Err(e) => issues.push(e),
        }
    }
    Ok(RootListing {
        root: entry,
        canonical,
        loose_files,
        units,
        issues,
    })
}

/// Removes `dir` and everything below it, provided it holds only folders.
fn remove_empty_tree(dir: &Path) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for entry in WalkDir::new(dir).contents_first(true).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_dir() {
            continue;
        }
        match fs::remove_dir(entry.path()) {
            Ok(()) => removed.push(entry.path().to_path_buf()),
            Err(e) => debug!(path = %entry.path().display(), error = %e, "folder kept"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(path: &Path, bytes: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![b'q'; bytes]).unwrap();
    }

    #[test]
    fn missing_root_is_fatal() {
        let dir = tempdir().unwrap();
        let err = RepackOrchestrator::new(RepackConfig::default())
            .run(&[dir.path().join("nope")])
            .unwrap_err();
        assert!(matches!(
            err,
            RepackError::Configuration(ConfigurationError::InvalidRoot { .. })
        ));
    }

    #[test]
    fn zero_concurrency_is_fatal() {
        let dir = tempdir().unwrap();
        let config = RepackConfig {
            concurrency: 0,
            ..RepackConfig::default()
        };
        let err = RepackOrchestrator::new(config)
            .run(&[dir.path().to_path_buf()])
            .unwrap_err();
        assert!(matches!(
            err,
            RepackError::Configuration(ConfigurationError::InvalidConcurrency(0))
        ));
    }

    #[test]
    fn cancelled_run_starts_nothing() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("docs/1.txt"), 3);
        touch(&dir.path().join("pics/1.png"), 3);

        let orchestrator = RepackOrchestrator::new(RepackConfig::default());
        orchestrator.cancellation_token().cancel();
        let report = orchestrator.run(&[dir.path().to_path_buf()]).unwrap();

        assert!(report.cancelled);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.succeeded, 0);
        assert!(report
            .results
            .iter()
            .all(|r| r.error.as_deref() == Some("run cancelled")));
        assert!(!dir.path().join("docs.zip").exists());
    }

    #[test]
    fn empty_folders_are_removed_after_the_plan() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("mix/hollow/deeper")).unwrap();
        touch(&dir.path().join("mix/keep.txt"), 3);

        let config = RepackConfig {
            cleanup_empty_folders: true,
            ..RepackConfig::default()
        };
        let report = RepackOrchestrator::new(config)
            .run(&[dir.path().to_path_buf()])
            .unwrap();

        assert!(!dir.path().join("mix/hollow").exists());
        assert!(report
            .removed_empty_dirs
            .contains(&dir.path().join("mix/hollow")));
        assert!(dir.path().join("mix/mix.zip").exists());
    }

    #[test]
    fn plan_only_writes_nothing() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("docs/1.txt"), 3);
        touch(&dir.path().join("top.txt"), 3);

        let planned = RepackOrchestrator::new(RepackConfig::default())
            .plan_only(&[dir.path().to_path_buf()])
            .unwrap();
        assert_eq!(planned.plans.len(), 2);
        assert_eq!(planned.action_count(), 2);
        assert!(!dir.path().join("docs.zip").exists());
    }

    #[test]
    fn repeated_roots_are_listed_once() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("docs/1.txt"), 3);

        let planned = RepackOrchestrator::new(RepackConfig::default())
            .plan_only(&[dir.path().to_path_buf(), dir.path().join("docs/..")])
            .unwrap();
        assert_eq!(planned.plans.len(), 1);
        assert_eq!(planned.action_count(), 1);
    }

    #[test]
    fn nested_roots_overlap() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("a/b/1.txt"), 3);

        for roots in [
            [dir.path().to_path_buf(), dir.path().join("a")],
            [dir.path().join("a/b"), dir.path().to_path_buf()],
        ] {
            let err = RepackOrchestrator::new(RepackConfig::default())
                .plan_only(&roots)
                .unwrap_err();
            assert!(matches!(
                err,
                RepackError::Configuration(ConfigurationError::InvalidRoot {
                    reason: "overlaps another root",
                    ..
                })
            ));
        }
    }

    #[cfg(unix)]
    #[test]
    fn links_at_the_root_are_aliases_or_reported() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        touch(&root.join("b/1.txt"), 3);
        touch(&dir.path().join("outside/2.txt"), 3);
        std::os::unix::fs::symlink(root.join("b"), root.join("alias")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("outside"), root.join("away")).unwrap();

        let listing = list_root(&root).unwrap();
        assert_eq!(listing.units, vec![root.join("b")]);
        assert!(listing.loose_files.is_empty());
        assert!(matches!(
            listing.issues.as_slice(),
            [ClassificationError::OutsideRoot { path }] if *path == root.join("away")
        ));

        let planned = RepackOrchestrator::new(RepackConfig::default())
            .plan_only(&[root.clone()])
            .unwrap();
        assert_eq!(planned.action_count(), 1);
        assert_eq!(planned.classification_errors.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_subfolder_is_reported_and_the_rest_runs() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        touch(&dir.path().join("docs/1.txt"), 3);
        touch(&dir.path().join("docs/locked/secret.txt"), 3);
        touch(&dir.path().join("pics/1.png"), 3);
        let locked = dir.path().join("docs/locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&locked).is_ok() {
            // Permissions are not enforced for this user.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let report = RepackOrchestrator::new(RepackConfig::default())
            .run(&[dir.path().to_path_buf()]);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        let report = report.unwrap();

        assert!(!report.classification_errors.is_empty());
        assert!(report.classification_errors.iter().any(|e| e.contains("locked")));
        assert_eq!(report.failed, 0, "{:?}", report.results);
        assert!(dir.path().join("pics.zip").exists());
        assert!(dir.path().join("docs/docs.zip").exists());
        assert!(locked.join("secret.txt").exists());
    }
}

//! End-to-end runs of the orchestrator on real directory trees.

use autorepack::archive::{ArchiveBackend, CompressJob, NativeBackend};
use autorepack::common::ArchiveManifest;
use autorepack::error::{ConfigurationError, PlanningError, RepackError};
use autorepack::plan::{ActionKind, SkipReason};
use autorepack::progress::{ProgressCallback, RepackEvent};
use autorepack::writer::RepackStatus;
use autorepack::{CancellationToken, RepackConfig, RepackOrchestrator};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;
use walkdir::WalkDir;

// ---------- helpers ----------

fn touch(path: &Path, bytes: usize) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, vec![b'r'; bytes]).unwrap();
}

fn zip_members(path: &Path) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    names
}

fn names_in(dir: &Path) -> BTreeSet<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

fn config(tweak: impl FnOnce(&mut RepackConfig)) -> RepackConfig {
    let mut config = RepackConfig {
        concurrency: 2,
        ..RepackConfig::default()
    };
    tweak(&mut config);
    config
}

/// A tree touching every planner branch.
fn build_mixed_tree(root: &Path) {
    for i in 0..3 {
        touch(&root.join(format!("docs/{i}.txt")), 10 + i);
    }
    touch(&root.join("a/b/report.pdf"), 64);
    touch(&root.join("photos/1.jpg"), 5);
    touch(&root.join("photos.zip"), 5);
    touch(&root.join("mixed/loose.txt"), 7);
    touch(&root.join("mixed/sub/inner.txt"), 8);
    touch(&root.join("mixed/old.rar"), 9);
    fs::create_dir_all(root.join("hollow/deeper")).unwrap();
    touch(&root.join("vols/v1.cbz"), 4);
}

/// Native backend that lies about sizes when inspecting.
struct SkewedBackend;

impl ArchiveBackend for SkewedBackend {
    fn compress(&self, job: &CompressJob<'_>) -> io::Result<u64> {
        NativeBackend.compress(job)
    }

    fn inspect(&self, archive: &Path) -> io::Result<ArchiveManifest> {
        let mut manifest = NativeBackend.inspect(archive)?;
        manifest.total_size += 1;
        Ok(manifest)
    }
}

// ---------- scenarios ----------

#[test]
fn flat_and_nested_folders_become_two_archives() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    for name in ["1.txt", "2.txt", "3.txt"] {
        touch(&root.join("docs").join(name), 20);
    }
    touch(&root.join("a/b/report.pdf"), 50);

    let report = RepackOrchestrator::new(config(|_| {}))
        .run(&[root.to_path_buf()])
        .unwrap();

    assert_eq!(report.succeeded, 2, "{:?}", report.results);
    assert_eq!(report.failed, 0);
    assert!(report
        .results
        .iter()
        .all(|r| r.kind == ActionKind::CompressAsIs));
    assert_eq!(zip_members(&root.join("docs.zip")), ["1.txt", "2.txt", "3.txt"]);
    assert_eq!(zip_members(&root.join("a.zip")), ["report.pdf"]);
    assert!(!root.join("a/b.zip").exists());
    assert!(!root.join("b.zip").exists());
    assert_eq!(report.bytes_processed, 110);
}

#[test]
fn sibling_archive_is_skipped_by_default() {
    let dir = tempdir().unwrap();
    touch(&dir.path().join("photos/1.jpg"), 5);
    touch(&dir.path().join("photos.zip"), 5);

    let report = RepackOrchestrator::new(config(|_| {}))
        .run(&[dir.path().to_path_buf()])
        .unwrap();

    // The loose photos.zip under the root is skipped as well.
    assert_eq!(report.skipped, 2);
    let photos = report
        .results
        .iter()
        .find(|r| r.root == dir.path().join("photos"))
        .unwrap();
    assert_eq!(photos.kind, ActionKind::Skip(SkipReason::DuplicateOfSibling));
    assert!(dir.path().join("photos/1.jpg").exists());
}

#[test]
fn merge_deletes_folder_only_after_sibling_matches() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("root");
    touch(&root.join("photos/1.jpg"), 15);
    touch(&root.join("photos/2.jpg"), 25);

    // First run produces the sibling archive and keeps the folder.
    let report = RepackOrchestrator::new(config(|_| {}))
        .run(&[root.clone()])
        .unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(root.join("photos.zip").exists());

    let report = RepackOrchestrator::new(config(|c| c.merge_duplicates = true))
        .run(&[root.clone()])
        .unwrap();
    assert_eq!(report.succeeded, 1, "{:?}", report.results);
    let merge = report
        .results
        .iter()
        .find(|r| r.root == root.join("photos"))
        .unwrap();
    assert!(matches!(merge.kind, ActionKind::Merge { .. }));
    assert_eq!(merge.bytes_written, 0);
    assert!(!root.join("photos").exists());
    assert!(root.join("photos.zip").exists());
    assert!(!root.join("photos (1).zip").exists());
}

#[test]
fn colliding_destinations_get_a_suffix() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("out");
    fs::create_dir_all(&out).unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    touch(&first.join("Untitled/a.txt"), 3);
    touch(&second.join("Untitled/b.txt"), 4);

    let report = RepackOrchestrator::new(config(|c| c.output_dir = Some(out.clone())))
        .run(&[first, second])
        .unwrap();

    assert_eq!(report.succeeded, 2, "{:?}", report.results);
    assert_eq!(zip_members(&out.join("Untitled.zip")), ["a.txt"]);
    assert_eq!(zip_members(&out.join("Untitled (1).zip")), ["b.txt"]);
}

#[test]
fn concurrency_does_not_change_totals() {
    let one = tempdir().unwrap();
    let many = tempdir().unwrap();
    build_mixed_tree(one.path());
    build_mixed_tree(many.path());

    let serial = RepackOrchestrator::new(config(|c| {
        c.concurrency = 1;
        c.cleanup_empty_folders = true;
    }))
    .run(&[one.path().to_path_buf()])
    .unwrap();
    let parallel = RepackOrchestrator::new(config(|c| {
        c.concurrency = 8;
        c.cleanup_empty_folders = true;
    }))
    .run(&[many.path().to_path_buf()])
    .unwrap();

    assert_eq!(serial.succeeded, parallel.succeeded);
    assert_eq!(serial.failed, parallel.failed);
    assert_eq!(serial.skipped, parallel.skipped);
    assert_eq!(serial.bytes_processed, parallel.bytes_processed);
    assert_eq!(serial.total(), parallel.total());
    assert_eq!(serial.removed_empty_dirs.len(), parallel.removed_empty_dirs.len());
    assert_eq!(serial.failed, 0);
}

#[test]
fn forced_verification_failure_keeps_sources() {
    let dir = tempdir().unwrap();
    touch(&dir.path().join("docs/1.txt"), 10);
    touch(&dir.path().join("docs/2.txt"), 20);

    let report = RepackOrchestrator::new(config(|c| c.delete_source_after_success = true))
        .with_backend(SkewedBackend)
        .run(&[dir.path().to_path_buf()])
        .unwrap();

    assert_eq!(report.failed, 1);
    assert!(report.has_failures());
    assert_eq!(report.results[0].status, RepackStatus::Failed);
    assert!(!dir.path().join("docs.zip").exists());
    assert!(dir.path().join("docs/1.txt").exists());
    assert!(dir.path().join("docs/2.txt").exists());
}

#[test]
fn successful_run_with_deletion_leaves_only_archives() {
    let dir = tempdir().unwrap();
    touch(&dir.path().join("docs/1.txt"), 10);
    touch(&dir.path().join("a/b/c/deep.txt"), 10);

    let report = RepackOrchestrator::new(config(|c| {
        c.delete_source_after_success = true;
        c.archive_format = "tar.zst".parse().unwrap();
    }))
    .run(&[dir.path().to_path_buf()])
    .unwrap();

    assert_eq!(report.succeeded, 2, "{:?}", report.results);
    let left: BTreeSet<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        left,
        ["a.tar.zst", "docs.tar.zst"]
            .iter()
            .map(|s| s.to_string())
            .collect::<BTreeSet<String>>()
    );
    let manifest = NativeBackend.inspect(&dir.path().join("a.tar.zst")).unwrap();
    assert_eq!(manifest.member_count, 1);
    assert_eq!(manifest.total_size, 10);
}

#[test]
fn plans_partition_every_file() {
    let dir = tempdir().unwrap();
    build_mixed_tree(dir.path());
    touch(&dir.path().join("top-level.txt"), 2);

    let planned = RepackOrchestrator::new(config(|_| {}))
        .plan_only(&[dir.path().to_path_buf()])
        .unwrap();

    let mut claimed: Vec<PathBuf> = planned
        .plans
        .iter()
        .flat_map(|p| p.actions.iter())
        .flat_map(|a| a.sources.iter().map(|e| e.path.clone()))
        .collect();
    let before = claimed.len();
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), before, "a file was claimed twice");

    let on_disk: Vec<PathBuf> = {
        let mut files: Vec<PathBuf> = WalkDir::new(dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        files.sort();
        files
    };
    assert_eq!(claimed, on_disk);
}

#[test]
fn progress_callback_sees_every_action() {
    let dir = tempdir().unwrap();
    build_mixed_tree(dir.path());

    let finished = Arc::new(Mutex::new(0usize));
    let planned_actions = Arc::new(Mutex::new(0usize));
    let (f, p) = (Arc::clone(&finished), Arc::clone(&planned_actions));
    let callback: Arc<ProgressCallback> = Arc::new(move |event: RepackEvent| match event {
        RepackEvent::PlanReady { actions, .. } => *p.lock().unwrap() = actions,
        RepackEvent::ActionFinished { .. } => *f.lock().unwrap() += 1,
        _ => {}
    });

    let report = RepackOrchestrator::new(config(|_| {}))
        .with_progress(callback)
        .run(&[dir.path().to_path_buf()])
        .unwrap();

    assert_eq!(*finished.lock().unwrap(), report.total());
    assert_eq!(*planned_actions.lock().unwrap(), report.total());
}

#[cfg(unix)]
#[test]
fn symlink_cycle_aborts_before_writing() {
    let dir = tempdir().unwrap();
    touch(&dir.path().join("docs/1.txt"), 3);
    touch(&dir.path().join("loop/file.txt"), 3);
    touch(&dir.path().join("loop/sub/inner.txt"), 3);
    std::os::unix::fs::symlink(dir.path().join("loop"), dir.path().join("loop/sub/back")).unwrap();

    let err = RepackOrchestrator::new(config(|_| {}))
        .run(&[dir.path().to_path_buf()])
        .unwrap_err();

    assert!(matches!(
        err,
        RepackError::Planning(PlanningError::SymlinkCycle { .. })
    ));
    assert!(!dir.path().join("docs.zip").exists());
}

#[test]
fn repeated_root_is_planned_once() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("root");
    touch(&root.join("docs/1.txt"), 4);

    let report = RepackOrchestrator::new(config(|c| c.delete_source_after_success = true))
        .run(&[root.clone(), root.join("docs/..")])
        .unwrap();

    assert_eq!(report.succeeded, 1, "{:?}", report.results);
    assert_eq!(names_in(&root), BTreeSet::from(["docs.zip".to_string()]));
}

#[test]
fn nested_roots_are_rejected_before_writing() {
    let dir = tempdir().unwrap();
    touch(&dir.path().join("a/x/1.txt"), 4);
    touch(&dir.path().join("a/y/2.txt"), 4);

    let err = RepackOrchestrator::new(config(|_| {}))
        .run(&[dir.path().to_path_buf(), dir.path().join("a")])
        .unwrap_err();

    assert!(matches!(
        err,
        RepackError::Configuration(ConfigurationError::InvalidRoot { .. })
    ));
    assert!(!dir.path().join("a.zip").exists());
    assert!(!dir.path().join("a/x.zip").exists());
}

#[test]
fn rerun_leaves_packed_folders_alone() {
    let dir = tempdir().unwrap();
    touch(&dir.path().join("mix/loose.txt"), 3);
    touch(&dir.path().join("mix/sub/inner.txt"), 3);

    let first = RepackOrchestrator::new(config(|_| {}))
        .run(&[dir.path().to_path_buf()])
        .unwrap();
    assert_eq!(first.succeeded, 2, "{:?}", first.results);

    for _ in 0..2 {
        let again = RepackOrchestrator::new(config(|_| {}))
            .run(&[dir.path().to_path_buf()])
            .unwrap();
        assert_eq!(again.succeeded, 0, "{:?}", again.results);
        assert_eq!(again.failed, 0);
    }
    assert_eq!(
        names_in(&dir.path().join("mix")),
        ["loose.txt", "mix.zip", "sub", "sub.zip"]
            .iter()
            .map(|s| s.to_string())
            .collect::<BTreeSet<String>>()
    );
}

#[test]
fn root_survives_packing_its_own_files() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("root");
    let out = dir.path().join("out");
    fs::create_dir_all(&out).unwrap();
    touch(&root.join("a.txt"), 2);
    touch(&root.join("b.txt"), 2);

    let report = RepackOrchestrator::new(config(|c| {
        c.output_dir = Some(out.clone());
        c.delete_source_after_success = true;
    }))
    .run(&[root.clone()])
    .unwrap();

    assert_eq!(report.succeeded, 1, "{:?}", report.results);
    assert_eq!(zip_members(&out.join("root.zip")), ["a.txt", "b.txt"]);
    assert!(root.is_dir());
    assert!(names_in(&root).is_empty());
}

#[test]
fn cancelling_mid_run_skips_the_remaining_actions() {
    let dir = tempdir().unwrap();
    for unit in ["alpha", "beta", "gamma"] {
        touch(&dir.path().join(unit).join("1.txt"), 3);
    }

    let token = CancellationToken::new();
    let trigger = token.clone();
    let callback: Arc<ProgressCallback> = Arc::new(move |event: RepackEvent| {
        if let RepackEvent::ActionFinished { .. } = event {
            trigger.cancel();
        }
    });
    let report = RepackOrchestrator::new(config(|c| c.concurrency = 1))
        .with_cancellation(token)
        .with_progress(callback)
        .run(&[dir.path().to_path_buf()])
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.succeeded, 1, "{:?}", report.results);
    assert_eq!(report.skipped, 2);
    assert!(report
        .results
        .iter()
        .filter(|r| !r.is_success())
        .all(|r| r.error.as_deref() == Some("run cancelled")));
    let archives = ["alpha.zip", "beta.zip", "gamma.zip"]
        .iter()
        .filter(|name| dir.path().join(name).exists())
        .count();
    assert_eq!(archives, 1);
}

#[cfg(unix)]
#[test]
fn unreadable_entries_are_reported_and_the_run_continues() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("root");
    touch(&root.join("docs/1.txt"), 3);
    std::os::unix::fs::symlink(dir.path().join("nowhere"), root.join("docs/broken")).unwrap();
    std::os::unix::fs::symlink(dir.path().join("nowhere"), root.join("broken-top")).unwrap();

    let report = RepackOrchestrator::new(config(|_| {}))
        .run(&[root.clone()])
        .unwrap();

    assert_eq!(report.classification_errors.len(), 2, "{:?}", report.classification_errors);
    assert!(report.classification_errors.iter().all(|e| e.contains("broken")));
    assert_eq!(report.succeeded, 1, "{:?}", report.results);
    assert_eq!(zip_members(&root.join("docs.zip")), ["1.txt"]);
}

#[cfg(unix)]
#[test]
fn links_out_of_the_root_are_never_followed_for_deletion() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("root");
    touch(&root.join("unit/keep.txt"), 3);
    touch(&dir.path().join("outside/precious.txt"), 3);
    std::os::unix::fs::symlink(dir.path().join("outside"), root.join("unit/link")).unwrap();
    std::os::unix::fs::symlink(dir.path().join("outside"), root.join("elsewhere")).unwrap();

    let report = RepackOrchestrator::new(config(|c| c.delete_source_after_success = true))
        .run(&[root.clone()])
        .unwrap();

    assert_eq!(report.failed, 0, "{:?}", report.results);
    assert!(dir.path().join("outside/precious.txt").exists());
    assert!(report
        .results
        .iter()
        .any(|r| r.kind == ActionKind::Skip(SkipReason::LinkOutsideUnit)));
    assert!(report
        .classification_errors
        .iter()
        .any(|e| e.contains("outside its root")));
    assert_eq!(zip_members(&root.join("unit/unit.zip")), ["keep.txt"]);
    assert!(!root.join("unit/keep.txt").exists());
}

#[cfg(unix)]
#[test]
fn link_between_units_claims_each_file_once() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("root");
    touch(&root.join("a/x.txt"), 3);
    touch(&root.join("b/1.txt"), 3);
    touch(&root.join("b/2.txt"), 3);
    std::os::unix::fs::symlink(root.join("b"), root.join("a/link")).unwrap();

    let planned = RepackOrchestrator::new(config(|_| {}))
        .plan_only(&[root.clone()])
        .unwrap();

    let claimed: Vec<PathBuf> = planned
        .plans
        .iter()
        .flat_map(|p| p.actions.iter())
        .flat_map(|a| a.sources.iter().map(|e| e.path.clone()))
        .collect();
    assert!(claimed.iter().all(|p| !p.starts_with(root.join("a/link"))));
    assert!(claimed.contains(&root.join("b/1.txt")));
    assert!(claimed.contains(&root.join("b/2.txt")));
}


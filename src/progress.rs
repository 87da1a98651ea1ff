//! Progress reporting for repack runs
//!
//! The orchestrator reports through a [`ProgressTracker`], which turns action
//! completions into [`RepackEvent`]s for an optional caller-supplied callback.
//! Counters are atomics so workers never wait on each other to report.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::plan::ActionKind;
use crate::writer::{RepackResult, RepackStatus};

/// Snapshot of run progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressState {
    pub total_actions: u64,
    pub completed_actions: u64,
    pub failed_actions: u64,
    pub bytes_processed: u64,
    pub elapsed_time: Duration,
    pub speed_mbps: f32,
    pub progress_percent: f32,
}

#[derive(Debug, Clone)]
pub enum RepackEvent {
    /// All units are planned; execution is about to start.
    PlanReady { units: usize, actions: usize },
    ActionStarted {
        unit: PathBuf,
        action_id: usize,
        root: PathBuf,
        kind: ActionKind,
    },
    ActionFinished {
        result: RepackResult,
        progress: ProgressState,
    },
    Finished { progress: ProgressState },
}

/// Progress callback function type
pub type ProgressCallback = dyn Fn(RepackEvent) + Send + Sync;

pub struct ProgressTracker {
    total_actions: AtomicU64,
    completed_actions: AtomicU64,
    failed_actions: AtomicU64,
    bytes_processed: AtomicU64,
    start_time: Instant,
    callback: Option<Arc<ProgressCallback>>,
}

impl ProgressTracker {
    pub fn new(callback: Option<Arc<ProgressCallback>>) -> Self {
        Self {
            total_actions: AtomicU64::new(0),
            completed_actions: AtomicU64::new(0),
            failed_actions: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            start_time: Instant::now(),
            callback,
        }
    }

    /// A tracker that only counts.
    pub fn silent() -> Self {
        Self::new(None)
    }

    pub fn plan_ready(&self, units: usize, actions: usize) {
        self.total_actions.store(actions as u64, Ordering::Relaxed);
        self.emit(|| RepackEvent::PlanReady { units, actions });
    }

    pub fn action_started(&self, unit: &Path, action_id: usize, root: &Path, kind: &ActionKind) {
        self.emit(|| RepackEvent::ActionStarted {
            unit: unit.to_path_buf(),
            action_id,
            root: root.to_path_buf(),
            kind: kind.clone(),
        });
    }

    /// Counts a finished action and reports it.
    pub fn action_finished(&self, result: &RepackResult) {
        self.completed_actions.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed
            .fetch_add(result.bytes_processed, Ordering::Relaxed);
        if result.status == RepackStatus::Failed {
            self.failed_actions.fetch_add(1, Ordering::Relaxed);
        }
        self.emit(|| RepackEvent::ActionFinished {
            result: result.clone(),
            progress: self.state(),
        });
    }

    pub fn finish(&self) {
        self.emit(|| RepackEvent::Finished {
            progress: self.state(),
        });
    }

    pub fn state(&self) -> ProgressState {
        let total_actions = self.total_actions.load(Ordering::Relaxed);
        let completed_actions = self.completed_actions.load(Ordering::Relaxed);
        let bytes_processed = self.bytes_processed.load(Ordering::Relaxed);
        let elapsed_time = self.start_time.elapsed();

        let speed_mbps = if elapsed_time.as_secs_f32() > 0.0 {
            (bytes_processed as f32 / (1024.0 * 1024.0)) / elapsed_time.as_secs_f32()
        } else {
            0.0
        };
        let progress_percent = if total_actions > 0 {
            ((completed_actions as f32 / total_actions as f32) * 100.0).min(100.0)
        } else {
            100.0
        };

        ProgressState {
            total_actions,
            completed_actions,
            failed_actions: self.failed_actions.load(Ordering::Relaxed),
            bytes_processed,
            elapsed_time,
            speed_mbps,
            progress_percent,
        }
    }

    // Events are only built when someone listens.
    fn emit(&self, event: impl FnOnce() -> RepackEvent) {
        if let Some(callback) = &self.callback {
            callback(event());
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::silent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn result(status: RepackStatus, bytes: u64) -> RepackResult {
        RepackResult {
            unit: PathBuf::from("/r/u"),
            action_id: 0,
            kind: ActionKind::CompressAsIs,
            root: PathBuf::from("/r/u"),
            destination: None,
            status,
            error: None,
            bytes_processed: bytes,
            bytes_written: 0,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn tracker_counts_and_reports() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: Arc<ProgressCallback> = Arc::new(move |event: RepackEvent| {
            sink.lock().unwrap().push(event);
        });
        let tracker = ProgressTracker::new(Some(callback));

        tracker.plan_ready(1, 2);
        tracker.action_started(Path::new("/r/u"), 0, Path::new("/r/u"), &ActionKind::CompressAsIs);
        tracker.action_finished(&result(RepackStatus::Success, 1024));
        tracker.action_finished(&result(RepackStatus::Failed, 0));
        tracker.finish();

        let state = tracker.state();
        assert_eq!(state.completed_actions, 2);
        assert_eq!(state.failed_actions, 1);
        assert_eq!(state.bytes_processed, 1024);
        assert_eq!(state.progress_percent, 100.0);

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], RepackEvent::PlanReady { units: 1, actions: 2 }));
        match &events[2] {
            RepackEvent::ActionFinished { progress, .. } => {
                assert_eq!(progress.completed_actions, 1);
                assert_eq!(progress.progress_percent, 50.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(events[4], RepackEvent::Finished { .. }));
    }

    #[test]
    fn silent_tracker_still_counts() {
        let tracker = ProgressTracker::silent();
        tracker.plan_ready(1, 4);
        tracker.action_finished(&result(RepackStatus::Skipped, 0));
        assert_eq!(tracker.state().completed_actions, 1);
        assert_eq!(tracker.state().progress_percent, 25.0);
    }
}

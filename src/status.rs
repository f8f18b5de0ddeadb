use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Minimum interval between snapshot emissions to subscribers.
const EMIT_THROTTLE: Duration = Duration::from_secs(1);

/// Window for the `recent` completion counters.
const RECENT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    /// In `[0, 1]`.
    pub percent: f64,
}

impl Progress {
    fn new(completed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            1.0
        } else {
            (completed as f64 / total as f64).clamp(0.0, 1.0)
        };
        Progress {
            completed,
            total,
            percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCounts {
    pub info: usize,
    pub exif: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceState {
    pub exif_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressGroup {
    pub overall: Progress,
    pub scanned: Progress,
    pub info: Progress,
    pub exif: Progress,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentCounts {
    pub exif: usize,
}

/// Point-in-time view of indexing and processing activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub database_size: usize,
    pub scanned_files_count: usize,
    pub pending: PendingCounts,
    pub maintenance: MaintenanceState,
    pub progress: ProgressGroup,
    pub recent: RecentCounts,
}

/// Aggregates counters maintained by the indexer and the processing queue
/// into snapshots, and fans meaningful changes out to subscribers at most
/// once per second.
///
/// Cheap to clone; clones share the same counters and subscriber list.
#[derive(Clone)]
pub struct StatusReporter {
    inner: Arc<ReporterInner>,
}

struct ReporterInner {
    database_size: AtomicUsize,
    scanned_files: AtomicUsize,
    scanning: AtomicBool,
    info_pending: AtomicUsize,
    info_completed: AtomicUsize,
    exif_pending: AtomicUsize,
    exif_completed: AtomicUsize,
    exif_active: AtomicBool,
    recent_exif: Mutex<VecDeque<Instant>>,
    listeners: Mutex<Vec<mpsc::Sender<StatusSnapshot>>>,
    last_emit: Mutex<Option<(Instant, StatusSnapshot)>>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        StatusReporter {
            inner: Arc::new(ReporterInner {
                database_size: AtomicUsize::new(0),
                scanned_files: AtomicUsize::new(0),
                scanning: AtomicBool::new(false),
                info_pending: AtomicUsize::new(0),
                info_completed: AtomicUsize::new(0),
                exif_pending: AtomicUsize::new(0),
                exif_completed: AtomicUsize::new(0),
                exif_active: AtomicBool::new(false),
                recent_exif: Mutex::new(VecDeque::new()),
                listeners: Mutex::new(Vec::new()),
                last_emit: Mutex::new(None),
            }),
        }
    }

    pub fn set_database_size(&self, size: usize) {
        self.inner.database_size.store(size, Ordering::SeqCst);
        self.maybe_emit();
    }

    pub fn scan_started(&self) {
        self.inner.scanning.store(true, Ordering::SeqCst);
        self.maybe_emit();
    }

    pub fn scan_finished(&self) {
        self.inner.scanning.store(false, Ordering::SeqCst);
        self.emit_now();
    }

    /// A new file entered the pipeline: one pending unit per stage.
    pub fn file_discovered(&self) {
        self.inner.scanned_files.fetch_add(1, Ordering::SeqCst);
        self.inner.info_pending.fetch_add(1, Ordering::SeqCst);
        self.inner.exif_pending.fetch_add(1, Ordering::SeqCst);
        self.maybe_emit();
    }

    pub fn info_completed(&self) {
        saturating_dec(&self.inner.info_pending);
        self.inner.info_completed.fetch_add(1, Ordering::SeqCst);
        self.maybe_emit();
    }

    pub fn exif_completed(&self) {
        saturating_dec(&self.inner.exif_pending);
        self.inner.exif_completed.fetch_add(1, Ordering::SeqCst);
        self.inner.recent_exif.lock().unwrap().push_back(Instant::now());
        self.maybe_emit();
    }

    /// A stage unit failed or was skipped; it is no longer pending but
    /// does not count as completed.
    pub fn stage_abandoned(&self) {
        saturating_dec(&self.inner.info_pending);
        saturating_dec(&self.inner.exif_pending);
        self.maybe_emit();
    }

    pub fn set_exif_active(&self, active: bool) {
        self.inner.exif_active.store(active, Ordering::SeqCst);
        self.maybe_emit();
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = &self.inner;
        let scanned = inner.scanned_files.load(Ordering::SeqCst);
        let info_pending = inner.info_pending.load(Ordering::SeqCst);
        let info_completed = inner.info_completed.load(Ordering::SeqCst);
        let exif_pending = inner.exif_pending.load(Ordering::SeqCst);
        let exif_completed = inner.exif_completed.load(Ordering::SeqCst);
        let scanning = inner.scanning.load(Ordering::SeqCst);

        let recent_exif = {
            let mut recent = inner.recent_exif.lock().unwrap();
            if let Some(cutoff) = Instant::now().checked_sub(RECENT_WINDOW) {
                while recent.front().is_some_and(|t| *t < cutoff) {
                    recent.pop_front();
                }
            }
            recent.len()
        };

        let info = Progress::new(info_completed, info_completed + info_pending);
        let exif = Progress::new(exif_completed, exif_completed + exif_pending);
        let scanned_progress = Progress {
            completed: scanned,
            total: scanned,
            percent: if scanning { 0.0 } else { 1.0 },
        };
        let overall = Progress::new(
            info.completed + exif.completed,
            info.total + exif.total,
        );

        StatusSnapshot {
            database_size: inner.database_size.load(Ordering::SeqCst),
            scanned_files_count: scanned,
            pending: PendingCounts {
                info: info_pending,
                exif: exif_pending,
            },
            maintenance: MaintenanceState {
                exif_active: inner.exif_active.load(Ordering::SeqCst),
            },
            progress: ProgressGroup {
                overall,
                scanned: scanned_progress,
                info,
                exif,
            },
            recent: RecentCounts { exif: recent_exif },
        }
    }

    /// Subscribe to snapshot emissions. The current snapshot is delivered
    /// immediately; afterwards only meaningful changes arrive, at most
    /// once per second. Dropped receivers are pruned on the next emit.
    pub fn subscribe(&self) -> mpsc::Receiver<StatusSnapshot> {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(self.snapshot());
        self.inner.listeners.lock().unwrap().push(tx);
        rx
    }

    fn maybe_emit(&self) {
        let mut last = self.inner.last_emit.lock().unwrap();
        if let Some((at, _)) = last.as_ref() {
            if at.elapsed() < EMIT_THROTTLE {
                return;
            }
        }
        let snapshot = self.snapshot();
        if let Some((_, previous)) = last.as_ref() {
            if *previous == snapshot {
                return;
            }
        }
        *last = Some((Instant::now(), snapshot.clone()));
        drop(last);
        self.broadcast(snapshot);
    }

    /// Emit regardless of the throttle (scan completion and other edges
    /// that must not be lost to the 1 s window).
    pub fn emit_now(&self) {
        let snapshot = self.snapshot();
        *self.inner.last_emit.lock().unwrap() = Some((Instant::now(), snapshot.clone()));
        self.broadcast(snapshot);
    }

    fn broadcast(&self, snapshot: StatusSnapshot) {
        let mut listeners = self.inner.listeners.lock().unwrap();
        listeners.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

fn saturating_dec(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percent_bounds() {
        assert_eq!(Progress::new(0, 0).percent, 1.0);
        assert_eq!(Progress::new(0, 4).percent, 0.0);
        assert_eq!(Progress::new(2, 4).percent, 0.5);
        assert_eq!(Progress::new(4, 4).percent, 1.0);
    }

    #[test]
    fn test_counters_flow_through_snapshot() {
        let reporter = StatusReporter::new();
        reporter.scan_started();
        reporter.file_discovered();
        reporter.file_discovered();
        reporter.info_completed();

        let s = reporter.snapshot();
        assert_eq!(s.scanned_files_count, 2);
        assert_eq!(s.pending.info, 1);
        assert_eq!(s.pending.exif, 2);
        assert_eq!(s.progress.info.completed, 1);
        assert_eq!(s.progress.info.total, 2);
        assert_eq!(s.progress.scanned.percent, 0.0);

        reporter.exif_completed();
        reporter.exif_completed();
        reporter.scan_finished();
        let s = reporter.snapshot();
        assert_eq!(s.pending.exif, 0);
        assert_eq!(s.progress.scanned.percent, 1.0);
        assert_eq!(s.recent.exif, 2);
    }

    #[test]
    fn test_abandoned_units_leave_pending() {
        let reporter = StatusReporter::new();
        reporter.file_discovered();
        reporter.stage_abandoned();
        let s = reporter.snapshot();
        assert_eq!(s.pending.info, 0);
        assert_eq!(s.pending.exif, 0);
        assert_eq!(s.progress.exif.completed, 0);
    }

    #[test]
    fn test_subscriber_gets_initial_snapshot_and_forced_emits() {
        let reporter = StatusReporter::new();
        let rx = reporter.subscribe();
        let initial = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(initial.database_size, 0);

        reporter.set_database_size(7);
        reporter.emit_now();
        let mut latest = None;
        while let Ok(s) = rx.try_recv() {
            latest = Some(s);
        }
        assert_eq!(latest.unwrap().database_size, 7);
    }

    #[test]
    fn test_emissions_are_throttled() {
        let reporter = StatusReporter::new();
        let rx = reporter.subscribe();
        let _ = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        // A burst of updates inside the window coalesces: at most one
        // throttled emission beyond the initial snapshot.
        for _ in 0..50 {
            reporter.file_discovered();
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= 1, "burst must be throttled, got {received}");
    }

    #[test]
    fn test_snapshot_serializes_expected_shape() {
        let reporter = StatusReporter::new();
        reporter.file_discovered();
        let json = serde_json::to_value(reporter.snapshot()).unwrap();
        assert!(json.get("databaseSize").is_some());
        assert!(json.get("scannedFilesCount").is_some());
        assert!(json["pending"].get("info").is_some());
        assert!(json["maintenance"].get("exifActive").is_some());
        assert!(json["progress"]["overall"].get("percent").is_some());
        assert!(json["recent"].get("exif").is_some());
    }
}

pub mod watcher;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::record::{FileRecord, FullRecord};
use crate::index::store::IndexStore;
use crate::metadata;
use crate::pathnorm;
use crate::status::StatusReporter;

/// Directory under the media root holding the index document and the
/// derivative cache; the scanner and watcher never look inside it.
pub(crate) const INTERNAL_DIR: &str = ".photarium";

/// Minimum interval between progress log lines.
const PROGRESS_THROTTLE_MS: u128 = 200;

#[derive(Debug, Default, Clone)]
pub struct ScanStats {
    /// Files seen by the discovery walk.
    pub scanned: usize,
    /// Files upgraded to Full records this run.
    pub processed: usize,
    /// Files whose processing failed (they stay Discovered and are
    /// retried on a later run).
    pub failed: usize,
    /// Walk errors (unreadable directories, odd entries).
    pub errors: usize,
    pub cancelled: bool,
}

/// Orchestrates the three-phase pipeline over one media root and owns the
/// filesystem watcher feeding the same pipeline.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct FolderIndexer {
    inner: Arc<IndexerInner>,
}

pub(crate) struct IndexerInner {
    pub(crate) root: PathBuf,
    pub(crate) store: IndexStore,
    pub(crate) status: StatusReporter,
    pub(crate) cancel: AtomicBool,
    scan_parallelism: usize,
    watch: bool,
    await_write_finish: bool,
    watcher: Mutex<Option<watcher::WatcherHandle>>,
}

impl FolderIndexer {
    pub fn new(config: &Config, store: IndexStore, status: StatusReporter) -> Self {
        FolderIndexer {
            inner: Arc::new(IndexerInner {
                root: config.media_root.clone(),
                store,
                status,
                cancel: AtomicBool::new(false),
                scan_parallelism: config.scan_parallelism,
                watch: config.watch,
                await_write_finish: config.await_write_finish,
                watcher: Mutex::new(None),
            }),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.inner.root
    }

    pub fn store(&self) -> &IndexStore {
        &self.inner.store
    }

    /// Run discovery and processing, then attach the watcher (when
    /// configured). Per-file failures never abort the scan; they are
    /// counted and logged.
    pub fn start(&self) -> Result<ScanStats> {
        let inner = &self.inner;
        inner.cancel.store(false, Ordering::SeqCst);
        inner.status.scan_started();

        let mut stats = ScanStats::default();
        self.discover(&mut stats);
        if !stats.cancelled {
            self.process_discovered(&mut stats);
        }

        inner.status.set_database_size(inner.store.len());
        inner.status.scan_finished();
        tracing::info!(
            "scan complete: processed={} failed={} total={} errors={} cancelled={}",
            stats.processed,
            stats.failed,
            stats.scanned,
            stats.errors,
            stats.cancelled
        );

        if inner.watch && !stats.cancelled {
            match watcher::attach(inner) {
                Ok(handle) => {
                    *inner.watcher.lock().unwrap() = Some(handle);
                    tracing::info!("watching {:?}", inner.root);
                }
                Err(e) => tracing::warn!("cannot watch {:?}: {}", inner.root, e),
            }
        }

        Ok(stats)
    }

    /// Phase 1: walk the tree and insert Discovered records for paths the
    /// store has never seen. Unreadable directories are logged and
    /// skipped; entries that are neither file nor directory are skipped
    /// with a warning.
    fn discover(&self, stats: &mut ScanStats) {
        let inner = &self.inner;
        let progress = ProgressTracker::new("discovery", None);

        let walk = walkdir::WalkDir::new(&inner.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.file_name().to_str() != Some(INTERNAL_DIR));

        for entry in walk {
            if inner.cancel.load(Ordering::SeqCst) {
                tracing::info!("scan cancelled during discovery");
                stats.cancelled = true;
                return;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("discovery error: {}", e);
                    stats.errors += 1;
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            if !entry.file_type().is_file() {
                tracing::warn!("skipping non-regular entry {:?}", entry.path());
                stats.errors += 1;
                continue;
            }
            let Some(key) = pathnorm::relative_key(&inner.root, entry.path()) else {
                continue;
            };
            stats.scanned += 1;

            if inner.store.get(&key).is_none() {
                let mime = pathnorm::mime_for_path(entry.path());
                inner.store.upsert(FileRecord::discovered(key, mime));
                inner.status.file_discovered();
            }
            progress.tick(stats.scanned);
        }
        tracing::info!("discovery complete: {} files", stats.scanned);
    }

    /// Phase 2: upgrade Discovered records to Full with bounded
    /// parallelism. Failed files stay Discovered for the next run.
    fn process_discovered(&self, stats: &mut ScanStats) {
        let inner = &self.inner;
        let paths = inner.store.discovered_paths();
        if paths.is_empty() {
            return;
        }
        let progress = ProgressTracker::new("processing", Some(paths.len()));

        let threads = inner.scan_parallelism.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap_or_else(|_| {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(1)
                    .build()
                    .unwrap()
            });

        let processed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let done = AtomicUsize::new(0);

        pool.install(|| {
            paths.par_iter().for_each(|key| {
                if inner.cancel.load(Ordering::SeqCst) {
                    return;
                }
                match inner.index_relative(key, false) {
                    Ok(_) => {
                        processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!("cannot index {}: {}", key, e);
                        failed.fetch_add(1, Ordering::Relaxed);
                        inner.status.stage_abandoned();
                    }
                }
                progress.tick(done.fetch_add(1, Ordering::Relaxed) + 1);
            });
        });

        stats.processed = processed.load(Ordering::Relaxed);
        stats.failed = failed.load(Ordering::Relaxed);
        stats.cancelled = inner.cancel.load(Ordering::SeqCst);
    }

    /// Index one file through the full pipeline (stat, MIME inference,
    /// metadata extraction). Accepts an absolute path under the root or a
    /// relative one. Returns `false` when `skip_if_unchanged` found
    /// nothing to do.
    pub fn index_file(&self, path: impl AsRef<Path>, skip_if_unchanged: bool) -> Result<bool> {
        let key = self.inner.to_relative(path.as_ref())?;
        self.inner.index_relative(&key, skip_if_unchanged)
    }

    /// Drop a file from the index. Accepts absolute or relative paths.
    pub fn remove_file(&self, path: impl AsRef<Path>) -> Result<bool> {
        let key = self.inner.to_relative(path.as_ref())?;
        let removed = self.inner.store.remove(&key);
        if removed {
            self.inner.status.set_database_size(self.inner.store.len());
        }
        Ok(removed)
    }

    pub fn list_indexed_files(&self) -> Vec<FileRecord> {
        self.inner.store.list()
    }

    pub fn get_indexed_file(&self, relative_path: &str) -> Option<FileRecord> {
        self.inner.store.get(relative_path)
    }

    pub fn query_files(
        &self,
        filter: Option<&crate::index::filter::FilterNode>,
        options: &crate::index::query::QueryOptions,
    ) -> crate::index::query::QueryResult {
        self.inner.store.query(filter, options)
    }

    /// One-level subfolder listing (names only), for the folders surface.
    pub fn list_subfolders(&self, relative_dir: &str) -> Result<Vec<String>> {
        let dir = pathnorm::normalize_dir(relative_dir)?;
        let abs = if dir.is_empty() {
            self.inner.root.clone()
        } else {
            self.inner.root.join(&dir)
        };
        let mut names: Vec<String> = std::fs::read_dir(&abs)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name != INTERNAL_DIR)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Stop scanning and watching. In-flight file tasks finish; no new
    /// ones are scheduled. `close_db` also flushes and closes the store.
    pub fn stop(&self, close_db: bool) {
        self.inner.cancel.store(true, Ordering::SeqCst);
        // Dropping the debouncer stops its thread asynchronously.
        self.inner.watcher.lock().unwrap().take();
        if close_db {
            self.inner.store.close();
        }
    }
}

impl IndexerInner {
    fn to_relative(&self, path: &Path) -> Result<String> {
        if path.is_absolute() {
            pathnorm::relative_key(&self.root, path)
                .ok_or_else(|| Error::Forbidden(format!("path outside media root: {path:?}")))
        } else {
            pathnorm::normalize(&path.to_string_lossy())
        }
    }

    pub(crate) fn index_relative(&self, key: &str, skip_if_unchanged: bool) -> Result<bool> {
        let abs = self.root.join(key);
        let stat = std::fs::metadata(&abs)
            .map_err(|e| Error::NotFound(format!("cannot stat {key}: {e}")))?;
        if !stat.is_file() {
            return Err(Error::BadRequest(format!("not a regular file: {key}")));
        }

        let size = stat.len();
        let date_modified: DateTime<Utc> = stat
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        let date_created: Option<DateTime<Utc>> = stat.created().ok().map(DateTime::from);

        if skip_if_unchanged {
            if let Some(FileRecord::Full(existing)) = self.store.get(key) {
                if existing.size == size && existing.date_modified == date_modified {
                    tracing::debug!("unchanged, skipping {}", key);
                    return Ok(false);
                }
            }
        }

        let mime = pathnorm::mime_for_path(&abs);
        self.status.info_completed();

        let metadata = match mime.as_deref() {
            Some(m) if pathnorm::is_image_mime(m) => metadata::extract_image_metadata(&abs),
            Some(m) if pathnorm::is_video_mime(m) => metadata::probe_video(&abs),
            _ => None,
        }
        .unwrap_or_default();

        let record = FullRecord {
            relative_path: key.to_string(),
            directory: pathnorm::parent_dir(key),
            name: pathnorm::base_name(key).to_string(),
            size,
            mime_type: mime,
            date_created,
            date_modified,
            metadata,
            last_indexed_at: Utc::now(),
        };
        self.store.upsert(FileRecord::Full(record));
        self.status.exif_completed();
        self.status.set_database_size(self.store.len());
        Ok(true)
    }

    /// Watcher event entry point: files that still exist are re-indexed,
    /// vanished paths are dropped from the index.
    pub(crate) fn handle_watch_event(&self, path: &Path) {
        let Some(key) = pathnorm::relative_key(&self.root, path) else {
            return;
        };
        if key.split('/').next() == Some(INTERNAL_DIR) {
            return;
        }
        match std::fs::metadata(path) {
            Ok(stat) if stat.is_file() => {
                if let Err(e) = self.index_relative(&key, false) {
                    tracing::warn!("watcher: cannot index {}: {}", key, e);
                }
            }
            // Directory events are ignored; their files arrive as their
            // own events.
            Ok(_) => {}
            Err(_) => {
                if self.store.remove(&key) {
                    tracing::debug!("watcher: removed {}", key);
                    self.status.set_database_size(self.store.len());
                }
            }
        }
    }

    pub(crate) fn debounce_window(&self) -> std::time::Duration {
        if self.await_write_finish {
            std::time::Duration::from_millis(200)
        } else {
            std::time::Duration::from_millis(20)
        }
    }
}

/// Throttled progress logging with a running-rate ETA.
struct ProgressTracker {
    label: &'static str,
    total: Option<usize>,
    started: Instant,
    last_log: Mutex<Instant>,
}

impl ProgressTracker {
    fn new(label: &'static str, total: Option<usize>) -> Self {
        ProgressTracker {
            label,
            total,
            started: Instant::now(),
            last_log: Mutex::new(Instant::now()),
        }
    }

    fn tick(&self, count: usize) {
        let mut last = self.last_log.lock().unwrap();
        if last.elapsed().as_millis() < PROGRESS_THROTTLE_MS {
            return;
        }
        *last = Instant::now();
        drop(last);

        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        let rate = count as f64 / elapsed;
        match self.total {
            Some(total) if rate > 0.0 => {
                let remaining = total.saturating_sub(count);
                let eta = remaining as f64 / rate;
                tracing::info!(
                    "{}: {}/{} ({:.0}/s, eta {:.0}s)",
                    self.label,
                    count,
                    total,
                    rate,
                    eta
                );
            }
            _ => tracing::info!("{}: {} files ({:.0}/s)", self.label, count, rate),
        }
    }
}

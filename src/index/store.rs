use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::index::record::{FileRecord, Stage};

/// Quiet period after the latest mutation before the snapshot is written.
const FLUSH_DEBOUNCE: Duration = Duration::from_secs(1);

enum Signal {
    Dirty,
    Shutdown,
}

/// The sole authority for records. An in-memory map keyed by
/// `relative_path` with debounced snapshot persistence to a single JSON
/// document. Mutations appear atomic to readers; queries iterate a
/// snapshot taken under the lock.
///
/// Cheap to clone — clones share the same map and flush thread.
#[derive(Clone)]
pub struct IndexStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    records: Mutex<BTreeMap<String, FileRecord>>,
    index_file: Option<PathBuf>,
    dirty: AtomicBool,
    closed: AtomicBool,
    flush_tx: Mutex<Option<mpsc::Sender<Signal>>>,
    flush_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl IndexStore {
    /// In-memory store without persistence (tests, ephemeral indexes).
    pub fn in_memory() -> Self {
        Self::build(None, BTreeMap::new())
    }

    /// Open a store backed by `index_file`. A missing or unreadable
    /// document logs a warning and starts empty — the scan will rebuild
    /// it.
    pub fn open(index_file: PathBuf) -> Self {
        let records = match load_document(&index_file) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("cannot load index {:?}: {}, starting empty", index_file, e);
                BTreeMap::new()
            }
        };
        tracing::info!("index loaded: {} records from {:?}", records.len(), index_file);
        Self::build(Some(index_file), records)
    }

    fn build(index_file: Option<PathBuf>, records: BTreeMap<String, FileRecord>) -> Self {
        let inner = Arc::new(StoreInner {
            records: Mutex::new(records),
            index_file,
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            flush_tx: Mutex::new(None),
            flush_thread: Mutex::new(None),
        });

        if inner.index_file.is_some() {
            let (tx, rx) = mpsc::channel();
            let thread_inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name("index-flush".to_string())
                .spawn(move || flush_loop(&thread_inner, &rx))
                .expect("cannot spawn index flush thread");
            *inner.flush_tx.lock().unwrap() = Some(tx);
            *inner.flush_thread.lock().unwrap() = Some(handle);
        }

        IndexStore { inner }
    }

    /// Replace the record stored under its `relative_path`, schedule a
    /// debounced flush.
    pub fn upsert(&self, record: FileRecord) {
        {
            let mut records = self.inner.records.lock().unwrap();
            records.insert(record.relative_path().to_string(), record);
        }
        self.mark_dirty();
    }

    /// Remove a record. Returns whether it existed.
    pub fn remove(&self, relative_path: &str) -> bool {
        let removed = {
            let mut records = self.inner.records.lock().unwrap();
            records.remove(relative_path).is_some()
        };
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn get(&self, relative_path: &str) -> Option<FileRecord> {
        self.inner.records.lock().unwrap().get(relative_path).cloned()
    }

    /// All records, sorted by `relative_path`.
    pub fn list(&self) -> Vec<FileRecord> {
        self.inner.records.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_stage(&self, stage: Stage) -> usize {
        self.inner
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.stage() == stage)
            .count()
    }

    /// Relative paths of records still waiting at the Discovered stage.
    pub fn discovered_paths(&self) -> Vec<String> {
        self.inner
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.stage() == Stage::Discovered)
            .map(|r| r.relative_path().to_string())
            .collect()
    }

    /// Evaluate a query against a snapshot of the record set.
    pub fn query(
        &self,
        filter: Option<&crate::index::filter::FilterNode>,
        options: &crate::index::query::QueryOptions,
    ) -> crate::index::query::QueryResult {
        let records = self.list();
        crate::index::query::run(&records, filter, options)
    }

    /// Cancel the pending flush timer and write synchronously when dirty.
    /// Idempotent; the store stays readable after closing.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.inner.flush_tx.lock().unwrap().take() {
            let _ = tx.send(Signal::Shutdown);
        }
        if let Some(handle) = self.inner.flush_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if self.inner.dirty.load(Ordering::SeqCst) {
            if let Err(e) = flush_now(&self.inner) {
                tracing::warn!("final index flush failed: {}", e);
            }
        }
    }

    fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
        if let Some(tx) = self.inner.flush_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Signal::Dirty);
        }
    }
}

fn flush_loop(inner: &StoreInner, rx: &mpsc::Receiver<Signal>) {
    loop {
        match rx.recv() {
            Ok(Signal::Shutdown) | Err(_) => return,
            Ok(Signal::Dirty) => {}
        }
        // Debounce: keep absorbing mutations until a full quiet period
        // passes, then write one coalesced snapshot.
        loop {
            match rx.recv_timeout(FLUSH_DEBOUNCE) {
                Ok(Signal::Dirty) => continue,
                // close() takes over with a synchronous flush.
                Ok(Signal::Shutdown) => return,
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }
        if let Err(e) = flush_now(inner) {
            tracing::warn!("index flush failed, will retry: {}", e);
            inner.dirty.store(true, Ordering::SeqCst);
        }
    }
}

/// Serialize the sorted record list and replace the document atomically
/// (write-then-rename). Clearing the dirty flag first lets mutations that
/// land mid-write re-mark it for the next debounce tick.
fn flush_now(inner: &StoreInner) -> std::io::Result<()> {
    let Some(index_file) = inner.index_file.as_ref() else {
        return Ok(());
    };
    inner.dirty.store(false, Ordering::SeqCst);

    let snapshot: Vec<FileRecord> = inner.records.lock().unwrap().values().cloned().collect();
    let json = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    if let Some(parent) = index_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = index_file.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, index_file)?;
    tracing::debug!("index flushed: {} records to {:?}", snapshot.len(), index_file);
    Ok(())
}

fn load_document(index_file: &std::path::Path) -> std::io::Result<BTreeMap<String, FileRecord>> {
    let raw = std::fs::read_to_string(index_file)?;
    let records: Vec<FileRecord> = serde_json::from_str(&raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(records
        .into_iter()
        .map(|r| (r.relative_path().to_string(), r))
        .collect())
}

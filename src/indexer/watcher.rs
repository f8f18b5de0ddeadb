use std::sync::{Arc, Weak};

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};

use crate::indexer::IndexerInner;

pub(crate) type WatcherHandle = Debouncer<RecommendedWatcher>;

/// Attach a recursive debounced watcher on the media root. Events are
/// held until writes settle (the debounce window), then classified by a
/// fresh `stat`: existing files re-enter the indexing pipeline, vanished
/// paths leave the index. A rename is simply an unlink plus an add.
///
/// The handler keeps only a weak reference to the indexer so a dropped
/// indexer does not stay alive through its own watcher thread.
pub(crate) fn attach(inner: &Arc<IndexerInner>) -> notify::Result<WatcherHandle> {
    let weak: Weak<IndexerInner> = Arc::downgrade(inner);
    let mut debouncer = new_debouncer(inner.debounce_window(), move |result: DebounceEventResult| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match result {
            Ok(events) => {
                for event in events {
                    inner.handle_watch_event(&event.path);
                }
            }
            // Watcher errors are non-fatal; watching continues.
            Err(error) => tracing::warn!("watcher error: {}", error),
        }
    })?;
    debouncer
        .watcher()
        .watch(&inner.root, RecursiveMode::Recursive)?;
    Ok(debouncer)
}

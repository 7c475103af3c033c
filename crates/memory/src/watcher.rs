//! Filesystem watching for the source folders.
//!
//! `notify-debouncer-full` collapses raw OS events; relevant ones are then
//! forwarded into a [`SyncDebouncer`], which owns the user-facing window.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    notify_debouncer_full::{
        DebounceEventResult, Debouncer, RecommendedCache, new_debouncer,
        notify::{Event, EventKind, RecommendedWatcher, RecursiveMode},
    },
    tracing::{debug, warn},
};

use crate::{debounce::SyncDebouncer, error::MemoryError};

/// Debounce applied by the OS-event layer before events reach the sync window.
const EVENT_COALESCE: Duration = Duration::from_millis(200);

/// Whether `event` could change what the index contains.
pub fn is_relevant(event: &Event, extensions: &[String]) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|p| is_indexable(p, extensions))
}

fn is_indexable(path: &Path, extensions: &[String]) -> bool {
    let hidden = path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| s.starts_with('.') && s.len() > 1 && s != "..")
    });
    if hidden {
        return false;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)),
        // Directory removals and renames carry no extension but can drop files.
        None => true,
    }
}

/// Keeps the OS watcher and its sync debouncer alive; dropping it stops both.
pub struct MemoryWatcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    sync_debouncer: SyncDebouncer,
    roots: Vec<PathBuf>,
}

impl MemoryWatcher {
    /// Watch every existing root recursively.
    pub fn start(
        roots: &[PathBuf],
        extensions: Vec<String>,
        sync_debouncer: SyncDebouncer,
    ) -> Result<Self, MemoryError> {
        let notifier = sync_debouncer.notifier();
        let mut debouncer = new_debouncer(
            EVENT_COALESCE,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    if events.iter().any(|e| is_relevant(&e.event, &extensions)) {
                        notifier.notify();
                    }
                },
                Err(errors) => {
                    for error in errors {
                        warn!(error = %error, "memory watcher error");
                    }
                },
            },
        )
        .map_err(|e| MemoryError::Watch(e.to_string()))?;

        let mut watched = Vec::new();
        for root in roots {
            if !root.is_dir() {
                debug!(root = %root.display(), "not watching missing folder");
                continue;
            }
            debouncer
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| MemoryError::Watch(format!("{}: {e}", root.display())))?;
            watched.push(root.clone());
        }
        debug!(roots = ?watched, "memory watcher started");

        Ok(Self {
            _debouncer: debouncer,
            sync_debouncer,
            roots: watched,
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn stop(self) {
        self.sync_debouncer.cancel();
    }
}

impl Drop for MemoryWatcher {
    fn drop(&mut self) {
        debug!(roots = ?self.roots, "memory watcher dropped");
    }
}

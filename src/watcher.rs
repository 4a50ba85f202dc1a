//! File system watcher for automatic resynchronization
//!
//! The watcher monitors the configured roots and, once changes have settled
//! for the debounce period, synchronizes the affected folders, scans new or
//! modified files and queues a duplicate prediction run.

use anyhow::{Context, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::{Duration, Instant};

use crate::background::WorkQueue;
use crate::cache::CACHE_DIR;
use crate::cancel::CancellationToken;
use crate::indexer::Indexer;

/// Configuration for file watching
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Waits this long after the last change before resynchronizing
    pub debounce_ms: u64,
    /// How often the stop flag and debounce timer are checked
    pub poll_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            poll_ms: 100,
        }
    }
}

/// Changed paths waiting for the debounce timer
///
/// Every new change restarts the timer, so a burst of changes (a camera
/// import, a batch rename) is handled as one resynchronization.
#[derive(Debug, Default)]
struct PendingChanges {
    paths: BTreeSet<PathBuf>,
    last_event: Option<Instant>,
}

impl PendingChanges {
    fn record(&mut self, path: PathBuf, now: Instant) {
        self.paths.insert(path);
        self.last_event = Some(now);
    }

    /// Take the pending paths once `debounce` has passed since the last change
    fn take_if_due(&mut self, now: Instant, debounce: Duration) -> Option<Vec<PathBuf>> {
        let last = self.last_event?;
        if self.paths.is_empty() || now.duration_since(last) < debounce {
            return None;
        }
        self.last_event = None;
        Some(std::mem::take(&mut self.paths).into_iter().collect())
    }
}

/// Watch the configured roots until `stop` is set
///
/// Blocks the calling thread. Duplicate prediction runs on its own worker;
/// requests made while a run is in progress collapse into one follow-up run.
pub fn watch(indexer: Arc<Indexer>, config: WatchConfig, stop: Arc<AtomicBool>) -> Result<()> {
    let roots = indexer.config().index.roots.clone();
    log::info!(
        "Starting file watcher for {} roots with {}ms debounce",
        roots.len(),
        config.debounce_ms
    );

    let (tx, rx) = channel();
    let mut watcher = RecommendedWatcher::new(tx, Config::default()).context("Failed to create file watcher")?;
    for root in &roots {
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to start watching {}", root.display()))?;
    }

    let cancel = CancellationToken::from_flag(stop.clone());
    let predictor = indexer.clone();
    let predictor_cancel = cancel.clone();
    let predictions = WorkQueue::spawn("mediadex-predictions", usize::MAX, move |requests: Vec<()>| {
        log::debug!("Running duplicate prediction for {} requests", requests.len());
        predictor.update_predictions(&predictor_cancel);
    })?;

    let mut pending = PendingChanges::default();
    let debounce = Duration::from_millis(config.debounce_ms);
    let poll = Duration::from_millis(config.poll_ms.max(1));

    while !stop.load(Ordering::Relaxed) {
        match rx.recv_timeout(poll) {
            Ok(Ok(event)) => {
                let now = Instant::now();
                for path in relevant_paths(&event) {
                    log::trace!("Detected change: {}", path.display());
                    pending.record(path, now);
                }
            }
            Ok(Err(e)) => log::warn!("Watch error: {}", e),
            Err(RecvTimeoutError::Timeout) => {
                let Some(paths) = pending.take_if_due(Instant::now(), debounce) else {
                    continue;
                };
                log::info!("Detected {} changed paths, resynchronizing", paths.len());
                let start = Instant::now();
                match indexer.sync_paths(&paths, &cancel) {
                    Ok(stats) => {
                        let scan = indexer.scan_metadata(&cancel);
                        log::info!(
                            "Resynchronized {} folders and scanned {} files in {:?}",
                            stats.folders_synced,
                            scan.scanned,
                            start.elapsed()
                        );
                        predictions.push(());
                    }
                    Err(e) => log::error!("Resynchronization failed: {:#}", e),
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::info!("Watcher channel disconnected, stopping...");
                break;
            }
        }
    }

    predictions.shutdown();
    indexer.flush();
    log::info!("Watcher stopped");
    Ok(())
}

/// Paths of an event that may change the index
///
/// Access events are ignored, as are hidden files and anything inside the
/// cache directory.
fn relevant_paths(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => event
            .paths
            .iter()
            .filter(|path| !is_ignored(path))
            .cloned()
            .collect(),
        _ => Vec::new(),
    }
}

fn is_ignored(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'));
    hidden || path.components().any(|c| matches!(c, Component::Normal(name) if name == CACHE_DIR))
}

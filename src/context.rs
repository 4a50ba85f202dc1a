//! Process-wide state shared by the indexing engine
//!
//! Everything the engine needs beyond the tree itself lives in one explicitly
//! constructed [`IndexContext`] that callers create at startup and pass in.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scopeguard::ScopeGuard;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cancel::VersionTracker;
use crate::config::IndexConfig;
use crate::geo::LocationCache;
use crate::providers::{NullInvalidator, ViewCategory, ViewInvalidator};
use crate::records::folder_key;

/// Long-running activities reported to presenters
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Activity {
    Searching,
    Indexing,
    ScanningItems,
    Detecting,
    ThumbnailingItems,
}

/// Guard returned by [`Counters::track`]; decrements on drop
pub type ActivityGuard<'a> = ScopeGuard<&'a AtomicUsize, fn(&'a AtomicUsize)>;

fn release(counter: &AtomicUsize) {
    counter.fetch_sub(1, Ordering::SeqCst);
}

/// In-flight activity counters (progress feedback only)
#[derive(Debug, Default)]
pub struct Counters {
    searching: AtomicUsize,
    indexing: AtomicUsize,
    scanning_items: AtomicUsize,
    detecting: AtomicUsize,
    thumbnailing_items: AtomicUsize,
}

/// Point-in-time copy of [`Counters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub searching: usize,
    pub indexing: usize,
    pub scanning_items: usize,
    pub detecting: usize,
    pub thumbnailing_items: usize,
}

impl Counters {
    fn counter(&self, activity: Activity) -> &AtomicUsize {
        match activity {
            Activity::Searching => &self.searching,
            Activity::Indexing => &self.indexing,
            Activity::ScanningItems => &self.scanning_items,
            Activity::Detecting => &self.detecting,
            Activity::ThumbnailingItems => &self.thumbnailing_items,
        }
    }

    /// Increment the activity's counter until the returned guard drops
    pub fn track(&self, activity: Activity) -> ActivityGuard<'_> {
        let counter = self.counter(activity);
        counter.fetch_add(1, Ordering::SeqCst);
        scopeguard::guard(counter, release as fn(&AtomicUsize))
    }

    pub fn get(&self, activity: Activity) -> usize {
        self.counter(activity).load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            searching: self.get(Activity::Searching),
            indexing: self.get(Activity::Indexing),
            scanning_items: self.get(Activity::ScanningItems),
            detecting: self.get(Activity::Detecting),
            thumbnailing_items: self.get(Activity::ThumbnailingItems),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureEntry {
    count: u32,
    modified: DateTime<Utc>,
}

/// Files whose scans keep failing
///
/// A file is skipped once it has failed `max` times in a row; the entry is
/// forgotten as soon as the file's modification time changes.
#[derive(Debug, Default)]
pub struct ScanBlocklist {
    entries: Mutex<HashMap<String, FailureEntry>>,
}

impl ScanBlocklist {
    pub fn should_skip(&self, path: &Path, modified: DateTime<Utc>, max: u32) -> bool {
        let key = folder_key(path);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.modified != modified => {
                entries.remove(&key);
                false
            }
            Some(entry) => max > 0 && entry.count >= max,
            None => false,
        }
    }

    pub fn record_failure(&self, path: &Path, modified: DateTime<Utc>) -> u32 {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(folder_key(path))
            .or_insert(FailureEntry { count: 0, modified });
        if entry.modified != modified {
            *entry = FailureEntry { count: 0, modified };
        }
        entry.count += 1;
        entry.count
    }

    pub fn record_success(&self, path: &Path) {
        self.entries.lock().remove(&folder_key(path));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dependency-injected engine state
pub struct IndexContext {
    pub config: IndexConfig,
    pub counters: Counters,
    pub versions: VersionTracker,
    pub locations: LocationCache,
    pub blocklist: ScanBlocklist,
    invalidator: Arc<dyn ViewInvalidator>,
}

impl IndexContext {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            counters: Counters::default(),
            versions: VersionTracker::new(),
            locations: LocationCache::new(),
            blocklist: ScanBlocklist::default(),
            invalidator: Arc::new(NullInvalidator),
        }
    }

    pub fn with_invalidator(mut self, invalidator: Arc<dyn ViewInvalidator>) -> Self {
        self.invalidator = invalidator;
        self
    }

    pub fn invalidate(&self, category: ViewCategory) {
        log::trace!("Invalidating view: {}", category);
        self.invalidator.invalidate_view(category);
    }
}

impl Default for IndexContext {
    fn default() -> Self {
        Self::new(IndexConfig::default())
    }
}

impl std::fmt::Debug for IndexContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexContext")
            .field("config", &self.config)
            .field("counters", &self.counters.snapshot())
            .field("version", &self.versions.current_version())
            .field("blocklist", &self.blocklist.len())
            .finish()
    }
}

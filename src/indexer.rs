//! Indexing engine: keeps the tree in step with the file system
//!
//! The indexer owns the index tree and drives every maintenance pass over it:
//! - `index_roots` walks the configured roots one level at a time, each level
//!   synchronized in parallel
//! - `scan_metadata` runs the metadata scanner on files changed since their
//!   last scan and queues the results for persistence
//! - `update_predictions` recomputes duplicate groups
//! - `sync_paths` re-synchronizes the folders around changed paths

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use globset::GlobSet;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::background::{IndexerState, IndexingStatus};
use crate::cache::CacheManager;
use crate::cancel::CancellationToken;
use crate::config::IndexConfig;
use crate::context::{Activity, IndexContext};
use crate::duplicates::{DuplicateDetector, DuplicateStats};
use crate::geo::GeoIndex;
use crate::models::{FileMetadata, IndexStats, PersistRecord, ScanStats};
use crate::providers::{Collaborators, ScanRequest, ViewCategory};
use crate::query::{QueryEngine, QueryFilter, ResultItem};
use crate::records::{FileRecord, FolderRecord};
use crate::search::SearchParser;
use crate::sync::FolderSynchronizer;
use crate::tree::IndexTree;

/// Result of scanning one file
enum ScanOutcome {
    Scanned { has_location: bool },
    Failed,
    Cancelled,
}

/// A file selected for scanning
struct ScanCandidate {
    folder: Arc<FolderRecord>,
    file: Arc<FileRecord>,
    path: PathBuf,
    xmp: Option<PathBuf>,
}

/// Manages the index and its maintenance passes
pub struct Indexer {
    tree: IndexTree,
    ctx: IndexContext,
    collaborators: Collaborators,
    exclusions: GlobSet,
    duplicates: DuplicateDetector,
    pool: rayon::ThreadPool,
    /// Set when opened over a cache directory
    cache: Option<CacheManager>,
    last_index: Mutex<Option<IndexStats>>,
    last_scan: Mutex<Option<ScanStats>>,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("folders", &self.tree.len())
            .field("ctx", &self.ctx)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl Indexer {
    /// Create an indexer with the given configuration and collaborators
    pub fn new(config: IndexConfig, collaborators: Collaborators) -> Result<Self> {
        Self::with_context(IndexContext::new(config), collaborators)
    }

    /// Create an indexer around a prepared context (custom invalidator, preloaded locations)
    pub fn with_context(ctx: IndexContext, collaborators: Collaborators) -> Result<Self> {
        let exclusions = ctx.config.exclusions()?;

        let num_threads = ctx.config.worker_threads();
        log::info!(
            "Using {} threads for indexing (out of {} available)",
            num_threads,
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("mediadex-index-{}", i))
            .build()
            .context("Failed to create thread pool")?;

        if let Some(geo) = &ctx.config.geo {
            if !ctx.locations.is_loaded() {
                if let Err(e) = ctx.locations.load(geo) {
                    log::warn!("Location tables unavailable, place lookups disabled: {:#}", e);
                }
            }
        }

        Ok(Self {
            tree: IndexTree::new(),
            ctx,
            collaborators,
            exclusions,
            duplicates: DuplicateDetector::new(),
            pool,
            cache: None,
            last_index: Mutex::new(None),
            last_scan: Mutex::new(None),
        })
    }

    /// Indexer backed by a cache directory
    ///
    /// Reads `config.toml` from the cache, persists scan results to `meta.db`
    /// and seeds the tree with what earlier runs persisted. Without configured
    /// roots the folder holding the cache is indexed.
    pub fn open(cache: &CacheManager, collaborators: Collaborators) -> Result<Self> {
        cache.init()?;
        let mut config = cache.load_config()?;
        if config.index.roots.is_empty() {
            config.index.roots.extend(cache.path().parent().map(Path::to_path_buf));
        }
        let writer = cache.writer()?;
        let mut indexer = Self::new(config, collaborators.with_sink(Arc::new(writer)))?;
        indexer.merge_persisted(cache.load_records()?);
        indexer.cache = Some(cache.clone());
        Ok(indexer)
    }

    /// Persisted thumbnail of a file, `None` without a cache or thumbnail
    pub fn thumbnail(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        cache.load_thumbnail(&path.to_string_lossy())
    }

    pub fn tree(&self) -> &IndexTree {
        &self.tree
    }

    pub fn context(&self) -> &IndexContext {
        &self.ctx
    }

    pub fn config(&self) -> &IndexConfig {
        &self.ctx.config
    }

    pub fn synchronizer(&self) -> FolderSynchronizer<'_> {
        FolderSynchronizer::new(&self.tree, &self.ctx, &self.collaborators, &self.exclusions)
    }

    /// Query engine able to list folders on demand
    pub fn query_engine(&self) -> QueryEngine<'_> {
        QueryEngine::new(&self.tree, &self.ctx).with_synchronizer(self.synchronizer())
    }

    /// Token for a new query
    ///
    /// Starting the next query, or a synchronization pass that changes the
    /// tree, cancels it; the caller re-issues the query on the new state.
    pub fn begin_query(&self) -> CancellationToken {
        self.ctx.versions.begin()
    }

    /// Parse and run a query, resolving place names through the geo index
    pub fn search(&self, text: &str, filter: QueryFilter, cancel: &CancellationToken) -> Vec<Arc<ResultItem>> {
        let geo: Option<Arc<GeoIndex>> = self.ctx.locations.get();
        let search = SearchParser::with_locations(geo.as_deref()).parse(text);
        self.query_engine().with_filter(filter).collect(&search, cancel)
    }

    /// Seed the tree with persisted scan results
    ///
    /// Seeds are applied when the synchronizer first creates the matching
    /// file record.
    pub fn merge_persisted(&self, records: Vec<PersistRecord>) -> usize {
        let count = self.tree.seed(records);
        log::info!("Merged {} persisted records ({} pending)", count, self.tree.pending_seeds());
        count
    }

    fn is_under_root(&self, path: &Path) -> bool {
        self.ctx.config.index.roots.iter().any(|root| path.starts_with(root))
    }

    /// Synchronize every configured root, breadth-first
    pub fn index_roots(&self, cancel: &CancellationToken) -> Result<IndexStats> {
        let _indexing = self.ctx.counters.track(Activity::Indexing);
        let start = Instant::now();
        let now = Utc::now();

        let roots = &self.ctx.config.index.roots;
        if roots.is_empty() {
            log::warn!("No roots configured, nothing to index");
        }
        log::info!("Indexing {} roots", roots.len());

        let mut stats = IndexStats::default();
        let level: Vec<PathBuf> = roots.clone();
        self.sync_levels(level, true, now, cancel, &mut stats);

        self.finish_index_stats(&mut stats);
        log::info!(
            "Indexed {} folders ({} changed, {} removed), {} files in {:?}{}",
            stats.folders_synced,
            stats.folders_changed,
            stats.folders_removed,
            stats.total_files,
            start.elapsed(),
            if stats.cancelled { " (cancelled)" } else { "" }
        );
        *self.last_index.lock() = Some(stats.clone());
        Ok(stats)
    }

    /// Synchronize level after level, in parallel within a level
    ///
    /// With `descend_all` unset only folders not yet in the tree are visited
    /// below the first level.
    fn sync_levels(
        &self,
        mut level: Vec<PathBuf>,
        descend_all: bool,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        stats: &mut IndexStats,
    ) {
        let sync = self.synchronizer();

        while !level.is_empty() {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }

            let outcomes: Vec<_> = self.pool.install(|| {
                level
                    .par_iter()
                    .map(|path| {
                        if cancel.is_cancelled() {
                            return (path, None);
                        }
                        let mark_indexed = self.is_under_root(path);
                        (path, Some(sync.validate_folder(path, mark_indexed, true, now)))
                    })
                    .collect()
            });

            let mut next = Vec::new();
            for (path, outcome) in outcomes {
                match outcome {
                    None => stats.cancelled = true,
                    Some(Err(e)) => log::warn!("Failed to synchronize {}: {:#}", path.display(), e),
                    Some(Ok(outcome)) => {
                        stats.folders_synced += 1;
                        stats.folders_changed += usize::from(outcome.changed);
                        stats.folders_removed += outcome.removed.len();
                        if descend_all {
                            next.extend(outcome.subfolders);
                        } else {
                            next.extend(outcome.subfolders.into_iter().filter(|s| self.tree.find(s).is_none()));
                        }
                    }
                }
            }
            level = next;
        }

        if stats.folders_changed + stats.folders_removed > 0 {
            // Queries running over the old tree are stale now
            self.ctx.versions.next_version();
            self.ctx.invalidate(ViewCategory::Folders);
            self.ctx.invalidate(ViewCategory::Items);
        }
    }

    fn finish_index_stats(&self, stats: &mut IndexStats) {
        let mut by_type = HashMap::new();
        let mut total = 0;
        for folder in self.tree.indexed_folders() {
            total += folder.files.len();
            for file in &folder.files {
                *by_type.entry(file.file_type.media_type).or_insert(0) += 1;
            }
        }
        stats.total_files = total;
        stats.files_by_type = by_type;
    }

    /// Re-synchronize the folders around changed paths
    ///
    /// Every path refreshes its parent folder, and a path naming a known
    /// folder refreshes that folder too. Folders that appear are walked
    /// recursively.
    pub fn sync_paths(&self, paths: &[PathBuf], cancel: &CancellationToken) -> Result<IndexStats> {
        let _indexing = self.ctx.counters.track(Activity::Indexing);
        let now = Utc::now();

        let folders: BTreeSet<PathBuf> = paths
            .iter()
            .flat_map(|path| {
                let known = self.tree.find(path).map(|_| path.clone());
                known.into_iter().chain(path.parent().map(Path::to_path_buf))
            })
            .filter(|folder| self.tree.find(folder).is_some() || self.is_under_root(folder))
            .collect();

        log::debug!("Synchronizing {} folders for {} changed paths", folders.len(), paths.len());
        let mut stats = IndexStats::default();
        self.sync_levels(folders.into_iter().collect(), false, now, cancel, &mut stats);
        self.finish_index_stats(&mut stats);
        Ok(stats)
    }

    /// Scan every file whose metadata is older than its contents
    pub fn scan_metadata(&self, cancel: &CancellationToken) -> ScanStats {
        let _scanning = self.ctx.counters.track(Activity::ScanningItems);
        let start = Instant::now();
        let max_failures = self.ctx.config.index.max_scan_failures;

        let mut stats = ScanStats::default();
        let mut candidates = Vec::new();
        for folder in self.tree.indexed_folders() {
            for file in &folder.files {
                if file.flags.sidecar || !file.file_type.traits.has_metadata || !file.needs_scan() {
                    continue;
                }
                let path = folder.file_path(file);
                if self.ctx.blocklist.should_skip(&path, file.modified, max_failures) {
                    stats.skipped += 1;
                    continue;
                }
                let xmp = file.metadata().and_then(|m| {
                    m.sidecars
                        .iter()
                        .find(|s| s.to_ascii_lowercase().ends_with(".xmp"))
                        .map(|s| folder.child_path(s))
                });
                candidates.push(ScanCandidate {
                    folder: folder.clone(),
                    file: file.clone(),
                    path,
                    xmp,
                });
            }
        }
        stats.candidates = candidates.len();
        if candidates.is_empty() {
            *self.last_scan.lock() = Some(stats.clone());
            return stats;
        }

        log::info!("Scanning metadata of {} files ({} skipped)", candidates.len(), stats.skipped);
        let geo = self.ctx.locations.get();
        let outcomes: Vec<ScanOutcome> = self.pool.install(|| {
            candidates
                .par_iter()
                .map(|candidate| self.scan_one(candidate, geo.as_deref(), cancel))
                .collect()
        });

        let mut touched = BTreeSet::new();
        let mut located = false;
        for (candidate, outcome) in candidates.iter().zip(outcomes) {
            match outcome {
                ScanOutcome::Scanned { has_location } => {
                    stats.scanned += 1;
                    located |= has_location;
                    touched.insert(candidate.folder.path.clone());
                }
                ScanOutcome::Failed => stats.failed += 1,
                ScanOutcome::Cancelled => stats.cancelled = true,
            }
        }

        for folder in &touched {
            self.tree.reset_bloom_bits(folder);
        }
        if !touched.is_empty() {
            self.ctx.invalidate(ViewCategory::Metadata);
        }
        if located {
            self.ctx.invalidate(ViewCategory::Locations);
        }

        log::info!(
            "Scanned {} files ({} failed, {} skipped) in {:?}{}",
            stats.scanned,
            stats.failed,
            stats.skipped,
            start.elapsed(),
            if stats.cancelled { " (cancelled)" } else { "" }
        );
        *self.last_scan.lock() = Some(stats.clone());
        stats
    }

    fn scan_one(&self, candidate: &ScanCandidate, geo: Option<&GeoIndex>, cancel: &CancellationToken) -> ScanOutcome {
        if cancel.is_cancelled() {
            return ScanOutcome::Cancelled;
        }

        let file = &candidate.file;
        let want_thumbnail = self.ctx.config.index.thumbnails && file.file_type.traits.can_thumbnail;
        let _thumbnailing = want_thumbnail.then(|| self.ctx.counters.track(Activity::ThumbnailingItems));

        let request = ScanRequest {
            path: &candidate.path,
            want_thumbnail,
            file_type: &file.file_type,
            xmp_sidecar: candidate.xmp.as_deref(),
            max_thumbnail_size: self.ctx.config.index.max_thumbnail_size,
        };

        match self.collaborators.scanner.scan(&request) {
            Ok(output) => {
                let now = Utc::now();
                let mut metadata = output.metadata;
                let has_location = match (metadata.as_mut(), geo) {
                    (Some(m), Some(geo)) => enrich_location(m, geo),
                    (Some(m), None) => m.gps.is_some(),
                    _ => false,
                };

                file.set_scan_result(metadata.clone(), output.content_hash, now);
                self.ctx.blocklist.record_success(&candidate.path);
                self.collaborators.sink.enqueue(PersistRecord {
                    path: candidate.path.to_string_lossy().into_owned(),
                    metadata,
                    thumbnail: output.thumbnail,
                    content_hash: output.content_hash,
                    scanned: now,
                });
                ScanOutcome::Scanned { has_location }
            }
            Err(e) => {
                let failures = self.ctx.blocklist.record_failure(&candidate.path, file.modified);
                log::warn!("Failed to scan {} (attempt {}): {}", candidate.path.display(), failures, e);
                ScanOutcome::Failed
            }
        }
    }

    /// Recompute duplicate groups
    ///
    /// `None` when a run was already in progress.
    pub fn update_predictions(&self, cancel: &CancellationToken) -> Option<DuplicateStats> {
        let _detecting = self.ctx.counters.track(Activity::Detecting);
        let stats = self
            .duplicates
            .update_predictions(&self.tree, &self.ctx.config.duplicates, cancel)?;
        if !stats.cancelled {
            self.ctx.invalidate(ViewCategory::Duplicates);
        }
        Some(stats)
    }

    /// Full pass: synchronize, scan, predict
    pub fn refresh(&self, cancel: &CancellationToken) -> Result<IndexStats> {
        let stats = self.index_roots(cancel)?;
        if !stats.cancelled {
            self.scan_metadata(cancel);
        }
        if !cancel.is_cancelled() {
            self.update_predictions(cancel);
        }
        Ok(stats)
    }

    /// Block until queued persistence records are written
    pub fn flush(&self) {
        self.collaborators.sink.flush();
    }

    pub fn status(&self) -> IndexingStatus {
        let activity = self.ctx.counters.snapshot();
        let busy = activity.indexing + activity.scanning_items + activity.detecting + activity.thumbnailing_items > 0
            || self.duplicates.is_running();
        IndexingStatus {
            state: if busy { IndexerState::Running } else { IndexerState::Idle },
            activity,
            folders: self.tree.len(),
            files: self.tree.file_count(),
            pending_seeds: self.tree.pending_seeds(),
            pending_writes: self.collaborators.sink.pending(),
            blocked_files: self.ctx.blocklist.len(),
            last_index: self.last_index.lock().clone(),
            last_scan: self.last_scan.lock().clone(),
            last_duplicates: self.duplicates.last_stats(),
            updated_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Fill place names from the closest known place; true if the item has gps
fn enrich_location(metadata: &mut FileMetadata, geo: &GeoIndex) -> bool {
    let Some(gps) = metadata.gps else {
        return false;
    };
    if metadata.place.is_none() {
        if let Some(location) = geo.find_closest(gps.lat, gps.lon) {
            metadata.place = Some(location.name);
            if metadata.state.is_none() {
                metadata.state = location.state;
            }
            if metadata.country.is_none() {
                metadata.country = location.country;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{PlacesTable, tables};
    use crate::models::GeoCoord;

    #[test]
    fn test_enrich_location_keeps_existing_names() {
        let geo = GeoIndex::from_tables(
            PlacesTable::from_bytes(b"1\t48.8566\t2.3522\t11\tFR\t2138551\tParis\n".to_vec()),
            tables::parse_countries("FR\tFrance\n"),
            tables::parse_states("FR.11\tIle-de-France\n"),
        );

        let mut meta = FileMetadata {
            gps: Some(GeoCoord::new(48.85, 2.35)),
            ..Default::default()
        };
        assert!(enrich_location(&mut meta, &geo));
        assert_eq!(meta.place.as_deref(), Some("Paris"));
        assert_eq!(meta.state.as_deref(), Some("Ile-de-France"));
        assert_eq!(meta.country.as_deref(), Some("France"));

        let mut named = FileMetadata {
            gps: Some(GeoCoord::new(48.85, 2.35)),
            place: Some("Home".into()),
            ..Default::default()
        };
        enrich_location(&mut named, &geo);
        assert_eq!(named.place.as_deref(), Some("Home"));
        assert_eq!(named.country, None);

        assert!(!enrich_location(&mut FileMetadata::default(), &geo));
    }

    #[test]
    fn test_status_of_empty_indexer() {
        let indexer = Indexer::new(IndexConfig::default(), Collaborators::local(false)).unwrap();
        let status = indexer.status();
        assert_eq!(status.state, IndexerState::Idle);
        assert_eq!(status.folders, 0);
        assert!(status.last_index.is_none());

        let stats = indexer.index_roots(&CancellationToken::noop()).unwrap();
        assert_eq!(stats.folders_synced, 0);
        assert!(indexer.status().last_index.is_some());
    }
}

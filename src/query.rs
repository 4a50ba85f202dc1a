//! Query executor over the index tree
//!
//! Two modes:
//! - **Selector mode**: the search names folders; only those folders (and
//!   their subtrees for recursive selectors) are walked, optionally
//!   refreshing each from the file system first.
//! - **Whole-index mode**: every indexed folder is considered, with folder
//!   bloom bits used to skip folders that cannot contain a match.
//!
//! Queries are abortable. The cancellation token is checked before every
//! folder and file; results already delivered to the callback stay delivered.

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::context::{Activity, IndexContext};
use crate::models::MediaType;
use crate::records::{FileRecord, FolderRecord, folder_key};
use crate::search::{SearchMatcher, SearchT, Selector};
use crate::sync::FolderSynchronizer;
use crate::tree::IndexTree;

/// Query options
#[derive(Debug, Clone)]
pub struct QueryFilter {
    /// Re-list selector folders from the file system before matching
    pub refresh_from_fs: bool,
    /// Report matching folders as well as files
    pub include_folders: bool,
    /// Report files attached to another file as sidecars
    pub show_sidecars: bool,
    /// Stop after this many results
    pub limit: Option<usize>,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            refresh_from_fs: false,
            include_folders: true,
            show_sidecars: false,
            limit: None,
        }
    }
}

/// One query result
#[derive(Debug, Clone)]
pub enum ResultItem {
    File { path: PathBuf, file: Arc<FileRecord> },
    Folder { path: PathBuf, record: Option<Arc<FolderRecord>> },
}

impl ResultItem {
    pub fn path(&self) -> &Path {
        match self {
            ResultItem::File { path, .. } | ResultItem::Folder { path, .. } => path,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ResultItem::File { .. })
    }

    pub fn file(&self) -> Option<&Arc<FileRecord>> {
        match self {
            ResultItem::File { file, .. } => Some(file),
            ResultItem::Folder { .. } => None,
        }
    }
}

/// Results a caller already holds, keyed by normalized path
///
/// Queries hand back the held item instead of creating a second one for
/// the same path.
#[derive(Debug, Default, Clone)]
pub struct ResultSet {
    items: HashMap<String, Arc<ResultItem>>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&Arc<ResultItem>> {
        self.items.get(&folder_key(path))
    }

    /// Add an item; an item already held for the same path wins
    pub fn insert(&mut self, item: Arc<ResultItem>) -> Arc<ResultItem> {
        self.items.entry(folder_key(item.path())).or_insert(item).clone()
    }

    /// The held item for this path, or the new one
    fn resolve(&self, item: ResultItem) -> Arc<ResultItem> {
        match self.get(item.path()) {
            Some(held) => held.clone(),
            None => Arc::new(item),
        }
    }
}

impl FromIterator<Arc<ResultItem>> for ResultSet {
    fn from_iter<I: IntoIterator<Item = Arc<ResultItem>>>(iter: I) -> Self {
        let mut set = ResultSet::new();
        for item in iter {
            set.insert(item);
        }
        set
    }
}

/// Counters reported by one query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryStats {
    pub folders_visited: usize,
    /// Folders skipped whole by their bloom bits
    pub folders_skipped: usize,
    pub files_checked: usize,
    /// Files rejected by their own bloom bits
    pub files_filtered: usize,
    pub matches: usize,
    /// Matches answered with an item the caller already held
    pub reused: usize,
    pub cancelled: bool,
}

/// Counts of matches by category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchHistogram {
    pub files: usize,
    pub folders: usize,
    /// Files per year of capture (or creation) time
    pub by_year: BTreeMap<i32, usize>,
    pub by_type: BTreeMap<MediaType, usize>,
    /// Files in a duplicate group
    pub duplicates: usize,
    pub cancelled: bool,
}

/// Executes searches against an index tree
pub struct QueryEngine<'a> {
    tree: &'a IndexTree,
    ctx: &'a IndexContext,
    synchronizer: Option<FolderSynchronizer<'a>>,
    filter: QueryFilter,
}

impl<'a> QueryEngine<'a> {
    pub fn new(tree: &'a IndexTree, ctx: &'a IndexContext) -> Self {
        let filter = QueryFilter {
            show_sidecars: ctx.config.index.show_sidecars,
            ..QueryFilter::default()
        };
        Self {
            tree,
            ctx,
            synchronizer: None,
            filter,
        }
    }

    /// Allow selector queries to list folders missing from the tree and to
    /// refresh folders when the filter asks for it
    pub fn with_synchronizer(mut self, synchronizer: FolderSynchronizer<'a>) -> Self {
        self.synchronizer = Some(synchronizer);
        self
    }

    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Run a search, passing every match to `callback`
    pub fn query_items(
        &self,
        search: &SearchT,
        existing: &ResultSet,
        mut callback: impl FnMut(Arc<ResultItem>),
        cancel: &CancellationToken,
    ) -> QueryStats {
        let _searching = self.ctx.counters.track(Activity::Searching);
        let matcher = SearchMatcher::new(search);
        let mut run = Run {
            matcher: &matcher,
            filter: &self.filter,
            existing,
            callback: &mut callback,
            stats: QueryStats::default(),
        };

        if search.selectors.is_empty() {
            self.query_index(&mut run, cancel);
        } else {
            for selector in &search.selectors {
                if !self.query_selector(&mut run, selector, cancel) {
                    break;
                }
            }
        }

        run.stats.cancelled = cancel.is_cancelled();
        log::debug!(
            "Query '{}': {} matches, {} folders visited, {} skipped, {} files checked, {} filtered{}",
            search.text,
            run.stats.matches,
            run.stats.folders_visited,
            run.stats.folders_skipped,
            run.stats.files_checked,
            run.stats.files_filtered,
            if run.stats.cancelled { " (cancelled)" } else { "" }
        );
        run.stats
    }

    /// Collect every match of a search
    pub fn collect(&self, search: &SearchT, cancel: &CancellationToken) -> Vec<Arc<ResultItem>> {
        let mut items = Vec::new();
        self.query_items(search, &ResultSet::new(), |item| items.push(item), cancel);
        items
    }

    /// Histogram of what a search matches
    pub fn count_matches(&self, search: &SearchT, cancel: &CancellationToken) -> MatchHistogram {
        let mut histogram = MatchHistogram::default();
        let stats = self.query_items(
            search,
            &ResultSet::new(),
            |item| match item.as_ref() {
                ResultItem::File { file, .. } => {
                    histogram.files += 1;
                    *histogram.by_year.entry(file.created_or_taken().year()).or_default() += 1;
                    *histogram.by_type.entry(file.file_type.media_type).or_default() += 1;
                    if file.duplicates().is_duplicate() {
                        histogram.duplicates += 1;
                    }
                }
                ResultItem::Folder { .. } => histogram.folders += 1,
            },
            cancel,
        );
        histogram.cancelled = stats.cancelled;
        histogram
    }

    /// Every other file in the duplicate group of `path`
    pub fn duplicates_of(
        &self,
        path: &Path,
        existing: &ResultSet,
        mut callback: impl FnMut(Arc<ResultItem>),
        cancel: &CancellationToken,
    ) -> QueryStats {
        let _searching = self.ctx.counters.track(Activity::Searching);
        let mut stats = QueryStats::default();

        let Some((_, source)) = self.tree.find_file(path) else {
            log::debug!("duplicates_of: {} is not indexed", path.display());
            return stats;
        };
        let group = source.duplicates();
        if !group.is_duplicate() {
            return stats;
        }

        let mut remaining = group.group_size.saturating_sub(1) as usize;
        for folder in self.tree.indexed_folders() {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            stats.folders_visited += 1;
            for file in &folder.files {
                stats.files_checked += 1;
                if Arc::ptr_eq(file, &source) || file.duplicates().group_id != group.group_id {
                    continue;
                }
                let item = ResultItem::File {
                    path: folder.file_path(file),
                    file: file.clone(),
                };
                if existing.get(item.path()).is_some() {
                    stats.reused += 1;
                }
                callback(existing.resolve(item));
                stats.matches += 1;
                remaining = remaining.saturating_sub(1);
            }
            if remaining == 0 {
                break;
            }
        }
        stats
    }

    fn query_index(&self, run: &mut Run<'_>, cancel: &CancellationToken) {
        // Browsing everything is what selectors are for
        if run.matcher.is_empty() {
            return;
        }
        let query_bits = run.matcher.query_bits();

        for folder in self.tree.indexed_folders() {
            if cancel.is_cancelled() {
                return;
            }
            if !run.matcher.can_match_folder() && !folder.bloom().potential_match(query_bits) {
                run.stats.folders_skipped += 1;
                continue;
            }
            run.stats.folders_visited += 1;

            if run.filter.include_folders
                && run.matcher.can_match_folder()
                && run.matcher.match_folder(&folder.name())
                && !run.emit(ResultItem::Folder {
                    path: folder.path.clone(),
                    record: Some(folder.clone()),
                })
            {
                return;
            }

            if folder.files_bloom().potential_match(query_bits) && !run.match_files(&folder, None, cancel) {
                return;
            }
        }
    }

    /// Walk one selector; returns false when the query should stop
    fn query_selector(&self, run: &mut Run<'_>, selector: &Selector, cancel: &CancellationToken) -> bool {
        let now: DateTime<Utc> = Utc::now();
        let query_bits = run.matcher.query_bits();
        let mut queue = VecDeque::from([selector.path.clone()]);

        while let Some(path) = queue.pop_front() {
            if cancel.is_cancelled() {
                return false;
            }

            let Some(folder) = self.load_folder(&path, now) else {
                continue;
            };
            if !run.matcher.can_match_folder() && !folder.bloom().potential_match(query_bits) {
                run.stats.folders_skipped += 1;
                continue;
            }
            run.stats.folders_visited += 1;

            for entry in &folder.subfolders {
                if entry.is_excluded {
                    continue;
                }
                let child = folder.child_path(&entry.name);
                if run.filter.include_folders && selector.accepts(&entry.name) && run.matcher.match_folder(&entry.name) {
                    let record = self.tree.find(&child);
                    if !run.emit(ResultItem::Folder {
                        path: child.clone(),
                        record,
                    }) {
                        return false;
                    }
                }
                if selector.recursive {
                    queue.push_back(child);
                }
            }

            if folder.files_bloom().potential_match(query_bits) && !run.match_files(&folder, Some(selector), cancel) {
                return false;
            }
        }
        true
    }

    fn load_folder(&self, path: &Path, now: DateTime<Utc>) -> Option<Arc<FolderRecord>> {
        let existing = self.tree.find(path);
        let Some(sync) = &self.synchronizer else {
            return existing;
        };
        if existing.is_some() && !self.filter.refresh_from_fs {
            return existing;
        }

        match sync.validate_folder(path, false, self.filter.refresh_from_fs, now) {
            Ok(outcome) => outcome.record,
            Err(e) => {
                log::warn!("Failed to refresh {}: {:#}", path.display(), e);
                existing
            }
        }
    }
}

/// State of one running query
struct Run<'r> {
    matcher: &'r SearchMatcher<'r>,
    filter: &'r QueryFilter,
    existing: &'r ResultSet,
    callback: &'r mut dyn FnMut(Arc<ResultItem>),
    stats: QueryStats,
}

impl Run<'_> {
    /// Deliver a match; returns false once the limit is reached
    fn emit(&mut self, item: ResultItem) -> bool {
        if self.existing.get(item.path()).is_some() {
            self.stats.reused += 1;
        }
        (self.callback)(self.existing.resolve(item));
        self.stats.matches += 1;
        self.filter.limit.is_none_or(|limit| self.stats.matches < limit)
    }

    fn match_files(&mut self, folder: &FolderRecord, selector: Option<&Selector>, cancel: &CancellationToken) -> bool {
        for file in &folder.files {
            if cancel.is_cancelled() {
                return false;
            }
            if file.flags.sidecar && !self.filter.show_sidecars {
                continue;
            }
            if selector.is_some_and(|s| !s.accepts(&file.name)) {
                continue;
            }

            self.stats.files_checked += 1;
            let path = folder.file_path(file);
            let result = self.matcher.match_item(&path, file);
            if result == crate::search::SearchResult::Filtered {
                self.stats.files_filtered += 1;
            }
            if result.is_match()
                && !self.emit(ResultItem::File {
                    path,
                    file: file.clone(),
                })
            {
                return false;
            }
        }
        true
    }
}

//! Batch duplicate prediction
//!
//! Every candidate file emits several bucket keys (content or size, creation
//! time, name). Files sharing a key are compared pairwise with
//! [`is_dup_match`] and confirmed pairs are joined in a disjoint-set forest.
//! Work is bounded by the longest run of equal keys rather than the square of
//! the file count.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::cancel::CancellationToken;
use crate::config::DuplicateSection;
use crate::records::{DuplicateInfo, FileRecord};
use crate::tree::IndexTree;

/// Outcome of one prediction run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateStats {
    pub candidates: usize,
    pub buckets: usize,
    /// Longest run of equal bucket keys seen
    pub largest_run: usize,
    pub comparisons: usize,
    pub groups: usize,
    /// Files that ended up in a group
    pub duplicates: usize,
    pub cancelled: bool,
}

/// The facts about a file the match policy looks at
#[derive(Debug, Clone)]
pub struct DupCandidate {
    pub file: Arc<FileRecord>,
    pub name: String,
    pub size: u64,
    pub crc32c: Option<u32>,
    pub created: DateTime<Utc>,
    pub taken: Option<DateTime<Utc>>,
}

impl DupCandidate {
    pub fn new(file: Arc<FileRecord>) -> Self {
        let taken = file.metadata().and_then(|m| m.taken);
        Self {
            name: file.name.to_lowercase(),
            size: file.size,
            crc32c: file.crc32c(),
            created: file.created,
            taken,
            file,
        }
    }
}

/// Equality policy for "same underlying content"
///
/// Sizes must agree. When both files carry a content hash the hashes decide.
/// Otherwise the files must share a name (case-insensitively) with creation
/// times within `tolerance_secs`, or carry the same capture time.
pub fn is_dup_match(a: &DupCandidate, b: &DupCandidate, tolerance_secs: i64) -> bool {
    if a.size != b.size {
        return false;
    }

    match (a.crc32c, b.crc32c) {
        (Some(x), Some(y)) => x == y,
        _ => {
            let same_name = a.name == b.name && (a.created - b.created).num_seconds().abs() <= tolerance_secs;
            let same_capture = a.taken.is_some() && a.taken == b.taken;
            same_name || same_capture
        }
    }
}

#[derive(Hash)]
enum BucketKey<'a> {
    Content(u32, u64),
    Size(u64),
    Created(i64),
    Name(&'a str),
}

impl BucketKey<'_> {
    fn hash64(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Disjoint-set forest with path halving and union by rank
struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Runs duplicate prediction over the whole index
#[derive(Debug)]
pub struct DuplicateDetector {
    running: Mutex<()>,
    next_group: AtomicU32,
    last: Mutex<Option<DuplicateStats>>,
}

impl DuplicateDetector {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(()),
            next_group: AtomicU32::new(1),
            last: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_locked()
    }

    pub fn last_stats(&self) -> Option<DuplicateStats> {
        self.last.lock().clone()
    }

    /// Recompute duplicate groups for every indexed file
    ///
    /// Returns `None` without doing anything if another run is in progress.
    /// A cancelled run leaves the previous groups in place.
    pub fn update_predictions(
        &self,
        tree: &IndexTree,
        policy: &DuplicateSection,
        cancel: &CancellationToken,
    ) -> Option<DuplicateStats> {
        let Some(_running) = self.running.try_lock() else {
            log::debug!("Duplicate prediction already running, skipping");
            return None;
        };

        let mut stats = DuplicateStats::default();
        let candidates = collect_candidates(tree, policy);
        stats.candidates = candidates.len();

        let max_existing = candidates
            .iter()
            .map(|c| c.file.duplicates().group_id)
            .max()
            .unwrap_or(0);
        self.next_group.fetch_max(max_existing.saturating_add(1), Ordering::SeqCst);

        let tolerance = policy.created_tolerance_secs.max(0);
        let bucket_width = tolerance.max(1);

        let mut keys: Vec<(u64, usize)> = Vec::with_capacity(candidates.len() * 3);
        for (i, c) in candidates.iter().enumerate() {
            let content = match c.crc32c {
                Some(crc) => BucketKey::Content(crc, c.size),
                None => BucketKey::Size(c.size),
            };
            let created = c.taken.unwrap_or(c.created).timestamp().div_euclid(bucket_width);
            keys.push((content.hash64(), i));
            keys.push((BucketKey::Created(created).hash64(), i));
            keys.push((BucketKey::Name(&c.name).hash64(), i));
        }
        keys.sort_unstable();

        let mut sets = DisjointSet::new(candidates.len());
        for run in keys.chunk_by(|a, b| a.0 == b.0) {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            stats.buckets += 1;
            stats.largest_run = stats.largest_run.max(run.len());

            for (x, &(_, i)) in run.iter().enumerate() {
                for &(_, j) in &run[x + 1..] {
                    if i == j || sets.find(i) == sets.find(j) {
                        continue;
                    }
                    stats.comparisons += 1;
                    if is_dup_match(&candidates[i], &candidates[j], tolerance) {
                        sets.union(i, j);
                    }
                }
            }
        }

        if stats.cancelled {
            log::info!("Duplicate prediction cancelled after {} buckets", stats.buckets);
            *self.last.lock() = Some(stats.clone());
            return Some(stats);
        }

        self.assign_groups(&candidates, &mut sets, &mut stats);

        log::info!(
            "Duplicate prediction: {} candidates, {} groups, {} files, largest run {}",
            stats.candidates,
            stats.groups,
            stats.duplicates,
            stats.largest_run
        );
        *self.last.lock() = Some(stats.clone());
        Some(stats)
    }

    /// Publish group ids, keeping a group's previous id where possible
    fn assign_groups(&self, candidates: &[DupCandidate], sets: &mut DisjointSet, stats: &mut DuplicateStats) {
        let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..candidates.len() {
            components.entry(sets.find(i)).or_default().push(i);
        }

        let mut groups: Vec<Vec<usize>> = components.into_values().filter(|m| m.len() > 1).collect();
        // Deterministic id reuse: groups holding the oldest ids choose first
        groups.sort_by_key(|members| {
            members
                .iter()
                .map(|&i| candidates[i].file.duplicates().group_id)
                .filter(|&id| id != 0)
                .min()
                .unwrap_or(u32::MAX)
        });

        let mut used: HashSet<u32> = HashSet::new();
        let mut assigned = vec![DuplicateInfo::NONE; candidates.len()];

        for members in &groups {
            let mut previous: Vec<u32> = members
                .iter()
                .map(|&i| candidates[i].file.duplicates().group_id)
                .filter(|&id| id != 0 && !used.contains(&id))
                .collect();
            previous.sort_unstable();

            let group_id = match previous.first() {
                Some(&id) => id,
                None => self.next_group.fetch_add(1, Ordering::SeqCst),
            };
            used.insert(group_id);

            let info = DuplicateInfo {
                group_id,
                group_size: members.len() as u32,
            };
            for &i in members {
                assigned[i] = info;
            }
            stats.groups += 1;
            stats.duplicates += members.len();
        }

        for (candidate, info) in candidates.iter().zip(assigned) {
            candidate.file.set_duplicates(info);
        }
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Files eligible for duplicate prediction
///
/// Empty files, sidecars, files below the minimum size and files outside
/// indexed folders never take part; any stale group on them is cleared.
fn collect_candidates(tree: &IndexTree, policy: &DuplicateSection) -> Vec<DupCandidate> {
    let mut candidates = Vec::new();
    for folder in tree.indexed_folders() {
        for file in &folder.files {
            let eligible = file.size > 0
                && file.size >= policy.min_size
                && !file.flags.sidecar
                && !file.file_type.traits.is_sidecar;
            if eligible {
                candidates.push(DupCandidate::new(Arc::clone(file)));
            } else if file.duplicates().is_duplicate() {
                file.set_duplicates(DuplicateInfo::NONE);
            }
        }
    }
    candidates
}

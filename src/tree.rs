//! Path-keyed arena of folder records
//!
//! The tree owns every [`FolderRecord`] behind an `Arc`. Structural updates
//! swap a whole record under the exclusive lock; readers clone the `Arc`
//! under the shared lock and keep a consistent snapshot for as long as they
//! like. Folder bloom bits are atomics on the record and are refreshed in
//! place.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bloom::BloomBits;
use crate::models::PersistRecord;
use crate::records::{FileRecord, FolderEntry, FolderRecord, folder_key, name_eq};

/// The in-memory mirror of the indexed file system
#[derive(Debug, Default)]
pub struct IndexTree {
    folders: RwLock<HashMap<String, Arc<FolderRecord>>>,
    /// Persisted scan results waiting for their file to be listed, keyed by
    /// parent folder key and then by lowercased file name
    seeds: Mutex<BTreeMap<String, HashMap<String, PersistRecord>>>,
}

impl IndexTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.folders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.read().is_empty()
    }

    pub fn find(&self, path: &Path) -> Option<Arc<FolderRecord>> {
        self.folders.read().get(&folder_key(path)).cloned()
    }

    /// Existing record, or a freshly inserted empty placeholder
    pub fn find_or_create(&self, path: &Path, is_indexed: bool) -> Arc<FolderRecord> {
        let key = folder_key(path);
        if let Some(record) = self.folders.read().get(&key) {
            return Arc::clone(record);
        }

        let mut folders = self.folders.write();
        Arc::clone(
            folders
                .entry(key)
                .or_insert_with(|| Arc::new(FolderRecord::empty(path, is_indexed))),
        )
    }

    /// Publish a record, replacing any previous one for the same path
    ///
    /// Readers that already hold the old record keep it unchanged.
    pub fn replace(&self, record: FolderRecord) -> Arc<FolderRecord> {
        if !record.is_sorted() {
            debug_assert!(false, "unsorted record for {}", record.path.display());
            log::error!("Refusing unsorted folder record for {}", record.path.display());
            let FolderRecord { path, files, subfolders, is_indexed, is_excluded, created, modified, .. } = record;
            return self.replace(
                FolderRecord::new(path, files, subfolders, is_indexed, is_excluded)
                    .with_timestamps(created, modified),
            );
        }

        let record = Arc::new(record);
        self.folders
            .write()
            .insert(folder_key(&record.path), Arc::clone(&record));
        record
    }

    /// Remove the given folders (not their descendants); returns how many existed
    pub fn erase<P: AsRef<Path>>(&self, paths: impl IntoIterator<Item = P>) -> usize {
        let mut folders = self.folders.write();
        paths
            .into_iter()
            .filter(|p| folders.remove(&folder_key(p.as_ref())).is_some())
            .count()
    }

    /// Remove a folder and everything below it; returns the removed paths
    ///
    /// Seeds waiting anywhere in the subtree are dropped as well.
    pub fn erase_subtree(&self, path: &Path) -> Vec<PathBuf> {
        let key = folder_key(path);
        let prefix = subtree_prefix(&key);

        self.drop_seeds_below(&key, |_| true);

        let mut folders = self.folders.write();
        let doomed: Vec<String> = folders
            .keys()
            .filter(|k| **k == key || k.starts_with(&prefix))
            .cloned()
            .collect();

        doomed
            .into_iter()
            .filter_map(|k| folders.remove(&k))
            .map(|record| record.path.clone())
            .collect()
    }

    /// Snapshot of every folder record, in no particular order
    pub fn all_folders(&self) -> impl Iterator<Item = Arc<FolderRecord>> + use<> {
        let snapshot: Vec<Arc<FolderRecord>> = self.folders.read().values().cloned().collect();
        snapshot.into_iter()
    }

    /// Snapshot of indexed, non-excluded folders sorted by path
    pub fn indexed_folders(&self) -> Vec<Arc<FolderRecord>> {
        let mut folders: Vec<_> = self
            .all_folders()
            .filter(|f| f.is_indexed && !f.is_excluded)
            .collect();
        folders.sort_by_key(|f| folder_key(&f.path));
        folders
    }

    /// Look up a file by its full path
    pub fn find_file(&self, path: &Path) -> Option<(Arc<FolderRecord>, Arc<FileRecord>)> {
        let folder = self.find(path.parent()?)?;
        let name = path.file_name()?.to_string_lossy();
        let file = folder.find_file(&name).cloned()?;
        Some((folder, file))
    }

    /// Recompute a folder's bloom bits from its children and propagate upward
    ///
    /// The folder itself is always recomputed; ancestors are only visited
    /// while their bits keep changing.
    pub fn reset_bloom_bits(&self, path: &Path) {
        let Some(start) = self.find(path) else {
            return;
        };
        start.set_bloom(self.folder_bloom(&start));
        let mut current = start.path.parent().and_then(|parent| self.find(parent));

        while let Some(folder) = current {
            let bits = self.folder_bloom(&folder);
            if !folder.set_bloom(bits) {
                break;
            }
            current = folder.path.parent().and_then(|parent| self.find(parent));
        }
    }

    /// Recompute every folder bottom-up (deepest paths first)
    pub fn reset_all_bloom_bits(&self) {
        let mut folders: Vec<_> = self.all_folders().collect();
        folders.sort_by_key(|f| std::cmp::Reverse(f.path.components().count()));
        for folder in folders {
            folder.set_bloom(self.folder_bloom(&folder));
        }
    }

    fn folder_bloom(&self, folder: &FolderRecord) -> BloomBits {
        folder.subfolders.iter().fold(folder.files_bloom(), |acc, entry| {
            match self.find(&folder.child_path(&entry.name)) {
                Some(child) => acc | child.bloom(),
                None => acc,
            }
        })
    }

    /// Queue persisted scan results to be applied when their files are listed
    pub fn seed(&self, records: impl IntoIterator<Item = PersistRecord>) -> usize {
        let mut seeds = self.seeds.lock();
        let mut added = 0;
        for record in records {
            let Some((folder, name)) = seed_key(Path::new(&record.path)) else {
                log::warn!("Ignoring persisted record without a parent folder: {}", record.path);
                continue;
            };
            if seeds.entry(folder).or_default().insert(name, record).is_none() {
                added += 1;
            }
        }
        added
    }

    /// Take the seed for a file path, if one is pending
    pub fn take_seed(&self, path: &Path) -> Option<PersistRecord> {
        let mut seeds = self.seeds.lock();
        if seeds.is_empty() {
            return None;
        }
        let (folder, name) = seed_key(path)?;
        let in_folder = seeds.get_mut(&folder)?;
        let seed = in_folder.remove(&name);
        if in_folder.is_empty() {
            seeds.remove(&folder);
        }
        seed
    }

    /// Drop seeds a fresh listing of `folder` did not claim
    ///
    /// Seeds left in the folder itself belong to files that no longer exist,
    /// and so do seeds below a child folder missing from `subfolders`.
    /// Returns the persisted paths of the dropped seeds.
    pub fn drop_unclaimed_seeds(&self, folder: &Path, subfolders: &[FolderEntry]) -> Vec<String> {
        let key = folder_key(folder);
        let prefix = subtree_prefix(&key);
        self.drop_seeds_below(&key, |seed_folder| {
            let Some(rest) = seed_folder.strip_prefix(&prefix) else {
                return true;
            };
            let child = rest.split('/').next().unwrap_or(rest);
            !subfolders.iter().any(|s| name_eq(&s.name, child))
        })
    }

    /// Remove seeds in the folder `key` and below it whose folder key passes `doomed`
    fn drop_seeds_below(&self, key: &str, doomed: impl Fn(&str) -> bool) -> Vec<String> {
        let prefix = subtree_prefix(key);
        let mut seeds = self.seeds.lock();
        let mut matching: Vec<String> = seeds
            .range::<str, _>((std::ops::Bound::Included(prefix.as_str()), std::ops::Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(&prefix))
            .filter(|k| doomed(k))
            .cloned()
            .collect();
        if seeds.contains_key(key) && doomed(key) {
            matching.push(key.to_string());
        }

        let dropped: Vec<String> = matching
            .into_iter()
            .filter_map(|k| seeds.remove(&k))
            .flat_map(|in_folder| in_folder.into_values().map(|record| record.path))
            .collect();
        if !dropped.is_empty() {
            log::debug!("Dropped {} persisted records under {}", dropped.len(), key);
        }
        dropped
    }

    pub fn pending_seeds(&self) -> usize {
        self.seeds.lock().values().map(HashMap::len).sum()
    }

    /// Total number of files in indexed folders
    pub fn file_count(&self) -> usize {
        self.folders
            .read()
            .values()
            .filter(|f| f.is_indexed)
            .map(|f| f.files.len())
            .sum()
    }
}

fn subtree_prefix(key: &str) -> String {
    if key.ends_with('/') { key.to_string() } else { format!("{}/", key) }
}

fn seed_key(path: &Path) -> Option<(String, String)> {
    let folder = path.parent()?;
    let name = path.file_name()?;
    Some((folder_key(folder), name.to_string_lossy().to_lowercase()))
}

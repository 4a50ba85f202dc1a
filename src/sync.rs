//! Folder synchronization: reconcile one file-system listing with the tree
//!
//! A call handles exactly one folder level. The caller drives recursion with
//! a breadth-first worklist using [`SyncOutcome::subfolders`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use globset::GlobSet;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::context::IndexContext;
use crate::file_types::stem_of;
use crate::models::{FileFlags, FileType, MediaType};
use crate::providers::{Collaborators, FileEntry, ListError, ScanRequest};
use crate::records::{FileRecord, FolderEntry, FolderRecord, name_cmp, name_eq};
use crate::tree::IndexTree;

/// Per-call classification of every file name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileDiff {
    pub created: usize,
    pub removed: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Result of synchronizing one folder
#[derive(Debug)]
pub struct SyncOutcome {
    /// Current record, `None` when the folder no longer exists
    pub record: Option<Arc<FolderRecord>>,
    /// A new record was published
    pub changed: bool,
    pub files: FileDiff,
    /// Folders erased from the tree (vanished subtrees)
    pub removed: Vec<PathBuf>,
    /// Non-excluded child folders the caller may visit next
    pub subfolders: Vec<PathBuf>,
}

impl SyncOutcome {
    fn unchanged(record: Option<Arc<FolderRecord>>) -> Self {
        let subfolders = record.as_deref().map(visitable_subfolders).unwrap_or_default();
        Self {
            record,
            changed: false,
            files: FileDiff::default(),
            removed: Vec::new(),
            subfolders,
        }
    }
}

fn visitable_subfolders(record: &FolderRecord) -> Vec<PathBuf> {
    record
        .subfolders
        .iter()
        .filter(|s| !s.is_excluded)
        .map(|s| record.child_path(&s.name))
        .collect()
}

/// A listed file with its classification and final flags
struct ListedFile {
    entry: FileEntry,
    file_type: Arc<FileType>,
    flags: FileFlags,
}

/// Reconciles folder listings against the index tree
pub struct FolderSynchronizer<'a> {
    tree: &'a IndexTree,
    ctx: &'a IndexContext,
    collaborators: &'a Collaborators,
    exclusions: &'a GlobSet,
}

impl<'a> FolderSynchronizer<'a> {
    pub fn new(
        tree: &'a IndexTree,
        ctx: &'a IndexContext,
        collaborators: &'a Collaborators,
        exclusions: &'a GlobSet,
    ) -> Self {
        Self {
            tree,
            ctx,
            collaborators,
            exclusions,
        }
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        !self.exclusions.is_empty() && self.exclusions.is_match(path)
    }

    /// Bring the record for `path` in line with the file system
    ///
    /// Returns the existing record untouched when nothing changed. With
    /// `refresh_from_fs` unset an existing record is returned as is.
    pub fn validate_folder(
        &self,
        path: &Path,
        mark_indexed: bool,
        refresh_from_fs: bool,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome> {
        let existing = self.tree.find(path);

        if !refresh_from_fs && existing.as_ref().is_some_and(|r| r.last_sync().is_some()) {
            return Ok(SyncOutcome::unchanged(existing));
        }

        let listing = match self.collaborators.enumerator.list(path) {
            Ok(listing) => listing,
            Err(ListError::NotFound(_)) => {
                self.forget(path);
                let removed = self.tree.erase_subtree(path);
                if !removed.is_empty() {
                    log::info!("Folder vanished, removed {} records under {}", removed.len(), path.display());
                    if let Some(parent) = path.parent() {
                        self.tree.reset_bloom_bits(parent);
                    }
                }
                return Ok(SyncOutcome {
                    record: None,
                    changed: !removed.is_empty(),
                    files: FileDiff::default(),
                    removed,
                    subfolders: Vec::new(),
                });
            }
            Err(e) => {
                // Transient: keep what we have and retry on the next pass
                log::warn!("{}", e);
                return Ok(SyncOutcome::unchanged(existing));
            }
        };

        let include_hidden = self.ctx.config.index.include_hidden;
        let is_indexed = mark_indexed || existing.as_ref().is_some_and(|r| r.is_indexed);
        let is_excluded = self.is_excluded(path);

        let listed = self.classify_listing(listing.files, include_hidden);

        let mut subfolders: Vec<FolderEntry> = listing
            .folders
            .into_iter()
            .filter(|f| include_hidden || !f.attributes.hidden)
            .map(|f| FolderEntry {
                is_excluded: self.is_excluded(&path.join(&f.name)),
                name: f.name,
            })
            .collect();
        subfolders.sort_by(|a, b| name_cmp(&a.name, &b.name));
        subfolders.dedup_by(|a, b| name_eq(&a.name, &b.name));

        let old_files: &[Arc<FileRecord>] = existing.as_deref().map(|r| r.files.as_slice()).unwrap_or(&[]);
        let (files, diff, gone_files) = self.merge_files(path, old_files, listed);
        for name in &gone_files {
            self.forget(&path.join(name));
        }
        for seed_path in self.tree.drop_unclaimed_seeds(path, &subfolders) {
            self.collaborators.sink.forget(&seed_path);
        }

        let mut changed = existing.as_ref().is_none_or(|r| r.last_sync().is_none())
            || diff.created + diff.removed + diff.updated > 0;

        let mut removed = Vec::new();
        if let Some(old) = existing.as_deref() {
            if old.subfolders != subfolders || old.is_indexed != is_indexed || old.is_excluded != is_excluded {
                changed = true;
            }
            for gone in old
                .subfolders
                .iter()
                .filter(|o| !subfolders.iter().any(|n| name_eq(&n.name, &o.name)))
            {
                let child = old.child_path(&gone.name);
                self.forget(&child);
                removed.extend(self.tree.erase_subtree(&child));
            }
        }

        changed |= self.attach_sidecars(path, &files, now);

        let record = match existing {
            Some(old) if !changed => {
                old.mark_synced(now);
                old
            }
            _ => {
                log::debug!(
                    "Synchronized {}: +{} -{} ~{} ({} subfolders)",
                    path.display(),
                    diff.created,
                    diff.removed,
                    diff.updated,
                    subfolders.len()
                );
                let record = FolderRecord::new(path, files, subfolders, is_indexed, is_excluded)
                    .with_timestamps(listing.created, listing.modified);
                record.mark_synced(now);
                let record = self.tree.replace(record);
                self.tree.reset_bloom_bits(path);
                record
            }
        };

        let subfolders = visitable_subfolders(&record);
        Ok(SyncOutcome {
            record: Some(record),
            changed,
            files: diff,
            removed,
            subfolders,
        })
    }

    /// Drop persisted results for a vanished file or folder
    fn forget(&self, path: &Path) {
        self.collaborators.sink.forget(&path.to_string_lossy());
    }

    /// Classify, filter and sort a listing, resolving sidecar flags
    fn classify_listing(&self, entries: Vec<FileEntry>, include_hidden: bool) -> Vec<ListedFile> {
        let mut listed: Vec<ListedFile> = entries
            .into_iter()
            .filter(|e| include_hidden || !e.attributes.hidden)
            .map(|entry| {
                let file_type = self.collaborators.classifier.classify(&entry.name);
                let flags = FileFlags {
                    read_only: entry.attributes.read_only,
                    offline: entry.attributes.offline,
                    sidecar: false,
                };
                ListedFile {
                    entry,
                    file_type,
                    flags,
                }
            })
            .collect();

        listed.sort_by(|a, b| name_cmp(&a.entry.name, &b.entry.name));
        // Names are unique case-insensitively; keep the first spelling
        listed.dedup_by(|a, b| name_eq(&a.entry.name, &b.entry.name));

        let names: Vec<&str> = listed.iter().map(|l| l.entry.name.as_str()).collect();
        let types: Vec<&FileType> = listed.iter().map(|l| l.file_type.as_ref()).collect();
        let owners = sidecar_owners(&names, &types);
        for (file, owner) in listed.iter_mut().zip(owners) {
            file.flags.sidecar = owner.is_some();
        }

        listed
    }

    /// Two-pointer merge of the previous sorted file list with the new one
    ///
    /// Also returns the names of files that only exist in the old list.
    fn merge_files(
        &self,
        folder: &Path,
        old: &[Arc<FileRecord>],
        new: Vec<ListedFile>,
    ) -> (Vec<Arc<FileRecord>>, FileDiff, Vec<String>) {
        let mut diff = FileDiff::default();
        let mut files = Vec::with_capacity(new.len());
        let mut gone = Vec::new();
        let mut old_iter = old.iter().peekable();

        for listed in new {
            // Everything sorting before this name only exists in the old list
            while let Some(prev) = old_iter.next_if(|o| fold_cmp(&o.name, &listed.entry.name) == Ordering::Less) {
                log::trace!("Removed {}", folder.join(&prev.name).display());
                gone.push(prev.name.clone());
            }

            let entry = &listed.entry;
            match old_iter.next_if(|o| fold_cmp(&o.name, &entry.name) == Ordering::Equal) {
                Some(prev)
                    if prev.name == entry.name
                        && !prev.differs_from_listing(entry.modified, entry.size, listed.flags) =>
                {
                    diff.unchanged += 1;
                    files.push(Arc::clone(prev));
                }
                Some(prev) => {
                    diff.updated += 1;
                    files.push(Arc::new(self.new_record(listed).with_previous(prev)));
                }
                None => {
                    diff.created += 1;
                    let path = folder.join(&listed.entry.name);
                    let record = self.new_record(listed);
                    self.apply_seed(&path, &record);
                    files.push(Arc::new(record));
                }
            }
        }
        gone.extend(old_iter.map(|prev| prev.name.clone()));
        diff.removed = gone.len();

        (files, diff, gone)
    }

    fn new_record(&self, listed: ListedFile) -> FileRecord {
        let ListedFile {
            entry,
            file_type,
            flags,
        } = listed;
        FileRecord::new(entry.name, file_type, entry.size, entry.created, entry.modified, flags)
    }

    /// Apply persisted scan data queued by the startup merge
    fn apply_seed(&self, path: &Path, record: &FileRecord) {
        let Some(seed) = self.tree.take_seed(path) else {
            return;
        };
        if seed.scanned < record.modified {
            log::debug!("Discarding stale persisted data for {}", path.display());
            return;
        }
        record.set_scan_result(seed.metadata, seed.content_hash, seed.scanned);
    }

    /// Record sidecar names on their owners and eagerly fold in fresh xmp files
    ///
    /// Returns true when any file's metadata changed in place, sidecar lists
    /// included.
    fn attach_sidecars(&self, folder: &Path, files: &[Arc<FileRecord>], now: DateTime<Utc>) -> bool {
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        let types: Vec<&FileType> = files.iter().map(|f| f.file_type.as_ref()).collect();
        let owners = sidecar_owners(&names, &types);

        let mut attached: HashMap<usize, Vec<usize>> = HashMap::new();
        for (sidecar, owner) in owners.iter().enumerate() {
            if let Some(owner) = owner {
                attached.entry(*owner).or_default().push(sidecar);
            }
        }

        let mut touched = false;
        for (index, file) in files.iter().enumerate() {
            if file.flags.sidecar {
                continue;
            }
            let sidecars = attached.remove(&index).unwrap_or_default();
            let mut sidecar_names: Vec<String> = sidecars.iter().map(|&i| files[i].name.clone()).collect();
            sidecar_names.sort_by(|a, b| name_cmp(a, b));

            touched |= file.update_metadata(|m| {
                if m.sidecars != sidecar_names {
                    m.sidecars = sidecar_names;
                }
            });

            if let Some(xmp) = sidecars.iter().map(|&i| &files[i]).find(|s| s.file_type.is_xmp()) {
                touched |= self.refresh_from_xmp(folder, file, xmp, now);
            }
        }
        touched
    }

    /// Parse an xmp sidecar that changed after its owner was last scanned
    fn refresh_from_xmp(&self, folder: &Path, owner: &FileRecord, xmp: &FileRecord, now: DateTime<Utc>) -> bool {
        let Some(scanned) = owner.metadata_scanned() else {
            // Never scanned: the regular scan picks the sidecar up
            return false;
        };
        if xmp.modified <= scanned {
            return false;
        }

        let xmp_path = folder.join(&xmp.name);
        let request = ScanRequest {
            path: &xmp_path,
            want_thumbnail: false,
            file_type: &xmp.file_type,
            xmp_sidecar: None,
            max_thumbnail_size: 0,
        };

        match self.collaborators.scanner.scan(&request) {
            Ok(output) => {
                let Some(sidecar) = output.metadata else {
                    return false;
                };
                let mut merged = owner.metadata().as_deref().cloned().unwrap_or_default();
                merged.merge_sidecar(&sidecar);
                owner.set_scan_result(Some(merged), owner.crc32c(), now);
                log::debug!("Merged updated sidecar {}", xmp_path.display());
                true
            }
            Err(e) => {
                log::warn!("Failed to read sidecar {}: {}", xmp_path.display(), e);
                false
            }
        }
    }
}

/// Identity ordering of file names: case-folded, without the exact-spelling
/// tie-break of [`name_cmp`]
fn fold_cmp(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

/// For each file, the index of the file that owns it as a sidecar
///
/// A file `F` owns `G` when `G` is named `stem(F).ext` or `F.ext` for one of
/// the sidecar extensions declared by `F`'s type. Raw files claim after other
/// media so a JPEG+RAW pair attaches both the raw and the xmp to the JPEG. A
/// claimed file never owns anything itself.
pub fn sidecar_owners(names: &[&str], types: &[&FileType]) -> Vec<Option<usize>> {
    debug_assert_eq!(names.len(), types.len());

    let by_name: HashMap<String, usize> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.to_lowercase(), i))
        .collect();

    let mut claimants: Vec<usize> = (0..names.len())
        .filter(|&i| !types[i].sidecars.is_empty() && !types[i].traits.is_sidecar)
        .collect();
    claimants.sort_by_key(|&i| types[i].media_type == MediaType::Raw);

    let mut owner: Vec<Option<usize>> = vec![None; names.len()];
    let mut owns = vec![false; names.len()];

    for i in claimants {
        if owner[i].is_some() {
            continue;
        }
        let full = names[i].to_lowercase();
        let stem = stem_of(&full).to_string();

        for ext in &types[i].sidecars {
            for candidate in [format!("{}.{}", stem, ext), format!("{}.{}", full, ext)] {
                match by_name.get(&candidate) {
                    Some(&j) if j != i && owner[j].is_none() && !owns[j] => {
                        owner[j] = Some(i);
                        owns[i] = true;
                    }
                    _ => {}
                }
            }
        }
    }

    owner
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_types::ExtensionClassifier;
    use crate::models::{FileAttributes, FileMetadata, PersistRecord};
    use crate::providers::{
        FileEnumerator, FileTypeClassifier, FolderEntryInfo, FolderListing, MetadataScanner, NullSink,
        PersistenceSink, ScanError, ScanOutput,
    };
    use chrono::TimeZone;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeFs {
        folders: Mutex<HashMap<PathBuf, FolderListing>>,
    }

    impl FakeFs {
        fn set(&self, path: &str, files: &[(&str, u64, i64)], folders: &[&str]) {
            let listing = FolderListing {
                files: files
                    .iter()
                    .map(|(name, size, secs)| FileEntry {
                        name: name.to_string(),
                        size: *size,
                        created: Utc.timestamp_opt(*secs, 0).unwrap(),
                        modified: Utc.timestamp_opt(*secs, 0).unwrap(),
                        attributes: FileAttributes::default(),
                    })
                    .collect(),
                folders: folders
                    .iter()
                    .map(|name| FolderEntryInfo {
                        name: name.to_string(),
                        attributes: FileAttributes::default(),
                    })
                    .collect(),
                created: None,
                modified: None,
            };
            self.folders.lock().insert(PathBuf::from(path), listing);
        }

        fn remove(&self, path: &str) {
            self.folders.lock().remove(Path::new(path));
        }
    }

    impl FileEnumerator for FakeFs {
        fn list(&self, folder: &Path) -> Result<FolderListing, ListError> {
            self.folders
                .lock()
                .get(folder)
                .cloned()
                .ok_or_else(|| ListError::NotFound(folder.to_path_buf()))
        }
    }

    struct XmpScanner;

    impl MetadataScanner for XmpScanner {
        fn scan(&self, request: &ScanRequest<'_>) -> Result<ScanOutput, ScanError> {
            if !request.file_type.is_xmp() {
                return Err(ScanError::Unsupported(request.path.display().to_string()));
            }
            Ok(ScanOutput {
                metadata: Some(FileMetadata {
                    tags: vec!["from-xmp".into()],
                    ..Default::default()
                }),
                thumbnail: None,
                content_hash: None,
            })
        }
    }

    #[derive(Default)]
    struct ForgetLog {
        paths: Mutex<Vec<String>>,
    }

    impl ForgetLog {
        fn take(&self) -> Vec<String> {
            let mut paths = std::mem::take(&mut *self.paths.lock());
            paths.sort();
            paths
        }
    }

    impl PersistenceSink for ForgetLog {
        fn enqueue(&self, _record: PersistRecord) {}

        fn forget(&self, path: &str) {
            self.paths.lock().push(path.to_string());
        }
    }

    fn setup(fs: Arc<FakeFs>) -> (IndexTree, IndexContext, Collaborators, GlobSet) {
        let ctx = IndexContext::default();
        let exclusions = ctx.config.exclusions().unwrap();
        let collaborators = Collaborators {
            enumerator: fs,
            classifier: Arc::new(ExtensionClassifier::new()),
            scanner: Arc::new(XmpScanner),
            sink: Arc::new(NullSink),
        };
        (IndexTree::new(), ctx, collaborators, exclusions)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_validate_folder_is_idempotent() {
        let fs = Arc::new(FakeFs::default());
        fs.set("/a", &[("b.jpg", 10, 100), ("a.jpg", 20, 100)], &["sub"]);
        let (tree, ctx, collab, excl) = setup(fs);
        let sync = FolderSynchronizer::new(&tree, &ctx, &collab, &excl);

        let first = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();
        assert!(first.changed);
        assert_eq!(first.files.created, 2);
        assert_eq!(first.subfolders, vec![PathBuf::from("/a/sub")]);

        let second = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();
        assert!(!second.changed);
        assert_eq!(
            second.files,
            FileDiff {
                unchanged: 2,
                ..Default::default()
            }
        );
        assert!(Arc::ptr_eq(first.record.as_ref().unwrap(), second.record.as_ref().unwrap()));

        let names: Vec<_> = second.record.unwrap().files.iter().map(|f| f.name.clone()).collect();
        assert_eq!(names, vec!["a.jpg", "b.jpg"]);
    }

    #[test]
    fn test_merge_diff_classifies_every_name() {
        let fs = Arc::new(FakeFs::default());
        fs.set("/a", &[("a.jpg", 1, 1), ("b.jpg", 1, 1), ("c.jpg", 1, 1)], &[]);
        let (tree, ctx, collab, excl) = setup(fs.clone());
        let sync = FolderSynchronizer::new(&tree, &ctx, &collab, &excl);
        let first = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();
        let kept = Arc::clone(first.record.unwrap().find_file("c.jpg").unwrap());

        fs.set("/a", &[("B.jpg", 1, 1), ("c.jpg", 1, 1), ("d.jpg", 1, 1), ("e.jpg", 5, 1)], &[]);
        let outcome = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();

        assert!(outcome.changed);
        // A case-only rename is the same file under a new spelling
        assert_eq!(
            outcome.files,
            FileDiff {
                created: 2,
                removed: 1,
                updated: 1,
                unchanged: 1
            }
        );
        let record = outcome.record.unwrap();
        let names: Vec<_> = record.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["B.jpg", "c.jpg", "d.jpg", "e.jpg"]);
        assert!(Arc::ptr_eq(record.find_file("c.jpg").unwrap(), &kept));
    }

    #[test]
    fn test_modified_file_keeps_scan_results() {
        let fs = Arc::new(FakeFs::default());
        fs.set("/a", &[("a.jpg", 1, 1)], &[]);
        let (tree, ctx, collab, excl) = setup(fs.clone());
        let sync = FolderSynchronizer::new(&tree, &ctx, &collab, &excl);
        let first = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();
        first.record.unwrap().files[0].set_scan_result(None, Some(9), now());

        fs.set("/a", &[("a.jpg", 2, 50)], &[]);
        let outcome = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();

        assert_eq!(outcome.files.updated, 1);
        let file = &outcome.record.unwrap().files[0];
        assert_eq!(file.size, 2);
        assert_eq!(file.crc32c(), Some(9));
    }

    #[test]
    fn test_sidecars_attach_to_owner() {
        let fs = Arc::new(FakeFs::default());
        fs.set(
            "/a",
            &[("img1.jpg", 10, 1), ("IMG1.XMP", 1, 1), ("img1.cr2", 30, 1), ("other.xmp", 1, 1)],
            &[],
        );
        let (tree, ctx, collab, excl) = setup(fs);
        let sync = FolderSynchronizer::new(&tree, &ctx, &collab, &excl);
        let record = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap().record.unwrap();

        let jpg = record.find_file("img1.jpg").unwrap();
        assert!(!jpg.flags.sidecar);
        assert_eq!(jpg.metadata().unwrap().sidecars, vec!["img1.cr2".to_string(), "IMG1.XMP".to_string()]);
        assert!(record.find_file("img1.xmp").unwrap().flags.sidecar);
        assert!(record.find_file("img1.cr2").unwrap().flags.sidecar);
        assert!(!record.find_file("other.xmp").unwrap().flags.sidecar);
    }

    #[test]
    fn test_newer_xmp_is_parsed_eagerly() {
        let fs = Arc::new(FakeFs::default());
        fs.set("/a", &[("img1.jpg", 10, 100), ("img1.xmp", 1, 100)], &[]);
        let (tree, ctx, collab, excl) = setup(fs.clone());
        let sync = FolderSynchronizer::new(&tree, &ctx, &collab, &excl);
        let record = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap().record.unwrap();
        let jpg = Arc::clone(record.find_file("img1.jpg").unwrap());
        jpg.set_scan_result(Some(FileMetadata::default()), None, Utc.timestamp_opt(200, 0).unwrap());

        let later = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        fs.set("/a", &[("img1.jpg", 10, 100), ("img1.xmp", 2, later.timestamp())], &[]);
        sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();

        assert_eq!(jpg.metadata().unwrap().tags, vec!["from-xmp".to_string()]);
        assert!(jpg.bloom().contains(crate::bloom::BloomCategory::Tag));
    }

    #[test]
    fn test_vanished_folder_erases_subtree() {
        let fs = Arc::new(FakeFs::default());
        fs.set("/a", &[], &["b"]);
        fs.set("/a/b", &[("x.jpg", 1, 1)], &["c"]);
        fs.set("/a/b/c", &[], &[]);
        let (tree, ctx, collab, excl) = setup(fs.clone());
        let sync = FolderSynchronizer::new(&tree, &ctx, &collab, &excl);
        for p in ["/a", "/a/b", "/a/b/c"] {
            sync.validate_folder(Path::new(p), true, true, now()).unwrap();
        }
        assert_eq!(tree.len(), 3);

        fs.set("/a", &[], &[]);
        fs.remove("/a/b");
        let outcome = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.removed.len(), 2);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_excluded_and_hidden_entries() {
        let fs = Arc::new(FakeFs::default());
        fs.set("/a", &[("a.jpg", 1, 1)], &[".git", "node_modules", "photos"]);
        let (tree, ctx, collab, excl) = setup(fs);
        let sync = FolderSynchronizer::new(&tree, &ctx, &collab, &excl);
        let outcome = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();

        let record = outcome.record.unwrap();
        let excluded: Vec<_> = record.subfolders.iter().filter(|s| s.is_excluded).map(|s| s.name.as_str()).collect();
        assert_eq!(excluded, vec![".git", "node_modules"]);
        assert_eq!(outcome.subfolders, vec![PathBuf::from("/a/photos")]);
    }

    #[test]
    fn test_seed_applied_when_not_stale() {
        let fs = Arc::new(FakeFs::default());
        fs.set("/a", &[("fresh.jpg", 1, 100), ("stale.jpg", 1, 500)], &[]);
        let (tree, ctx, collab, excl) = setup(fs);
        let seed = |name: &str| PersistRecord {
            path: format!("/a/{}", name),
            metadata: Some(FileMetadata {
                title: Some("seeded".into()),
                ..Default::default()
            }),
            thumbnail: None,
            content_hash: Some(1),
            scanned: Utc.timestamp_opt(300, 0).unwrap(),
        };
        tree.seed([seed("fresh.jpg"), seed("stale.jpg")]);

        let sync = FolderSynchronizer::new(&tree, &ctx, &collab, &excl);
        let record = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap().record.unwrap();

        let fresh = record.find_file("fresh.jpg").unwrap();
        assert_eq!(fresh.crc32c(), Some(1));
        assert!(!fresh.needs_scan());
        assert!(record.find_file("stale.jpg").unwrap().needs_scan());
        assert_eq!(tree.pending_seeds(), 0);
    }

    #[test]
    fn test_sidecar_owner_rules() {
        let classifier = ExtensionClassifier::new();
        let names = ["a.jpg", "a.jpg.xmp", "b.png", "b.cr2", "c.cr2", "c.xmp"];
        let types: Vec<_> = names.iter().map(|n| classifier.classify(n)).collect();
        let refs: Vec<&FileType> = types.iter().map(|t| t.as_ref()).collect();

        let owners = sidecar_owners(&names, &refs);
        assert_eq!(owners, vec![None, Some(0), None, None, None, Some(4)]);
    }

    #[test]
    fn test_sidecar_list_change_counts_as_change() {
        let fs = Arc::new(FakeFs::default());
        fs.set("/a", &[("img1.jpg", 10, 1), ("img1.xmp", 1, 1)], &[]);
        let (tree, ctx, collab, excl) = setup(fs);
        let sync = FolderSynchronizer::new(&tree, &ctx, &collab, &excl);
        let record = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap().record.unwrap();
        let jpg = Arc::clone(record.find_file("img1.jpg").unwrap());
        jpg.update_metadata(|m| m.sidecars.clear());

        let outcome = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();
        assert!(outcome.changed);
        assert_eq!(jpg.metadata().unwrap().sidecars, vec!["img1.xmp".to_string()]);

        let again = sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();
        assert!(!again.changed);
    }

    #[test]
    fn test_vanished_paths_are_forgotten() {
        let fs = Arc::new(FakeFs::default());
        fs.set("/a", &[("a.jpg", 1, 1), ("b.jpg", 1, 1)], &["sub"]);
        fs.set("/a/sub", &[("x.jpg", 1, 1)], &[]);
        let (tree, ctx, mut collab, excl) = setup(fs.clone());
        let log = Arc::new(ForgetLog::default());
        collab.sink = log.clone();
        let persisted = |path: &str| PersistRecord {
            path: path.to_string(),
            metadata: None,
            thumbnail: None,
            content_hash: None,
            scanned: now(),
        };
        tree.seed([persisted("/a/a.jpg"), persisted("/a/old.jpg"), persisted("/a/ghost/y.jpg")]);

        let sync = FolderSynchronizer::new(&tree, &ctx, &collab, &excl);
        sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();
        sync.validate_folder(Path::new("/a/sub"), true, true, now()).unwrap();
        assert_eq!(log.take(), vec!["/a/ghost/y.jpg".to_string(), "/a/old.jpg".to_string()]);
        assert_eq!(tree.pending_seeds(), 0);

        fs.set("/a", &[("a.jpg", 1, 1)], &[]);
        fs.remove("/a/sub");
        sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();
        assert_eq!(log.take(), vec!["/a/b.jpg".to_string(), "/a/sub".to_string()]);

        fs.remove("/a");
        sync.validate_folder(Path::new("/a"), true, true, now()).unwrap();
        assert_eq!(log.take(), vec!["/a".to_string()]);
    }
}

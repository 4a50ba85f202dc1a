//! In-memory folder and file records
//!
//! A [`FolderRecord`] is never mutated structurally once it is published in
//! the tree: adding or removing children builds a new record and swaps it in,
//! so readers holding the old `Arc` keep a consistent snapshot. The few
//! per-file values that change without a folder rebuild (bloom bits, duplicate
//! group, scan results) live in their own atomics/locks and are shared by the
//! old and new record because the `Arc<FileRecord>` itself is carried over.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering as AtomicOrdering};

use crate::bloom::BloomBits;
use crate::models::{FileFlags, FileMetadata, FileType};

/// Case-insensitive ordering used for every sorted list in the index
pub fn name_cmp(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
        .then_with(|| a.cmp(b))
}

/// Case-insensitive equality matching [`name_cmp`]'s notion of identity
pub fn name_eq(a: &str, b: &str) -> bool {
    a.chars().flat_map(char::to_lowercase).eq(b.chars().flat_map(char::to_lowercase))
}

/// Duplicate group membership; group 0 means "not a duplicate"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DuplicateInfo {
    pub group_id: u32,
    pub group_size: u32,
}

impl DuplicateInfo {
    pub const NONE: DuplicateInfo = DuplicateInfo { group_id: 0, group_size: 0 };

    pub fn is_duplicate(&self) -> bool {
        self.group_id != 0
    }

    fn pack(self) -> u64 {
        ((self.group_id as u64) << 32) | self.group_size as u64
    }

    fn unpack(raw: u64) -> Self {
        Self {
            group_id: (raw >> 32) as u32,
            group_size: raw as u32,
        }
    }
}

/// Results of the last metadata scan of a file
#[derive(Debug, Clone, Default)]
pub struct ScanState {
    pub metadata: Option<Arc<FileMetadata>>,
    pub scanned: Option<DateTime<Utc>>,
    pub crc32c: Option<u32>,
}

/// One file inside a folder
#[derive(Debug)]
pub struct FileRecord {
    pub name: String,
    pub file_type: Arc<FileType>,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub flags: FileFlags,
    scan: RwLock<ScanState>,
    bloom: AtomicU32,
    duplicates: AtomicU64,
}

impl FileRecord {
    pub fn new(
        name: impl Into<String>,
        file_type: Arc<FileType>,
        size: u64,
        created: DateTime<Utc>,
        modified: DateTime<Utc>,
        flags: FileFlags,
    ) -> Self {
        Self {
            name: name.into(),
            file_type,
            size,
            created,
            modified,
            flags,
            scan: RwLock::new(ScanState::default()),
            bloom: AtomicU32::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Builder used when a file is re-listed: carries previous scan results
    /// and duplicate membership into a record with fresh attributes
    pub fn with_previous(mut self, previous: &FileRecord) -> Self {
        self.scan = RwLock::new(previous.scan_state());
        self.bloom = AtomicU32::new(previous.bloom().raw());
        self.duplicates = AtomicU64::new(previous.duplicates().pack());
        self
    }

    /// Clone of the scan state, taken under the shared lock
    pub fn scan_state(&self) -> ScanState {
        self.scan.read().clone()
    }

    pub fn metadata(&self) -> Option<Arc<FileMetadata>> {
        self.scan.read().metadata.clone()
    }

    pub fn metadata_scanned(&self) -> Option<DateTime<Utc>> {
        self.scan.read().scanned
    }

    pub fn crc32c(&self) -> Option<u32> {
        self.scan.read().crc32c
    }

    /// Scan results are stale when the file changed after the last scan
    pub fn needs_scan(&self) -> bool {
        match self.metadata_scanned() {
            Some(scanned) => scanned < self.modified,
            None => true,
        }
    }

    /// Store the outcome of a metadata scan and recompute bloom bits
    pub fn set_scan_result(
        &self,
        metadata: Option<FileMetadata>,
        crc32c: Option<u32>,
        scanned: DateTime<Utc>,
    ) -> BloomBits {
        let mut state = self.scan.write();

        // Sidecar associations belong to the folder listing, not the scan
        let sidecars = state
            .metadata
            .as_ref()
            .map(|m| m.sidecars.clone())
            .unwrap_or_default();
        let metadata = match metadata {
            Some(mut m) => {
                if m.sidecars.is_empty() {
                    m.sidecars = sidecars;
                }
                Some(Arc::new(m))
            }
            // A failed scan still owns its sidecars
            None if !sidecars.is_empty() => Some(Arc::new(FileMetadata {
                sidecars,
                ..Default::default()
            })),
            None => None,
        };

        state.metadata = metadata;
        state.crc32c = crc32c.or(state.crc32c);
        state.scanned = Some(scanned);

        let bits = BloomBits::compute(state.metadata.as_deref());
        self.bloom.store(bits.raw(), AtomicOrdering::Release);
        bits
    }

    /// Apply a closure to the metadata in place (creating it when absent)
    ///
    /// Returns true if the metadata changed; bloom bits are kept in sync.
    pub fn update_metadata(&self, update: impl FnOnce(&mut FileMetadata)) -> bool {
        let mut state = self.scan.write();
        let before = state.metadata.clone();
        let mut meta = before.as_deref().cloned().unwrap_or_default();
        update(&mut meta);

        let changed = before.as_deref() != Some(&meta)
            && !(before.is_none() && meta == FileMetadata::default());
        if changed {
            state.metadata = Some(Arc::new(meta));
            let bits = BloomBits::compute(state.metadata.as_deref());
            self.bloom.store(bits.raw(), AtomicOrdering::Release);
        }
        changed
    }

    pub fn bloom(&self) -> BloomBits {
        BloomBits::from_raw(self.bloom.load(AtomicOrdering::Acquire))
    }

    /// Recompute bloom bits from current metadata; returns true if they changed
    pub fn reset_bloom_bits(&self) -> bool {
        let bits = BloomBits::compute(self.scan.read().metadata.as_deref());
        self.bloom.swap(bits.raw(), AtomicOrdering::AcqRel) != bits.raw()
    }

    pub fn duplicates(&self) -> DuplicateInfo {
        DuplicateInfo::unpack(self.duplicates.load(AtomicOrdering::Acquire))
    }

    pub fn set_duplicates(&self, info: DuplicateInfo) {
        self.duplicates.store(info.pack(), AtomicOrdering::Release);
    }

    /// Capture time from metadata, falling back to the file-system creation time
    pub fn created_or_taken(&self) -> DateTime<Utc> {
        self.metadata()
            .and_then(|m| m.taken)
            .unwrap_or(self.created)
    }

    /// Whether a re-listed entry differs from this record in a way that
    /// requires a folder rebuild
    pub fn differs_from_listing(&self, modified: DateTime<Utc>, size: u64, flags: FileFlags) -> bool {
        self.modified != modified || self.size != size || self.flags != flags
    }
}

/// Child folder entry kept in a folder record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
    pub name: String,
    pub is_excluded: bool,
}

/// One folder of the index
#[derive(Debug)]
pub struct FolderRecord {
    pub path: PathBuf,
    pub files: Vec<Arc<FileRecord>>,
    pub subfolders: Vec<FolderEntry>,
    pub is_indexed: bool,
    pub is_excluded: bool,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    bloom: AtomicU32,
    last_sync: AtomicI64,
}

impl FolderRecord {
    /// Create a record; both child lists are sorted here
    pub fn new(
        path: impl Into<PathBuf>,
        mut files: Vec<Arc<FileRecord>>,
        mut subfolders: Vec<FolderEntry>,
        is_indexed: bool,
        is_excluded: bool,
    ) -> Self {
        files.sort_by(|a, b| name_cmp(&a.name, &b.name));
        subfolders.sort_by(|a, b| name_cmp(&a.name, &b.name));
        let bloom = files.iter().fold(BloomBits::EMPTY, |acc, f| acc | f.bloom());

        Self {
            path: path.into(),
            files,
            subfolders,
            is_indexed,
            is_excluded,
            created: None,
            modified: None,
            bloom: AtomicU32::new(bloom.raw()),
            last_sync: AtomicI64::new(0),
        }
    }

    /// An empty placeholder for a folder that has not been listed yet
    pub fn empty(path: impl Into<PathBuf>, is_indexed: bool) -> Self {
        Self::new(path, Vec::new(), Vec::new(), is_indexed, false)
    }

    pub fn with_timestamps(mut self, created: Option<DateTime<Utc>>, modified: Option<DateTime<Utc>>) -> Self {
        self.created = created;
        self.modified = modified;
        self
    }

    /// Final path component (the full path for roots)
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }

    pub fn bloom(&self) -> BloomBits {
        BloomBits::from_raw(self.bloom.load(AtomicOrdering::Acquire))
    }

    /// Store new folder bits; returns true if they changed
    pub fn set_bloom(&self, bits: BloomBits) -> bool {
        self.bloom.swap(bits.raw(), AtomicOrdering::AcqRel) != bits.raw()
    }

    /// OR of this folder's own files' bits
    pub fn files_bloom(&self) -> BloomBits {
        self.files.iter().fold(BloomBits::EMPTY, |acc, f| acc | f.bloom())
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        match self.last_sync.load(AtomicOrdering::Acquire) {
            0 => None,
            secs => DateTime::from_timestamp(secs, 0),
        }
    }

    pub fn mark_synced(&self, now: DateTime<Utc>) {
        self.last_sync.store(now.timestamp(), AtomicOrdering::Release);
    }

    /// Binary search for a file by case-insensitive name
    pub fn find_file(&self, name: &str) -> Option<&Arc<FileRecord>> {
        self.files
            .binary_search_by(|f| name_cmp(&f.name, name))
            .ok()
            .map(|i| &self.files[i])
            .or_else(|| self.files.iter().find(|f| name_eq(&f.name, name)))
    }

    pub fn child_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn file_path(&self, file: &FileRecord) -> PathBuf {
        self.path.join(&file.name)
    }

    /// Checks the sorted-children invariant
    pub fn is_sorted(&self) -> bool {
        self.files.windows(2).all(|w| name_cmp(&w[0].name, &w[1].name) != Ordering::Greater)
            && self
                .subfolders
                .windows(2)
                .all(|w| name_cmp(&w[0].name, &w[1].name) != Ordering::Greater)
    }
}

/// Normalized lookup key for a folder path (case-insensitive, `/` separated)
pub fn folder_key(path: &Path) -> String {
    let mut key = path.to_string_lossy().replace('\\', "/").to_lowercase();
    while key.len() > 1 && key.ends_with('/') {
        key.pop();
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileType;

    fn file(name: &str) -> Arc<FileRecord> {
        let now = Utc::now();
        Arc::new(FileRecord::new(
            name,
            Arc::new(FileType::unknown("")),
            1,
            now,
            now,
            FileFlags::default(),
        ))
    }

    #[test]
    fn test_name_cmp_is_case_insensitive() {
        assert_eq!(name_cmp("apple", "Banana"), Ordering::Less);
        assert_eq!(name_cmp("B", "a"), Ordering::Greater);
        assert!(name_eq("IMG.JPG", "img.jpg"));
        assert!(!name_eq("img1.jpg", "img2.jpg"));
    }

    #[test]
    fn test_folder_record_sorts_children() {
        let record = FolderRecord::new(
            "/a",
            vec![file("c.jpg"), file("A.jpg"), file("b.jpg")],
            vec![
                FolderEntry { name: "zeta".into(), is_excluded: false },
                FolderEntry { name: "Alpha".into(), is_excluded: false },
            ],
            true,
            false,
        );

        let names: Vec<_> = record.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["A.jpg", "b.jpg", "c.jpg"]);
        assert_eq!(record.subfolders[0].name, "Alpha");
        assert!(record.is_sorted());
        assert!(record.find_file("B.JPG").is_some());
        assert!(record.find_file("d.jpg").is_none());
    }

    #[test]
    fn test_duplicate_info_roundtrip_through_atomic() {
        let f = file("a.jpg");
        assert_eq!(f.duplicates(), DuplicateInfo::NONE);

        f.set_duplicates(DuplicateInfo { group_id: 7, group_size: 3 });
        assert_eq!(f.duplicates(), DuplicateInfo { group_id: 7, group_size: 3 });
        assert!(f.duplicates().is_duplicate());
    }

    #[test]
    fn test_scan_result_updates_bloom() {
        let f = file("a.jpg");
        assert!(f.needs_scan());

        let meta = FileMetadata {
            tags: vec!["cat".into()],
            ..Default::default()
        };
        let bits = f.set_scan_result(Some(meta), Some(42), Utc::now());

        assert!(bits.contains(crate::bloom::BloomCategory::Tag));
        assert_eq!(f.bloom(), bits);
        assert_eq!(f.crc32c(), Some(42));
        assert!(!f.needs_scan());
    }

    #[test]
    fn test_update_metadata_keeps_sidecars_across_scan() {
        let f = file("a.jpg");
        assert!(f.update_metadata(|m| m.sidecars = vec!["a.xmp".into()]));
        assert!(!f.update_metadata(|m| m.sidecars = vec!["a.xmp".into()]));

        f.set_scan_result(Some(FileMetadata::default()), None, Utc::now());
        assert_eq!(f.metadata().unwrap().sidecars, vec!["a.xmp".to_string()]);
    }

    #[test]
    fn test_failed_scan_keeps_sidecars() {
        let f = file("a.jpg");
        f.update_metadata(|m| m.sidecars = vec!["a.xmp".into()]);

        f.set_scan_result(None, None, Utc::now());
        let meta = f.metadata().unwrap();
        assert_eq!(meta.sidecars, vec!["a.xmp".to_string()]);
        assert_eq!(meta.title, None);
        assert!(!f.needs_scan());

        let bare = file("b.jpg");
        bare.set_scan_result(None, None, Utc::now());
        assert!(bare.metadata().is_none());
    }

    #[test]
    fn test_folder_key_normalizes() {
        assert_eq!(folder_key(Path::new("/Photos/2020/")), "/photos/2020");
        assert_eq!(folder_key(Path::new("/")), "/");
    }
}

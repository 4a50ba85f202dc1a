//! Collaborator interfaces consumed by the index
//!
//! The index never touches the file system, metadata decoders, persistence
//! or the UI directly. Each of those sits behind a narrow trait defined here,
//! and every failure crosses the boundary as a typed error so the traversal
//! code can turn it into "no data" at the call site.

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::models::{FileAttributes, FileMetadata, FileType, PersistRecord};

/// One file reported by the enumerator
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub attributes: FileAttributes,
}

/// One subfolder reported by the enumerator
#[derive(Debug, Clone, PartialEq)]
pub struct FolderEntryInfo {
    pub name: String,
    pub attributes: FileAttributes,
}

/// A single-level directory listing
#[derive(Debug, Clone, Default)]
pub struct FolderListing {
    pub files: Vec<FileEntry>,
    pub folders: Vec<FolderEntryInfo>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

/// Why a folder could not be listed
#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error("folder not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why a metadata scan produced nothing
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("file unreadable: {0}")]
    Unreadable(String),

    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("corrupt metadata: {0}")]
    Corrupt(String),
}

/// Lists the immediate children of a folder
pub trait FileEnumerator: Send + Sync {
    fn list(&self, folder: &Path) -> Result<FolderListing, ListError>;
}

/// Classifies file names into types with capabilities and sidecar rules
pub trait FileTypeClassifier: Send + Sync {
    fn classify(&self, name: &str) -> Arc<FileType>;
}

/// Parameters of one metadata scan
#[derive(Debug, Clone)]
pub struct ScanRequest<'a> {
    pub path: &'a Path,
    pub want_thumbnail: bool,
    pub file_type: &'a FileType,
    /// Path of an xmp sidecar whose values should be folded into the result
    pub xmp_sidecar: Option<&'a Path>,
    pub max_thumbnail_size: u32,
}

/// What a successful scan returns
#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    pub metadata: Option<FileMetadata>,
    pub thumbnail: Option<Vec<u8>>,
    pub content_hash: Option<u32>,
}

/// Extracts metadata (and optionally a thumbnail and content hash) from a file
pub trait MetadataScanner: Send + Sync {
    fn scan(&self, request: &ScanRequest<'_>) -> Result<ScanOutput, ScanError>;
}

/// Destination for scan results
pub trait PersistenceSink: Send + Sync {
    fn enqueue(&self, record: PersistRecord);

    /// Drop stored results for a vanished file, or for everything below a
    /// vanished folder
    fn forget(&self, _path: &str) {}

    /// Block until everything queued so far has been handed to storage
    fn flush(&self) {}

    /// Records queued but not yet written
    fn pending(&self) -> usize {
        0
    }
}

/// Parts of a presenter that may need redrawing after index changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ViewCategory {
    Folders,
    Items,
    Metadata,
    Duplicates,
    Locations,
}

/// Fire-and-forget redraw notification
pub trait ViewInvalidator: Send + Sync {
    fn invalidate_view(&self, category: ViewCategory);
}

/// Scanner used when no metadata decoder is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScanner;

impl MetadataScanner for NullScanner {
    fn scan(&self, request: &ScanRequest<'_>) -> Result<ScanOutput, ScanError> {
        Err(ScanError::Unsupported(request.path.display().to_string()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PersistenceSink for NullSink {
    fn enqueue(&self, _record: PersistRecord) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullInvalidator;

impl ViewInvalidator for NullInvalidator {
    fn invalidate_view(&self, _category: ViewCategory) {}
}

/// The set of collaborators an indexer is built with
#[derive(Clone)]
pub struct Collaborators {
    pub enumerator: Arc<dyn FileEnumerator>,
    pub classifier: Arc<dyn FileTypeClassifier>,
    pub scanner: Arc<dyn MetadataScanner>,
    pub sink: Arc<dyn PersistenceSink>,
}

impl Collaborators {
    /// Local file system, extension table, no scanner, no persistence
    pub fn local(follow_symlinks: bool) -> Self {
        Self {
            enumerator: Arc::new(LocalFileEnumerator { follow_symlinks }),
            classifier: Arc::new(crate::file_types::ExtensionClassifier::new()),
            scanner: Arc::new(NullScanner),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn MetadataScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_enumerator(mut self, enumerator: Arc<dyn FileEnumerator>) -> Self {
        self.enumerator = enumerator;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Enumerator backed by the local file system
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileEnumerator {
    pub follow_symlinks: bool,
}

impl LocalFileEnumerator {
    fn timestamp(time: io::Result<std::time::SystemTime>) -> Option<DateTime<Utc>> {
        time.ok().map(DateTime::<Utc>::from)
    }

    fn attributes(name: &str, metadata: &std::fs::Metadata) -> FileAttributes {
        FileAttributes {
            read_only: metadata.permissions().readonly(),
            hidden: name.starts_with('.'),
            offline: false,
        }
    }
}

impl FileEnumerator for LocalFileEnumerator {
    fn list(&self, folder: &Path) -> Result<FolderListing, ListError> {
        let folder_meta = std::fs::metadata(folder).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => ListError::NotFound(folder.to_path_buf()),
            _ => ListError::Io {
                path: folder.to_path_buf(),
                source,
            },
        })?;
        if !folder_meta.is_dir() {
            return Err(ListError::NotFound(folder.to_path_buf()));
        }

        let mut listing = FolderListing {
            created: Self::timestamp(folder_meta.created()),
            modified: Self::timestamp(folder_meta.modified()),
            ..Default::default()
        };

        let walker = WalkDir::new(folder)
            .min_depth(1)
            .max_depth(1)
            .follow_links(self.follow_symlinks);

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // One unreadable child never fails the whole listing
                    log::warn!("Skipping entry in {}: {}", folder.display(), e);
                    continue;
                }
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("Failed to stat {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            let attributes = Self::attributes(&name, &metadata);

            if metadata.is_dir() {
                listing.folders.push(FolderEntryInfo { name, attributes });
            } else if metadata.is_file() {
                let modified = Self::timestamp(metadata.modified()).unwrap_or_default();
                listing.files.push(FileEntry {
                    name,
                    size: metadata.len(),
                    created: Self::timestamp(metadata.created()).unwrap_or(modified),
                    modified,
                    attributes,
                });
            }
        }

        Ok(listing)
    }
}

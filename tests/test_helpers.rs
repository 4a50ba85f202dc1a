//! Test helpers: file-system fixtures and a text-based metadata scanner
//!
//! Fixture files carry their "metadata" as `key=value` lines, which
//! [`TextScanner`] reads back the way a real decoder would read EXIF/XMP.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use mediadex::models::{FileMetadata, GeoCoord};
use mediadex::providers::{MetadataScanner, ScanError, ScanOutput, ScanRequest};
use mediadex::{Collaborators, IndexConfig, Indexer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Scanner that parses `key=value` lines
///
/// Recognized keys: `title`, `tags` (comma separated), `taken` (RFC 3339),
/// `gps` (`lat,lon`), `crc`, `thumb` (bytes returned as the thumbnail when
/// one is requested) and `fail` (any value makes the scan fail).
#[derive(Debug, Default)]
pub struct TextScanner {
    pub calls: AtomicUsize,
}

impl TextScanner {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn read(path: &Path) -> Result<(FileMetadata, Option<u32>, Option<Vec<u8>>), ScanError> {
        let text = std::fs::read_to_string(path).map_err(|e| ScanError::Unreadable(e.to_string()))?;
        let mut meta = FileMetadata::default();
        let mut crc = None;
        let mut thumb = None;

        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "title" => meta.title = Some(value.to_string()),
                "tags" => meta.tags = value.split(',').map(|t| t.trim().to_string()).collect(),
                "taken" => {
                    let taken = DateTime::parse_from_rfc3339(value)
                        .map_err(|e| ScanError::Corrupt(e.to_string()))?;
                    meta.taken = Some(taken.with_timezone(&Utc));
                }
                "gps" => {
                    let (lat, lon) = value
                        .split_once(',')
                        .ok_or_else(|| ScanError::Corrupt(value.to_string()))?;
                    let lat = lat.trim().parse().map_err(|_| ScanError::Corrupt(value.to_string()))?;
                    let lon = lon.trim().parse().map_err(|_| ScanError::Corrupt(value.to_string()))?;
                    meta.gps = Some(GeoCoord::new(lat, lon));
                }
                "crc" => crc = value.parse().ok(),
                "thumb" => thumb = Some(value.as_bytes().to_vec()),
                "fail" => return Err(ScanError::Corrupt(path.display().to_string())),
                _ => {}
            }
        }
        Ok((meta, crc, thumb))
    }
}

impl MetadataScanner for TextScanner {
    fn scan(&self, request: &ScanRequest<'_>) -> Result<ScanOutput, ScanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (mut metadata, content_hash, thumb) = Self::read(request.path)?;
        if let Some(xmp) = request.xmp_sidecar {
            let (sidecar, _, _) = Self::read(xmp)?;
            metadata.merge_sidecar(&sidecar);
        }
        Ok(ScanOutput {
            metadata: Some(metadata),
            thumbnail: thumb.filter(|_| request.want_thumbnail),
            content_hash,
        })
    }
}

/// A temporary photo library
pub struct Library {
    pub dir: TempDir,
}

impl Library {
    pub fn new() -> Self {
        init_logging();
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `relative`, creating parent folders
    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.root().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn config(&self) -> IndexConfig {
        let mut config = IndexConfig::default();
        config.index.roots = vec![self.root().to_path_buf()];
        config.index.parallel_threads = 2;
        config.duplicates.min_size = 0;
        config
    }

    pub fn indexer(&self, scanner: Arc<TextScanner>) -> Indexer {
        Indexer::new(self.config(), Collaborators::local(false).with_scanner(scanner)).unwrap()
    }

    /// `root/relative` as a search selector
    pub fn selector(&self, relative: &str) -> String {
        let path = if relative.is_empty() {
            self.root().to_path_buf()
        } else {
            self.root().join(relative)
        };
        path.to_string_lossy().into_owned()
    }
}

/// File names of the file results, sorted
pub fn file_names(items: &[Arc<mediadex::ResultItem>]) -> Vec<String> {
    let mut names: Vec<String> = items
        .iter()
        .filter_map(|item| item.file().map(|f| f.name.clone()))
        .collect();
    names.sort();
    names
}

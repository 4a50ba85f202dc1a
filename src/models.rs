//! Core data models for mediadex
//!
//! These structures describe what the index knows about a file independently
//! of where it lives in the tree: its classification, its file-system
//! attributes, and the metadata extracted by the scanner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumIter, EnumString};

/// Broad media classification of a file
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[strum(to_string = "image", serialize = "photo", serialize = "picture")]
    Image,
    Raw,
    #[strum(to_string = "video", serialize = "movie")]
    Video,
    #[strum(to_string = "audio", serialize = "music")]
    Audio,
    #[strum(to_string = "document", serialize = "doc")]
    Document,
    Sidecar,
    Other,
}

/// Capability set resolved once per file type at classification time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTraits {
    /// Counts as media for browsing and duplicate prediction
    pub is_media: bool,
    /// The metadata scanner knows how to read this type
    pub has_metadata: bool,
    /// The scanner can produce a thumbnail for this type
    pub can_thumbnail: bool,
    /// This type only ever exists to annotate another file
    pub is_sidecar: bool,
}

/// Result of classifying a file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileType {
    /// Lowercase extension without the dot (empty when the name has none)
    pub extension: String,
    pub media_type: MediaType,
    pub traits: FileTraits,
    /// Extensions of files that, sharing this file's base name, belong to it
    pub sidecars: Vec<String>,
}

impl FileType {
    /// Fallback type for names the classifier knows nothing about
    pub fn unknown(extension: &str) -> Self {
        Self {
            extension: extension.to_ascii_lowercase(),
            media_type: MediaType::Other,
            traits: FileTraits::default(),
            sidecars: Vec::new(),
        }
    }

    pub fn is_xmp(&self) -> bool {
        self.extension == "xmp"
    }
}

/// Attribute bits reported by the file enumerator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub read_only: bool,
    pub hidden: bool,
    /// Content is not locally present (cloud placeholder, detached volume)
    pub offline: bool,
}

/// Presence flags stored on a file record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFlags {
    pub read_only: bool,
    pub offline: bool,
    /// The file is attached to another file in the same folder as its sidecar
    pub sidecar: bool,
}

/// A WGS84 coordinate in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoord {
    pub lat: f64,
    pub lon: f64,
}

impl GeoCoord {
    pub const EARTH_RADIUS_KM: f64 = 6371.0088;

    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance using the haversine formula
    pub fn distance_km(&self, other: &GeoCoord) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * Self::EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }
}

/// Metadata extracted from a file (and its xmp sidecar) by the scanner
///
/// Every field is optional: absent values contribute nothing to bloom bits
/// and never match property terms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub comment: Option<String>,
    pub tags: Vec<String>,
    pub album: Option<String>,
    pub artist: Option<String>,
    pub genre: Option<String>,
    pub copyright: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub lens: Option<String>,
    pub iso: Option<u32>,
    pub f_number: Option<f64>,
    pub exposure_secs: Option<f64>,
    pub focal_length_mm: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<f64>,
    pub rating: Option<u8>,
    /// Capture time recorded inside the file
    pub taken: Option<DateTime<Utc>>,
    pub gps: Option<GeoCoord>,
    /// Place names resolved from `gps` during enrichment
    pub place: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    /// Names of sidecar files attached to this file, sorted
    pub sidecars: Vec<String>,
}

impl FileMetadata {
    /// Camera description combining make and model
    pub fn camera(&self) -> Option<String> {
        match (&self.camera_make, &self.camera_model) {
            (Some(make), Some(model)) if model.starts_with(make.as_str()) => Some(model.clone()),
            (Some(make), Some(model)) => Some(format!("{} {}", make, model)),
            (Some(make), None) => Some(make.clone()),
            (None, Some(model)) => Some(model.clone()),
            (None, None) => None,
        }
    }

    /// Overlay values from a sidecar onto this metadata
    ///
    /// Sidecar values win for descriptive fields; tags are unioned.
    pub fn merge_sidecar(&mut self, sidecar: &FileMetadata) {
        fn overlay<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if src.is_some() {
                dst.clone_from(src);
            }
        }

        overlay(&mut self.title, &sidecar.title);
        overlay(&mut self.description, &sidecar.description);
        overlay(&mut self.comment, &sidecar.comment);
        overlay(&mut self.album, &sidecar.album);
        overlay(&mut self.artist, &sidecar.artist);
        overlay(&mut self.genre, &sidecar.genre);
        overlay(&mut self.copyright, &sidecar.copyright);
        overlay(&mut self.rating, &sidecar.rating);
        overlay(&mut self.taken, &sidecar.taken);
        overlay(&mut self.gps, &sidecar.gps);
        overlay(&mut self.place, &sidecar.place);
        overlay(&mut self.state, &sidecar.state);
        overlay(&mut self.country, &sidecar.country);

        for tag in &sidecar.tags {
            if !self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                self.tags.push(tag.clone());
            }
        }
    }
}

/// Scan data persisted for a file, keyed by its full path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistRecord {
    pub path: String,
    pub metadata: Option<FileMetadata>,
    #[serde(skip)]
    pub thumbnail: Option<Vec<u8>>,
    pub content_hash: Option<u32>,
    pub scanned: DateTime<Utc>,
}

/// Statistics about an indexing pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    /// Folders synchronized in this pass
    pub folders_synced: usize,
    /// Folders whose record was replaced because something changed
    pub folders_changed: usize,
    /// Folders removed from the tree because they vanished
    pub folders_removed: usize,
    /// Total files held by indexed folders after the pass
    pub total_files: usize,
    /// File count per media type
    pub files_by_type: HashMap<MediaType, usize>,
    /// The pass was cut short by cancellation
    pub cancelled: bool,
}

/// Counters reported by a metadata scanning pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanStats {
    pub candidates: usize,
    pub scanned: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

//! Extension-based file type classification

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{FileTraits, FileType, MediaType};
use crate::providers::FileTypeClassifier;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "jpe", "png", "gif", "bmp", "tif", "tiff", "webp", "heic", "heif", "avif", "jxl",
];

const RAW_EXTENSIONS: &[&str] = &[
    "arw", "cr2", "cr3", "crw", "dng", "erf", "kdc", "mef", "mos", "mrw", "nef", "nrw", "orf", "pef",
    "raf", "raw", "rw2", "rwl", "sr2", "srf", "srw", "x3f",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mov", "avi", "mkv", "mts", "m2ts", "wmv", "webm", "3gp", "mpg", "mpeg",
];

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "flac", "wav", "ogg", "opus", "aac", "wma", "aiff"];

const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "txt", "md", "doc", "docx", "rtf", "odt"];

/// Sidecar-only extensions
const SIDECAR_EXTENSIONS: &[&str] = &["xmp", "thm", "aae", "pp3", "dop"];

/// Classifier backed by a static extension table
///
/// Types are built once at construction and shared by `Arc`, so the
/// capability set is resolved a single time per extension.
pub struct ExtensionClassifier {
    types: HashMap<String, Arc<FileType>>,
}

impl ExtensionClassifier {
    pub fn new() -> Self {
        let mut types = HashMap::new();

        let media = |media_type, traits, sidecars: Vec<String>, ext: &str| FileType {
            extension: ext.to_string(),
            media_type,
            traits,
            sidecars,
        };

        let visual = FileTraits {
            is_media: true,
            has_metadata: true,
            can_thumbnail: true,
            is_sidecar: false,
        };

        for ext in IMAGE_EXTENSIONS {
            // JPEG and HEIF renders pair with raw originals of the same name
            let mut sidecars = vec!["xmp".to_string(), "aae".to_string()];
            if matches!(*ext, "jpg" | "jpeg" | "jpe" | "heic" | "heif") {
                sidecars.extend(RAW_EXTENSIONS.iter().map(|r| r.to_string()));
            }
            types.insert(ext.to_string(), Arc::new(media(MediaType::Image, visual, sidecars, *ext)));
        }

        for ext in RAW_EXTENSIONS {
            let sidecars = vec!["xmp".to_string(), "pp3".to_string(), "dop".to_string()];
            types.insert(ext.to_string(), Arc::new(media(MediaType::Raw, visual, sidecars, *ext)));
        }

        for ext in VIDEO_EXTENSIONS {
            let sidecars = vec!["xmp".to_string(), "thm".to_string()];
            types.insert(ext.to_string(), Arc::new(media(MediaType::Video, visual, sidecars, *ext)));
        }

        let audio = FileTraits {
            is_media: true,
            has_metadata: true,
            can_thumbnail: false,
            is_sidecar: false,
        };
        for ext in AUDIO_EXTENSIONS {
            types.insert(ext.to_string(), Arc::new(media(MediaType::Audio, audio, Vec::new(), *ext)));
        }

        let document = FileTraits {
            is_media: false,
            has_metadata: true,
            can_thumbnail: false,
            is_sidecar: false,
        };
        for ext in DOCUMENT_EXTENSIONS {
            types.insert(
                ext.to_string(),
                Arc::new(media(MediaType::Document, document, Vec::new(), *ext)),
            );
        }

        let sidecar = FileTraits {
            is_media: false,
            has_metadata: false,
            can_thumbnail: false,
            is_sidecar: true,
        };
        for ext in SIDECAR_EXTENSIONS {
            types.insert(ext.to_string(), Arc::new(media(MediaType::Sidecar, sidecar, Vec::new(), *ext)));
        }

        Self { types }
    }
}

impl Default for ExtensionClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTypeClassifier for ExtensionClassifier {
    fn classify(&self, name: &str) -> Arc<FileType> {
        let ext = extension_of(name).to_ascii_lowercase();
        self.types
            .get(&ext)
            .cloned()
            .unwrap_or_else(|| Arc::new(FileType::unknown(&ext)))
    }
}

/// Extension of a file name without the dot (empty for dotfiles and bare names)
pub fn extension_of(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => "",
        Some(i) => &name[i + 1..],
    }
}

/// File name without its final extension
pub fn stem_of(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => name,
        Some(i) => &name[..i],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_types() {
        let classifier = ExtensionClassifier::new();

        let jpg = classifier.classify("IMG_0001.JPG");
        assert_eq!(jpg.media_type, MediaType::Image);
        assert!(jpg.traits.is_media);
        assert!(jpg.sidecars.iter().any(|s| s == "xmp"));
        assert!(jpg.sidecars.iter().any(|s| s == "cr2"));

        let png = classifier.classify("a.png");
        assert!(!png.sidecars.iter().any(|s| s == "cr2"));

        let xmp = classifier.classify("IMG_0001.xmp");
        assert!(xmp.traits.is_sidecar);
        assert!(xmp.is_xmp());

        assert_eq!(classifier.classify("clip.MOV").media_type, MediaType::Video);
        assert_eq!(classifier.classify("notes").media_type, MediaType::Other);
    }

    #[test]
    fn test_classify_shares_type_instances() {
        let classifier = ExtensionClassifier::new();
        let a = classifier.classify("a.jpg");
        let b = classifier.classify("b.JPG");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_stem_and_extension() {
        assert_eq!(extension_of("a.tar.gz"), "gz");
        assert_eq!(stem_of("a.tar.gz"), "a.tar");
        assert_eq!(extension_of(".bashrc"), "");
        assert_eq!(stem_of(".bashrc"), ".bashrc");
        assert_eq!(extension_of("README"), "");
    }
}

//! Index configuration loaded from `config.toml`
//!
//! Every field has a default so a missing file, a missing section or a
//! partially written section all load cleanly.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub index: IndexSection,
    pub duplicates: DuplicateSection,
    pub geo: Option<GeoSection>,
}

/// `[index]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSection {
    /// Folders mirrored by the index
    pub roots: Vec<PathBuf>,
    /// Glob patterns (matched against folder paths) that are never descended
    pub exclude_patterns: Vec<String>,
    /// Index entries whose name starts with a dot
    pub include_hidden: bool,
    /// Return files attached to another file as sidecars in query results
    pub show_sidecars: bool,
    /// Follow symbolic links while listing folders
    pub follow_symlinks: bool,
    /// Worker threads for synchronization and scanning (0 = 80% of cores)
    pub parallel_threads: usize,
    /// Ask the scanner for thumbnails
    pub thumbnails: bool,
    /// Longest thumbnail edge in pixels
    pub max_thumbnail_size: u32,
    /// Consecutive scan failures after which a file is skipped until it changes
    pub max_scan_failures: u32,
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            exclude_patterns: Vec::new(),
            include_hidden: false,
            show_sidecars: false,
            follow_symlinks: false,
            parallel_threads: 0,
            thumbnails: false,
            max_thumbnail_size: 256,
            max_scan_failures: 2,
        }
    }
}

/// `[duplicates]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicateSection {
    /// Files smaller than this are never reported as duplicates
    pub min_size: u64,
    /// Creation times closer than this count as "the same moment"
    pub created_tolerance_secs: i64,
}

impl Default for DuplicateSection {
    fn default() -> Self {
        Self {
            min_size: 1,
            created_tolerance_secs: 2,
        }
    }
}

/// `[geo]` section: the three location tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoSection {
    pub places: PathBuf,
    pub countries: PathBuf,
    pub states: PathBuf,
}

/// Default contents written on first cache init
pub const DEFAULT_CONFIG_TOML: &str = r#"[index]
roots = []
exclude_patterns = ["**/.git", "**/node_modules", "**/@eaDir"]
include_hidden = false
show_sidecars = false
follow_symlinks = false
parallel_threads = 0  # 0 = auto (80% of available cores)
thumbnails = false
max_thumbnail_size = 256
max_scan_failures = 2

[duplicates]
min_size = 1
created_tolerance_secs = 2

# [geo]
# places = "places.tsv"
# countries = "countries.tsv"
# states = "states.tsv"
"#;

impl IndexConfig {
    /// Load configuration from a TOML file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: IndexConfig = toml::from_str(text)?;
        Ok(config)
    }

    /// Worker thread count with `0` resolved to 80% of the available cores
    pub fn worker_threads(&self) -> usize {
        if self.index.parallel_threads == 0 {
            let available_cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            ((available_cores as f64 * 0.8).ceil() as usize).max(1)
        } else {
            self.index.parallel_threads
        }
    }

    /// Compile the exclusion globs
    pub fn exclusions(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.index.exclude_patterns {
            let glob = Glob::new(pattern).with_context(|| format!("Invalid exclude pattern: {}", pattern))?;
            builder.add(glob);
        }
        builder.build().context("Failed to build exclusion set")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_parses() {
        let config = IndexConfig::from_toml(DEFAULT_CONFIG_TOML).unwrap();
        assert_eq!(config.index.max_thumbnail_size, 256);
        assert_eq!(config.duplicates.created_tolerance_secs, 2);
        assert!(config.geo.is_none());
        assert_eq!(config.index.exclude_patterns.len(), 3);
    }

    #[test]
    fn test_partial_section_uses_defaults() {
        let config = IndexConfig::from_toml("[index]\nroots = [\"/photos\"]\n").unwrap();
        assert_eq!(config.index.roots, vec![PathBuf::from("/photos")]);
        assert!(!config.index.show_sidecars);
        assert_eq!(config.duplicates.min_size, 1);
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let config = IndexConfig::load(&temp.path().join("config.toml")).unwrap();
        assert!(config.index.roots.is_empty());
    }

    #[test]
    fn test_exclusions_match_paths() {
        let config = IndexConfig::from_toml(DEFAULT_CONFIG_TOML).unwrap();
        let set = config.exclusions().unwrap();
        assert!(set.is_match("/home/me/project/.git"));
        assert!(set.is_match("/data/node_modules"));
        assert!(!set.is_match("/photos/2020"));
    }

    #[test]
    fn test_worker_threads() {
        let mut config = IndexConfig::default();
        assert!(config.worker_threads() >= 1);
        config.index.parallel_threads = 3;
        assert_eq!(config.worker_threads(), 3);
    }
}

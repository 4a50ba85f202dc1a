//! Build-time schema hash for persisted cache invalidation
//!
//! Hashes every source file that defines what gets written into `meta.db`.
//! The hash is exported as `CACHE_SCHEMA_HASH`; at runtime the cache compares
//! it with the value stored in the database and drops stale tables on mismatch.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Source files whose changes can break compatibility with an existing meta.db
const CACHE_CRITICAL_FILES: &[&str] = &["src/cache.rs", "src/models.rs"];

fn main() {
    let schema_hash = compute_schema_hash();

    println!("cargo:rustc-env=CACHE_SCHEMA_HASH={}", schema_hash);

    for file in CACHE_CRITICAL_FILES {
        println!("cargo:rerun-if-changed={}", file);
    }
}

/// Deterministic blake3 digest over (path, content) of each critical file
fn compute_schema_hash() -> String {
    let mut hasher = blake3::Hasher::new();

    let files: BTreeSet<&str> = CACHE_CRITICAL_FILES.iter().copied().collect();

    for file_path in files {
        let path = Path::new(file_path);
        let content = fs::read(path)
            .unwrap_or_else(|e| panic!("Failed to read cache-critical file {}: {}", file_path, e));

        hasher.update(file_path.as_bytes());
        hasher.update(&content);
    }

    // 64 bits is plenty to tell schema revisions apart
    hasher.finalize().as_bytes()[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

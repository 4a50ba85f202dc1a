//! Cache management and persisted scan results
//!
//! The cache module handles the `.mediadex/` directory structure:
//! - `meta.db`: Persisted scan results and schema hash (SQLite)
//! - `config.toml`: Index settings (TOML text)
//!
//! Scan results reach the database through [`CacheWriter`], the default
//! persistence sink: records are queued to a dedicated writer thread that
//! commits them in batched transactions. Files and folders that vanish from
//! the index are forgotten through the same queue, so a delete never
//! overtakes an earlier save. On startup [`CacheManager::load_records`]
//! feeds the index's merge step.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{MAIN_SEPARATOR, Path, PathBuf};

use crate::background::WorkQueue;
use crate::config::{DEFAULT_CONFIG_TOML, IndexConfig};
use crate::models::{FileMetadata, PersistRecord};
use crate::providers::PersistenceSink;

/// Default cache directory name
pub const CACHE_DIR: &str = ".mediadex";

/// File names within the cache directory
pub const META_DB: &str = "meta.db";
pub const CONFIG_TOML: &str = "config.toml";

/// Hash of the persisted layout, computed by build.rs
pub const SCHEMA_HASH: &str = env!("CACHE_SCHEMA_HASH");

/// Records committed per writer transaction
const WRITE_BATCH: usize = 500;

/// Manages the mediadex cache directory
#[derive(Debug, Clone)]
pub struct CacheManager {
    cache_path: PathBuf,
}

impl CacheManager {
    /// Create a new cache manager for the given root directory
    pub fn new(root: impl AsRef<Path>) -> Self {
        let cache_path = root.as_ref().join(CACHE_DIR);
        Self { cache_path }
    }

    /// Initialize the cache directory structure if it doesn't exist
    pub fn init(&self) -> Result<()> {
        log::info!("Initializing cache at {:?}", self.cache_path);

        if !self.cache_path.exists() {
            std::fs::create_dir_all(&self.cache_path)
                .with_context(|| format!("Failed to create {}", self.cache_path.display()))?;
        }

        let conn = self.open()?;
        Self::ensure_schema(&conn)?;
        self.init_config_toml()?;

        log::info!("Cache initialized successfully");
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        let db_path = self.cache_path.join(META_DB);
        let conn = Connection::open(&db_path).with_context(|| format!("Failed to open {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .context("Failed to configure meta.db")?;
        Ok(conn)
    }

    /// Create tables, dropping persisted items written under another schema
    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        let stored: Option<String> = conn
            .query_row("SELECT value FROM config WHERE key = 'schema_hash'", [], |row| row.get(0))
            .optional()?;

        match stored.as_deref() {
            Some(hash) if hash == SCHEMA_HASH => {}
            Some(hash) => {
                log::warn!("Cache schema changed ({} -> {}), dropping persisted items", hash, SCHEMA_HASH);
                conn.execute("DROP TABLE IF EXISTS items", [])?;
            }
            None => log::debug!("Creating meta.db schema {}", SCHEMA_HASH),
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS items (
                path TEXT PRIMARY KEY,
                metadata TEXT,
                thumbnail BLOB,
                content_hash INTEGER,
                scanned INTEGER NOT NULL -- microseconds since the epoch
            )",
            [],
        )?;

        conn.execute(
            "INSERT OR REPLACE INTO config (key, value) VALUES ('schema_hash', ?)",
            [SCHEMA_HASH],
        )?;
        Ok(())
    }

    /// Initialize config.toml with defaults
    fn init_config_toml(&self) -> Result<()> {
        let config_path = self.config_path();
        if config_path.exists() {
            return Ok(());
        }

        std::fs::write(&config_path, DEFAULT_CONFIG_TOML).context("Failed to write config.toml")?;
        log::debug!("Created default config.toml");
        Ok(())
    }

    /// Check if cache exists
    pub fn exists(&self) -> bool {
        self.cache_path.exists() && self.cache_path.join(META_DB).exists()
    }

    /// Get the path to the cache directory
    pub fn path(&self) -> &Path {
        &self.cache_path
    }

    pub fn config_path(&self) -> PathBuf {
        self.cache_path.join(CONFIG_TOML)
    }

    /// Load `config.toml`, defaults when it is missing
    pub fn load_config(&self) -> Result<IndexConfig> {
        IndexConfig::load(&self.config_path())
    }

    /// Force a full WAL checkpoint so other connections see committed data
    pub fn checkpoint_wal(&self) -> Result<()> {
        if !self.exists() {
            return Ok(());
        }

        let conn = self.open()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
            let busy: i64 = row.get(0)?;
            let log_pages: i64 = row.get(1)?;
            let checkpointed: i64 = row.get(2)?;
            log::debug!(
                "WAL checkpoint completed: busy={}, log_pages={}, checkpointed_pages={}",
                busy,
                log_pages,
                checkpointed
            );
            Ok(())
        })
        .context("Failed to execute WAL checkpoint")?;
        Ok(())
    }

    /// Every persisted record, without thumbnails
    pub fn load_records(&self) -> Result<Vec<PersistRecord>> {
        if !self.exists() {
            return Ok(Vec::new());
        }

        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT path, metadata, content_hash, scanned FROM items")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (path, metadata, content_hash, scanned) = row?;
            let metadata = match metadata.map(|json| serde_json::from_str::<FileMetadata>(&json)) {
                Some(Ok(metadata)) => Some(metadata),
                Some(Err(e)) => {
                    log::warn!("Dropping unreadable metadata for {}: {}", path, e);
                    None
                }
                None => None,
            };
            let Some(scanned) = DateTime::<Utc>::from_timestamp_micros(scanned) else {
                log::warn!("Skipping record with invalid scan time: {}", path);
                continue;
            };

            records.push(PersistRecord {
                path,
                metadata,
                thumbnail: None,
                content_hash: content_hash.map(|h| h as u32),
                scanned,
            });
        }

        log::info!("Loaded {} persisted records", records.len());
        Ok(records)
    }

    /// Stored thumbnail for a file path
    pub fn load_thumbnail(&self, path: &str) -> Result<Option<Vec<u8>>> {
        if !self.exists() {
            return Ok(None);
        }
        let conn = self.open()?;
        let thumbnail = conn
            .query_row("SELECT thumbnail FROM items WHERE path = ?", [path], |row| {
                row.get::<_, Option<Vec<u8>>>(0)
            })
            .optional()?;
        Ok(thumbnail.flatten())
    }

    pub fn record_count(&self) -> Result<usize> {
        if !self.exists() {
            return Ok(0);
        }
        let conn = self.open()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Start the background writer feeding this cache
    pub fn writer(&self) -> Result<CacheWriter> {
        CacheWriter::spawn(self.clone())
    }
}

/// One queued change to `meta.db`
#[derive(Debug)]
enum CacheWrite {
    Save(PersistRecord),
    /// A vanished file, or a vanished folder with everything below it
    Forget(String),
}

#[derive(Debug, Default, Clone, Copy)]
struct WriteCounts {
    saved: usize,
    removed: usize,
}

/// Apply writes in order within one transaction
///
/// A saved record without a thumbnail or hash keeps the stored one.
fn apply_writes(conn: &mut Connection, writes: &[CacheWrite]) -> Result<WriteCounts> {
    let tx = conn.transaction()?;
    let mut counts = WriteCounts::default();
    {
        let mut save = tx.prepare(
            "INSERT INTO items (path, metadata, thumbnail, content_hash, scanned)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                metadata = excluded.metadata,
                thumbnail = COALESCE(excluded.thumbnail, items.thumbnail),
                content_hash = COALESCE(excluded.content_hash, items.content_hash),
                scanned = excluded.scanned",
        )?;
        // Children of `p` sort in [p/, p0) since '0' follows the separator
        let mut forget = tx.prepare("DELETE FROM items WHERE path = ?1 OR (path >= ?2 AND path < ?3)")?;

        for write in writes {
            match write {
                CacheWrite::Save(record) => {
                    let metadata = record
                        .metadata
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()
                        .with_context(|| format!("Failed to serialize metadata for {}", record.path))?;
                    save.execute(params![
                        record.path,
                        metadata,
                        record.thumbnail,
                        record.content_hash.map(i64::from),
                        record.scanned.timestamp_micros(),
                    ])?;
                    counts.saved += 1;
                }
                CacheWrite::Forget(path) => {
                    let (lower, upper) = subtree_bounds(path);
                    counts.removed += forget.execute(params![path, lower, upper])?;
                }
            }
        }
    }
    tx.commit().context("Failed to commit persisted records")?;
    Ok(counts)
}

/// Half-open string range holding every path below `path`
fn subtree_bounds(path: &str) -> (String, String) {
    let base = path.trim_end_matches(MAIN_SEPARATOR);
    let after_separator = char::from(MAIN_SEPARATOR as u8 + 1);
    (format!("{}{}", base, MAIN_SEPARATOR), format!("{}{}", base, after_separator))
}

/// Persistence sink writing to `meta.db` on a dedicated thread
#[derive(Debug)]
pub struct CacheWriter {
    cache: CacheManager,
    queue: WorkQueue<CacheWrite>,
}

impl CacheWriter {
    pub fn spawn(cache: CacheManager) -> Result<Self> {
        cache.init()?;
        let worker_cache = cache.clone();
        let mut conn: Option<Connection> = None;

        let queue = WorkQueue::spawn("mediadex-db-writer", WRITE_BATCH, move |batch: Vec<CacheWrite>| {
            if conn.is_none() {
                match worker_cache.open() {
                    Ok(opened) => conn = Some(opened),
                    Err(e) => {
                        log::error!("Dropping {} writes, cannot open meta.db: {:#}", batch.len(), e);
                        return;
                    }
                }
            }
            let Some(db) = conn.as_mut() else {
                return;
            };
            match apply_writes(db, &batch) {
                Ok(counts) => log::debug!("Persisted {} records, removed {}", counts.saved, counts.removed),
                Err(e) => log::error!("Failed to apply {} writes: {:#}", batch.len(), e),
            }
        })?;

        Ok(Self { cache, queue })
    }

    fn push(&self, write: CacheWrite) {
        if !self.queue.push(write) {
            log::warn!("Database writer stopped, dropping write");
        }
    }
}

impl PersistenceSink for CacheWriter {
    fn enqueue(&self, record: PersistRecord) {
        self.push(CacheWrite::Save(record));
    }

    fn forget(&self, path: &str) {
        self.push(CacheWrite::Forget(path.to_string()));
    }

    /// Drain the queue, then fold the WAL back into `meta.db`
    fn flush(&self) {
        self.queue.flush();
        if let Err(e) = self.cache.checkpoint_wal() {
            log::warn!("{:#}", e);
        }
    }

    fn pending(&self) -> usize {
        self.queue.pending()
    }
}

//! Mediadex: an incrementally maintained, memory-resident media index
//!
//! Mediadex keeps a tree of folder and file records in memory, synchronized
//! with the file system on demand, and answers structured searches over file
//! names, metadata, dates, places and duplicate groups. Persistent scan
//! results live in a small SQLite cache in `.mediadex/`.
//!
//! # Architecture
//!
//! - **Tree**: copy-on-write folder records keyed by normalized path
//! - **Synchronizer**: diffs one folder against a fresh listing
//! - **Indexer**: drives root indexing, metadata scans and duplicate prediction
//! - **Query Engine**: evaluates parsed searches with bloom-filter pruning
//! - **Geo**: k-d tree and n-gram lookups over memory-mapped place tables
//!
//! # Example Usage
//!
//! ```no_run
//! use mediadex::{CacheManager, CancellationToken, Collaborators, Indexer, QueryFilter};
//!
//! let cache = CacheManager::new("/photos");
//! let indexer = Indexer::open(&cache, Collaborators::local(false)).unwrap();
//! let cancel = CancellationToken::noop();
//! indexer.refresh(&cancel).unwrap();
//!
//! for item in indexer.search("/photos/** #vacation year:2023", QueryFilter::default(), &cancel) {
//!     println!("{}", item.path().display());
//! }
//! ```

pub mod background;
pub mod bloom;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod context;
pub mod duplicates;
pub mod file_types;
pub mod geo;
pub mod indexer;
pub mod models;
pub mod providers;
pub mod query;
pub mod records;
pub mod search;
pub mod sync;
pub mod tree;
pub mod watcher;

// Re-export commonly used types
pub use cache::CacheManager;
pub use cancel::{CancellationToken, VersionTracker};
pub use config::IndexConfig;
pub use context::IndexContext;
pub use indexer::Indexer;
pub use models::{FileMetadata, GeoCoord, IndexStats, MediaType, PersistRecord, ScanStats};
pub use providers::Collaborators;
pub use query::{QueryEngine, QueryFilter, ResultItem, ResultSet};
pub use records::{FileRecord, FolderRecord};
pub use search::{SearchMatcher, SearchParser, SearchT};
pub use tree::IndexTree;

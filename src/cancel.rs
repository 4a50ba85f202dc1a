//! Cooperative cancellation for long-running traversals
//!
//! Every query, scan and duplicate pass receives a [`CancellationToken`]
//! minted from a [`VersionTracker`]. Bumping the tracker's version cancels
//! every token minted for an older version; loops poll the token at
//! folder/file/bucket granularity and return partial results.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Monotonic version counter shared by the tokens it mints
#[derive(Debug, Default, Clone)]
pub struct VersionTracker {
    active: Arc<AtomicU64>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation, cancelling every outstanding token
    pub fn next_version(&self) -> u64 {
        self.active.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_version(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Start a new generation and return its token
    pub fn begin(&self) -> CancellationToken {
        let version = self.next_version();
        self.token_for_version(version)
    }

    pub fn token_for_version(&self, version: u64) -> CancellationToken {
        CancellationToken {
            source: TokenSource::Version {
                active: Arc::clone(&self.active),
                version,
            },
        }
    }
}

#[derive(Debug, Clone)]
enum TokenSource {
    Never,
    Version { active: Arc<AtomicU64>, version: u64 },
    Flag(Arc<AtomicBool>),
}

/// Cheap, cloneable cancellation handle
#[derive(Debug, Clone)]
pub struct CancellationToken {
    source: TokenSource,
}

impl CancellationToken {
    /// Token that is never cancelled
    pub fn noop() -> Self {
        Self {
            source: TokenSource::Never,
        }
    }

    /// Token driven by a plain flag (used by the watcher's stop switch)
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self {
            source: TokenSource::Flag(flag),
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        match &self.source {
            TokenSource::Never => false,
            TokenSource::Version { active, version } => active.load(Ordering::Relaxed) != *version,
            TokenSource::Flag(flag) => flag.load(Ordering::Relaxed),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_token_is_never_cancelled() {
        assert!(!CancellationToken::noop().is_cancelled());
        assert!(!CancellationToken::default().is_cancelled());
    }

    #[test]
    fn newer_version_cancels_older_tokens() {
        let tracker = VersionTracker::new();
        let first = tracker.begin();
        assert!(!first.is_cancelled());

        let second = tracker.begin();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(tracker.current_version(), 2);
    }

    #[test]
    fn flag_token_follows_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::from_flag(Arc::clone(&flag));
        assert!(!token.is_cancelled());
        flag.store(true, Ordering::SeqCst);
        assert!(token.is_cancelled());
    }
}

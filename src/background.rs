//! Background work queues and indexing status
//!
//! A [`WorkQueue`] owns one named worker thread fed through a channel. The
//! worker drains everything pending into a batch before calling its handler,
//! so requests pushed while a batch is being handled coalesce into the next
//! one. The database-write queue and the duplicate-prediction queue are both
//! built on it.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use crate::context::CounterSnapshot;
use crate::duplicates::DuplicateStats;
use crate::models::{IndexStats, ScanStats};

enum Message<T> {
    Item(T),
    Flush(Sender<()>),
}

/// A named worker thread processing batches of queued items
pub struct WorkQueue<T: Send + 'static> {
    name: String,
    sender: Mutex<Option<Sender<Message<T>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl<T: Send + 'static> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Start the worker; batches hold at most `batch_limit` items
    pub fn spawn(
        name: impl Into<String>,
        batch_limit: usize,
        handler: impl FnMut(Vec<T>) + Send + 'static,
    ) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = pending.clone();
        let worker_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(&worker_name, receiver, batch_limit.max(1), worker_pending, handler))
            .with_context(|| format!("Failed to spawn {} worker", name))?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            pending,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an item; false once the queue has shut down
    pub fn push(&self, item: T) -> bool {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return false;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(Message::Item(item)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Items queued but not yet handled
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Block until every item queued before this call has been handled
    pub fn flush(&self) {
        let (ack, done) = channel();
        let sent = self
            .sender
            .lock()
            .as_ref()
            .is_some_and(|sender| sender.send(Message::Flush(ack)).is_ok());
        if sent {
            // A closed channel means the worker is gone, which also means drained
            let _ = done.recv();
        }
    }

    /// Drain the queue and stop the worker
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::error!("{} worker panicked", self.name);
            }
        }
    }
}

impl<T: Send + 'static> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<T>(
    name: &str,
    receiver: Receiver<Message<T>>,
    batch_limit: usize,
    pending: Arc<AtomicUsize>,
    mut handler: impl FnMut(Vec<T>),
) {
    log::debug!("{} worker started", name);

    while let Ok(first) = receiver.recv() {
        let mut batch = Vec::new();
        let mut acks = Vec::new();
        let mut next = Some(first);

        while let Some(message) = next.take() {
            match message {
                Message::Item(item) => batch.push(item),
                Message::Flush(ack) => acks.push(ack),
            }
            if batch.len() >= batch_limit {
                break;
            }
            next = receiver.try_recv().ok();
        }

        if !batch.is_empty() {
            let count = batch.len();
            handler(batch);
            pending.fetch_sub(count, Ordering::SeqCst);
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }

    log::debug!("{} worker stopped", name);
}

/// Whether any background activity is in progress
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexerState {
    Idle,
    Running,
}

/// Serializable snapshot of the indexer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingStatus {
    pub state: IndexerState,
    pub activity: CounterSnapshot,
    /// Folders held by the tree
    pub folders: usize,
    /// Files held by indexed folders
    pub files: usize,
    /// Persisted records not yet matched to a listed file
    pub pending_seeds: usize,
    /// Records waiting for the database writer
    pub pending_writes: usize,
    /// Files skipped after repeated scan failures
    pub blocked_files: usize,
    pub last_index: Option<IndexStats>,
    pub last_scan: Option<ScanStats>,
    pub last_duplicates: Option<DuplicateStats>,
    /// Snapshot time (ISO 8601)
    pub updated_at: String,
}

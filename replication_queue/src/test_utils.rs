//! Mock collaborators for driving the queue in tests.

use crate::exec::{Worker, WorkerError};
use crate::interface::{MergeScheduler, PartStore, StoredPart};
use crate::queue::QueueEntry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A [`MergeScheduler`] controlled by test code. Starts uncancelled with an
/// unrestricted merge size.
#[derive(Debug)]
pub struct MockMergeScheduler {
    cancelled: AtomicBool,
    max_parts_size: AtomicU64,
}

impl Default for MockMergeScheduler {
    fn default() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            max_parts_size: AtomicU64::new(u64::MAX),
        }
    }
}

impl MockMergeScheduler {
    /// Create with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the process-wide cancellation signal.
    pub fn set_cancelled(&self, cancelled: bool) {
        self.cancelled.store(cancelled, Ordering::SeqCst);
    }

    /// Set the current merge-size allowance.
    pub fn set_max_parts_size(&self, bytes: u64) {
        self.max_parts_size.store(bytes, Ordering::SeqCst);
    }
}

impl MergeScheduler for MockMergeScheduler {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn max_parts_size_for_merge(&self) -> u64 {
        self.max_parts_size.load(Ordering::SeqCst)
    }
}

/// A [`PartStore`] backed by a map of part sizes.
#[derive(Debug)]
pub struct MockPartStore {
    parts: Mutex<hashbrown::HashMap<String, u64>>,
    size_ceiling: u64,
}

impl Default for MockPartStore {
    fn default() -> Self {
        Self::with_ceiling(u64::MAX)
    }
}

impl MockPartStore {
    /// Create an empty store with an unrestricted merge-size ceiling.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store with the given absolute merge-size ceiling.
    pub fn with_ceiling(size_ceiling: u64) -> Self {
        Self {
            parts: Default::default(),
            size_ceiling,
        }
    }

    /// Make a part of the given size present.
    pub fn put(&self, name: &str, size_bytes: u64) {
        self.parts.lock().insert(name.to_owned(), size_bytes);
    }
}

impl PartStore for MockPartStore {
    fn get_part_if_exists(&self, part_name: &str) -> Option<StoredPart> {
        self.parts
            .lock()
            .get(part_name)
            .map(|&size_bytes| StoredPart { size_bytes })
    }

    fn max_bytes_to_merge_at_max_space(&self) -> u64 {
        self.size_ceiling
    }
}

/// A [`Worker`] that records what it was asked to run and does what it is
/// told: succeed (the default), report "not applied", or fail.
#[derive(Debug)]
pub struct MockWorker {
    executed: Mutex<Vec<String>>,
    apply: AtomicBool,
    fail_with: Mutex<Option<String>>,
}

impl Default for MockWorker {
    fn default() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            apply: AtomicBool::new(true),
            fail_with: Mutex::new(None),
        }
    }
}

impl MockWorker {
    /// Create a worker that applies every entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `execute` reports the entry as applied.
    pub fn set_apply(&self, apply: bool) {
        self.apply.store(apply, Ordering::SeqCst);
    }

    /// Make every subsequent `execute` fail with `message`.
    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock() = Some(message.to_owned());
    }

    /// The produced-part names of the entries run so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl Worker for MockWorker {
    async fn execute(&self, entry: &QueueEntry) -> Result<bool, WorkerError> {
        self.executed
            .lock()
            .push(entry.entry().new_part_name.clone());
        if let Some(message) = self.fail_with.lock().clone() {
            return Err(message.into());
        }
        Ok(self.apply.load(Ordering::SeqCst))
    }
}

//! Contracts of the collaborators the queue consults while scheduling.
//!
//! The queue never touches part data or runs merges itself; it only asks
//! these narrow questions. Keeping them as traits makes the scheduler easy
//! to drive in tests.

use std::fmt::Debug;

/// Scheduling signals from the merge subsystem.
pub trait MergeScheduler: Send + Sync + Debug {
    /// Whether merging has been cancelled process-wide (e.g. during
    /// shutdown). While `true` no new merge entries are selected; entries
    /// already executing are unaffected.
    fn is_cancelled(&self) -> bool;

    /// The largest combined source size, in bytes, a merge may currently
    /// have. Shrinks while the worker pool is busy; equals the store's
    /// absolute ceiling when the pool is idle.
    fn max_parts_size_for_merge(&self) -> u64;
}

/// Metadata of a part that is present on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredPart {
    /// Total on-disk size of the part.
    pub size_bytes: u64,
}

/// Read-only view of the local part storage.
pub trait PartStore: Send + Sync + Debug {
    /// Look up a present part by name.
    fn get_part_if_exists(&self, part_name: &str) -> Option<StoredPart>;

    /// The absolute merge-size ceiling from the storage settings. When
    /// [`MergeScheduler::max_parts_size_for_merge`] reports this value the
    /// size gate is disabled entirely.
    fn max_bytes_to_merge_at_max_space(&self) -> u64;
}

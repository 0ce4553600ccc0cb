//! Per-replica replication queue for a replicated, range-partitioned shard.
//!
//! Every replica of a shard holds an identical sequence of immutable parts.
//! Mutations are serialized through the shared `/log` of the coordination
//! service; each replica mirrors that log into its own queue, selects entries
//! to execute under safety constraints, and persists its progress so peers
//! can observe lag.
//!
//! The pieces:
//!
//! - [`entry`] — the log-entry model and its wire codec
//! - [`queue`] — the in-memory queue, virtual/future part tracking,
//!   watermarks and the scheduler
//! - [`pull`] — the coordinator-to-queue transfer in bounded multi-op batches
//! - [`exec`] — the worker seam and the background driver loops
//! - [`interface`] — collaborator contracts (merge scheduling, part lookup)

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod entry;
pub mod exec;
pub mod interface;
pub mod pull;
pub mod queue;
pub mod test_utils;

pub use entry::{EntryParseError, EntryType, LogEntry};
pub use exec::{run_log_puller, run_queue_executor, Worker, WorkerError};
pub use interface::{MergeScheduler, PartStore, StoredPart};
pub use pull::{PullError, MAX_MULTI_OPS};
pub use queue::{CurrentlyExecuting, LoadError, QueueEntry, ReplicatedQueue, Status};

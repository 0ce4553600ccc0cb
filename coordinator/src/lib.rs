//! Client abstraction over the external coordination service.
//!
//! The replication subsystem talks to a sequential-znode service (ordered
//! sequential children, versioned writes, multi-op transactions, ephemeral
//! nodes and watches) only through the [`Coordinator`] trait defined here.
//! [`mem::MemCoordinator`] is a complete in-process implementation used by
//! every test in the workspace.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub mod mem;

/// Generic boxed error type that is used in this crate.
///
/// The dynamic boxing makes it easier to deal with errors from different
/// coordinator implementations, while [`CoordinatorErrorKind`] lets callers
/// branch on the outcome without downcasting.
#[derive(Debug)]
pub struct CoordinatorError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: CoordinatorErrorKind,
}

impl CoordinatorError {
    /// Create an error with the given kind.
    pub fn new(
        kind: CoordinatorErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// The addressed node does not exist.
    pub fn node_not_exist(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(CoordinatorErrorKind::NodeNotExist, e)
    }

    /// A node already exists at the addressed path.
    pub fn node_exists(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(CoordinatorErrorKind::NodeExists, e)
    }

    /// A versioned write lost a race.
    pub fn bad_version(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(CoordinatorErrorKind::BadVersion, e)
    }

    /// The session dropped mid-operation; the caller should retry on its
    /// next tick.
    pub fn connection_loss(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(CoordinatorErrorKind::ConnectionLoss, e)
    }

    /// Anything else.
    pub fn unknown(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(CoordinatorErrorKind::Unknown, e)
    }

    /// Returns the kind of error this was.
    pub fn kind(&self) -> CoordinatorErrorKind {
        self.kind
    }

    /// Returns the inner error.
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }
}

impl Display for CoordinatorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CoordinatorError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for CoordinatorError {}

impl From<String> for CoordinatorError {
    fn from(e: String) -> Self {
        Self {
            inner: e.into(),
            kind: CoordinatorErrorKind::Unknown,
        }
    }
}

impl From<&'static str> for CoordinatorError {
    fn from(e: &'static str) -> Self {
        Self {
            inner: e.into(),
            kind: CoordinatorErrorKind::Unknown,
        }
    }
}

/// Outcome classes a caller may want to branch on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoordinatorErrorKind {
    /// This operation failed for an unknown reason.
    Unknown,

    /// The addressed node does not exist.
    NodeNotExist,

    /// A node already exists at the addressed path.
    NodeExists,

    /// A versioned write was submitted against a stale version.
    BadVersion,

    /// The connection dropped; the operation may or may not have taken
    /// effect. Transient: callers retry on their next tick.
    ConnectionLoss,
}

/// A convenient alias.
pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;

/// Node metadata returned alongside reads and versioned writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Data version, bumped on every set.
    pub version: i32,
    /// Creation time, seconds since epoch.
    pub ctime: i64,
}

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// A plain durable node.
    Persistent,
    /// A durable node whose name is suffixed with a parent-scoped,
    /// zero-padded sequence number.
    PersistentSequential,
    /// A node tied to the creating session.
    Ephemeral,
    /// Sequential and tied to the creating session.
    EphemeralSequential,
}

impl CreateMode {
    fn is_sequential(&self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }

    fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }
}

/// One operation of a multi-op transaction.
#[derive(Debug, Clone)]
pub enum Op {
    /// Create a node.
    Create {
        /// Target path; for sequential modes this is the prefix the
        /// coordinator completes with a sequence number.
        path: String,
        /// Initial payload.
        value: String,
        /// Creation mode.
        mode: CreateMode,
    },
    /// Overwrite a node's payload.
    SetData {
        /// Target path.
        path: String,
        /// New payload.
        value: String,
        /// Expected version, or `-1` for any.
        version: i32,
    },
    /// Delete a node.
    Remove {
        /// Target path.
        path: String,
        /// Expected version, or `-1` for any.
        version: i32,
    },
    /// Assert a node's version without modifying it.
    Check {
        /// Target path.
        path: String,
        /// Expected version, or `-1` for any.
        version: i32,
    },
}

impl Op {
    /// Create-op shorthand.
    pub fn create(path: impl Into<String>, value: impl Into<String>, mode: CreateMode) -> Self {
        Self::Create {
            path: path.into(),
            value: value.into(),
            mode,
        }
    }

    /// Set-op shorthand.
    pub fn set_data(path: impl Into<String>, value: impl Into<String>, version: i32) -> Self {
        Self::SetData {
            path: path.into(),
            value: value.into(),
            version,
        }
    }

    /// Remove-op shorthand.
    pub fn remove(path: impl Into<String>, version: i32) -> Self {
        Self::Remove {
            path: path.into(),
            version,
        }
    }

    /// Check-op shorthand.
    pub fn check(path: impl Into<String>, version: i32) -> Self {
        Self::Check {
            path: path.into(),
            version,
        }
    }
}

/// Per-op outcome of a committed multi-op transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// A node was created; `path` carries the full name including any
    /// assigned sequence suffix.
    Created {
        /// The created path.
        path: String,
    },
    /// A node's payload was overwritten.
    SetData {
        /// Post-write metadata.
        stat: Stat,
    },
    /// A node was deleted.
    Removed,
    /// A version check passed.
    Checked,
}

/// A sticky, multi-waiter event used for coordinator watches.
///
/// Once [`set`](Self::set), every current and future [`wait`](Self::wait)
/// returns immediately; a watch may fire before the interested party starts
/// waiting.
#[derive(Debug, Default)]
pub struct NodeEvent {
    fired: AtomicBool,
    notify: Notify,
}

impl NodeEvent {
    /// Create an unfired event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the event, waking all waiters.
    pub fn set(&self) {
        self.fired.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether the event has fired.
    pub fn is_set(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Wait until the event fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the flag, so a concurrent `set`
            // cannot slip between the check and the await.
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// The narrow interface the replication subsystem needs from the
/// coordination service.
#[async_trait]
pub trait Coordinator: Send + Sync + Debug {
    /// Read a node's payload and metadata. The node must exist.
    async fn get(&self, path: &str) -> Result<(String, Stat)>;

    /// Read a node if it exists.
    async fn try_get(&self, path: &str) -> Result<Option<(String, Stat)>>;

    /// Names of a node's immediate children (no path prefix, unspecified
    /// order).
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Overwrite a node's payload. `version` of `-1` matches any.
    async fn set(&self, path: &str, value: &str, version: i32) -> Result<Stat>;

    /// Create a node, returning the full created path (sequence-suffixed
    /// for sequential modes).
    async fn create(&self, path: &str, value: &str, mode: CreateMode) -> Result<String>;

    /// Delete a node if it exists. `Ok(false)` means it was already gone.
    async fn try_remove(&self, path: &str) -> Result<bool>;

    /// Execute `ops` atomically: either every op takes effect, or none does.
    async fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResult>>;

    /// Whether a node exists. If `watch` is given it is armed to fire on the
    /// next create, delete or data change of `path`, whether or not the node
    /// currently exists.
    async fn exists(&self, path: &str, watch: Option<Arc<NodeEvent>>) -> Result<bool>;
}

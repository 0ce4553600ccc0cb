//! The in-memory replication queue, its indexes and the scheduler.
//!
//! One [`ReplicatedQueue`] exists per replica. It shadows the replica's
//! `/queue` children in RAM, tracks *virtual* parts (present or planned) and
//! *future* parts (being produced right now), maintains the insert-time
//! watermarks that peers read to observe lag, and picks the next entry that
//! is safe to execute.
//!
//! Lock discipline: `state` is a plain mutex held only for short in-memory
//! updates and never across a coordinator call; the pull-cycle lock in
//! [`crate::pull`] is independent so scheduling is never blocked by a log
//! pull.

use crate::entry::{EntryParseError, EntryType, LogEntry};
use crate::interface::{MergeScheduler, PartStore};
use coordinator::{Coordinator, CoordinatorError, Op};
use data_types::{ActivePartSet, PartName, PartNameError};
use futures::future::try_join_all;
use hashbrown::HashSet;
use observability_deps::tracing::{debug, error, info, trace};
use parking_lot::Mutex;
use shard_time::TimeProvider;
use snafu::{ResultExt, Snafu};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Errors raised while seeding or loading the queue. All are fatal: the
/// replica must not start with a queue it cannot faithfully mirror.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum LoadError {
    #[snafu(display("Coordinator operation failed: {source}"))]
    Coordinator { source: CoordinatorError },

    #[snafu(display("Cannot parse queue entry '{znode_name}': {source}"))]
    Parse {
        znode_name: String,
        source: EntryParseError,
    },

    #[snafu(display("Invalid part name: {source}"))]
    Part { source: PartNameError },
}

/// A [`LogEntry`] enqueued on this replica, together with its queue node
/// name and the execution bookkeeping.
///
/// The bookkeeping fields are interior-mutable but are only written while
/// the owning queue's lock is held, so readers holding that lock observe a
/// consistent snapshot.
#[derive(Debug)]
pub struct QueueEntry {
    entry: LogEntry,
    znode_name: String,

    currently_executing: AtomicBool,
    num_tries: AtomicU32,
    num_postponed: AtomicU32,
    last_attempt_time: AtomicI64,
    last_postpone_time: AtomicI64,
    postpone_reason: Mutex<Option<String>>,
    exception: Mutex<Option<Arc<dyn std::error::Error + Send + Sync>>>,
    execution_complete: Notify,
}

impl QueueEntry {
    /// Wrap `entry` under its assigned queue node name.
    pub fn new(entry: LogEntry, znode_name: impl Into<String>) -> Self {
        Self {
            entry,
            znode_name: znode_name.into(),
            currently_executing: AtomicBool::new(false),
            num_tries: AtomicU32::new(0),
            num_postponed: AtomicU32::new(0),
            last_attempt_time: AtomicI64::new(0),
            last_postpone_time: AtomicI64::new(0),
            postpone_reason: Mutex::new(None),
            exception: Mutex::new(None),
            execution_complete: Notify::new(),
        }
    }

    /// The immutable log entry.
    pub fn entry(&self) -> &LogEntry {
        &self.entry
    }

    /// Name of the mirrored `/queue` child.
    pub fn znode_name(&self) -> &str {
        &self.znode_name
    }

    /// Whether an execution guard for this entry is currently held.
    pub fn is_currently_executing(&self) -> bool {
        self.currently_executing.load(Ordering::Acquire)
    }

    /// How often execution has been attempted.
    pub fn num_tries(&self) -> u32 {
        self.num_tries.load(Ordering::Relaxed)
    }

    /// How often the scheduler has passed over this entry.
    pub fn num_postponed(&self) -> u32 {
        self.num_postponed.load(Ordering::Relaxed)
    }

    /// Seconds since epoch of the latest attempt, `0` if never attempted.
    pub fn last_attempt_time(&self) -> i64 {
        self.last_attempt_time.load(Ordering::Relaxed)
    }

    /// Seconds since epoch of the latest postponement, `0` if never.
    pub fn last_postpone_time(&self) -> i64 {
        self.last_postpone_time.load(Ordering::Relaxed)
    }

    /// Why the scheduler last passed over this entry.
    pub fn postpone_reason(&self) -> Option<String> {
        self.postpone_reason.lock().clone()
    }

    /// The failure captured from the most recent worker attempt.
    pub fn exception(&self) -> Option<Arc<dyn std::error::Error + Send + Sync>> {
        self.exception.lock().clone()
    }

    pub(crate) fn record_postpone(&self, reason: String, now: i64) {
        self.num_postponed.fetch_add(1, Ordering::Relaxed);
        self.last_postpone_time.store(now, Ordering::Relaxed);
        *self.postpone_reason.lock() = Some(reason);
    }

    pub(crate) fn set_exception(&self, e: Arc<dyn std::error::Error + Send + Sync>) {
        *self.exception.lock() = Some(e);
    }
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub(crate) queue: VecDeque<Arc<QueueEntry>>,
    pub(crate) virtual_parts: ActivePartSet,
    pub(crate) future_parts: HashSet<String>,
    /// GET_PART entries keyed by `(create_time, znode_name)` so the minimum
    /// unprocessed insert time is recomputable in O(log n) after removals.
    pub(crate) inserts_by_time: BTreeSet<(i64, String)>,
    pub(crate) min_unprocessed_insert_time: i64,
    pub(crate) max_processed_insert_time: i64,
    pub(crate) last_queue_update: i64,
}

/// Counters exposed for monitoring; see [`ReplicatedQueue::status`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    /// Parts currently being produced by executing entries.
    pub future_parts: usize,
    /// Entries in the queue.
    pub queue_size: usize,
    /// Seconds since epoch of the last successful log pull, `0` if never.
    pub last_queue_update: i64,
    /// GET_PART entries in the queue.
    pub inserts_in_queue: usize,
    /// MERGE_PARTS entries in the queue.
    pub merges_in_queue: usize,
    /// Oldest `create_time` across all queued entries, `0` if unknown.
    pub queue_oldest_time: i64,
    /// Oldest `create_time` across queued GET_PART entries.
    pub inserts_oldest_time: i64,
    /// Oldest `create_time` across queued MERGE_PARTS entries.
    pub merges_oldest_time: i64,
    /// Part produced by the oldest queued GET_PART.
    pub oldest_part_to_get: String,
    /// Part produced by the oldest queued MERGE_PARTS.
    pub oldest_part_to_merge_to: String,
}

/// The per-replica queue shadowing the shared replication log.
#[derive(Debug)]
pub struct ReplicatedQueue {
    pub(crate) shard_path: String,
    pub(crate) replica_path: String,
    pub(crate) time_provider: Arc<dyn TimeProvider>,
    pub(crate) state: Mutex<QueueState>,
    /// Serializes whole pull cycles; held across coordinator awaits, which
    /// is why it is not the state mutex.
    pub(crate) pull_lock: tokio::sync::Mutex<()>,
}

impl ReplicatedQueue {
    /// Create an empty queue for the replica at `replica_path` of the shard
    /// rooted at `shard_path`.
    pub fn new(
        shard_path: impl Into<String>,
        replica_path: impl Into<String>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            shard_path: shard_path.into(),
            replica_path: replica_path.into(),
            time_provider,
            state: Mutex::new(QueueState::default()),
            pull_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn log_path(&self) -> String {
        format!("{}/log", self.shard_path)
    }

    pub(crate) fn queue_path(&self) -> String {
        format!("{}/queue", self.replica_path)
    }

    pub(crate) fn log_pointer_path(&self) -> String {
        format!("{}/log_pointer", self.replica_path)
    }

    pub(crate) fn min_time_path(&self) -> String {
        format!("{}/min_unprocessed_insert_time", self.replica_path)
    }

    fn max_time_path(&self) -> String {
        format!("{}/max_processed_insert_time", self.replica_path)
    }

    fn now_secs(&self) -> i64 {
        self.time_provider.now().timestamp()
    }

    /// One-time setup: seed the virtual parts from the parts currently
    /// present on disk, then mirror the coordinator queue into RAM.
    pub async fn initialize(
        &self,
        coord: &dyn Coordinator,
        parts: &[String],
    ) -> Result<(), LoadError> {
        {
            let mut state = self.state.lock();
            for name in parts {
                state.virtual_parts.add(name).context(PartSnafu)?;
            }
        }
        self.load(coord).await
    }

    /// Mirror every `/queue` child into the in-memory queue, in coordinator
    /// insertion order, then push the current watermarks.
    pub async fn load(&self, coord: &dyn Coordinator) -> Result<(), LoadError> {
        let queue_path = self.queue_path();
        debug!(path = %queue_path, "Loading queue");

        let mut children = coord
            .get_children(&queue_path)
            .await
            .context(CoordinatorSnafu)?;
        debug!(n_entries = children.len(), "Having queue entries to load");

        // Children use persistent-sequential naming, so the name order is
        // the insertion order.
        children.sort();

        let values = try_join_all(children.iter().map(|child| {
            let path = format!("{queue_path}/{child}");
            async move { coord.get(&path).await }
        }))
        .await
        .context(CoordinatorSnafu)?;

        let mut handles = Vec::with_capacity(children.len());
        for (child, (value, _stat)) in children.iter().zip(values) {
            let entry = LogEntry::parse(&value).context(ParseSnafu {
                znode_name: child.as_str(),
            })?;
            handles.push(Arc::new(QueueEntry::new(entry, child.clone())));
        }

        {
            let mut state = self.state.lock();
            for handle in &handles {
                Self::insert_unlocked(&mut state, handle);
            }
        }

        self.update_times_in_coordinator(coord, true, false).await;

        trace!("Loaded queue");
        Ok(())
    }

    /// Insert `entry` into the queue and every index. Infallible: part names
    /// were validated when the entry payload was parsed.
    pub(crate) fn insert_unlocked(state: &mut QueueState, entry: &Arc<QueueEntry>) {
        state
            .virtual_parts
            .add(&entry.entry().new_part_name)
            .expect("part names are validated when entries are parsed");
        state.queue.push_back(Arc::clone(entry));

        if entry.entry().entry_type == EntryType::GetPart {
            let create_time = entry.entry().create_time;
            state
                .inserts_by_time
                .insert((create_time, entry.znode_name().to_owned()));

            if create_time != 0
                && (state.min_unprocessed_insert_time == 0
                    || create_time < state.min_unprocessed_insert_time)
            {
                state.min_unprocessed_insert_time = create_time;
            }
        }
    }

    /// Append an entry this replica authored itself and already wrote to the
    /// coordinator. Idempotent: the entry will usually be seen again by the
    /// log puller, and a duplicate queue node name is a no-op.
    pub async fn insert(&self, coord: &dyn Coordinator, entry: Arc<QueueEntry>) {
        let min_changed = {
            let mut state = self.state.lock();
            if state
                .queue
                .iter()
                .any(|e| e.znode_name() == entry.znode_name())
            {
                debug!(znode_name = entry.znode_name(), "entry already queued");
                false
            } else {
                let prev_min = state.min_unprocessed_insert_time;
                Self::insert_unlocked(&mut state, &entry);
                state.min_unprocessed_insert_time != prev_min
            }
        };

        if min_changed {
            self.update_times_in_coordinator(coord, true, false).await;
        }
    }

    /// Drop `entry` from the insert-time index and recompute both
    /// watermarks. Returns `(min_changed, max_changed)`.
    fn update_times_on_removal(state: &mut QueueState, entry: &QueueEntry) -> (bool, bool) {
        if entry.entry().entry_type != EntryType::GetPart {
            return (false, false);
        }

        let mut min_changed = false;
        let mut max_changed = false;

        state
            .inserts_by_time
            .remove(&(entry.entry().create_time, entry.znode_name().to_owned()));

        match state.inserts_by_time.iter().next() {
            None => {
                state.min_unprocessed_insert_time = 0;
                min_changed = true;
            }
            Some((first, _)) if *first > state.min_unprocessed_insert_time => {
                state.min_unprocessed_insert_time = *first;
                min_changed = true;
            }
            Some(_) => {}
        }

        if entry.entry().create_time > state.max_processed_insert_time {
            state.max_processed_insert_time = entry.entry().create_time;
            max_changed = true;
        }

        (min_changed, max_changed)
    }

    /// Flush the watermarks to the coordinator.
    ///
    /// Concurrent removers and the puller may interleave these writes, so a
    /// peer can briefly read a slightly stale value; local scheduling never
    /// depends on the coordinator copy.
    pub(crate) async fn update_times_in_coordinator(
        &self,
        coord: &dyn Coordinator,
        min_changed: bool,
        max_changed: bool,
    ) {
        let (min, max) = {
            let state = self.state.lock();
            (
                state.min_unprocessed_insert_time,
                state.max_processed_insert_time,
            )
        };

        let mut ops = Vec::with_capacity(2);
        if min_changed {
            ops.push(Op::set_data(self.min_time_path(), min.to_string(), -1));
        }
        if max_changed {
            ops.push(Op::set_data(self.max_time_path(), max.to_string(), -1));
        }
        if ops.is_empty() {
            return;
        }

        if let Err(e) = coord.multi(ops).await {
            error!(
                replica_path = %self.replica_path,
                %e,
                "Couldn't set value of insert time nodes. This shouldn't happen often.",
            );
        }
    }

    /// Remove a successfully executed entry from the coordinator and from
    /// RAM, updating the watermarks. Removing an entry that is already gone
    /// leaves the same post-state.
    pub async fn remove(&self, coord: &dyn Coordinator, entry: &Arc<QueueEntry>) {
        let path = format!("{}/{}", self.queue_path(), entry.znode_name());
        match coord.try_remove(&path).await {
            Ok(true) => {}
            Ok(false) => info!(path = %path, "queue node was already removed"),
            Err(e) => {
                error!(path = %path, %e, "Couldn't remove queue node. This shouldn't happen often.")
            }
        }

        let (min_changed, max_changed) = {
            let mut state = self.state.lock();

            // The entry picked for execution was moved to the tail, so scan
            // from the back. It may be gone already if a range drop raced us.
            if let Some(idx) = state.queue.iter().rposition(|e| Arc::ptr_eq(e, entry)) {
                state.queue.remove(idx);
            }

            Self::update_times_on_removal(&mut state, entry)
        };

        self.update_times_in_coordinator(coord, min_changed, max_changed)
            .await;
    }

    /// Remove the first queued entry producing `part_name`, if any.
    pub async fn remove_by_part_name(&self, coord: &dyn Coordinator, part_name: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state
                .queue
                .iter()
                .position(|e| e.entry().new_part_name == part_name)
            {
                Some(idx) => {
                    let entry = state.queue.remove(idx).expect("index came from position()");
                    let flags = Self::update_times_on_removal(&mut state, &entry);
                    Some((entry, flags))
                }
                None => None,
            }
        };

        let Some((entry, (min_changed, max_changed))) = removed else {
            return false;
        };

        let path = format!("{}/{}", self.queue_path(), entry.znode_name());
        match coord.try_remove(&path).await {
            Ok(true) => {}
            Ok(false) => info!(path = %path, "queue node was already removed"),
            Err(e) => {
                error!(path = %path, %e, "Couldn't remove queue node. This shouldn't happen often.")
            }
        }
        self.update_times_in_coordinator(coord, min_changed, max_changed)
            .await;

        true
    }

    /// Find the pending merge that consumes `part_name` and move the queued
    /// acquisitions of its other inputs behind it, so they do not race ahead
    /// of a merge that is going to be retried. Returns the merge's full
    /// input set, or an empty set if no such merge is queued.
    pub fn move_sibling_parts_for_merge_to_end_of_queue(
        &self,
        part_name: &str,
    ) -> BTreeSet<String> {
        let mut state = self.state.lock();

        let mut parts_for_merge = BTreeSet::new();
        let mut merge_idx = None;
        for (idx, e) in state.queue.iter().enumerate() {
            if e.entry().entry_type == EntryType::MergeParts
                && e.entry().parts_to_merge.iter().any(|p| p == part_name)
            {
                parts_for_merge = e.entry().parts_to_merge.iter().cloned().collect();
                merge_idx = Some(idx);
                break;
            }
        }

        if let Some(mut end) = merge_idx {
            let mut moved = Vec::new();
            let mut i = 0;
            while i < end {
                let e = &state.queue[i];
                let is_producer = matches!(
                    e.entry().entry_type,
                    EntryType::MergeParts | EntryType::GetPart
                ) && parts_for_merge.contains(&e.entry().new_part_name);

                if is_producer {
                    let e = state.queue.remove(i).expect("index is in bounds");
                    moved.push(e);
                    end -= 1;
                } else {
                    i += 1;
                }
            }
            state.queue.extend(moved);
        }

        parts_for_merge
    }

    /// For a range drop covering `part_name`: remove every queued GET_PART
    /// and MERGE_PARTS whose produced part falls inside the range, then wait
    /// for the covered entries that were already executing to finish.
    ///
    /// This call may block until in-flight workers release their guards; the
    /// caller must not hold anything those workers need.
    pub async fn remove_gets_and_merges_in_range(
        &self,
        coord: &dyn Coordinator,
        part_name: &str,
    ) -> Result<(), PartNameError> {
        let range: PartName = part_name.parse()?;

        let mut to_wait = Vec::new();
        let mut victims = Vec::new();
        let mut min_changed = false;
        let mut max_changed = false;

        {
            let mut state = self.state.lock();
            let mut i = 0;
            while i < state.queue.len() {
                let e = &state.queue[i];
                let covered = matches!(
                    e.entry().entry_type,
                    EntryType::GetPart | EntryType::MergeParts
                ) && e
                    .entry()
                    .new_part_name
                    .parse::<PartName>()
                    .map(|p| range.contains(&p))
                    .unwrap_or(false);

                if covered {
                    let entry = state.queue.remove(i).expect("index is in bounds");
                    if entry.is_currently_executing() {
                        to_wait.push(Arc::clone(&entry));
                    }
                    let (min_c, max_c) = Self::update_times_on_removal(&mut state, &entry);
                    min_changed |= min_c;
                    max_changed |= max_c;
                    victims.push(entry);
                } else {
                    i += 1;
                }
            }
        }

        for entry in &victims {
            let path = format!("{}/{}", self.queue_path(), entry.znode_name());
            match coord.try_remove(&path).await {
                Ok(_) => {}
                Err(e) => info!(path = %path, %e, "Couldn't remove queue node"),
            }
        }

        self.update_times_in_coordinator(coord, min_changed, max_changed)
            .await;

        debug!(
            removed_entries = victims.len(),
            waiting = to_wait.len(),
            "Removed entries from queue, waiting for executing entries in the dropped range",
        );

        for entry in to_wait {
            loop {
                let notified = entry.execution_complete.notified();
                tokio::pin!(notified);
                // Register before re-checking the flag, so a guard dropped
                // in between cannot be missed.
                notified.as_mut().enable();
                if !entry.is_currently_executing() {
                    break;
                }
                notified.await;
            }
        }

        Ok(())
    }

    /// The postpone decision table. `Err` carries the human-readable reason.
    fn should_execute_log_entry(
        state: &QueueState,
        entry: &QueueEntry,
        merger: &dyn MergeScheduler,
        store: &dyn PartStore,
    ) -> Result<(), String> {
        let log_entry = entry.entry();
        let part = &log_entry.new_part_name;

        if matches!(
            log_entry.entry_type,
            EntryType::MergeParts | EntryType::GetPart | EntryType::AttachPart
        ) {
            // The same part may already be produced by another entry that is
            // executing right now; once it finishes this entry will either
            // run or be found already satisfied.
            if state.future_parts.contains(part) {
                let reason = format!(
                    "Not executing log entry for part {part} because another log entry for \
                     the same part is being processed. This shouldn't happen often."
                );
                debug!("{reason}");
                return Err(reason);
            }

            if let Ok(result_part) = part.parse::<PartName>() {
                for future_name in &state.future_parts {
                    let covers = future_name
                        .parse::<PartName>()
                        .map(|f| f.contains(&result_part))
                        .unwrap_or(false);
                    if covers {
                        let reason = format!(
                            "Not executing log entry for part {part} because another log \
                             entry for covering part {future_name} is being processed."
                        );
                        debug!("{reason}");
                        return Err(reason);
                    }
                }
            }
        }

        if log_entry.entry_type == EntryType::MergeParts {
            // If a source part is still being transferred or produced, wait
            // for it. A source that is simply absent is not a blocker: the
            // merge attempt will fall back to fetching the result instead.
            let mut sum_parts_size_bytes = 0;
            for name in &log_entry.parts_to_merge {
                if state.future_parts.contains(name) {
                    let reason = format!(
                        "Not merging into part {part} because part {name} is not ready yet \
                         (log entry for that part is being processed)."
                    );
                    trace!("{reason}");
                    return Err(reason);
                }

                if let Some(source) = store.get_part_if_exists(name) {
                    sum_parts_size_bytes += source.size_bytes;
                }
            }

            if merger.is_cancelled() {
                let reason =
                    format!("Not executing log entry for part {part} because merges are cancelled now.");
                debug!("{reason}");
                return Err(reason);
            }

            // Merges of this size only run while the pool has room for them;
            // when every slot is free the maximum is unrestricted so that
            // explicitly requested merges still go through.
            let max_parts_size_for_merge = merger.max_parts_size_for_merge();
            if max_parts_size_for_merge != store.max_bytes_to_merge_at_max_space()
                && sum_parts_size_bytes > max_parts_size_for_merge
            {
                let reason = format!(
                    "Not executing log entry for part {part} because its size \
                     ({sum_parts_size_bytes} bytes) is greater than current maximum \
                     ({max_parts_size_for_merge} bytes)."
                );
                debug!("{reason}");
                return Err(reason);
            }
        }

        Ok(())
    }

    /// Whether `entry` would execute right now; on postpone the reason is
    /// returned and recorded on the entry.
    pub fn should_execute(
        &self,
        entry: &QueueEntry,
        merger: &dyn MergeScheduler,
        store: &dyn PartStore,
    ) -> Result<(), String> {
        let state = self.state.lock();
        let decision = Self::should_execute_log_entry(&state, entry, merger, store);
        if let Err(reason) = &decision {
            entry.record_postpone(reason.clone(), self.now_secs());
        }
        decision
    }

    /// Pick the first executable entry, move it to the queue tail (so a
    /// failure does not starve the entries behind it) and tag it with an
    /// execution guard. Skipped entries get their postpone counters bumped.
    pub fn select_entry_to_process(
        &self,
        merger: &dyn MergeScheduler,
        store: &dyn PartStore,
    ) -> Option<(Arc<QueueEntry>, CurrentlyExecuting<'_>)> {
        let mut state = self.state.lock();
        let now = self.now_secs();

        let mut selected = None;
        for i in 0..state.queue.len() {
            let e = &state.queue[i];
            if e.is_currently_executing() {
                continue;
            }

            match Self::should_execute_log_entry(&state, e, merger, store) {
                Ok(()) => {
                    selected = Some(i);
                    break;
                }
                Err(reason) => e.record_postpone(reason, now),
            }
        }

        let idx = selected?;
        let entry = state.queue.remove(idx).expect("index is in bounds");
        state.queue.push_back(Arc::clone(&entry));

        let guard = CurrentlyExecuting::new(self, &entry, &mut state, now);
        Some((entry, guard))
    }

    /// Mark the range as already covered so the scheduler and merge
    /// selection treat everything inside it as superseded. Used after a
    /// range drop; there is no queue entry behind this virtual part.
    pub fn disable_merges_in_range(&self, part_name: &str) -> Result<(), PartNameError> {
        self.state.lock().virtual_parts.add(part_name)
    }

    /// Whether `part_name` is covered by a virtual part other than itself,
    /// i.e. a merge will produce it or merges over it are disabled.
    pub fn part_will_be_merged_or_merges_disabled(
        &self,
        part_name: &str,
    ) -> Result<bool, PartNameError> {
        let state = self.state.lock();
        Ok(state.virtual_parts.get_containing_part(part_name)? != part_name)
    }

    /// Point-in-time snapshot of the monitoring counters.
    pub fn status(&self) -> Status {
        let state = self.state.lock();

        let mut res = Status {
            future_parts: state.future_parts.len(),
            queue_size: state.queue.len(),
            last_queue_update: state.last_queue_update,
            ..Default::default()
        };

        for entry in &state.queue {
            let create_time = entry.entry().create_time;

            if create_time != 0 && (res.queue_oldest_time == 0 || create_time < res.queue_oldest_time)
            {
                res.queue_oldest_time = create_time;
            }

            match entry.entry().entry_type {
                EntryType::GetPart => {
                    res.inserts_in_queue += 1;
                    if create_time != 0
                        && (res.inserts_oldest_time == 0 || create_time < res.inserts_oldest_time)
                    {
                        res.inserts_oldest_time = create_time;
                        res.oldest_part_to_get = entry.entry().new_part_name.clone();
                    }
                }
                EntryType::MergeParts => {
                    res.merges_in_queue += 1;
                    if create_time != 0
                        && (res.merges_oldest_time == 0 || create_time < res.merges_oldest_time)
                    {
                        res.merges_oldest_time = create_time;
                        res.oldest_part_to_merge_to = entry.entry().new_part_name.clone();
                    }
                }
                _ => {}
            }
        }

        res
    }

    /// Snapshot of the queued log entries, head to tail.
    pub fn entries(&self) -> Vec<LogEntry> {
        let state = self.state.lock();
        state.queue.iter().map(|e| e.entry().clone()).collect()
    }

    /// Number of queued MERGE_PARTS entries.
    pub fn count_merges(&self) -> usize {
        let state = self.state.lock();
        state
            .queue
            .iter()
            .filter(|e| e.entry().entry_type == EntryType::MergeParts)
            .count()
    }

    /// Both insert-time watermarks, `(min_unprocessed, max_processed)`.
    pub fn insert_times(&self) -> (i64, i64) {
        let state = self.state.lock();
        (
            state.min_unprocessed_insert_time,
            state.max_processed_insert_time,
        )
    }
}

/// Scoped tag for an entry being executed.
///
/// While the guard lives, the produced part is a *future part* and the entry
/// is skipped by the scheduler. Dropping the guard untags the part and wakes
/// any range-drop drain waiting on the entry, on every control-flow exit of
/// the worker.
#[derive(Debug)]
pub struct CurrentlyExecuting<'q> {
    queue: &'q ReplicatedQueue,
    entry: Arc<QueueEntry>,
}

impl<'q> CurrentlyExecuting<'q> {
    /// Called with the queue lock held, from entry selection only.
    fn new(
        queue: &'q ReplicatedQueue,
        entry: &Arc<QueueEntry>,
        state: &mut QueueState,
        now: i64,
    ) -> Self {
        entry.currently_executing.store(true, Ordering::Release);
        entry.num_tries.fetch_add(1, Ordering::Relaxed);
        entry.last_attempt_time.store(now, Ordering::Relaxed);

        assert!(
            state
                .future_parts
                .insert(entry.entry().new_part_name.clone()),
            "Tagging already tagged future part {}. This is a bug.",
            entry.entry().new_part_name,
        );

        Self {
            queue,
            entry: Arc::clone(entry),
        }
    }
}

impl Drop for CurrentlyExecuting<'_> {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock();

        self.entry.currently_executing.store(false, Ordering::Release);
        self.entry.execution_complete.notify_waiters();

        if !state.future_parts.remove(&self.entry.entry().new_part_name) {
            error!(
                part = %self.entry.entry().new_part_name,
                "Untagging already untagged future part. This is a bug.",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockMergeScheduler, MockPartStore};
    use coordinator::{mem::MemCoordinator, CreateMode};
    use shard_time::{MockProvider, Time};
    use std::time::Duration;

    const SHARD: &str = "/shards/s1";
    const REPLICA: &str = "/shards/s1/replicas/r1";

    async fn setup_replica(coord: &MemCoordinator) {
        for path in [
            "/shards",
            SHARD,
            &format!("{SHARD}/log"),
            &format!("{SHARD}/replicas"),
            REPLICA,
            &format!("{REPLICA}/queue"),
        ] {
            coord.create(path, "", CreateMode::Persistent).await.unwrap();
        }
        for (node, value) in [
            ("log_pointer", ""),
            ("min_unprocessed_insert_time", "0"),
            ("max_processed_insert_time", "0"),
        ] {
            coord
                .create(&format!("{REPLICA}/{node}"), value, CreateMode::Persistent)
                .await
                .unwrap();
        }
    }

    fn get_entry(part: &str, create_time: i64) -> LogEntry {
        LogEntry {
            entry_type: EntryType::GetPart,
            new_part_name: part.to_owned(),
            parts_to_merge: vec![],
            column_name: None,
            create_time,
            source_replica: "r1".to_owned(),
        }
    }

    fn merge_entry(sources: &[&str], target: &str, create_time: i64) -> LogEntry {
        LogEntry {
            entry_type: EntryType::MergeParts,
            new_part_name: target.to_owned(),
            parts_to_merge: sources.iter().map(|s| (*s).to_owned()).collect(),
            column_name: None,
            create_time,
            source_replica: "r1".to_owned(),
        }
    }

    fn test_queue() -> (ReplicatedQueue, Arc<MockProvider>) {
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp(10_000)));
        let queue = ReplicatedQueue::new(
            SHARD,
            REPLICA,
            Arc::<MockProvider>::clone(&time_provider) as _,
        );
        (queue, time_provider)
    }

    fn push_entries(queue: &ReplicatedQueue, entries: &[(LogEntry, &str)]) -> Vec<Arc<QueueEntry>> {
        let mut state = queue.state.lock();
        entries
            .iter()
            .map(|(entry, znode)| {
                let handle = Arc::new(QueueEntry::new(entry.clone(), *znode));
                ReplicatedQueue::insert_unlocked(&mut state, &handle);
                handle
            })
            .collect()
    }

    #[test]
    fn insert_tracks_watermark_and_virtual_parts() {
        let (queue, _time) = test_queue();
        push_entries(
            &queue,
            &[
                (get_entry("p_0_0_0", 1002), "queue-0000000000"),
                (get_entry("p_1_1_0", 1001), "queue-0000000001"),
                (get_entry("p_2_2_0", 0), "queue-0000000002"),
            ],
        );

        assert_eq!(queue.insert_times(), (1001, 0));
        assert!(!queue
            .part_will_be_merged_or_merges_disabled("p_1_1_0")
            .unwrap());

        let status = queue.status();
        assert_eq!(status.queue_size, 3);
        assert_eq!(status.inserts_in_queue, 3);
        assert_eq!(status.inserts_oldest_time, 1001);
        assert_eq!(status.oldest_part_to_get, "p_1_1_0");
    }

    #[test]
    fn zero_create_time_does_not_lower_watermark() {
        let (queue, _time) = test_queue();
        push_entries(&queue, &[(get_entry("p_0_0_0", 0), "queue-0000000000")]);
        assert_eq!(queue.insert_times(), (0, 0));

        push_entries(&queue, &[(get_entry("p_1_1_0", 500), "queue-0000000001")]);
        assert_eq!(queue.insert_times(), (500, 0));
    }

    #[test]
    fn select_skips_future_part_conflicts() {
        let (queue, _time) = test_queue();
        let merger = MockMergeScheduler::new();
        let store = MockPartStore::new();

        let handles = push_entries(
            &queue,
            &[
                (get_entry("p_2_2_0", 1000), "queue-0000000000"),
                (
                    merge_entry(&["p_1_1_0", "p_2_2_0", "p_3_3_0"], "p_1_3_1", 1001),
                    "queue-0000000001",
                ),
                (get_entry("p_9_9_0", 1002), "queue-0000000002"),
            ],
        );

        // First pick: the GET for p_2_2_0.
        let (first, first_guard) = queue.select_entry_to_process(&merger, &store).unwrap();
        assert!(Arc::ptr_eq(&first, &handles[0]));

        // While p_2_2_0 is in flight the merge consuming it is postponed and
        // the scheduler falls through to the next GET.
        let (second, second_guard) = queue.select_entry_to_process(&merger, &store).unwrap();
        assert!(Arc::ptr_eq(&second, &handles[2]));
        assert_eq!(handles[1].num_postponed(), 1);
        assert!(handles[1]
            .postpone_reason()
            .unwrap()
            .contains("is not ready yet"));

        // Nothing else is executable.
        assert!(queue.select_entry_to_process(&merger, &store).is_none());

        drop(first_guard);
        drop(second_guard);

        // With the sources free again, the merge goes through.
        let (third, _g) = queue.select_entry_to_process(&merger, &store).unwrap();
        assert!(Arc::ptr_eq(&third, &handles[1]));
    }

    #[test]
    fn select_skips_same_and_covering_future_parts() {
        let (queue, _time) = test_queue();
        let merger = MockMergeScheduler::new();
        let store = MockPartStore::new();

        let handles = push_entries(
            &queue,
            &[
                (get_entry("p_0_5_1", 1000), "queue-0000000000"),
                (get_entry("p_2_2_0", 1001), "queue-0000000001"),
            ],
        );

        let (_first, guard) = queue.select_entry_to_process(&merger, &store).unwrap();

        // p_2_2_0 is covered by the in-flight p_0_5_1.
        assert!(queue.select_entry_to_process(&merger, &store).is_none());
        assert!(handles[1]
            .postpone_reason()
            .unwrap()
            .contains("covering part p_0_5_1"));

        drop(guard);
        assert!(queue.select_entry_to_process(&merger, &store).is_some());
    }

    #[test]
    fn merges_postponed_when_cancelled() {
        let (queue, _time) = test_queue();
        let merger = MockMergeScheduler::new();
        merger.set_cancelled(true);
        let store = MockPartStore::new();

        let handles = push_entries(
            &queue,
            &[(
                merge_entry(&["p_0_0_0", "p_1_1_0"], "p_0_1_1", 1000),
                "queue-0000000000",
            )],
        );

        assert!(queue.select_entry_to_process(&merger, &store).is_none());
        assert!(handles[0]
            .postpone_reason()
            .unwrap()
            .contains("merges are cancelled"));
    }

    #[test]
    fn oversized_merges_postponed_unless_ceiling_reached() {
        let (queue, _time) = test_queue();
        let merger = MockMergeScheduler::new();
        let store = MockPartStore::with_ceiling(1_000_000);
        store.put("p_0_0_0", 600);
        store.put("p_1_1_0", 500);

        let handles = push_entries(
            &queue,
            &[(
                merge_entry(&["p_0_0_0", "p_1_1_0"], "p_0_1_1", 1000),
                "queue-0000000000",
            )],
        );

        // Pool is busy: only small merges are allowed, 1100 bytes is too big.
        merger.set_max_parts_size(1000);
        assert!(queue.select_entry_to_process(&merger, &store).is_none());
        assert!(handles[0]
            .postpone_reason()
            .unwrap()
            .contains("greater than current maximum"));

        // Pool is idle: the maximum equals the absolute ceiling and any
        // merge is allowed through.
        merger.set_max_parts_size(1_000_000);
        assert!(queue.select_entry_to_process(&merger, &store).is_some());
    }

    #[test]
    fn guard_drop_untags_and_notifies() {
        let (queue, _time) = test_queue();
        let merger = MockMergeScheduler::new();
        let store = MockPartStore::new();

        push_entries(&queue, &[(get_entry("p_0_0_0", 1000), "queue-0000000000")]);

        let (entry, guard) = queue.select_entry_to_process(&merger, &store).unwrap();
        assert!(entry.is_currently_executing());
        assert_eq!(entry.num_tries(), 1);
        assert_eq!(queue.status().future_parts, 1);

        drop(guard);
        assert!(!entry.is_currently_executing());
        assert_eq!(queue.status().future_parts, 0);

        // Re-selection increments the try counter again.
        let (entry, _guard) = queue.select_entry_to_process(&merger, &store).unwrap();
        assert_eq!(entry.num_tries(), 2);
    }

    #[test]
    fn sibling_parts_move_behind_their_merge() {
        let (queue, _time) = test_queue();
        push_entries(
            &queue,
            &[
                (get_entry("p_1_1_0", 1), "queue-0000000000"),
                (get_entry("p_2_2_0", 2), "queue-0000000001"),
                (get_entry("p_3_3_0", 3), "queue-0000000002"),
                (
                    merge_entry(&["p_1_1_0", "p_2_2_0", "p_3_3_0"], "p_1_3_1", 4),
                    "queue-0000000003",
                ),
                (get_entry("p_4_4_0", 5), "queue-0000000004"),
            ],
        );

        let moved = queue.move_sibling_parts_for_merge_to_end_of_queue("p_2_2_0");
        assert_eq!(
            moved,
            ["p_1_1_0", "p_2_2_0", "p_3_3_0"]
                .iter()
                .map(|s| (*s).to_owned())
                .collect::<BTreeSet<_>>()
        );

        let order: Vec<String> = queue
            .entries()
            .into_iter()
            .map(|e| e.new_part_name)
            .collect();
        assert_eq!(
            order,
            vec!["p_1_3_1", "p_4_4_0", "p_1_1_0", "p_2_2_0", "p_3_3_0"]
        );
    }

    #[test]
    fn no_merge_for_part_returns_empty_set() {
        let (queue, _time) = test_queue();
        push_entries(&queue, &[(get_entry("p_1_1_0", 1), "queue-0000000000")]);

        let moved = queue.move_sibling_parts_for_merge_to_end_of_queue("p_1_1_0");
        assert!(moved.is_empty());
        assert_eq!(queue.entries().len(), 1);
    }

    #[test]
    fn disable_merges_marks_range_covered() {
        let (queue, _time) = test_queue();
        queue.disable_merges_in_range("p_0_99_999").unwrap();

        assert!(queue
            .part_will_be_merged_or_merges_disabled("p_42_42_0")
            .unwrap());
        assert!(!queue
            .part_will_be_merged_or_merges_disabled("q_42_42_0")
            .unwrap());
    }

    #[tokio::test]
    async fn remove_updates_coordinator_and_watermarks() {
        let coord = MemCoordinator::new();
        setup_replica(&coord).await;
        let (queue, _time) = test_queue();

        let handles = push_entries(
            &queue,
            &[
                (get_entry("p_0_0_0", 1000), "queue-0000000000"),
                (get_entry("p_1_1_0", 1001), "queue-0000000001"),
            ],
        );
        for handle in &handles {
            coord
                .create(
                    &format!("{REPLICA}/queue/{}", handle.znode_name()),
                    &handle.entry().serialize(),
                    CreateMode::Persistent,
                )
                .await
                .unwrap();
        }

        queue.remove(&coord, &handles[0]).await;

        assert_eq!(queue.insert_times(), (1001, 1000));
        assert_eq!(queue.status().queue_size, 1);
        assert_eq!(
            coord
                .get(&format!("{REPLICA}/min_unprocessed_insert_time"))
                .await
                .unwrap()
                .0,
            "1001"
        );
        assert_eq!(
            coord
                .get(&format!("{REPLICA}/max_processed_insert_time"))
                .await
                .unwrap()
                .0,
            "1000"
        );
        assert!(coord
            .try_get(&format!("{REPLICA}/queue/queue-0000000000"))
            .await
            .unwrap()
            .is_none());

        // Removing again is a no-op on the already-missing node and leaves
        // the same post-state.
        queue.remove(&coord, &handles[0]).await;
        assert_eq!(queue.insert_times(), (1001, 1000));
        assert_eq!(queue.status().queue_size, 1);
    }

    #[tokio::test]
    async fn remove_by_part_name_finds_first_match() {
        let coord = MemCoordinator::new();
        setup_replica(&coord).await;
        let (queue, _time) = test_queue();

        push_entries(
            &queue,
            &[
                (get_entry("p_0_0_0", 1000), "queue-0000000000"),
                (get_entry("p_1_1_0", 1001), "queue-0000000001"),
            ],
        );

        assert!(queue.remove_by_part_name(&coord, "p_1_1_0").await);
        assert!(!queue.remove_by_part_name(&coord, "p_1_1_0").await);
        assert_eq!(queue.status().queue_size, 1);
    }

    #[tokio::test]
    async fn range_drop_waits_for_executing_entries() {
        let coord = Arc::new(MemCoordinator::new());
        setup_replica(&coord).await;
        let queue = Arc::new(ReplicatedQueue::new(
            SHARD,
            REPLICA,
            Arc::new(MockProvider::new(Time::from_timestamp(10_000))) as _,
        ));
        let merger = MockMergeScheduler::new();
        let store = MockPartStore::new();

        push_entries(
            &queue,
            &[
                (get_entry("p_42_42_0", 1000), "queue-0000000000"),
                (
                    merge_entry(&["p_50_50_0", "p_51_51_0"], "p_50_51_1", 1001),
                    "queue-0000000001",
                ),
                (get_entry("q_7_7_0", 1002), "queue-0000000002"),
            ],
        );

        // Start executing the GET for p_42_42_0 and keep its guard alive.
        let (entry, guard) = queue.select_entry_to_process(&merger, &store).unwrap();
        assert_eq!(entry.entry().new_part_name, "p_42_42_0");

        let drainer = {
            let queue = Arc::clone(&queue);
            let coord = Arc::clone(&coord);
            tokio::spawn(async move {
                queue
                    .remove_gets_and_merges_in_range(coord.as_ref(), "p_0_99_999")
                    .await
                    .unwrap();
            })
        };

        // The drain must block on the executing entry.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drainer.is_finished());

        // Both covered entries are already out of the queue; the entry in
        // another partition survives.
        assert_eq!(queue.status().queue_size, 1);
        assert_eq!(queue.entries()[0].new_part_name, "q_7_7_0");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), drainer)
            .await
            .expect("drain completes once the guard is dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn range_drop_without_executing_entries_returns_immediately() {
        let coord = MemCoordinator::new();
        setup_replica(&coord).await;
        let (queue, _time) = test_queue();

        push_entries(
            &queue,
            &[(
                merge_entry(&["p_50_50_0", "p_51_51_0"], "p_50_51_1", 1001),
                "queue-0000000000",
            )],
        );

        queue
            .remove_gets_and_merges_in_range(&coord, "p_0_99_999")
            .await
            .unwrap();
        assert_eq!(queue.status().queue_size, 0);
    }
}

//! The log puller: copies new shared-log entries into this replica's queue.
//!
//! Each cycle reads `/log` past the replica's `log_pointer` and, in batches,
//! commits one multi-op transaction that (a) mirrors every entry under the
//! replica's `/queue` as a persistent-sequential child, (b) advances the
//! pointer, and (c) piggybacks a lowered insert watermark if the batch
//! contained fresh inserts. Only after the transaction commits does the
//! in-memory queue pick the entries up, under znode names assigned by the
//! coordinator.

use crate::entry::{EntryParseError, EntryType, LogEntry};
use crate::queue::{QueueEntry, ReplicatedQueue};
use coordinator::{Coordinator, CoordinatorError, CreateMode, NodeEvent, Op, OpResult};
use data_types::{pad_index, LogIndex};
use futures::future::try_join_all;
use observability_deps::tracing::debug;
use snafu::{OptionExt, ResultExt, Snafu};
use std::sync::Arc;

/// The coordinator caps the count and total size of operations in a single
/// multi-op transaction and simply closes the connection when the cap is
/// exceeded. Chosen with margin: typical payloads are well under 10 KiB
/// against a transaction budget of about 1 MB.
pub const MAX_MULTI_OPS: usize = 100;

/// Errors raised by a pull cycle.
///
/// Coordinator errors are transient (the next cycle retries); the others
/// mean the shared log itself is unusable and are fatal to the replica.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum PullError {
    #[snafu(display("Coordinator operation failed: {source}"))]
    Coordinator { source: CoordinatorError },

    #[snafu(display("Cannot parse log entry '{entry_name}': {source}"))]
    Parse {
        entry_name: String,
        source: EntryParseError,
    },

    #[snafu(display("Unexpected node '{name}' in {path}"))]
    UnexpectedLogNode { name: String, path: String },

    #[snafu(display("Cannot parse log pointer value '{value}'"))]
    BadLogPointer { value: String },
}

fn log_entry_index(name: &str, log_path: &str) -> Result<LogIndex, PullError> {
    name.strip_prefix("log-")
        .and_then(|s| s.parse().ok())
        .context(UnexpectedLogNodeSnafu {
            name,
            path: log_path,
        })
}

impl ReplicatedQueue {
    /// Copy new entries from the shared log into this replica's queue.
    ///
    /// Returns whether anything was copied. If `next_update_event` is given
    /// it is armed to fire once `/log` grows past the current pointer (or
    /// immediately, if it already has).
    pub async fn pull_logs_to_queue(
        &self,
        coord: &dyn Coordinator,
        next_update_event: Option<Arc<NodeEvent>>,
    ) -> Result<bool, PullError> {
        // Serializes whole pull cycles so two pullers never interleave
        // their transactions. Deliberately not the state mutex: scheduling
        // keeps running while this cycle talks to the coordinator.
        let _cycle = self.pull_lock.lock().await;

        let pointer_path = self.log_pointer_path();
        let log_path = self.log_path();

        let pointer = coord
            .try_get(&pointer_path)
            .await
            .context(CoordinatorSnafu)?;
        let mut log_entries = coord
            .get_children(&log_path)
            .await
            .context(CoordinatorSnafu)?;

        let index = match pointer {
            Some((value, _stat)) if !value.is_empty() => value
                .parse::<LogIndex>()
                .ok()
                .context(BadLogPointerSnafu { value: value.as_str() })?,
            pointer => {
                // No pointer yet: point at the smallest entry currently in
                // the log (0 if the log is empty) and persist that.
                let index = match log_entries.iter().min() {
                    Some(name) => log_entry_index(name, &log_path)?,
                    None => LogIndex::new(0),
                };
                let value = index.get().to_string();
                if pointer.is_some() {
                    coord
                        .set(&pointer_path, &value, -1)
                        .await
                        .context(CoordinatorSnafu)?;
                } else {
                    coord
                        .create(&pointer_path, &value, CreateMode::Persistent)
                        .await
                        .context(CoordinatorSnafu)?;
                }
                index
            }
        };

        // Entries sorting below the pointer were consumed earlier.
        let min_log_entry = format!("log-{}", pad_index(index.get()));
        log_entries.retain(|name| *name >= min_log_entry);

        let pulled_any = !log_entries.is_empty();
        if pulled_any {
            log_entries.sort();

            let queue_prefix = format!("{}/queue-", self.queue_path());
            for batch in log_entries.chunks(MAX_MULTI_OPS) {
                let first = batch.first().expect("chunks are never empty");
                let last = batch.last().expect("chunks are never empty");
                let last_index = log_entry_index(last, &log_path)?;

                debug!(
                    n_entries = batch.len(),
                    from = %first,
                    to = %last,
                    "Pulling entries to queue",
                );

                // Fan out the payload reads; every payload must be in hand
                // (and parseable) before the transaction is submitted.
                let payloads = try_join_all(batch.iter().map(|name| {
                    let path = format!("{log_path}/{name}");
                    async move { coord.get(&path).await }
                }))
                .await
                .context(CoordinatorSnafu)?;

                let mut copied_entries = Vec::with_capacity(batch.len());
                let mut ops = Vec::with_capacity(batch.len() + 2);
                let mut min_unprocessed = self.insert_times().0;
                let mut min_changed = false;

                for (name, (value, _stat)) in batch.iter().zip(payloads) {
                    let entry = LogEntry::parse(&value).context(ParseSnafu {
                        entry_name: name.as_str(),
                    })?;

                    if entry.entry_type == EntryType::GetPart
                        && entry.create_time != 0
                        && (min_unprocessed == 0 || entry.create_time < min_unprocessed)
                    {
                        min_unprocessed = entry.create_time;
                        min_changed = true;
                    }

                    ops.push(Op::create(
                        queue_prefix.clone(),
                        value,
                        CreateMode::PersistentSequential,
                    ));
                    copied_entries.push(entry);
                }

                ops.push(Op::set_data(
                    pointer_path.clone(),
                    (last_index + 1).get().to_string(),
                    -1,
                ));
                if min_changed {
                    ops.push(Op::set_data(
                        self.min_time_path(),
                        min_unprocessed.to_string(),
                        -1,
                    ));
                }

                let results = coord.multi(ops).await.context(CoordinatorSnafu)?;

                // The transaction is committed; the in-memory update below
                // cannot fail (payloads were parsed above), so RAM cannot
                // diverge from the coordinator.
                {
                    let mut state = self.state.lock();
                    for (entry, result) in copied_entries.into_iter().zip(&results) {
                        let created_path = match result {
                            OpResult::Created { path } => path,
                            other => unreachable!("create op yielded {other:?}"),
                        };
                        let znode_name = created_path
                            .rsplit('/')
                            .next()
                            .expect("created path has a final component");
                        let handle = Arc::new(QueueEntry::new(entry, znode_name));
                        Self::insert_unlocked(&mut state, &handle);
                    }
                    state.last_queue_update = self.time_provider.now().timestamp();
                }

                debug!(n_entries = batch.len(), "Pulled entries to queue");
            }
        }

        if let Some(event) = next_update_event {
            // Arm a watch on the next entry this replica will consume; if it
            // is already there the caller should pull again right away.
            let next_entry_path = format!("{log_path}/log-{}", pad_index(index.get()));
            if coord
                .exists(&next_entry_path, Some(Arc::clone(&event)))
                .await
                .context(CoordinatorSnafu)?
            {
                event.set();
            }
        }

        Ok(pulled_any)
    }
}

// Replication Queue
//
// Per-replica mirror of the shared replication log plus everything needed
// to decide which queued action may run next. All coordination state sits
// in one `QueueState` behind the primary lock; log pulling and mutation
// refreshes each hold their own single-flight lock so they never block
// selection.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::QueueConfig;
use crate::log::{
    Coordinator, CoordinatorError, EntryId, LogEntryData, LogEntryKind, LogError, Timestamp,
    WriteOp,
};
use crate::mutations::{MutationError, MutationIndex};
use crate::parts::{ActivePartSet, PartInfo, PartNameError};
use crate::rules::DispatchRules;
use crate::state::StateError;

mod entries;
mod ranges;
mod select;
mod sync;

pub use entries::{EntrySnapshot, InsertTimes, InsertTimesUpdate, LogEntryStore, QueueEntry};
pub use select::ExecutingEntry;
pub(crate) use select::claim_conflict;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("invalid part name: {0}")]
    PartName(#[from] PartNameError),

    #[error("state machine error: {0}")]
    State(#[from] StateError),

    #[error("mutation error: {0}")]
    Mutation(#[from] MutationError),

    /// The call would race with work already executing; nothing was changed.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("logical error: {0}")]
    LogicalError(String),
}

/// A part being produced right now by an executing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FuturePart {
    pub(crate) info: PartInfo,
    pub(crate) owner: EntryId,
}

/// Everything guarded by the primary lock.
#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub(crate) entries: LogEntryStore,
    pub(crate) future_parts: BTreeMap<String, FuturePart>,
    /// Entries with a live executing handle, including ones already
    /// removed from `entries` while they ran.
    pub(crate) executing: HashSet<EntryId>,
    pub(crate) virtual_parts: ActivePartSet,
    pub(crate) current_inserts: HashMap<String, BTreeSet<i64>>,
    pub(crate) mutations: MutationIndex,
    pub(crate) log_pointer: u64,
}

impl QueueState {
    /// Put an entry in the queue and project its result into the virtual parts.
    pub(crate) fn insert_unlocked(&mut self, entry: QueueEntry) -> InsertTimesUpdate {
        match entry.kind() {
            LogEntryKind::GetPart
            | LogEntryKind::AttachPart { .. }
            | LogEntryKind::MergeParts { .. }
            | LogEntryKind::MutatePart { .. }
            | LogEntryKind::DropRange { .. } => {
                self.virtual_parts.add_info(entry.result_part().clone());
            }
            LogEntryKind::ReplaceRange { .. } => {
                for part in entry.produced_parts() {
                    self.virtual_parts.add_info(part.clone());
                }
            }
            // Clearing a column leaves the set of parts unchanged.
            LogEntryKind::ClearColumn { .. } => {}
        }
        self.entries.push(entry)
    }
}

/// Counters and oldest items in the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub future_parts: usize,
    pub queue_size: usize,
    pub inserts_in_queue: usize,
    pub merges_in_queue: usize,
    pub mutations_in_queue: usize,
    pub queue_oldest_time: Timestamp,
    pub inserts_oldest_time: Timestamp,
    pub merges_oldest_time: Timestamp,
    pub mutations_oldest_time: Timestamp,
    pub oldest_part_to_get: String,
    pub oldest_part_to_merge_to: String,
    pub oldest_part_to_mutate_to: String,
    pub last_queue_update: Timestamp,
}

pub(crate) fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Keep the oldest non-zero time, and the part name that came with it.
fn track_oldest(oldest: &mut Timestamp, oldest_part: Option<&mut String>, entry: &LogEntryData) {
    if entry.create_time != 0 && (*oldest == 0 || entry.create_time < *oldest) {
        *oldest = entry.create_time;
        if let Some(part) = oldest_part {
            part.clone_from(&entry.new_part_name);
        }
    }
}

pub struct ReplicationQueue {
    config: QueueConfig,
    rules: DispatchRules,
    state: Mutex<QueueState>,
    /// Signalled whenever an executing handle is released.
    execution_complete: Condvar,
    pull_logs_lock: Mutex<()>,
    update_mutations_lock: Mutex<()>,
}

impl ReplicationQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_rules(config, DispatchRules::standard())
    }

    pub fn with_rules(config: QueueConfig, rules: DispatchRules) -> Self {
        Self {
            config,
            rules,
            state: Mutex::new(QueueState::default()),
            execution_complete: Condvar::new(),
            pull_logs_lock: Mutex::new(()),
            update_mutations_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a locally originated repair action at the tail of the queue.
    ///
    /// The caller is responsible for creating the node `znode_name` in the
    /// coordinator queue.
    pub fn insert(
        &self,
        coordinator: &dyn Coordinator,
        znode_name: &str,
        data: LogEntryData,
    ) -> Result<EntryId, QueueError> {
        let entry = QueueEntry::new(data, znode_name)?;
        let id = entry.id();
        let update = {
            let mut state = self.state.lock();
            let update = state.insert_unlocked(entry);
            state.entries.touch(unix_now());
            update
        };
        tracing::debug!(logger = %self.config.logger_name, znode = znode_name, "inserted local entry");
        self.update_times_in_coordinator(coordinator, update);
        Ok(id)
    }

    /// Remove the first entry producing exactly `part_name`, locally and in
    /// the coordinator. Used for actions on parts that were lost for good.
    pub fn remove(&self, coordinator: &dyn Coordinator, part_name: &str) -> Result<bool, QueueError> {
        let removed = {
            let mut state = self.state.lock();
            let found = state
                .entries
                .iter()
                .find(|entry| entry.data().new_part_name == part_name)
                .map(QueueEntry::id);
            found.and_then(|id| state.entries.remove(id))
        };

        let Some((entry, update)) = removed else {
            return Ok(false);
        };
        tracing::info!(
            logger = %self.config.logger_name,
            part = part_name,
            znode = entry.znode_name(),
            "removed queue entry"
        );
        self.update_times_in_coordinator(coordinator, update);
        self.remove_queue_node(coordinator, entry.znode_name())?;
        Ok(true)
    }

    /// Number of merges and single-part mutations in the queue.
    pub fn count_merges_and_part_mutations(&self) -> usize {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|entry| {
                matches!(
                    entry.kind(),
                    LogEntryKind::MergeParts { .. } | LogEntryKind::MutatePart { .. }
                )
            })
            .count()
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.state.lock();
        let mut status = QueueStatus {
            future_parts: state.future_parts.len(),
            queue_size: state.entries.len(),
            last_queue_update: state.entries.last_queue_update(),
            ..QueueStatus::default()
        };

        for entry in state.entries.iter() {
            let data = entry.data();
            track_oldest(&mut status.queue_oldest_time, None, data);
            match entry.kind() {
                LogEntryKind::GetPart => {
                    status.inserts_in_queue += 1;
                    track_oldest(
                        &mut status.inserts_oldest_time,
                        Some(&mut status.oldest_part_to_get),
                        data,
                    );
                }
                LogEntryKind::MergeParts { .. } => {
                    status.merges_in_queue += 1;
                    track_oldest(
                        &mut status.merges_oldest_time,
                        Some(&mut status.oldest_part_to_merge_to),
                        data,
                    );
                }
                LogEntryKind::MutatePart { .. } => {
                    status.mutations_in_queue += 1;
                    track_oldest(
                        &mut status.mutations_oldest_time,
                        Some(&mut status.oldest_part_to_mutate_to),
                        data,
                    );
                }
                LogEntryKind::AttachPart { .. }
                | LogEntryKind::DropRange { .. }
                | LogEntryKind::ClearColumn { .. }
                | LogEntryKind::ReplaceRange { .. } => {}
            }
        }
        status
    }

    /// Snapshot of every queued entry, in queue order.
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let state = self.state.lock();
        state.entries.iter().map(QueueEntry::snapshot).collect()
    }

    pub fn insert_times(&self) -> InsertTimes {
        self.state.lock().entries.insert_times()
    }

    /// Names of the parts being produced right now.
    pub fn future_parts(&self) -> Vec<String> {
        self.state.lock().future_parts.keys().cloned().collect()
    }

    /// Parts that will be active once the queue drains.
    pub fn virtual_parts(&self) -> Vec<String> {
        let state = self.state.lock();
        state.virtual_parts.names().map(str::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn log_pointer(&self) -> u64 {
        self.state.lock().log_pointer
    }

    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutations.len()
    }

    fn remove_queue_node(&self, coordinator: &dyn Coordinator, znode_name: &str) -> Result<(), QueueError> {
        if znode_name.is_empty() {
            return Ok(());
        }
        let path = format!("{}/{}", self.config.queue_dir(), znode_name);
        if !coordinator.try_remove(&path)? {
            tracing::info!(path = %path, "queue node was already removed");
        }
        Ok(())
    }

    /// Persist watermark changes. Failures only delay the lag metric, so
    /// they are logged rather than returned.
    fn update_times_in_coordinator(&self, coordinator: &dyn Coordinator, update: InsertTimesUpdate) {
        if update.is_empty() {
            return;
        }
        let mut ops = Vec::with_capacity(2);
        if let Some(min) = update.min_unprocessed {
            ops.push(WriteOp::Set {
                path: self.config.min_unprocessed_insert_time_path(),
                data: min.to_string(),
            });
        }
        if let Some(max) = update.max_processed {
            ops.push(WriteOp::Set {
                path: self.config.max_processed_insert_time_path(),
                data: max.to_string(),
            });
        }
        if let Err(err) = coordinator.multi(&ops) {
            tracing::warn!(error = %err, "failed to persist insert times");
        }
    }
}

impl std::fmt::Debug for ReplicationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationQueue")
            .field("config", &self.config)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

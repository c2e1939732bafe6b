// Log Entry Store
//
// The replica's in-memory queue: entries in offering order, plus a
// create-time index over fetch entries that drives the replication lag
// watermarks.

use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use crate::log::{EntryId, LogEntryData, LogEntryKind, Timestamp};
use crate::parts::{PartInfo, PartNameError};
use crate::state::{ExecutionEvent, ExecutionState, StateError};

/// An entry held in the queue together with its execution bookkeeping.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub(crate) id: EntryId,
    pub(crate) data: Arc<LogEntryData>,
    /// Parsed `data.produced_parts()`; the first element is the result part.
    pub(crate) produced: Vec<PartInfo>,
    /// Name of the node in the replica's coordinator queue.
    pub(crate) znode_name: String,
    /// Name of the shared log node this entry was copied from, if any.
    pub(crate) log_node_name: Option<String>,
    pub(crate) state: ExecutionState,
    pub(crate) num_tries: u32,
    pub(crate) num_postponed: u32,
    pub(crate) postpone_reason: String,
    pub(crate) last_attempt_time: Timestamp,
    pub(crate) last_postpone_time: Timestamp,
    pub(crate) exception: Option<String>,
    pub(crate) actual_new_part_name: Option<String>,
}

impl QueueEntry {
    pub fn new(data: LogEntryData, znode_name: impl Into<String>) -> Result<Self, PartNameError> {
        let produced = data.produced_part_infos()?;
        Ok(Self {
            id: EntryId::new(),
            data: Arc::new(data),
            produced,
            znode_name: znode_name.into(),
            log_node_name: None,
            state: ExecutionState::Queued,
            num_tries: 0,
            num_postponed: 0,
            postpone_reason: String::new(),
            last_attempt_time: 0,
            last_postpone_time: 0,
            exception: None,
            actual_new_part_name: None,
        })
    }

    pub fn with_log_node(mut self, log_node_name: impl Into<String>) -> Self {
        self.log_node_name = Some(log_node_name.into());
        self
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn data(&self) -> &LogEntryData {
        &self.data
    }

    pub fn kind(&self) -> &LogEntryKind {
        &self.data.kind
    }

    pub fn znode_name(&self) -> &str {
        &self.znode_name
    }

    /// Parsed `new_part_name`.
    pub fn result_part(&self) -> &PartInfo {
        // `produced` always starts with `new_part_name`.
        &self.produced[0]
    }

    pub fn produced_parts(&self) -> &[PartInfo] {
        &self.produced
    }

    pub fn is_executing(&self) -> bool {
        self.state.is_executing()
    }

    pub(crate) fn transition(&mut self, event: ExecutionEvent) -> Result<(), StateError> {
        self.state = self.state.apply(event)?;
        Ok(())
    }

    pub(crate) fn record_postpone(&mut self, reason: String, now: Timestamp) {
        self.num_postponed += 1;
        self.last_postpone_time = now;
        self.postpone_reason = reason;
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            znode_name: self.znode_name.clone(),
            type_name: self.data.kind.type_name(),
            data: (*self.data).clone(),
            currently_executing: self.is_executing(),
            num_tries: self.num_tries,
            num_postponed: self.num_postponed,
            postpone_reason: self.postpone_reason.clone(),
            last_attempt_time: self.last_attempt_time,
            last_postpone_time: self.last_postpone_time,
            exception: self.exception.clone(),
            actual_new_part_name: self.actual_new_part_name.clone(),
        }
    }
}

/// Point-in-time copy of an entry for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySnapshot {
    pub znode_name: String,
    pub type_name: &'static str,
    pub data: LogEntryData,
    pub currently_executing: bool,
    pub num_tries: u32,
    pub num_postponed: u32,
    pub postpone_reason: String,
    pub last_attempt_time: Timestamp,
    pub last_postpone_time: Timestamp,
    pub exception: Option<String>,
    pub actual_new_part_name: Option<String>,
}

/// Watermark changes that should be persisted to the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertTimesUpdate {
    pub min_unprocessed: Option<Timestamp>,
    pub max_processed: Option<Timestamp>,
}

impl InsertTimesUpdate {
    pub fn is_empty(&self) -> bool {
        self.min_unprocessed.is_none() && self.max_processed.is_none()
    }

    /// Fold a later update into this one; the later value wins.
    pub fn merge(&mut self, later: InsertTimesUpdate) {
        if later.min_unprocessed.is_some() {
            self.min_unprocessed = later.min_unprocessed;
        }
        if later.max_processed.is_some() {
            self.max_processed = later.max_processed;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertTimes {
    /// Oldest create time of a fetch still in the queue; 0 if none.
    pub min_unprocessed_insert_time: Timestamp,
    /// Newest create time of a fetch already processed.
    pub max_processed_insert_time: Timestamp,
}

#[derive(Debug, Default)]
pub struct LogEntryStore {
    queue: VecDeque<QueueEntry>,
    inserts_by_time: BTreeSet<(Timestamp, EntryId)>,
    min_unprocessed_insert_time: Timestamp,
    max_processed_insert_time: Timestamp,
    last_queue_update: Timestamp,
}

impl LogEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Drop ranges go to the head so parts they delete are
    /// not fetched first; everything else goes to the tail.
    pub fn push(&mut self, entry: QueueEntry) -> InsertTimesUpdate {
        let mut update = InsertTimesUpdate::default();
        if entry.data.is_insert() {
            let create_time = entry.data.create_time;
            self.inserts_by_time.insert((create_time, entry.id));
            if create_time != 0
                && (self.min_unprocessed_insert_time == 0
                    || create_time < self.min_unprocessed_insert_time)
            {
                self.min_unprocessed_insert_time = create_time;
                update.min_unprocessed = Some(create_time);
            }
        }

        if matches!(entry.data.kind, LogEntryKind::DropRange { .. }) {
            self.queue.push_front(entry);
        } else {
            self.queue.push_back(entry);
        }
        update
    }

    /// Bulk append of entries copied from the shared log.
    pub fn append<I>(&mut self, entries: I, now: Timestamp) -> InsertTimesUpdate
    where
        I: IntoIterator<Item = QueueEntry>,
    {
        let mut update = InsertTimesUpdate::default();
        for entry in entries {
            update.merge(self.push(entry));
        }
        self.last_queue_update = now;
        update
    }

    pub fn remove(&mut self, id: EntryId) -> Option<(QueueEntry, InsertTimesUpdate)> {
        // Selected entries sit at the tail, so search from there.
        let position = self.queue.iter().rposition(|entry| entry.id == id)?;
        let entry = self.queue.remove(position)?;
        let update = self.update_times_on_removal(&entry);
        Some((entry, update))
    }

    /// Remove every entry matching `predicate`, preserving the order of the rest.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> (Vec<QueueEntry>, InsertTimesUpdate)
    where
        F: FnMut(&QueueEntry) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for entry in self.queue.drain(..) {
            if predicate(&entry) {
                removed.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.queue = kept;

        let mut update = InsertTimesUpdate::default();
        for entry in &removed {
            update.merge(self.update_times_on_removal(entry));
        }
        (removed, update)
    }

    /// Remove every part-producing entry whose result lies inside `range`.
    pub fn remove_by_resulting_part(
        &mut self,
        range: &PartInfo,
    ) -> (Vec<QueueEntry>, InsertTimesUpdate) {
        // A column clear rewrites the parts it spans, so it goes with them.
        self.remove_where(|entry| {
            let producing = entry.kind().produces_part()
                || matches!(entry.kind(), LogEntryKind::ClearColumn { .. });
            producing && range.contains(entry.result_part())
        })
    }

    pub fn move_to_back(&mut self, id: EntryId) -> bool {
        let Some(position) = self.queue.iter().position(|entry| entry.id == id) else {
            return false;
        };
        match self.queue.remove(position) {
            Some(entry) => {
                self.queue.push_back(entry);
                true
            }
            None => false,
        }
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut QueueEntry> {
        self.queue.iter_mut().find(|entry| entry.id == id)
    }

    pub fn at(&self, index: usize) -> Option<&QueueEntry> {
        self.queue.get(index)
    }

    pub fn at_mut(&mut self, index: usize) -> Option<&mut QueueEntry> {
        self.queue.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains_znode(&self, znode_name: &str) -> bool {
        self.queue.iter().any(|entry| entry.znode_name == znode_name)
    }

    pub fn contains_log_node(&self, log_node_name: &str) -> bool {
        self.queue
            .iter()
            .any(|entry| entry.log_node_name.as_deref() == Some(log_node_name))
    }

    pub fn insert_times(&self) -> InsertTimes {
        InsertTimes {
            min_unprocessed_insert_time: self.min_unprocessed_insert_time,
            max_processed_insert_time: self.max_processed_insert_time,
        }
    }

    pub fn last_queue_update(&self) -> Timestamp {
        self.last_queue_update
    }

    pub(crate) fn touch(&mut self, now: Timestamp) {
        self.last_queue_update = now;
    }

    fn update_times_on_removal(&mut self, entry: &QueueEntry) -> InsertTimesUpdate {
        let mut update = InsertTimesUpdate::default();
        if !entry.data.is_insert() {
            return update;
        }

        self.inserts_by_time.remove(&(entry.data.create_time, entry.id));

        match self.inserts_by_time.first() {
            None => {
                self.min_unprocessed_insert_time = 0;
                update.min_unprocessed = Some(0);
            }
            Some(&(oldest, _)) if oldest > self.min_unprocessed_insert_time => {
                self.min_unprocessed_insert_time = oldest;
                update.min_unprocessed = Some(oldest);
            }
            Some(_) => {}
        }

        if entry.data.create_time > self.max_processed_insert_time {
            self.max_processed_insert_time = entry.data.create_time;
            update.max_processed = Some(entry.data.create_time);
        }
        update
    }
}

// Entry Selection
//
// Picks the next runnable entry and hands it out wrapped in an
// `ExecutingEntry`. The handle owns the entry's future-part marks; they are
// released on every exit path, and only a successful completion removes
// the entry from the queue.

use std::fmt;
use std::sync::Arc;

use crate::log::{Coordinator, EntryId, LogEntryData, LogEntryKind};
use crate::parts::PartInfo;
use crate::rules::{DispatchContext, Eligibility, ExecutionGate};
use crate::state::ExecutionEvent;

use super::{unix_now, FuturePart, InsertTimesUpdate, QueueEntry, QueueError, QueueState, ReplicationQueue};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Released,
    Succeeded,
    Failed(String),
}

/// Marks a queue entry as running.
///
/// Only `ReplicationQueue::select_entry_to_process` creates these. Dropping
/// the handle without calling `complete` or `fail` returns the entry to the
/// queue untouched.
pub struct ExecutingEntry<'q> {
    queue: &'q ReplicationQueue,
    id: EntryId,
    data: Arc<LogEntryData>,
    znode_name: String,
    tagged: Vec<String>,
    /// Part the action actually produces, when it differs from the planned one.
    actual_part: Option<PartInfo>,
    actual_tagged: Option<String>,
    outcome: Outcome,
    finished: bool,
}

impl<'q> ExecutingEntry<'q> {
    /// Called under the primary lock with the entry already picked.
    fn acquire(
        queue: &'q ReplicationQueue,
        state: &mut QueueState,
        id: EntryId,
    ) -> Result<Self, QueueError> {
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| QueueError::LogicalError("selected entry vanished from the queue".into()))?;
        entry.transition(ExecutionEvent::Selected)?;
        entry.num_tries += 1;
        entry.last_attempt_time = unix_now();

        let data = Arc::clone(&entry.data);
        let znode_name = entry.znode_name.clone();
        let produced = entry.produced.clone();

        let mut tagged: Vec<String> = Vec::with_capacity(produced.len());
        for info in produced {
            let name = info.part_name();
            if state.future_parts.contains_key(&name) {
                for name in &tagged {
                    state.future_parts.remove(name);
                }
                if let Some(entry) = state.entries.get_mut(id) {
                    entry.transition(ExecutionEvent::Released)?;
                }
                return Err(QueueError::LogicalError(format!(
                    "Tagging already tagged future part {name}. This is a bug."
                )));
            }
            state.future_parts.insert(name.clone(), FuturePart { info, owner: id });
            tagged.push(name);
        }
        state.executing.insert(id);

        Ok(Self {
            queue,
            id,
            data,
            znode_name,
            tagged,
            actual_part: None,
            actual_tagged: None,
            outcome: Outcome::Released,
            finished: false,
        })
    }

    pub fn entry(&self) -> &LogEntryData {
        &self.data
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn znode_name(&self) -> &str {
        &self.znode_name
    }

    pub fn actual_part_name(&self) -> Option<String> {
        self.actual_part.as_ref().map(PartInfo::part_name)
    }

    /// The action succeeded: drop the entry from the queue and the coordinator.
    pub fn complete(mut self, coordinator: &dyn Coordinator) -> Result<(), QueueError> {
        self.outcome = Outcome::Succeeded;
        let Some((entry, update)) = self.finish() else {
            return Ok(());
        };
        self.queue.update_times_in_coordinator(coordinator, update);
        self.queue.remove_queue_node(coordinator, entry.znode_name())
    }

    /// The action failed: the entry goes back to the queue with `reason` recorded.
    pub fn fail(mut self, reason: impl Into<String>) {
        self.outcome = Outcome::Failed(reason.into());
        self.finish();
    }

    /// Run `func` on the entry and report its outcome.
    ///
    /// `Ok(true)` completes the entry, `Ok(false)` leaves it queued without
    /// recording a failure, `Err` records the error on the entry. Returns
    /// `false` if an error occurred.
    pub fn process<F, E>(self, coordinator: &dyn Coordinator, func: F) -> bool
    where
        F: FnOnce(&LogEntryData) -> Result<bool, E>,
        E: fmt::Display,
    {
        match func(self.entry()) {
            Ok(true) => match self.complete(coordinator) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to remove processed entry");
                    false
                }
            },
            Ok(false) => true,
            Err(err) => {
                let reason = err.to_string();
                tracing::info!(part = %self.data.new_part_name, error = %reason, "log entry failed");
                self.fail(reason);
                false
            }
        }
    }

    /// Release the marks and apply the outcome. Runs at most once.
    fn finish(&mut self) -> Option<(QueueEntry, InsertTimesUpdate)> {
        if self.finished {
            return None;
        }
        self.finished = true;

        let mut state = self.queue.state.lock();
        for name in self.tagged.iter().chain(self.actual_tagged.iter()) {
            if state.future_parts.remove(name).is_none() {
                tracing::error!(part = %name, "Untagging already untagged future part. This is a bug.");
            }
        }
        state.executing.remove(&self.id);

        let outcome = std::mem::replace(&mut self.outcome, Outcome::Released);
        let mut removed = None;
        if let Some(entry) = state.entries.get_mut(self.id) {
            entry.actual_new_part_name = None;
            let event = match &outcome {
                Outcome::Succeeded => ExecutionEvent::Succeeded,
                Outcome::Failed(_) => ExecutionEvent::Failed,
                Outcome::Released => ExecutionEvent::Released,
            };
            if let Err(err) = entry.transition(event) {
                tracing::error!(error = %err, "executing entry in unexpected state");
            }
            if let Outcome::Failed(reason) = &outcome {
                entry.record_postpone(reason.clone(), unix_now());
                entry.exception = Some(reason.clone());
            }
        }

        if outcome == Outcome::Succeeded {
            fold_result(&mut state, &self.data, self.actual_part.take());
            removed = state.entries.remove(self.id);
        }
        drop(state);

        self.queue.execution_complete.notify_all();
        removed
    }
}

impl Drop for ExecutingEntry<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for ExecutingEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutingEntry")
            .field("id", &self.id)
            .field("entry", &self.data)
            .field("tagged", &self.tagged)
            .finish_non_exhaustive()
    }
}

/// Project a finished entry's result into the virtual parts.
fn fold_result(state: &mut QueueState, data: &LogEntryData, actual: Option<PartInfo>) {
    if data.kind.produces_part() {
        if let Some(actual) = actual {
            state.virtual_parts.add_info(actual);
        }
    } else if let LogEntryKind::ReplaceRange { new_part_names, .. } = &data.kind {
        for name in new_part_names {
            if let Ok(info) = PartInfo::from_part_name(name) {
                state.virtual_parts.add_info(info);
            }
        }
    }
}

/// Why `future` blocks a new claim on `part`, if it does.
pub(crate) fn claim_conflict(part: &PartInfo, future: &PartInfo) -> Option<&'static str> {
    if future == part {
        Some("another log entry for the same part is being processed")
    } else if future.contains(part) {
        Some("it is covered by a part that is executing right now")
    } else if part.contains(future) {
        Some("it covers a part that is executing right now")
    } else if future.intersects(part) {
        Some("it intersects a part that is executing right now")
    } else {
        None
    }
}

impl ReplicationQueue {
    /// Pick the oldest entry that may run now and mark it executing.
    ///
    /// Entries that may not run are skipped (their postpone counters are
    /// bumped) so one blocked entry never stalls the ones behind it. The
    /// chosen entry moves to the tail, so a failure retries it after the rest.
    pub fn select_entry_to_process(&self, gate: &dyn ExecutionGate) -> Option<ExecutingEntry<'_>> {
        let mut state = self.state.lock();
        let now = unix_now();

        let mut selected = None;
        for index in 0..state.entries.len() {
            let verdict = {
                let Some(entry) = state.entries.at(index) else {
                    break;
                };
                if entry.is_executing() {
                    continue;
                }
                let ctx = DispatchContext::new(&state, gate);
                (entry.id(), self.rules.evaluate(entry, &ctx))
            };

            match verdict {
                (id, Eligibility::Ready) => {
                    selected = Some(id);
                    break;
                }
                (_, Eligibility::Postpone(reason)) => {
                    tracing::debug!(logger = %self.config.logger_name, reason = %reason, "postponing log entry");
                    if let Some(entry) = state.entries.at_mut(index) {
                        entry.record_postpone(reason, now);
                    }
                }
            }
        }

        let id = selected?;
        state.entries.move_to_back(id);
        match ExecutingEntry::acquire(self, &mut state, id) {
            Ok(executing) => Some(executing),
            Err(err) => {
                tracing::error!(error = %err, "failed to mark entry as executing");
                None
            }
        }
    }

    /// Claim `part_name` for an executing entry that turned out to produce a
    /// different (usually covering) part than planned, e.g. a fetch that
    /// found a merged part on another replica.
    pub fn add_future_part_if_not_covered(
        &self,
        part_name: &str,
        executing: &mut ExecutingEntry<'_>,
    ) -> Result<Eligibility, QueueError> {
        let info = PartInfo::from_part_name(part_name)?;
        let mut state = self.state.lock();

        for (future_name, future) in &state.future_parts {
            if future.owner == executing.id {
                continue;
            }
            if let Some(relation) = claim_conflict(&info, &future.info) {
                return Ok(Eligibility::Postpone(format!(
                    "Not executing log entry for part {part_name} because {relation} ({future_name})."
                )));
            }
        }

        if executing.actual_part.is_some() {
            return Err(QueueError::LogicalError(
                "Entry actual part isn't empty yet. This is a bug.".into(),
            ));
        }

        let name = info.part_name();
        if !executing.tagged.contains(&name) {
            if state.future_parts.contains_key(&name) {
                return Err(QueueError::LogicalError(format!(
                    "Attaching already existing future part {name}. This is a bug."
                )));
            }
            state.future_parts.insert(
                name.clone(),
                FuturePart {
                    info: info.clone(),
                    owner: executing.id,
                },
            );
            executing.actual_tagged = Some(name.clone());
        }
        if let Some(entry) = state.entries.get_mut(executing.id) {
            entry.actual_new_part_name = Some(name);
        }
        executing.actual_part = Some(info);
        Ok(Eligibility::Ready)
    }
}

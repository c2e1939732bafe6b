// Range Operations
//
// Checks and edits that concern a block range rather than a single queued
// entry: merge and mutation planning, disabled ranges, and clearing the
// queue ahead of a range being dropped.

use std::collections::BTreeSet;

use crate::log::{Coordinator, EntryId, LogEntryData, LogEntryKind};
use crate::mutations::{MutationCommand, MutationError};
use crate::parts::{DisableScope, PartInfo, MAX_LEVEL};
use crate::rules::{describe_conflicts, range_conflicts, Eligibility};

use super::{EntrySnapshot, QueueError, QueueState, ReplicationQueue};

impl ReplicationQueue {
    /// Whether two parts may be merged into one right now.
    ///
    /// Checked before a new merge is assigned. The parts may be given in
    /// either order.
    pub fn can_merge_parts(&self, left: &PartInfo, right: &PartInfo) -> Eligibility {
        let state = self.state.lock();
        check_merge(&state, left, right)
    }

    /// Target mutation version for `part`, if a mutation should be assigned to it.
    pub fn can_mutate_part(&self, part: &PartInfo) -> Option<i64> {
        let state = self.state.lock();
        let name = part.part_name();
        if state.virtual_parts.containing_part(part) != Some(name.as_str()) {
            return None;
        }
        if state
            .virtual_parts
            .disabled_range_intersecting(part, DisableScope::Merges)
            .is_some()
        {
            return None;
        }
        let desired = state.mutations.max_version(&part.partition_id)?;
        (desired > part.data_version()).then_some(desired)
    }

    pub fn first_unapplied_mutation_version(&self, part: &PartInfo) -> Option<i64> {
        self.state.lock().mutations.first_unapplied_version(part)
    }

    /// Commands bringing `part` up to mutation `version`.
    ///
    /// `NotFound` means the version is no longer known locally; callers
    /// treat it as already applied.
    pub fn get_mutation_commands(
        &self,
        part: &PartInfo,
        version: i64,
    ) -> Result<Vec<MutationCommand>, MutationError> {
        self.state.lock().mutations.commands_for(part, version)
    }

    /// Forbid assigning merges that would touch `part_name` until re-enabled.
    pub fn disable_merges_in_range(&self, part_name: &str) -> Result<(), QueueError> {
        let range = PartInfo::from_part_name(part_name)?;
        tracing::debug!(logger = %self.config.logger_name, range = part_name, "disabling merges in range");
        self.state
            .lock()
            .virtual_parts
            .disable_range(range, DisableScope::Merges);
        Ok(())
    }

    /// Drop a disabled range installed by `disable_merges_in_range` or
    /// `disable_merges_and_fetches_in_range`. Returns whether it was present.
    pub fn enable_merges_in_range(&self, part_name: &str) -> Result<bool, QueueError> {
        let range = PartInfo::from_part_name(part_name)?;
        Ok(self.state.lock().virtual_parts.enable_range(&range))
    }

    /// Forbid merges and fetches inside the range of `entry`.
    ///
    /// Fails with `Conflict`, changing nothing, while anything inside the
    /// range is executing. The caller retries later.
    pub fn disable_merges_and_fetches_in_range(&self, entry: &LogEntryData) -> Result<(), QueueError> {
        let range = PartInfo::from_part_name(&entry.new_part_name)?;
        let mut state = self.state.lock();

        let conflicts = range_conflicts(entry, &range, state.entries.iter(), |other| {
            other.data() == entry
        });
        if !conflicts.is_empty() {
            let znode = znode_for(&state, entry);
            return Err(QueueError::Conflict(describe_conflicts(entry, &znode, &conflicts)));
        }

        state
            .virtual_parts
            .disable_range(range, DisableScope::MergesAndFetches);
        Ok(())
    }

    /// Executing entries that block clearing a column over the range of
    /// `entry`, with a description of them. Never waits.
    pub fn conflicts_for_clear_column(
        &self,
        entry: &LogEntryData,
    ) -> Result<(Vec<EntrySnapshot>, String), QueueError> {
        let range = PartInfo::from_part_name(&entry.new_part_name)?;
        let state = self.state.lock();

        let conflicts = range_conflicts(entry, &range, state.entries.iter(), |other| {
            other.data() == entry
        });
        let znode = znode_for(&state, entry);
        let description = describe_conflicts(entry, &znode, &conflicts);
        let snapshots = conflicts.into_iter().map(|c| c.snapshot()).collect();
        Ok((snapshots, description))
    }

    /// Remove every queued entry producing a part inside `part_name`, both
    /// locally and from the coordinator.
    ///
    /// Waits for removed entries that are executing right now to finish,
    /// so nothing inside the range is still being produced on return.
    pub fn remove_part_producing_ops_in_range(
        &self,
        coordinator: &dyn Coordinator,
        part_name: &str,
    ) -> Result<usize, QueueError> {
        let range = PartInfo::from_part_name(part_name)?;
        let (removed, update, in_flight) = {
            let mut state = self.state.lock();
            let (removed, update) = state.entries.remove_by_resulting_part(&range);
            let in_flight: Vec<EntryId> = removed
                .iter()
                .filter(|entry| entry.is_executing())
                .map(|entry| entry.id())
                .collect();
            (removed, update, in_flight)
        };

        let mut first_error: Option<QueueError> = None;
        for entry in &removed {
            if let Err(err) = self.remove_queue_node(coordinator, entry.znode_name()) {
                tracing::info!(
                    logger = %self.config.logger_name,
                    znode = entry.znode_name(),
                    error = %err,
                    "couldn't remove queue node"
                );
                first_error.get_or_insert(err);
            }
        }
        self.update_times_in_coordinator(coordinator, update);

        tracing::debug!(
            logger = %self.config.logger_name,
            range = part_name,
            removed = removed.len(),
            waiting = in_flight.len(),
            "removed entries producing parts in range"
        );

        if !in_flight.is_empty() {
            let mut state = self.state.lock();
            while in_flight.iter().any(|id| state.executing.contains(id)) {
                self.execution_complete.wait(&mut state);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(removed.len()),
        }
    }

    /// Push fetches and merges of the siblings of `part_name` to the tail.
    ///
    /// Finds the queued merge that takes `part_name` as a source and moves
    /// every entry producing one of that merge's sources behind the rest,
    /// so fetching the merged result is tried first. Returns the merge's
    /// source parts, or an empty set if no queued merge uses `part_name`.
    pub fn move_sibling_parts_for_merge_to_end_of_queue(&self, part_name: &str) -> BTreeSet<String> {
        let mut state = self.state.lock();

        let parts_for_merge: BTreeSet<String> = state
            .entries
            .iter()
            .find_map(|entry| match entry.kind() {
                LogEntryKind::MergeParts { source_parts, .. }
                    if source_parts.iter().any(|source| source == part_name) =>
                {
                    Some(source_parts.iter().cloned().collect())
                }
                _ => None,
            })
            .unwrap_or_default();
        if parts_for_merge.is_empty() {
            return parts_for_merge;
        }

        let siblings: Vec<EntryId> = state
            .entries
            .iter()
            .filter(|entry| match entry.kind() {
                LogEntryKind::GetPart | LogEntryKind::MergeParts { .. } => {
                    parts_for_merge.contains(&entry.data().new_part_name)
                }
                LogEntryKind::AttachPart { .. }
                | LogEntryKind::MutatePart { .. }
                | LogEntryKind::DropRange { .. }
                | LogEntryKind::ClearColumn { .. }
                | LogEntryKind::ReplaceRange { .. } => false,
            })
            .map(|entry| entry.id())
            .collect();
        for id in siblings {
            state.entries.move_to_back(id);
        }
        parts_for_merge
    }
}

fn check_merge(state: &QueueState, left: &PartInfo, right: &PartInfo) -> Eligibility {
    let (left, right) = if left.min_block <= right.min_block {
        (left, right)
    } else {
        (right, left)
    };

    if left.partition_id != right.partition_id {
        return Eligibility::Postpone(format!(
            "Parts {left} and {right} belong to different partitions"
        ));
    }
    if left.max_block >= right.min_block {
        return Eligibility::Postpone(format!("Parts {left} and {right} intersect"));
    }

    let span = PartInfo::new(left.partition_id.clone(), left.min_block, right.max_block, MAX_LEVEL);
    if let Some(disabled) = state
        .virtual_parts
        .disabled_range_intersecting(&span, DisableScope::Merges)
    {
        return Eligibility::Postpone(format!(
            "Merges are disabled in range {} covering parts {left} and {right}",
            disabled.range
        ));
    }

    for part in [left, right] {
        let name = part.part_name();
        match state.virtual_parts.containing_part(part) {
            Some(containing) if containing == name => {}
            Some(containing) => {
                return Eligibility::Postpone(format!(
                    "Part {name} has already been assigned a merge into {containing}"
                ));
            }
            None => {
                return Eligibility::Postpone(format!(
                    "Entry for part {name} hasn't been read from the replication log yet"
                ));
            }
        }
    }

    if left.max_block + 1 < right.min_block {
        let gap = PartInfo::new(
            left.partition_id.clone(),
            left.max_block + 1,
            right.min_block - 1,
            MAX_LEVEL,
        );
        if let Some(between) = state.virtual_parts.intersecting(&gap).next() {
            return Eligibility::Postpone(format!(
                "Block range for parts {left} and {right} is not continuous: part {between} lies between them"
            ));
        }
        if let Some(block) = state
            .current_inserts
            .get(&left.partition_id)
            .and_then(|blocks| blocks.range(gap.min_block..=gap.max_block).next())
        {
            return Eligibility::Postpone(format!(
                "Block number {block} is still being inserted between parts {left} and {right}"
            ));
        }
    }

    let left_version = state.mutations.current_version(left).unwrap_or(0);
    let right_version = state.mutations.current_version(right).unwrap_or(0);
    if left_version != right_version {
        return Eligibility::Postpone(format!(
            "Current mutation versions of parts {left} and {right} differ: {left_version} and {right_version} respectively"
        ));
    }

    Eligibility::Ready
}

fn znode_for(state: &QueueState, entry: &LogEntryData) -> String {
    state
        .entries
        .iter()
        .find(|queued| queued.data() == entry)
        .map(|queued| queued.znode_name().to_string())
        .unwrap_or_else(|| entry.new_part_name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::log::InMemoryCoordinator;
    use crate::mutations::MutationEntry;
    use crate::rules::NeverSuspended;

    fn part(name: &str) -> PartInfo {
        PartInfo::from_part_name(name).unwrap()
    }

    fn setup(parts: &[&str]) -> (ReplicationQueue, InMemoryCoordinator) {
        let queue = ReplicationQueue::new(QueueConfig::for_paths("/t", "/t/replicas/r1"));
        let zk = InMemoryCoordinator::new();
        queue.initialize(&zk, parts.iter().copied()).unwrap();
        (queue, zk)
    }

    fn push(queue: &ReplicationQueue, zk: &InMemoryCoordinator, data: LogEntryData) {
        let znode = format!("queue-{:010}", queue.len());
        queue.insert(zk, &znode, data).unwrap();
    }

    #[test]
    fn disabled_range_blocks_merge() {
        let (queue, _zk) = setup(&["p_0_5_1", "p_6_10_1"]);
        assert!(queue.can_merge_parts(&part("p_0_5_1"), &part("p_6_10_1")).is_ready());

        queue.disable_merges_in_range("p_0_10_999999999").unwrap();
        let verdict = queue.can_merge_parts(&part("p_0_5_1"), &part("p_6_10_1"));
        assert!(!verdict.reason().unwrap().is_empty());

        assert!(queue.enable_merges_in_range("p_0_10_999999999").unwrap());
        assert!(queue.can_merge_parts(&part("p_6_10_1"), &part("p_0_5_1")).is_ready());
    }

    #[test]
    fn merge_rejected_for_assigned_or_missing_parts() {
        let (queue, zk) = setup(&["p_1_1_0", "p_2_2_0", "p_3_3_0"]);
        push(&queue, &zk, LogEntryData::merge_parts(["p_1_1_0", "p_2_2_0"], "p_1_2_1"));

        let verdict = queue.can_merge_parts(&part("p_2_2_0"), &part("p_3_3_0"));
        assert!(verdict.reason().unwrap().contains("already been assigned a merge into p_1_2_1"));

        let verdict = queue.can_merge_parts(&part("p_1_2_1"), &part("p_4_4_0"));
        assert!(verdict.reason().unwrap().contains("p_4_4_0"));

        assert!(queue.can_merge_parts(&part("p_1_2_1"), &part("p_3_3_0")).is_ready());
    }

    #[test]
    fn merge_rejected_across_a_gap() {
        let (queue, _zk) = setup(&["p_1_1_0", "p_2_2_0", "p_3_3_0"]);
        let verdict = queue.can_merge_parts(&part("p_1_1_0"), &part("p_3_3_0"));
        assert!(verdict.reason().unwrap().contains("p_2_2_0"));

        let verdict = queue.can_merge_parts(&part("p_1_1_0"), &part("q_2_2_0"));
        assert!(verdict.reason().unwrap().contains("different partitions"));
    }

    #[test]
    fn merge_rejected_when_mutation_versions_differ() {
        let (queue, _zk) = setup(&["p_1_1_0", "p_6_6_0"]);
        queue.state.lock().mutations.add(MutationEntry::new("0000000000", Vec::new()).with_block("p", 5));

        let verdict = queue.can_merge_parts(&part("p_1_1_0"), &part("p_6_6_0"));
        assert!(verdict.reason().unwrap().contains("mutation versions"));
    }

    #[test]
    fn mutation_targets_follow_the_index() {
        let (queue, _zk) = setup(&["p_1_1_0", "p_2_2_0_5", "p_3_4_1"]);
        queue.state.lock().mutations.add(MutationEntry::new("0000000000", Vec::new()).with_block("p", 5));

        let fresh = part("p_1_1_0");
        assert_eq!(queue.first_unapplied_mutation_version(&fresh), Some(5));
        assert_eq!(queue.can_mutate_part(&fresh), Some(5));
        assert!(queue.get_mutation_commands(&fresh, 5).unwrap().is_empty());
        assert!(matches!(
            queue.get_mutation_commands(&fresh, 4),
            Err(MutationError::NotFound { version: 4, .. })
        ));

        let rewritten = part("p_2_2_0_5");
        assert_eq!(queue.first_unapplied_mutation_version(&rewritten), None);
        assert_eq!(queue.can_mutate_part(&rewritten), None);

        queue.disable_merges_in_range("p_3_4_999999999").unwrap();
        assert_eq!(queue.can_mutate_part(&part("p_3_4_1")), None);
        // Not a virtual part of its own any more.
        assert_eq!(queue.can_mutate_part(&part("p_3_3_0")), None);
    }

    #[test]
    fn disabling_range_fails_fast_while_executing() {
        let (queue, zk) = setup(&[]);
        push(&queue, &zk, LogEntryData::get_part("p_3_3_0"));
        let drop_range = LogEntryData::drop_range("p_0_10_999999999");

        let fetch = queue.select_entry_to_process(&NeverSuspended).unwrap();
        let err = queue.disable_merges_and_fetches_in_range(&drop_range).unwrap_err();
        match err {
            QueueError::Conflict(description) => {
                assert!(description.contains("1 currently executing entries"), "{description}");
                assert!(description.contains("GET_PART part p_3_3_0"), "{description}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        fetch.fail("interrupted");

        queue.disable_merges_and_fetches_in_range(&drop_range).unwrap();
        push(&queue, &zk, LogEntryData::get_part("p_4_4_0"));
        let _drop_entry = queue.select_entry_to_process(&NeverSuspended);
        let entries = queue.entries();
        let fetch = entries.iter().find(|e| e.data.new_part_name == "p_4_4_0").unwrap();
        assert!(fetch.postpone_reason.contains("disabled"), "{}", fetch.postpone_reason);
    }

    #[test]
    fn executing_mutation_counts_as_inside_the_range() {
        let (queue, zk) = setup(&["p_3_3_0"]);
        queue.state.lock().mutations.add(MutationEntry::new("0000000000", Vec::new()).with_block("p", 5));
        push(&queue, &zk, LogEntryData::mutate_part("p_3_3_0", "p_3_3_0_5"));
        let mutation = queue.select_entry_to_process(&NeverSuspended).unwrap();

        let drop_range = LogEntryData::drop_range("p_0_10_999999999");
        match queue.disable_merges_and_fetches_in_range(&drop_range) {
            Err(QueueError::Conflict(description)) => {
                assert!(description.contains("MUTATE_PART part p_3_3_0_5"), "{description}");
            }
            other => panic!("unexpected result {other:?}"),
        }

        let clear = LogEntryData::clear_column("c", "p_0_10_999999999");
        let (conflicts, _) = queue.conflicts_for_clear_column(&clear).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].data.new_part_name, "p_3_3_0_5");
        drop(mutation);

        push(&queue, &zk, drop_range);
        assert_eq!(queue.virtual_parts(), vec!["p_0_10_999999999".to_string()]);

        let removed = queue.remove_part_producing_ops_in_range(&zk, "p_0_10_999999999").unwrap();
        assert_eq!(removed, 1);
        let left: Vec<_> = queue.entries().into_iter().map(|e| e.data.new_part_name).collect();
        assert_eq!(left, vec!["p_0_10_999999999".to_string()]);
    }

    #[test]
    fn clear_column_reports_without_waiting() {
        let (queue, zk) = setup(&["p_1_1_0", "p_2_2_0"]);
        push(&queue, &zk, LogEntryData::merge_parts(["p_1_1_0", "p_2_2_0"], "p_1_2_1"));
        push(&queue, &zk, LogEntryData::clear_column("c", "q_0_10_999999999"));
        let clear = LogEntryData::clear_column("c", "p_0_10_999999999");

        let (conflicts, _) = queue.conflicts_for_clear_column(&clear).unwrap();
        assert!(conflicts.is_empty());

        let _merge = queue.select_entry_to_process(&NeverSuspended).unwrap();
        let _other_clear = queue.select_entry_to_process(&NeverSuspended).unwrap();
        let (conflicts, description) = queue.conflicts_for_clear_column(&clear).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].data.new_part_name, "p_1_2_1");
        assert!(description.contains("MERGE_PARTS part p_1_2_1"));
    }

    #[test]
    fn remove_in_range_drops_producers_only() {
        let (queue, zk) = setup(&[]);
        for (n, name) in ["p_1_1_0", "p_2_2_0", "p_20_20_0", "q_1_1_0"].iter().enumerate() {
            let znode = format!("queue-{n:010}");
            zk.put(&format!("/t/replicas/r1/queue/{znode}"), "");
            queue.insert(&zk, &znode, LogEntryData::get_part(*name)).unwrap();
        }

        let removed = queue.remove_part_producing_ops_in_range(&zk, "p_0_10_999999999").unwrap();
        assert_eq!(removed, 2);
        let left: Vec<_> = queue.entries().into_iter().map(|e| e.data.new_part_name).collect();
        assert_eq!(left, vec!["p_20_20_0".to_string(), "q_1_1_0".to_string()]);
        assert!(zk.get_data("/t/replicas/r1/queue/queue-0000000000").unwrap().is_none());
        assert!(zk.get_data("/t/replicas/r1/queue/queue-0000000002").unwrap().is_some());
    }

    #[test]
    fn siblings_move_behind_other_work() {
        let (queue, zk) = setup(&[]);
        push(&queue, &zk, LogEntryData::get_part("p_1_1_0"));
        push(&queue, &zk, LogEntryData::get_part("p_2_2_0"));
        push(&queue, &zk, LogEntryData::get_part("q_1_1_0"));
        push(&queue, &zk, LogEntryData::merge_parts(["p_1_1_0", "p_2_2_0"], "p_1_2_1"));

        let moved = queue.move_sibling_parts_for_merge_to_end_of_queue("p_2_2_0");
        assert_eq!(moved.into_iter().collect::<Vec<_>>(), vec!["p_1_1_0", "p_2_2_0"]);

        let order: Vec<_> = queue.entries().into_iter().map(|e| e.data.new_part_name).collect();
        assert_eq!(order, vec!["q_1_1_0", "p_1_2_1", "p_1_1_0", "p_2_2_0"]);

        assert!(queue.move_sibling_parts_for_merge_to_end_of_queue("q_1_1_0").is_empty());
    }
}

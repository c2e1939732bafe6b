// Built-in dispatch rules.

use crate::log::{LogEntryData, LogEntryKind};
use crate::parts::{DisableScope, PartInfo};
use crate::queue::{claim_conflict, QueueEntry};

use super::{DispatchContext, DispatchRule, Eligibility};

/// No two executing entries may claim overlapping parts.
pub struct FuturePartsRule;

impl DispatchRule for FuturePartsRule {
    fn name(&self) -> &'static str {
        "future-parts"
    }

    fn check(&self, entry: &QueueEntry, ctx: &DispatchContext<'_>) -> Eligibility {
        let kind = entry.kind().type_name();
        for part in entry.produced_parts() {
            let part_name = part.part_name();
            for (future_name, future) in ctx.future_parts() {
                let Some(relation) = claim_conflict(part, future) else {
                    continue;
                };
                return Eligibility::Postpone(format!(
                    "Not executing log entry {kind} for part {part_name} because {relation} ({future_name})."
                ));
            }
        }
        Eligibility::Ready
    }
}

/// Merges and mutations wait for their inputs to finish being produced.
pub struct SourcePartsRule;

impl DispatchRule for SourcePartsRule {
    fn name(&self) -> &'static str {
        "source-parts"
    }

    fn check(&self, entry: &QueueEntry, ctx: &DispatchContext<'_>) -> Eligibility {
        match entry.kind() {
            LogEntryKind::MergeParts { .. } | LogEntryKind::MutatePart { .. } => {}
            LogEntryKind::GetPart
            | LogEntryKind::AttachPart { .. }
            | LogEntryKind::DropRange { .. }
            | LogEntryKind::ClearColumn { .. }
            | LogEntryKind::ReplaceRange { .. } => return Eligibility::Ready,
        }

        match entry
            .data()
            .source_parts()
            .into_iter()
            .find(|source| ctx.is_future_part(source))
        {
            Some(source) => Eligibility::Postpone(format!(
                "Not merging into part {} because part {source} is not ready yet (log entry for that part is being processed).",
                entry.data().new_part_name
            )),
            None => Eligibility::Ready,
        }
    }
}

/// Nothing may be produced inside a range that is disabled for its kind.
pub struct DisabledRangeRule;

impl DispatchRule for DisabledRangeRule {
    fn name(&self) -> &'static str {
        "disabled-range"
    }

    fn check(&self, entry: &QueueEntry, ctx: &DispatchContext<'_>) -> Eligibility {
        let scope = match entry.kind() {
            LogEntryKind::MergeParts { .. } | LogEntryKind::MutatePart { .. } => {
                DisableScope::Merges
            }
            LogEntryKind::GetPart | LogEntryKind::AttachPart { .. } => {
                DisableScope::MergesAndFetches
            }
            LogEntryKind::DropRange { .. }
            | LogEntryKind::ClearColumn { .. }
            | LogEntryKind::ReplaceRange { .. } => return Eligibility::Ready,
        };

        match ctx
            .virtual_parts()
            .disabled_range_intersecting(entry.result_part(), scope)
        {
            Some(disabled) => Eligibility::Postpone(format!(
                "Not executing log entry {} for part {} because {:?} are disabled in range {}.",
                entry.kind(),
                entry.data().new_part_name,
                disabled.scope,
                disabled.range
            )),
            None => Eligibility::Ready,
        }
    }
}

/// A mutation can only run once the mutation it applies is known locally.
pub struct MutationVersionRule;

impl DispatchRule for MutationVersionRule {
    fn name(&self) -> &'static str {
        "mutation-version"
    }

    fn check(&self, entry: &QueueEntry, ctx: &DispatchContext<'_>) -> Eligibility {
        match entry.kind() {
            LogEntryKind::MutatePart { source_part } => {
                let target = entry.result_part();
                if ctx
                    .mutations()
                    .has_version(&target.partition_id, target.mutation)
                {
                    Eligibility::Ready
                } else {
                    Eligibility::Postpone(format!(
                        "Not mutating part {source_part} to {} because mutation version {} is not loaded yet.",
                        entry.data().new_part_name,
                        target.mutation
                    ))
                }
            }
            LogEntryKind::GetPart
            | LogEntryKind::AttachPart { .. }
            | LogEntryKind::MergeParts { .. }
            | LogEntryKind::DropRange { .. }
            | LogEntryKind::ClearColumn { .. }
            | LogEntryKind::ReplaceRange { .. } => Eligibility::Ready,
        }
    }
}

/// Merges and mutations pause while the executor has them suspended.
pub struct SuspensionRule;

impl DispatchRule for SuspensionRule {
    fn name(&self) -> &'static str {
        "suspension"
    }

    fn check(&self, entry: &QueueEntry, ctx: &DispatchContext<'_>) -> Eligibility {
        let pausable = match entry.kind() {
            LogEntryKind::MergeParts { .. } | LogEntryKind::MutatePart { .. } => true,
            LogEntryKind::GetPart
            | LogEntryKind::AttachPart { .. }
            | LogEntryKind::DropRange { .. }
            | LogEntryKind::ClearColumn { .. }
            | LogEntryKind::ReplaceRange { .. } => false,
        };
        if pausable && ctx.merges_suspended() {
            return Eligibility::Postpone(format!(
                "Not executing log entry for part {} because merges and mutations are cancelled now.",
                entry.data().new_part_name
            ));
        }
        Eligibility::Ready
    }
}

/// Merges and mutations wait for inserts that logically precede them.
///
/// A merge must not skip a block still being inserted inside its range,
/// and a mutation must not run ahead of an insert numbered below it.
pub struct CommittingInsertsRule;

impl DispatchRule for CommittingInsertsRule {
    fn name(&self) -> &'static str {
        "committing-inserts"
    }

    fn check(&self, entry: &QueueEntry, ctx: &DispatchContext<'_>) -> Eligibility {
        let result = entry.result_part();
        let Some(blocks) = ctx.committing_blocks(&result.partition_id) else {
            return Eligibility::Ready;
        };

        let blocking = match entry.kind() {
            LogEntryKind::MergeParts { .. } => blocks
                .range(result.min_block..=result.max_block)
                .next()
                .copied(),
            LogEntryKind::MutatePart { .. } => blocks.range(..result.mutation).next().copied(),
            LogEntryKind::GetPart
            | LogEntryKind::AttachPart { .. }
            | LogEntryKind::DropRange { .. }
            | LogEntryKind::ClearColumn { .. }
            | LogEntryKind::ReplaceRange { .. } => None,
        };

        match blocking {
            Some(block) => Eligibility::Postpone(format!(
                "Not executing log entry {} for part {} because block number {block} is still being inserted.",
                entry.kind(),
                entry.data().new_part_name
            )),
            None => Eligibility::Ready,
        }
    }
}

/// Range operations wait for everything executing inside their range.
pub struct RangeConflictRule;

impl DispatchRule for RangeConflictRule {
    fn name(&self) -> &'static str {
        "range-conflicts"
    }

    fn check(&self, entry: &QueueEntry, ctx: &DispatchContext<'_>) -> Eligibility {
        match entry.kind() {
            LogEntryKind::DropRange { .. }
            | LogEntryKind::ClearColumn { .. }
            | LogEntryKind::ReplaceRange { .. } => {}
            LogEntryKind::GetPart
            | LogEntryKind::AttachPart { .. }
            | LogEntryKind::MergeParts { .. }
            | LogEntryKind::MutatePart { .. } => return Eligibility::Ready,
        }

        let conflicts = range_conflicts(entry.data(), entry.result_part(), ctx.executing_entries(), |other| {
            other.id() == entry.id()
        });
        if conflicts.is_empty() {
            Eligibility::Ready
        } else {
            Eligibility::Postpone(describe_conflicts(entry.data(), entry.znode_name(), &conflicts))
        }
    }
}

/// Executing entries that block the range operation `data` over `range`.
pub(crate) fn range_conflicts<'a, I, F>(
    data: &LogEntryData,
    range: &PartInfo,
    executing: I,
    is_self: F,
) -> Vec<&'a QueueEntry>
where
    I: IntoIterator<Item = &'a QueueEntry>,
    F: Fn(&QueueEntry) -> bool,
{
    let clears_column = matches!(data.kind, LogEntryKind::ClearColumn { .. });
    executing
        .into_iter()
        .filter(|other| other.is_executing() && !is_self(*other))
        .filter(|other| match other.kind() {
            LogEntryKind::GetPart
            | LogEntryKind::AttachPart { .. }
            | LogEntryKind::MergeParts { .. }
            | LogEntryKind::MutatePart { .. } => range.contains(other.result_part()),
            LogEntryKind::ClearColumn { .. } => {
                clears_column && other.result_part().partition_id == range.partition_id
            }
            LogEntryKind::DropRange { .. } | LogEntryKind::ReplaceRange { .. } => {
                other.result_part().intersects(range)
            }
        })
        .collect()
}

pub(crate) fn describe_conflicts(
    data: &LogEntryData,
    znode_name: &str,
    conflicts: &[&QueueEntry],
) -> String {
    let mut description = format!(
        "Can't execute {} entry {znode_name}. There are {} currently executing entries blocking it: ",
        data.kind,
        conflicts.len()
    );
    for conflict in conflicts {
        description.push_str(&format!(
            "{} part {}, ",
            conflict.kind(),
            conflict.data().new_part_name
        ));
    }
    description
}

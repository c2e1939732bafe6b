// Dispatch Rules
//
// A queued entry may only start when every dispatch rule agrees. Rules
// are pure checks over the locked queue state; a rule that says "not now"
// gives a human-readable reason and the entry stays queued.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::mutations::MutationIndex;
use crate::parts::{ActivePartSet, PartInfo};
use crate::queue::{QueueEntry, QueueState};

mod builtin;

pub use builtin::{
    CommittingInsertsRule, DisabledRangeRule, FuturePartsRule, MutationVersionRule,
    RangeConflictRule, SourcePartsRule, SuspensionRule,
};
pub(crate) use builtin::{describe_conflicts, range_conflicts};

/// Outcome of a dispatch check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Ready,
    Postpone(String),
}

impl Eligibility {
    pub fn is_ready(&self) -> bool {
        matches!(self, Eligibility::Ready)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Eligibility::Ready => None,
            Eligibility::Postpone(reason) => Some(reason),
        }
    }
}

/// Switch owned by the merge/mutation executor.
///
/// The queue only reads it; suspension pauses merges and mutations
/// together and never pauses fetches.
pub trait ExecutionGate: Send + Sync {
    fn merges_suspended(&self) -> bool;
}

impl ExecutionGate for AtomicBool {
    fn merges_suspended(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

/// Gate for callers without a merge executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSuspended;

impl ExecutionGate for NeverSuspended {
    fn merges_suspended(&self) -> bool {
        false
    }
}

/// Read-only view of the locked queue state handed to rules.
pub struct DispatchContext<'a> {
    state: &'a QueueState,
    gate: &'a dyn ExecutionGate,
}

impl<'a> DispatchContext<'a> {
    pub(crate) fn new(state: &'a QueueState, gate: &'a dyn ExecutionGate) -> Self {
        Self { state, gate }
    }

    /// Parts being produced right now, with their names.
    pub fn future_parts(&self) -> impl Iterator<Item = (&'a str, &'a PartInfo)> + 'a {
        self.state
            .future_parts
            .iter()
            .map(|(name, future)| (name.as_str(), &future.info))
    }

    pub fn is_future_part(&self, name: &str) -> bool {
        self.state.future_parts.contains_key(name)
    }

    pub fn virtual_parts(&self) -> &'a ActivePartSet {
        &self.state.virtual_parts
    }

    pub fn mutations(&self) -> &'a MutationIndex {
        &self.state.mutations
    }

    /// Block numbers of inserts still committing in `partition_id`.
    pub fn committing_blocks(&self, partition_id: &str) -> Option<&'a BTreeSet<i64>> {
        self.state.current_inserts.get(partition_id)
    }

    pub fn executing_entries(&self) -> impl Iterator<Item = &'a QueueEntry> + 'a {
        self.state.entries.iter().filter(|entry| entry.is_executing())
    }

    pub fn merges_suspended(&self) -> bool {
        self.gate.merges_suspended()
    }
}

/// Trait implemented by all dispatch rules.
///
/// Rules must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait DispatchRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, entry: &QueueEntry, ctx: &DispatchContext<'_>) -> Eligibility;
}

/// Ordered set of rules consulted before an entry is handed to a worker.
#[derive(Default)]
pub struct DispatchRules {
    rules: Vec<Box<dyn DispatchRule>>,
}

impl DispatchRules {
    /// Create an engine with no rules.
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// The rules every replica runs, in evaluation order.
    pub fn standard() -> Self {
        let mut rules = Self::new();
        rules.register(FuturePartsRule);
        rules.register(SourcePartsRule);
        rules.register(DisabledRangeRule);
        rules.register(MutationVersionRule);
        rules.register(SuspensionRule);
        rules.register(CommittingInsertsRule);
        rules.register(RangeConflictRule);
        rules
    }

    /// Register a rule after the existing ones.
    pub fn register<R: DispatchRule + 'static>(&mut self, rule: R) {
        self.rules.push(Box::new(rule));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    /// Evaluate all rules.
    ///
    /// Stops at the first postponement.
    pub fn evaluate(&self, entry: &QueueEntry, ctx: &DispatchContext<'_>) -> Eligibility {
        for rule in &self.rules {
            match rule.check(entry, ctx) {
                Eligibility::Ready => continue,
                postpone @ Eligibility::Postpone(_) => {
                    tracing::trace!(
                        rule = rule.name(),
                        part = %entry.data().new_part_name,
                        reason = postpone.reason().unwrap_or_default(),
                        "entry postponed"
                    );
                    return postpone;
                }
            }
        }
        Eligibility::Ready
    }
}

impl std::fmt::Debug for DispatchRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

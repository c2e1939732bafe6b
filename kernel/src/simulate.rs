// End-to-End Queue Simulation
//
// Runs one replica's queue in dry-run mode against a coordinator:
// initialize → pull log → update mutations → select/complete loop

use serde::Serialize;

use crate::config::QueueConfig;
use crate::log::{Coordinator, LogEntryData, LogEntryKind};
use crate::queue::{InsertTimes, QueueError, QueueStatus, ReplicationQueue};
use crate::rules::ExecutionGate;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutedEntry {
    pub znode_name: String,
    pub type_name: &'static str,
    pub part: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostponedEntry {
    pub part: String,
    pub reason: String,
}

/// Result of a full simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub executed: Vec<ExecutedEntry>,
    /// Entries left in the queue, with the last reason they were held back.
    pub postponed: Vec<PostponedEntry>,
    pub status: QueueStatus,
    pub insert_times: InsertTimes,
}

/// Errors that can occur during simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("queue operation failed: {0}")]
    Queue(#[from] QueueError),
}

/// Run a replica's queue until nothing more may execute or `max_steps`
/// entries were handed out.
///
/// Part-producing actions are assumed to succeed without touching any
/// data. Range actions clear the queue inside their range the way a real
/// executor would before dropping or replacing parts.
pub fn simulate_queue<S: AsRef<str>>(
    coordinator: &dyn Coordinator,
    parts: &[S],
    config: QueueConfig,
    gate: &dyn ExecutionGate,
    max_steps: usize,
) -> Result<SimulationReport, SimulationError> {
    let queue = ReplicationQueue::new(config);

    // 1. Local state
    queue.initialize(coordinator, parts)?;

    // 2. Catch up with the coordinator
    queue.pull_logs_to_queue(coordinator, None)?;
    queue.update_mutations(coordinator, None)?;

    // 3. Drain
    let mut executed = Vec::new();
    for _ in 0..max_steps {
        let Some(executing) = queue.select_entry_to_process(gate) else {
            break;
        };
        let entry = executing.entry().clone();
        let znode_name = executing.znode_name().to_string();

        match execute_dry_run(&queue, coordinator, &entry) {
            Ok(()) => {
                executing.complete(coordinator)?;
                executed.push(ExecutedEntry {
                    znode_name,
                    type_name: entry.kind.type_name(),
                    part: entry.new_part_name,
                });
            }
            Err(err) => {
                tracing::warn!(part = %entry.new_part_name, error = %err, "dry run of entry failed");
                executing.fail(err.to_string());
            }
        }
    }

    let postponed = queue
        .entries()
        .into_iter()
        .map(|entry| PostponedEntry {
            part: entry.data.new_part_name,
            reason: entry.postpone_reason,
        })
        .collect();

    Ok(SimulationReport {
        executed,
        postponed,
        status: queue.status(),
        insert_times: queue.insert_times(),
    })
}

fn execute_dry_run(
    queue: &ReplicationQueue,
    coordinator: &dyn Coordinator,
    entry: &LogEntryData,
) -> Result<(), QueueError> {
    match &entry.kind {
        LogEntryKind::GetPart
        | LogEntryKind::AttachPart { .. }
        | LogEntryKind::MergeParts { .. }
        | LogEntryKind::MutatePart { .. } => Ok(()),
        LogEntryKind::DropRange { .. } | LogEntryKind::ReplaceRange { .. } => {
            queue.remove_part_producing_ops_in_range(coordinator, &entry.new_part_name)?;
            Ok(())
        }
        LogEntryKind::ClearColumn { .. } => {
            let (conflicts, description) = queue.conflicts_for_clear_column(entry)?;
            if conflicts.is_empty() {
                Ok(())
            } else {
                Err(QueueError::Conflict(description))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryCoordinator;
    use crate::mutations::{MutationCommand, MutationEntry};
    use crate::rules::NeverSuspended;
    use std::sync::atomic::AtomicBool;

    fn coordinator() -> InMemoryCoordinator {
        let zk = InMemoryCoordinator::new();
        for entry in [
            LogEntryData::get_part("p_1_1_0").with_create_time(10),
            LogEntryData::get_part("p_2_2_0").with_create_time(20),
            LogEntryData::merge_parts(["p_1_1_0", "p_2_2_0"], "p_1_2_1"),
            LogEntryData::get_part("q_1_1_0").with_create_time(5),
            LogEntryData::drop_range("q_0_5_999999999"),
        ] {
            zk.put_sequential("/t/log/log-", &entry.encode());
        }
        zk
    }

    fn config() -> QueueConfig {
        QueueConfig::for_paths("/t", "/t/replicas/r1")
    }

    #[test]
    fn full_simulation_drains_queue() {
        let zk = coordinator();
        let report = simulate_queue(&zk, &[] as &[&str], config(), &NeverSuspended, 100).unwrap();

        let executed: Vec<_> = report.executed.iter().map(|e| e.part.as_str()).collect();
        assert_eq!(executed, vec!["q_0_5_999999999", "p_1_1_0", "p_2_2_0", "p_1_2_1"]);
        assert!(report.postponed.is_empty());
        assert_eq!(report.status.queue_size, 0);
        assert_eq!(report.status.future_parts, 0);

        // The dropped fetch counts as processed.
        assert_eq!(report.insert_times.min_unprocessed_insert_time, 0);
        assert_eq!(report.insert_times.max_processed_insert_time, 20);
        assert!(zk.list_children("/t/replicas/r1/queue", None).unwrap().is_empty());
        assert_eq!(zk.get_data("/t/replicas/r1/log_pointer").unwrap().as_deref(), Some("5"));
    }

    #[test]
    fn suspended_merges_stay_queued() {
        let zk = coordinator();
        let suspended = AtomicBool::new(true);
        let report = simulate_queue(&zk, &[] as &[&str], config(), &suspended, 100).unwrap();

        assert_eq!(report.executed.len(), 3);
        assert_eq!(report.postponed.len(), 1);
        assert_eq!(report.postponed[0].part, "p_1_2_1");
        assert!(report.postponed[0].reason.contains("cancelled"));
        assert_eq!(report.status.merges_in_queue, 1);
    }

    #[test]
    fn mutations_wait_for_their_version() {
        let zk = InMemoryCoordinator::new();
        zk.put_sequential(
            "/t/log/log-",
            &LogEntryData::mutate_part("p_1_1_0", "p_1_1_0_5").encode(),
        );
        let report = simulate_queue(&zk, &["p_1_1_0"], config(), &NeverSuspended, 10).unwrap();
        assert!(report.executed.is_empty());
        assert!(report.postponed[0].reason.contains("mutation version 5"));

        let mutation = MutationEntry::new("", vec![MutationCommand::Delete { predicate: "1".into() }])
            .with_block("p", 5);
        zk.put("/t/mutations/0000000000", &mutation.encode());
        let report = simulate_queue(&zk, &["p_1_1_0"], config(), &NeverSuspended, 10).unwrap();
        assert_eq!(report.executed.len(), 1);
        assert_eq!(report.executed[0].type_name, "MUTATE_PART");
    }

    #[test]
    fn step_limit_is_respected() {
        let zk = coordinator();
        let report = simulate_queue(&zk, &[] as &[&str], config(), &NeverSuspended, 2).unwrap();
        assert_eq!(report.executed.len(), 2);
        assert_eq!(report.status.queue_size, 2);
    }
}

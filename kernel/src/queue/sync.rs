// Coordinator Sync
//
// Brings local state up to date with the coordinator: the replica's own
// queue on startup, new shared log entries, the mutation list and the
// set of inserts still committing. Every coordinator failure is returned
// to the caller unchanged; nothing here retries.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::log::{
    pad_index, parse_index, Coordinator, CoordinatorError, LogEntryData, UpdateEvent, WriteOp,
    WriteResult,
};
use crate::mutations::MutationEntry;

use super::{unix_now, InsertTimesUpdate, QueueEntry, QueueError, ReplicationQueue};

const LOG_PREFIX: &str = "log-";
const QUEUE_PREFIX: &str = "queue-";
const BLOCK_PREFIX: &str = "block-";
const ABANDONABLE_LOCK_PREFIX: &str = "abandonable_lock-";

impl ReplicationQueue {
    /// Seed the virtual parts with the parts present on disk, then load the
    /// replica's queue from the coordinator.
    pub fn initialize<I, S>(&self, coordinator: &dyn Coordinator, parts: I) -> Result<bool, QueueError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        {
            let mut state = self.state.lock();
            for name in parts {
                state.virtual_parts.add(name.as_ref())?;
            }
        }
        self.load(coordinator)
    }

    /// Read the replica's queue nodes that are not yet held locally.
    /// Returns whether anything was loaded.
    pub fn load(&self, coordinator: &dyn Coordinator) -> Result<bool, QueueError> {
        let _pulling = self.pull_logs_lock.lock();
        let queue_dir = self.config.queue_dir();

        let log_pointer = read_log_pointer(coordinator, &self.config.log_pointer_path())?;

        let mut children = coordinator.list_children(&queue_dir, None)?;
        {
            let state = self.state.lock();
            children.retain(|name| !state.entries.contains_znode(name));
        }
        children.sort();

        let paths: Vec<String> = children
            .iter()
            .map(|name| format!("{queue_dir}/{name}"))
            .collect();
        let contents = coordinator.multi_get_data(&paths)?;

        let mut loaded = Vec::with_capacity(children.len());
        for ((name, path), data) in children.iter().zip(&paths).zip(contents) {
            // Removed since the listing, e.g. completed by another thread.
            let Some(data) = data else { continue };
            let entry = LogEntryData::decode(path, &data)?;
            loaded.push(QueueEntry::new(entry, name.as_str())?);
        }

        let count = loaded.len();
        let update = {
            let mut state = self.state.lock();
            if let Some(pointer) = log_pointer {
                state.log_pointer = pointer;
            }

            let mut update = InsertTimesUpdate::default();
            for entry in loaded {
                update.merge(state.insert_unlocked(entry));
            }
            state.entries.touch(unix_now());
            update
        };
        self.update_times_in_coordinator(coordinator, update);

        tracing::debug!(logger = %self.config.logger_name, loaded = count, "loaded queue");
        Ok(count > 0)
    }

    /// Copy shared log entries past this replica's pointer into its queue.
    ///
    /// Entries are copied in batches; each batch creates the queue nodes and
    /// moves `log_pointer` in one atomic request, and is added locally only
    /// after that request succeeds. A failure therefore leaves the pointer
    /// right after the last batch held locally. With `next_update_event`,
    /// a watch is left on the first log node not yet copied.
    ///
    /// Returns whether any new entry was added.
    pub fn pull_logs_to_queue(
        &self,
        coordinator: &dyn Coordinator,
        next_update_event: Option<&Arc<UpdateEvent>>,
    ) -> Result<bool, QueueError> {
        let _pulling = self.pull_logs_lock.lock();

        self.load_current_inserts(coordinator)?;

        let log_dir = self.config.log_dir();
        let log_pointer_path = self.config.log_pointer_path();

        let mut log_entries: Vec<String> = coordinator
            .list_children(&log_dir, None)?
            .into_iter()
            .filter(|name| name.starts_with(LOG_PREFIX))
            .collect();
        log_entries.sort();

        let mut index = match read_log_pointer(coordinator, &log_pointer_path)? {
            Some(pointer) => pointer,
            None => {
                // A new replica starts from the oldest entry still in the log.
                let oldest = log_entries
                    .first()
                    .and_then(|name| parse_index(name, LOG_PREFIX))
                    .unwrap_or(0);
                let oldest = u64::try_from(oldest).unwrap_or(0);
                if log_entries.is_empty() {
                    coordinator.multi(&[WriteOp::Set {
                        path: log_pointer_path.clone(),
                        data: oldest.to_string(),
                    }])?;
                }
                self.state.lock().log_pointer = oldest;
                oldest
            }
        };

        let first_wanted = format!("{LOG_PREFIX}{}", pad_index(index as i64));
        log_entries.retain(|name| *name >= first_wanted);

        let mut pulled = 0usize;
        for batch in log_entries.chunks(self.config.max_multi_ops.max(1)) {
            index = self.pull_batch(coordinator, &log_dir, batch, index, &mut pulled)?;
        }

        if pulled > 0 {
            tracing::debug!(logger = %self.config.logger_name, pulled, pointer = index, "pulled log entries to queue");
        }

        if let Some(event) = next_update_event {
            let next = format!("{log_dir}/{LOG_PREFIX}{}", pad_index(index as i64));
            if coordinator.exists(&next, Some(event))? {
                event.set();
            }
        }

        Ok(pulled > 0)
    }

    /// Copy one batch of log nodes. Returns the log pointer after the batch.
    fn pull_batch(
        &self,
        coordinator: &dyn Coordinator,
        log_dir: &str,
        batch: &[String],
        pointer: u64,
        pulled: &mut usize,
    ) -> Result<u64, QueueError> {
        let Some(last) = batch.last() else {
            return Ok(pointer);
        };
        let last_index = parse_index(last, LOG_PREFIX).ok_or_else(|| CoordinatorError::BadData {
            path: format!("{log_dir}/{last}"),
            reason: "log node name is not a sequence number".into(),
        })?;
        let next_pointer = u64::try_from(last_index + 1).unwrap_or(pointer);

        let paths: Vec<String> = batch.iter().map(|name| format!("{log_dir}/{name}")).collect();
        let contents = coordinator.multi_get_data(&paths)?;

        let mut copies = Vec::with_capacity(batch.len());
        let mut min_unprocessed_insert_time = None;
        {
            let state = self.state.lock();
            let mut current_min = state.entries.insert_times().min_unprocessed_insert_time;
            for ((name, path), data) in batch.iter().zip(&paths).zip(contents) {
                let data = data.ok_or_else(|| CoordinatorError::NoNode(path.clone()))?;
                if state.entries.contains_log_node(name) {
                    continue;
                }
                let entry = LogEntryData::decode(path, &data)?;
                if entry.is_insert()
                    && entry.create_time != 0
                    && (current_min == 0 || entry.create_time < current_min)
                {
                    current_min = entry.create_time;
                    min_unprocessed_insert_time = Some(current_min);
                }
                copies.push(QueueEntry::new(entry, String::new())?.with_log_node(name.as_str()));
            }
        }

        let queue_prefix = format!("{}/{QUEUE_PREFIX}", self.config.queue_dir());
        let mut ops: Vec<WriteOp> = copies
            .iter()
            .map(|copy| WriteOp::CreateSequential {
                prefix: queue_prefix.clone(),
                data: copy.data().encode(),
            })
            .collect();
        ops.push(WriteOp::Set {
            path: self.config.log_pointer_path(),
            data: next_pointer.to_string(),
        });
        if let Some(min) = min_unprocessed_insert_time {
            ops.push(WriteOp::Set {
                path: self.config.min_unprocessed_insert_time_path(),
                data: min.to_string(),
            });
        }

        let results = coordinator.multi(&ops)?;

        let mut state = self.state.lock();
        for (mut copy, result) in copies.into_iter().zip(results) {
            if let WriteResult::Created(path) = result {
                copy.znode_name = path.rsplit('/').next().unwrap_or_default().to_string();
            }
            // The watermark change already went out with the batch.
            state.insert_unlocked(copy);
            *pulled += 1;
        }
        state.log_pointer = next_pointer;
        state.entries.touch(unix_now());
        Ok(next_pointer)
    }

    /// Reconcile the local mutation index with the coordinator's list.
    /// Returns whether anything was added or removed.
    pub fn update_mutations(
        &self,
        coordinator: &dyn Coordinator,
        next_update_event: Option<&Arc<UpdateEvent>>,
    ) -> Result<bool, QueueError> {
        let _updating = self.update_mutations_lock.lock();
        let mutations_dir = self.config.mutations_dir();

        let in_coordinator: BTreeSet<String> = coordinator
            .list_children(&mutations_dir, next_update_event)?
            .into_iter()
            .collect();

        let (to_remove, to_add): (Vec<String>, Vec<String>) = {
            let state = self.state.lock();
            let to_remove = state
                .mutations
                .znode_names()
                .filter(|name| !in_coordinator.contains(*name))
                .map(str::to_string)
                .collect();
            let to_add = in_coordinator
                .iter()
                .filter(|name| !state.mutations.contains(name))
                .cloned()
                .collect();
            (to_remove, to_add)
        };

        let paths: Vec<String> = to_add
            .iter()
            .map(|name| format!("{mutations_dir}/{name}"))
            .collect();
        let contents = coordinator.multi_get_data(&paths)?;

        let mut added = Vec::with_capacity(to_add.len());
        for ((name, path), data) in to_add.iter().zip(&paths).zip(contents) {
            let Some(data) = data else { continue };
            let entry = MutationEntry::parse(name, &data).map_err(|err| CoordinatorError::BadData {
                path: path.clone(),
                reason: err.to_string(),
            })?;
            added.push(entry);
        }

        let changed = !to_remove.is_empty() || !added.is_empty();
        if changed {
            let mut state = self.state.lock();
            for name in &to_remove {
                state.mutations.remove(name);
            }
            for entry in added.iter().cloned() {
                state.mutations.add(entry);
            }
            tracing::info!(
                logger = %self.config.logger_name,
                added = added.len(),
                removed = to_remove.len(),
                "updated mutations"
            );
        }
        Ok(changed)
    }

    /// Refresh the block numbers of inserts that are still committing.
    ///
    /// A block is in flight while the lock node its data points to exists
    /// under the table's temp directory.
    fn load_current_inserts(&self, coordinator: &dyn Coordinator) -> Result<(), QueueError> {
        let blocks_dir = self.config.block_numbers_dir();
        let lock_prefix = format!("{}/{ABANDONABLE_LOCK_PREFIX}", self.config.temp_dir());

        let mut current: HashMap<String, BTreeSet<i64>> = HashMap::new();
        for partition in coordinator.list_children(&blocks_dir, None)? {
            let partition_dir = format!("{blocks_dir}/{partition}");
            let blocks: Vec<String> = coordinator
                .list_children(&partition_dir, None)?
                .into_iter()
                .filter(|name| name.starts_with(BLOCK_PREFIX))
                .collect();
            let paths: Vec<String> = blocks
                .iter()
                .map(|name| format!("{partition_dir}/{name}"))
                .collect();
            let holders = coordinator.multi_get_data(&paths)?;

            for (name, holder) in blocks.iter().zip(holders) {
                let Some(holder) = holder.filter(|holder| holder.starts_with(&lock_prefix)) else {
                    continue;
                };
                let Some(number) = parse_index(name, BLOCK_PREFIX) else {
                    continue;
                };
                if coordinator.exists(&holder, None)? {
                    current.entry(partition.clone()).or_default().insert(number);
                }
            }
        }

        self.state.lock().current_inserts = current;
        Ok(())
    }
}

fn read_log_pointer(coordinator: &dyn Coordinator, path: &str) -> Result<Option<u64>, QueueError> {
    let Some(raw) = coordinator.get_data(path)? else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(|_| {
        QueueError::Coordinator(CoordinatorError::BadData {
            path: path.to_string(),
            reason: format!("log pointer `{raw}` is not a number"),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::log::InMemoryCoordinator;
    use crate::mutations::MutationCommand;
    use crate::parts::PartInfo;
    use crate::rules::NeverSuspended;

    fn queue() -> ReplicationQueue {
        ReplicationQueue::new(QueueConfig::for_paths("/t", "/t/replicas/r1"))
    }

    fn log(zk: &InMemoryCoordinator, entry: LogEntryData) -> String {
        zk.put_sequential("/t/log/log-", &entry.encode())
    }

    #[test]
    fn load_skips_entries_already_held() {
        let zk = InMemoryCoordinator::new();
        zk.put_sequential("/t/replicas/r1/queue/queue-", &LogEntryData::get_part("p_1_1_0").encode());
        zk.put_sequential("/t/replicas/r1/queue/queue-", &LogEntryData::drop_range("p_0_9_999999999").encode());
        zk.put("/t/replicas/r1/log_pointer", "7");

        let queue = queue();
        assert!(queue.initialize(&zk, ["p_5_5_0"]).unwrap());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.log_pointer(), 7);
        // The drop range was loaded second but sits at the head.
        assert_eq!(queue.entries()[0].type_name, "DROP_RANGE");

        assert!(!queue.load(&zk).unwrap());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn pull_copies_log_into_replica_queue() {
        let zk = InMemoryCoordinator::new();
        log(&zk, LogEntryData::get_part("p_1_1_0").with_create_time(100));
        log(&zk, LogEntryData::get_part("p_2_2_0").with_create_time(90));
        log(&zk, LogEntryData::merge_parts(["p_1_1_0", "p_2_2_0"], "p_1_2_1"));

        let queue = queue();
        queue.initialize(&zk, std::iter::empty::<&str>()).unwrap();
        assert!(queue.pull_logs_to_queue(&zk, None).unwrap());

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.log_pointer(), 3);
        assert_eq!(zk.get_data("/t/replicas/r1/log_pointer").unwrap().as_deref(), Some("3"));
        assert_eq!(
            zk.get_data("/t/replicas/r1/min_unprocessed_insert_time").unwrap().as_deref(),
            Some("90")
        );
        assert_eq!(queue.insert_times().min_unprocessed_insert_time, 90);

        let queued = zk.list_children("/t/replicas/r1/queue", None).unwrap();
        assert_eq!(queued.len(), 3);
        let names: Vec<_> = queue.entries().into_iter().map(|e| e.znode_name).collect();
        assert_eq!(names, vec!["queue-0000000000", "queue-0000000001", "queue-0000000002"]);
        assert_eq!(queue.virtual_parts(), vec!["p_1_2_1".to_string()]);

        // Nothing new: the queue and the pointer stay put.
        assert!(!queue.pull_logs_to_queue(&zk, None).unwrap());
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.log_pointer(), 3);
    }

    #[test]
    fn new_replica_starts_at_oldest_log_entry() {
        let zk = InMemoryCoordinator::new();
        for n in 0..3 {
            log(&zk, LogEntryData::get_part(format!("p_{n}_{n}_0")));
        }
        // Older entries were cleaned up already.
        zk.remove("/t/log/log-0000000000");

        let queue = queue();
        queue.pull_logs_to_queue(&zk, None).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.log_pointer(), 3);
    }

    #[test]
    fn empty_log_initializes_pointer() {
        let zk = InMemoryCoordinator::new();
        let queue = queue();
        assert!(!queue.pull_logs_to_queue(&zk, None).unwrap());
        assert_eq!(zk.get_data("/t/replicas/r1/log_pointer").unwrap().as_deref(), Some("0"));
    }

    #[test]
    fn bad_log_pointer_is_reported() {
        let zk = InMemoryCoordinator::new();
        zk.put("/t/replicas/r1/log_pointer", "seven");
        let err = queue().pull_logs_to_queue(&zk, None).unwrap_err();
        assert!(matches!(err, QueueError::Coordinator(CoordinatorError::BadData { .. })));
    }

    #[test]
    fn connection_loss_surfaces_unchanged() {
        let zk = InMemoryCoordinator::new();
        log(&zk, LogEntryData::get_part("p_1_1_0"));
        zk.set_offline(true);

        let queue = queue();
        let err = queue.pull_logs_to_queue(&zk, None).unwrap_err();
        assert!(matches!(err, QueueError::Coordinator(CoordinatorError::ConnectionLoss)));
        assert!(queue.is_empty());
    }

    #[test]
    fn committing_inserts_hold_back_merges() {
        let zk = InMemoryCoordinator::new();
        zk.put("/t/temp/abandonable_lock-0000000000", "");
        zk.put("/t/block_numbers/p/block-0000000002", "/t/temp/abandonable_lock-0000000000");
        // Committed: its lock holder is gone.
        zk.put("/t/block_numbers/p/block-0000000007", "/t/temp/abandonable_lock-0000000001");
        log(&zk, LogEntryData::merge_parts(["p_1_1_0", "p_3_3_0"], "p_1_3_1"));

        let queue = queue();
        queue.initialize(&zk, ["p_1_1_0", "p_3_3_0"]).unwrap();
        queue.pull_logs_to_queue(&zk, None).unwrap();
        assert!(queue.select_entry_to_process(&NeverSuspended).is_none());
        assert!(queue.entries()[0].postpone_reason.contains("block number 2"));

        let verdict = queue.can_merge_parts(
            &PartInfo::from_part_name("p_1_1_0").unwrap(),
            &PartInfo::from_part_name("p_3_3_0").unwrap(),
        );
        assert!(!verdict.is_ready());

        zk.remove("/t/temp/abandonable_lock-0000000000");
        queue.pull_logs_to_queue(&zk, None).unwrap();
        assert!(queue.select_entry_to_process(&NeverSuspended).is_some());
    }

    #[test]
    fn mutations_follow_coordinator_list() {
        let zk = InMemoryCoordinator::new();
        let delete = MutationEntry::new("", vec![MutationCommand::Delete { predicate: "x = 1".into() }])
            .with_block("p", 5)
            .with_block("q", 3);
        zk.put("/t/mutations/0000000000", &delete.encode());

        let queue = queue();
        assert!(queue.update_mutations(&zk, None).unwrap());
        assert_eq!(queue.mutation_count(), 1);
        let part = PartInfo::from_part_name("p_1_1_0").unwrap();
        assert_eq!(queue.first_unapplied_mutation_version(&part), Some(5));
        assert_eq!(queue.get_mutation_commands(&part, 5).unwrap().len(), 1);

        assert!(!queue.update_mutations(&zk, None).unwrap());

        zk.remove("/t/mutations/0000000000");
        assert!(queue.update_mutations(&zk, None).unwrap());
        assert_eq!(queue.mutation_count(), 0);
        assert_eq!(queue.first_unapplied_mutation_version(&part), None);
    }

    #[test]
    fn malformed_mutation_is_bad_data() {
        let zk = InMemoryCoordinator::new();
        zk.put("/t/mutations/0000000000", "{not json");
        let err = queue().update_mutations(&zk, None).unwrap_err();
        assert!(matches!(err, QueueError::Coordinator(CoordinatorError::BadData { .. })));
    }
}

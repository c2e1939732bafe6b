use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use replq_kernel::config::QueueConfig;
use replq_kernel::log::{InMemoryCoordinator, LogEntryData};
use replq_kernel::parts::PartInfo;
use replq_kernel::queue::ReplicationQueue;
use replq_kernel::rules::NeverSuspended;

fn config() -> QueueConfig {
    QueueConfig::for_paths("/t", "/t/replicas/r1")
}

/// Fetches for blocks 1..=16, pairwise merges, then merges of those pairs.
fn fill(queue: &ReplicationQueue, zk: &InMemoryCoordinator) {
    let mut entries = Vec::new();
    for block in 1..=16 {
        entries.push(LogEntryData::get_part(format!("p_{block}_{block}_0")).with_create_time(block));
    }
    for pair in 0..8 {
        let (left, right) = (2 * pair + 1, 2 * pair + 2);
        entries.push(LogEntryData::merge_parts(
            [format!("p_{left}_{left}_0"), format!("p_{right}_{right}_0")],
            format!("p_{left}_{right}_1"),
        ));
    }
    for quad in 0..4 {
        let (min, mid, max) = (4 * quad + 1, 4 * quad + 2, 4 * quad + 4);
        entries.push(LogEntryData::merge_parts(
            [format!("p_{min}_{mid}_1"), format!("p_{}_{max}_1", mid + 1)],
            format!("p_{min}_{max}_2"),
        ));
    }
    for (n, entry) in entries.into_iter().enumerate() {
        queue.insert(zk, &format!("queue-{n:010}"), entry).unwrap();
    }
}

#[test]
fn concurrent_workers_never_claim_overlapping_parts() {
    let queue = ReplicationQueue::new(config());
    let zk = InMemoryCoordinator::new();
    fill(&queue, &zk);
    let total = queue.len();

    let in_flight: Mutex<Vec<PartInfo>> = Mutex::new(Vec::new());
    let executed = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| loop {
                let Some(executing) = queue.select_entry_to_process(&NeverSuspended) else {
                    if queue.is_empty() {
                        break;
                    }
                    thread::yield_now();
                    continue;
                };

                let claimed = executing.entry().produced_part_infos().unwrap();
                {
                    let mut running = in_flight.lock();
                    for part in &claimed {
                        assert!(
                            running.iter().all(|other| !other.intersects(part)),
                            "{part} overlaps one of {running:?}"
                        );
                    }
                    running.extend(claimed.iter().cloned());
                }

                thread::sleep(Duration::from_millis(1));

                in_flight
                    .lock()
                    .retain(|other| !claimed.contains(other));
                executing.complete(&zk).unwrap();
                executed.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    assert_eq!(executed.load(Ordering::SeqCst), total);
    assert!(queue.future_parts().is_empty());
    assert_eq!(
        queue.virtual_parts(),
        vec!["p_1_4_2", "p_5_8_2", "p_9_12_2", "p_13_16_2"]
    );
    assert_eq!(queue.insert_times().max_processed_insert_time, 16);
    assert_eq!(queue.insert_times().min_unprocessed_insert_time, 0);
}

#[test]
fn selected_merge_is_not_handed_out_twice() {
    let queue = ReplicationQueue::new(config());
    let zk = InMemoryCoordinator::new();
    queue
        .initialize(&zk, ["p_1_1_0", "p_2_2_0", "p_3_3_0", "p_4_4_0"])
        .unwrap();
    queue
        .insert(&zk, "queue-0000000000", LogEntryData::merge_parts(["p_1_1_0", "p_2_2_0"], "p_1_2_1"))
        .unwrap();
    queue
        .insert(&zk, "queue-0000000001", LogEntryData::merge_parts(["p_3_3_0", "p_4_4_0"], "p_3_4_1"))
        .unwrap();

    let first = queue.select_entry_to_process(&NeverSuspended).unwrap();
    assert_eq!(first.entry().new_part_name, "p_1_2_1");

    let others: Vec<Option<String>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..3)
            .map(|_| {
                scope.spawn(|| {
                    queue
                        .select_entry_to_process(&NeverSuspended)
                        .map(|executing| executing.entry().new_part_name.clone())
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    // Every handle was dropped inside its thread, so each call may have
    // picked the second merge; none may have picked the first.
    assert!(others.iter().flatten().all(|name| name == "p_3_4_1"));
    assert!(others.iter().any(Option::is_some));
    first.complete(&zk).unwrap();
}

#[test]
fn removal_waits_for_executing_entry() {
    let queue = ReplicationQueue::new(config());
    let zk = InMemoryCoordinator::new();
    zk.put("/t/replicas/r1/queue/queue-0000000000", "");
    queue
        .insert(&zk, "queue-0000000000", LogEntryData::get_part("p_1_1_0"))
        .unwrap();

    let fetch = queue.select_entry_to_process(&NeverSuspended).unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let remover = scope.spawn(|| {
            let removed = queue
                .remove_part_producing_ops_in_range(&zk, "p_0_10_999999999")
                .unwrap();
            done.store(true, Ordering::SeqCst);
            removed
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst), "removal returned while the fetch was running");

        // The entry is gone from the queue already; completing it only
        // releases its claim.
        assert!(queue.is_empty());
        fetch.complete(&zk).unwrap();

        assert_eq!(remover.join().unwrap(), 1);
    });

    assert!(done.load(Ordering::SeqCst));
    assert!(queue.future_parts().is_empty());
    assert!(zk.snapshot().keys().all(|path| !path.contains("/queue/")));
}

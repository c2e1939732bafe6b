// Coordinator Abstraction
//
// The shared log lives in an external, strongly ordered, watchable
// key/value namespace. This module defines the contract the queue needs
// from it, plus an in-memory implementation used by the CLI and tests.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Width of the numeric suffix of sequential node names.
const SEQUENTIAL_SUFFIX_WIDTH: usize = 10;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("connection to coordinator lost")]
    ConnectionLoss,

    #[error("node {0} does not exist")]
    NoNode(String),

    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("bad data at {path}: {reason}")]
    BadData { path: String, reason: String },
}

/// One-shot notification set by a watch.
#[derive(Debug, Default)]
pub struct UpdateEvent {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl UpdateEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self) {
        *self.fired.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.fired.lock()
    }

    /// Clear the event, returning whether it had fired.
    pub fn reset(&self) -> bool {
        std::mem::replace(&mut *self.fired.lock(), false)
    }

    /// Wait up to `timeout` for the event. Returns whether it fired.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut fired = self.fired.lock();
        if !*fired {
            self.cond.wait_for(&mut fired, timeout);
        }
        *fired
    }
}

/// Write operation applied as part of an atomic multi-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Create { path: String, data: String },
    /// Create `<prefix><padded sequence number>`.
    CreateSequential { prefix: String, data: String },
    /// Overwrite (or create) `path`.
    Set { path: String, data: String },
    Remove { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Created(String),
    Set,
    Removed,
}

/// External durable log store.
///
/// Properties required from implementations:
/// - Per-path strong ordering
/// - `multi` applies all operations or none
/// - Watches fire at most once per registration
///
/// Every call may fail with `CoordinatorError::ConnectionLoss`.
pub trait Coordinator: Send + Sync {
    /// Names (not paths) of the children of `path`, in no particular order.
    ///
    /// If `watch` is given, it is set on the next change to the child list.
    fn list_children(
        &self,
        path: &str,
        watch: Option<&Arc<UpdateEvent>>,
    ) -> Result<Vec<String>, CoordinatorError>;

    /// Data stored at `path`, or `None` if the node is absent.
    fn get_data(&self, path: &str) -> Result<Option<String>, CoordinatorError>;

    fn multi_get_data(&self, paths: &[String]) -> Result<Vec<Option<String>>, CoordinatorError> {
        paths.iter().map(|path| self.get_data(path)).collect()
    }

    /// Whether `path` exists. If `watch` is given, it is set when the node
    /// is created, changed, or removed.
    fn exists(
        &self,
        path: &str,
        watch: Option<&Arc<UpdateEvent>>,
    ) -> Result<bool, CoordinatorError>;

    fn multi(&self, ops: &[WriteOp]) -> Result<Vec<WriteResult>, CoordinatorError>;

    /// Remove `path` if present. Returns whether a node was removed.
    fn try_remove(&self, path: &str) -> Result<bool, CoordinatorError>;
}

/// Format `index` the way the coordinator names sequential nodes.
///
/// Non-negative indices are zero-padded to a fixed width, so their names
/// sort like the numbers. Negative indices keep their sign inside the
/// padding (`00000000-5`), which never matches a generated name.
pub fn pad_index(index: i64) -> String {
    format!("{:0>width$}", index.to_string(), width = SEQUENTIAL_SUFFIX_WIDTH)
}

/// Inverse of `pad_index` for names like `log-0000000042`.
pub fn parse_index(name: &str, prefix: &str) -> Option<i64> {
    let suffix = name.strip_prefix(prefix)?;
    if suffix.len() < SEQUENTIAL_SUFFIX_WIDTH {
        return None;
    }
    let trimmed = suffix.trim_start_matches('0');
    if trimmed.is_empty() {
        return Some(0);
    }
    trimmed.parse().ok()
}

#[derive(Debug, Default)]
struct InMemoryNodes {
    nodes: BTreeMap<String, String>,
    sequences: HashMap<String, i64>,
    data_watches: HashMap<String, Vec<Arc<UpdateEvent>>>,
    child_watches: HashMap<String, Vec<Arc<UpdateEvent>>>,
    offline: bool,
    multis_before_failure: Option<usize>,
}

/// Coordinator kept in process memory.
///
/// Directories are implicit: a path is listed under its parent once any
/// node exists below it, and listing a path with no children yields an
/// empty list rather than `NoNode`.
#[derive(Debug, Default)]
pub struct InMemoryCoordinator {
    inner: Mutex<InMemoryNodes>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `path -> data` snapshot. Sequence counters continue
    /// after the highest numbered child already present.
    pub fn from_snapshot(snapshot: BTreeMap<String, String>) -> Self {
        let mut inner = InMemoryNodes::default();
        for path in snapshot.keys() {
            let (parent, name) = split_path(path);
            let Some(split) = name.len().checked_sub(SEQUENTIAL_SUFFIX_WIDTH) else {
                continue;
            };
            let Some(number) = name
                .get(split..)
                .and_then(|suffix| suffix.parse::<i64>().ok())
            else {
                continue;
            };
            let counter = inner.sequences.entry(parent.to_string()).or_insert(0);
            *counter = (*counter).max(number + 1);
        }
        inner.nodes = snapshot;
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.lock().nodes.clone()
    }

    /// Create or overwrite a node directly, firing watches.
    pub fn put(&self, path: &str, data: &str) {
        let mut inner = self.inner.lock();
        let created = !inner.nodes.contains_key(path);
        inner.nodes.insert(path.to_string(), data.to_string());
        inner.fire_data(path);
        if created {
            inner.fire_children(path);
        }
    }

    /// Create a sequential node directly, returning its full path.
    pub fn put_sequential(&self, prefix: &str, data: &str) -> String {
        let mut inner = self.inner.lock();
        let path = inner.next_sequential(prefix);
        inner.nodes.insert(path.clone(), data.to_string());
        inner.fire_data(&path);
        inner.fire_children(&path);
        path
    }

    pub fn remove(&self, path: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.remove_node(path)
    }

    /// While offline, every call fails with `ConnectionLoss`.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Let `count` more multi-requests succeed, then fail the rest with
    /// `ConnectionLoss`. `None` removes the limit.
    pub fn fail_multis_after(&self, count: Option<usize>) {
        self.inner.lock().multis_before_failure = count;
    }
}

impl InMemoryNodes {
    fn check_online(&self) -> Result<(), CoordinatorError> {
        if self.offline {
            Err(CoordinatorError::ConnectionLoss)
        } else {
            Ok(())
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let name = key[prefix.len()..].split('/').next()?;
                (!name.is_empty()).then(|| name.to_string())
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn next_sequential(&mut self, prefix: &str) -> String {
        let (parent, _) = split_path(prefix);
        let counter = self.sequences.entry(parent.to_string()).or_insert(0);
        let path = format!("{prefix}{}", pad_index(*counter));
        *counter += 1;
        path
    }

    fn remove_node(&mut self, path: &str) -> bool {
        if self.nodes.remove(path).is_none() {
            return false;
        }
        self.fire_data(path);
        self.fire_children(path);
        true
    }

    fn fire_data(&mut self, path: &str) {
        if let Some(watches) = self.data_watches.remove(path) {
            watches.iter().for_each(|event| event.set());
        }
    }

    fn fire_children(&mut self, path: &str) {
        let (parent, _) = split_path(path);
        if let Some(watches) = self.child_watches.remove(parent) {
            watches.iter().for_each(|event| event.set());
        }
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

impl Coordinator for InMemoryCoordinator {
    fn list_children(
        &self,
        path: &str,
        watch: Option<&Arc<UpdateEvent>>,
    ) -> Result<Vec<String>, CoordinatorError> {
        let mut inner = self.inner.lock();
        inner.check_online()?;
        if let Some(event) = watch {
            inner
                .child_watches
                .entry(path.trim_end_matches('/').to_string())
                .or_default()
                .push(Arc::clone(event));
        }
        Ok(inner.children(path))
    }

    fn get_data(&self, path: &str) -> Result<Option<String>, CoordinatorError> {
        let inner = self.inner.lock();
        inner.check_online()?;
        Ok(inner.nodes.get(path).cloned())
    }

    fn exists(
        &self,
        path: &str,
        watch: Option<&Arc<UpdateEvent>>,
    ) -> Result<bool, CoordinatorError> {
        let mut inner = self.inner.lock();
        inner.check_online()?;
        if let Some(event) = watch {
            inner
                .data_watches
                .entry(path.to_string())
                .or_default()
                .push(Arc::clone(event));
        }
        Ok(inner.nodes.contains_key(path))
    }

    fn multi(&self, ops: &[WriteOp]) -> Result<Vec<WriteResult>, CoordinatorError> {
        let mut inner = self.inner.lock();
        inner.check_online()?;
        if let Some(remaining) = inner.multis_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(CoordinatorError::ConnectionLoss);
            }
            *remaining -= 1;
        }

        // Validate first so a failing request leaves no partial effect.
        for op in ops {
            match op {
                WriteOp::Create { path, .. } if inner.nodes.contains_key(path) => {
                    return Err(CoordinatorError::NodeExists(path.clone()));
                }
                WriteOp::Remove { path } if !inner.nodes.contains_key(path) => {
                    return Err(CoordinatorError::NoNode(path.clone()));
                }
                _ => {}
            }
        }

        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match op {
                WriteOp::Create { path, data } => {
                    inner.nodes.insert(path.clone(), data.clone());
                    inner.fire_data(path);
                    inner.fire_children(path);
                    WriteResult::Created(path.clone())
                }
                WriteOp::CreateSequential { prefix, data } => {
                    let path = inner.next_sequential(prefix);
                    inner.nodes.insert(path.clone(), data.clone());
                    inner.fire_data(&path);
                    inner.fire_children(&path);
                    WriteResult::Created(path)
                }
                WriteOp::Set { path, data } => {
                    let created = inner.nodes.insert(path.clone(), data.clone()).is_none();
                    inner.fire_data(path);
                    if created {
                        inner.fire_children(path);
                    }
                    WriteResult::Set
                }
                WriteOp::Remove { path } => {
                    inner.remove_node(path);
                    WriteResult::Removed
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    fn try_remove(&self, path: &str) -> Result<bool, CoordinatorError> {
        let mut inner = self.inner.lock();
        inner.check_online()?;
        Ok(inner.remove_node(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_index_is_fixed_width_and_ordered() {
        assert_eq!(pad_index(5), "0000000005");
        assert_eq!(pad_index(0), "0000000000");
        assert_eq!(pad_index(1234567890), "1234567890");
        assert!(pad_index(5) < pad_index(42));
        assert!(pad_index(42) < pad_index(1000));

        let negative = pad_index(-5);
        assert_eq!(negative, "00000000-5");
        assert_eq!(negative.len(), pad_index(5).len());
        assert!(negative.contains('-'));
        assert_ne!(negative, pad_index(5));
    }

    #[test]
    fn parse_index_roundtrips_generated_names() {
        assert_eq!(parse_index("log-0000000042", "log-"), Some(42));
        assert_eq!(parse_index("log-0000000000", "log-"), Some(0));
        assert_eq!(parse_index("queue-0000000042", "log-"), None);
        assert_eq!(parse_index("log-42", "log-"), None);
    }

    #[test]
    fn sequential_nodes_continue_after_snapshot() {
        let mut snapshot = BTreeMap::new();
        snapshot.insert("/t/log/log-0000000007".to_string(), "{}".to_string());
        let coordinator = InMemoryCoordinator::from_snapshot(snapshot);

        let path = coordinator.put_sequential("/t/log/log-", "{}");
        assert_eq!(path, "/t/log/log-0000000008");

        let mut children = coordinator.list_children("/t/log", None).unwrap();
        children.sort();
        assert_eq!(children, vec!["log-0000000007", "log-0000000008"]);
    }

    #[test]
    fn intermediate_directories_are_listed() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.put("/t/block_numbers/p/block-0000000001", "");
        coordinator.put("/t/block_numbers/p/block-0000000002", "");
        coordinator.put("/t/block_numbers/p-2/block-0000000001", "");

        let mut partitions = coordinator.list_children("/t/block_numbers", None).unwrap();
        partitions.sort();
        assert_eq!(partitions, vec!["p", "p-2"]);
        assert!(coordinator.list_children("/t/nothing", None).unwrap().is_empty());
    }

    #[test]
    fn failed_multi_has_no_effect() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.put("/a", "1");

        let err = coordinator
            .multi(&[
                WriteOp::Set {
                    path: "/b".into(),
                    data: "2".into(),
                },
                WriteOp::Create {
                    path: "/a".into(),
                    data: "3".into(),
                },
            ])
            .unwrap_err();
        assert_eq!(err, CoordinatorError::NodeExists("/a".into()));
        assert_eq!(coordinator.get_data("/b").unwrap(), None);
        assert_eq!(coordinator.get_data("/a").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn watches_fire_once() {
        let coordinator = InMemoryCoordinator::new();
        let event = UpdateEvent::new();

        assert!(!coordinator.exists("/t/log/log-0000000000", Some(&event)).unwrap());
        coordinator.put_sequential("/t/log/log-", "{}");
        assert!(event.reset());

        coordinator.put_sequential("/t/log/log-", "{}");
        assert!(!event.is_set());

        coordinator.list_children("/t/log", Some(&event)).unwrap();
        coordinator.put_sequential("/t/log/log-", "{}");
        assert!(event.wait_for(Duration::from_millis(10)));
    }

    #[test]
    fn offline_coordinator_reports_connection_loss() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.set_offline(true);
        assert_eq!(
            coordinator.get_data("/a").unwrap_err(),
            CoordinatorError::ConnectionLoss
        );
        coordinator.set_offline(false);
        coordinator.fail_multis_after(Some(0));
        assert_eq!(
            coordinator.multi(&[]).unwrap_err(),
            CoordinatorError::ConnectionLoss
        );
    }
}

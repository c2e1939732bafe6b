// Queue Configuration
//
// Coordinator layout and batching knobs, loaded from JSON.

use serde::{Deserialize, Serialize};

/// Default cap on operations in one coordinator multi-request. Large
/// requests can exceed the coordinator's per-request size limit.
pub const DEFAULT_MAX_MULTI_OPS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Shared table root: `log`, `mutations`, `block_numbers`, `temp`.
    pub zookeeper_path: String,
    /// This replica's root: `queue`, `log_pointer`, insert-time watermarks.
    pub replica_path: String,
    pub max_multi_ops: usize,
    pub logger_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl QueueConfig {
    /// Built-in layout (used if no config is provided).
    pub fn default_config() -> Self {
        Self {
            zookeeper_path: "/clickhouse/tables/default".into(),
            replica_path: "/clickhouse/tables/default/replicas/replica_1".into(),
            max_multi_ops: DEFAULT_MAX_MULTI_OPS,
            logger_name: "ReplicationQueue".into(),
        }
    }

    pub fn for_paths(zookeeper_path: impl Into<String>, replica_path: impl Into<String>) -> Self {
        Self {
            zookeeper_path: zookeeper_path.into(),
            replica_path: replica_path.into(),
            ..Self::default_config()
        }
    }

    pub fn log_dir(&self) -> String {
        format!("{}/log", self.zookeeper_path)
    }

    pub fn mutations_dir(&self) -> String {
        format!("{}/mutations", self.zookeeper_path)
    }

    pub fn block_numbers_dir(&self) -> String {
        format!("{}/block_numbers", self.zookeeper_path)
    }

    pub fn temp_dir(&self) -> String {
        format!("{}/temp", self.zookeeper_path)
    }

    pub fn queue_dir(&self) -> String {
        format!("{}/queue", self.replica_path)
    }

    pub fn log_pointer_path(&self) -> String {
        format!("{}/log_pointer", self.replica_path)
    }

    pub fn min_unprocessed_insert_time_path(&self) -> String {
        format!("{}/min_unprocessed_insert_time", self.replica_path)
    }

    pub fn max_processed_insert_time_path(&self) -> String {
        format!("{}/max_processed_insert_time", self.replica_path)
    }
}

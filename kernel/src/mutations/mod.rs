// Mutation Index
//
// Pending schema/data mutations, indexed by partition and block number.
// A mutation with block number N must be applied to every part of the
// partition whose data version is below N.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::log::Timestamp;
use crate::parts::PartInfo;

/// Transform applied to the rows of a part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationCommand {
    Delete {
        predicate: String,
    },
    Update {
        predicate: String,
        assignments: BTreeMap<String, String>,
    },
}

/// A mutation as stored in the coordinator under `<table>/mutations/<znode>`.
///
/// One mutation carries its own block number in every partition it touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEntry {
    #[serde(skip)]
    pub znode_name: String,
    #[serde(default)]
    pub create_time: Timestamp,
    pub commands: Vec<MutationCommand>,
    pub block_numbers: BTreeMap<String, i64>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("mutation with version {version} not found in partition {partition_id}")]
    NotFound { partition_id: String, version: i64 },
}

impl MutationEntry {
    pub fn new(znode_name: impl Into<String>, commands: Vec<MutationCommand>) -> Self {
        Self {
            znode_name: znode_name.into(),
            create_time: 0,
            commands,
            block_numbers: BTreeMap::new(),
        }
    }

    pub fn with_block(mut self, partition_id: impl Into<String>, block_number: i64) -> Self {
        self.block_numbers.insert(partition_id.into(), block_number);
        self
    }

    pub fn block_number(&self, partition_id: &str) -> Option<i64> {
        self.block_numbers.get(partition_id).copied()
    }

    pub fn parse(znode_name: &str, data: &str) -> Result<Self, serde_json::Error> {
        let mut entry: MutationEntry = serde_json::from_str(data)?;
        entry.znode_name = znode_name.to_string();
        Ok(entry)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Live mutations owned by znode name; the partition index refers back by name.
#[derive(Debug, Clone, Default)]
pub struct MutationIndex {
    by_znode: BTreeMap<String, MutationEntry>,
    by_partition: HashMap<String, BTreeMap<i64, String>>,
}

impl MutationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `entry`. Returns `false` if its znode is already known.
    pub fn add(&mut self, entry: MutationEntry) -> bool {
        if self.by_znode.contains_key(&entry.znode_name) {
            return false;
        }
        for (partition_id, block_number) in &entry.block_numbers {
            self.by_partition
                .entry(partition_id.clone())
                .or_default()
                .insert(*block_number, entry.znode_name.clone());
        }
        self.by_znode.insert(entry.znode_name.clone(), entry);
        true
    }

    pub fn remove(&mut self, znode_name: &str) -> Option<MutationEntry> {
        let entry = self.by_znode.remove(znode_name)?;
        for (partition_id, block_number) in &entry.block_numbers {
            if let Some(in_partition) = self.by_partition.get_mut(partition_id) {
                in_partition.remove(block_number);
                if in_partition.is_empty() {
                    self.by_partition.remove(partition_id);
                }
            }
        }
        Some(entry)
    }

    pub fn contains(&self, znode_name: &str) -> bool {
        self.by_znode.contains_key(znode_name)
    }

    pub fn znode_names(&self) -> impl Iterator<Item = &str> {
        self.by_znode.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_znode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_znode.is_empty()
    }

    /// Smallest mutation version in the part's partition that the part has not seen yet.
    pub fn first_unapplied_version(&self, part: &PartInfo) -> Option<i64> {
        self.by_partition
            .get(&part.partition_id)?
            .range(part.data_version() + 1..)
            .next()
            .map(|(version, _)| *version)
    }

    /// Latest mutation the part does not need: either applied already or
    /// older than the part itself.
    pub fn current_version(&self, part: &PartInfo) -> Option<i64> {
        self.by_partition
            .get(&part.partition_id)?
            .range(..=part.data_version())
            .next_back()
            .map(|(version, _)| *version)
    }

    pub fn max_version(&self, partition_id: &str) -> Option<i64> {
        self.by_partition
            .get(partition_id)?
            .keys()
            .next_back()
            .copied()
    }

    pub fn has_version(&self, partition_id: &str, version: i64) -> bool {
        self.by_partition
            .get(partition_id)
            .is_some_and(|in_partition| in_partition.contains_key(&version))
    }

    /// Commands taking `part` from its data version up to `version`, in order.
    pub fn commands_for(
        &self,
        part: &PartInfo,
        version: i64,
    ) -> Result<Vec<MutationCommand>, MutationError> {
        let not_found = || MutationError::NotFound {
            partition_id: part.partition_id.clone(),
            version,
        };
        let in_partition = self.by_partition.get(&part.partition_id).ok_or_else(not_found)?;
        if !in_partition.contains_key(&version) {
            return Err(not_found());
        }

        let from = part.data_version();
        if version <= from {
            return Ok(Vec::new());
        }
        let commands = in_partition
            .range(from + 1..=version)
            .filter_map(|(_, znode)| self.by_znode.get(znode))
            .flat_map(|entry| entry.commands.iter().cloned())
            .collect();
        Ok(commands)
    }
}

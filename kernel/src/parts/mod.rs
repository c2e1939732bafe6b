// Part Naming & Ranges
//
// A data part is identified by its partition and the contiguous range of
// insert block numbers it holds. Merges widen the range and bump the level,
// mutations rewrite a part in place and stamp it with the mutation version.
//
// Name format: `<partition>_<min_block>_<max_block>_<level>[_<mutation>]`

use serde::{Deserialize, Serialize};
use std::fmt;

mod active_set;

pub use active_set::{ActivePartSet, DisableScope, DisabledRange};

/// Level used by synthetic range parts (drop ranges, disabled ranges).
pub const MAX_LEVEL: u32 = 999_999_999;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PartNameError {
    #[error("unexpected part name `{name}`: {reason}")]
    Malformed { name: String, reason: &'static str },
}

/// Parsed part name.
///
/// Field order matters: the derived ordering sorts parts of one partition
/// by their block range, which `ActivePartSet` relies on for range scans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartInfo {
    pub partition_id: String,
    pub min_block: i64,
    pub max_block: i64,
    pub level: u32,
    pub mutation: i64,
}

impl PartInfo {
    pub fn new(partition_id: impl Into<String>, min_block: i64, max_block: i64, level: u32) -> Self {
        Self {
            partition_id: partition_id.into(),
            min_block,
            max_block,
            level,
            mutation: 0,
        }
    }

    pub fn from_part_name(name: &str) -> Result<Self, PartNameError> {
        let malformed = |reason| PartNameError::Malformed {
            name: name.to_string(),
            reason,
        };

        let mut fields = name.split('_');
        let partition_id = fields
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| malformed("empty partition id"))?;

        let numbers = fields
            .map(|f| f.parse::<i64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| malformed("block numbers must be integers"))?;

        let (min_block, max_block, level, mutation) = match numbers.as_slice() {
            [min, max, level] => (*min, *max, *level, 0),
            [min, max, level, mutation] => (*min, *max, *level, *mutation),
            _ => return Err(malformed("expected 3 or 4 numeric fields")),
        };

        if min_block > max_block {
            return Err(malformed("min block is greater than max block"));
        }
        let level = u32::try_from(level).map_err(|_| malformed("level out of range"))?;

        Ok(Self {
            partition_id: partition_id.to_string(),
            min_block,
            max_block,
            level,
            mutation,
        })
    }

    pub fn part_name(&self) -> String {
        self.to_string()
    }

    /// Version of the data inside the part: the mutation that produced it,
    /// or the first insert block if it was never mutated.
    pub fn data_version(&self) -> i64 {
        if self.mutation != 0 {
            self.mutation
        } else {
            self.min_block
        }
    }

    /// Synthetic range rather than a real part: a drop range or a
    /// disabled range.
    pub fn is_range(&self) -> bool {
        self.level == MAX_LEVEL
    }

    /// Whether `other` lies inside this part.
    ///
    /// A synthetic range holds every version of the blocks it spans, so
    /// only real parts compare mutation versions.
    pub fn contains(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.min_block
            && self.max_block >= other.max_block
            && self.level >= other.level
            && (self.is_range() || self.mutation >= other.mutation)
    }

    /// Whether the block ranges of the two parts share at least one block.
    pub fn intersects(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.max_block
            && other.min_block <= self.max_block
    }

    /// Range covering every block of a partition, used as a scan bound.
    pub(crate) fn partition_bounds(partition_id: &str) -> (PartInfo, PartInfo) {
        let lower = PartInfo {
            partition_id: partition_id.to_string(),
            min_block: i64::MIN,
            max_block: i64::MIN,
            level: 0,
            mutation: i64::MIN,
        };
        let upper = PartInfo {
            partition_id: partition_id.to_string(),
            min_block: i64::MAX,
            max_block: i64::MAX,
            level: u32::MAX,
            mutation: i64::MAX,
        };
        (lower, upper)
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.partition_id, self.min_block, self.max_block, self.level
        )?;
        if self.mutation != 0 {
            write!(f, "_{}", self.mutation)?;
        }
        Ok(())
    }
}

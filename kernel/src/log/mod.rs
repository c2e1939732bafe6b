// Replication Log Entries
//
// Actions recorded in the shared replication log and copied into each
// replica's queue. The set of actions is closed: every consumer matches
// `LogEntryKind` exhaustively.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::parts::{PartInfo, PartNameError};

pub mod store;

pub use store::{
    pad_index, parse_index, Coordinator, CoordinatorError, InMemoryCoordinator, UpdateEvent,
    WriteOp, WriteResult,
};

/// Unix timestamp in seconds; 0 means unknown.
pub type Timestamp = i64;

/// Identity of an entry held in this replica's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntryKind {
    /// Fetch `new_part_name` from a replica that has it.
    GetPart,
    /// Attach a part from the detached directory.
    AttachPart { source_part: String },
    MergeParts {
        source_parts: Vec<String>,
        #[serde(default)]
        deduplicate: bool,
    },
    MutatePart { source_part: String },
    /// Delete (or detach) every part inside the `new_part_name` range.
    DropRange {
        #[serde(default)]
        detach: bool,
    },
    ClearColumn { column_name: String },
    /// Drop the `new_part_name` range and attach `new_part_names` in its place.
    ReplaceRange {
        #[serde(default)]
        source_table: String,
        new_part_names: Vec<String>,
    },
}

impl LogEntryKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            LogEntryKind::GetPart => "GET_PART",
            LogEntryKind::AttachPart { .. } => "ATTACH_PART",
            LogEntryKind::MergeParts { .. } => "MERGE_PARTS",
            LogEntryKind::MutatePart { .. } => "MUTATE_PART",
            LogEntryKind::DropRange { .. } => "DROP_RANGE",
            LogEntryKind::ClearColumn { .. } => "CLEAR_COLUMN",
            LogEntryKind::ReplaceRange { .. } => "REPLACE_RANGE",
        }
    }

    /// Kinds whose result is a single new part named `new_part_name`.
    pub fn produces_part(&self) -> bool {
        match self {
            LogEntryKind::GetPart
            | LogEntryKind::AttachPart { .. }
            | LogEntryKind::MergeParts { .. }
            | LogEntryKind::MutatePart { .. } => true,
            LogEntryKind::DropRange { .. }
            | LogEntryKind::ClearColumn { .. }
            | LogEntryKind::ReplaceRange { .. } => false,
        }
    }
}

impl fmt::Display for LogEntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Immutable payload of a log entry, as stored in the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntryData {
    pub kind: LogEntryKind,
    pub new_part_name: String,
    #[serde(default)]
    pub source_replica: String,
    #[serde(default)]
    pub create_time: Timestamp,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("malformed log entry at {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("log entry at {path} names an invalid part: {source}")]
    BadPartName {
        path: String,
        #[source]
        source: PartNameError,
    },
}

impl LogEntryData {
    pub fn new(kind: LogEntryKind, new_part_name: impl Into<String>) -> Self {
        Self {
            kind,
            new_part_name: new_part_name.into(),
            source_replica: String::new(),
            create_time: 0,
        }
    }

    pub fn with_create_time(mut self, create_time: Timestamp) -> Self {
        self.create_time = create_time;
        self
    }

    pub fn get_part(part: impl Into<String>) -> Self {
        Self::new(LogEntryKind::GetPart, part)
    }

    pub fn merge_parts<I, S>(sources: I, part: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            LogEntryKind::MergeParts {
                source_parts: sources.into_iter().map(Into::into).collect(),
                deduplicate: false,
            },
            part,
        )
    }

    pub fn mutate_part(source: impl Into<String>, part: impl Into<String>) -> Self {
        Self::new(
            LogEntryKind::MutatePart {
                source_part: source.into(),
            },
            part,
        )
    }

    pub fn drop_range(range: impl Into<String>) -> Self {
        Self::new(LogEntryKind::DropRange { detach: false }, range)
    }

    pub fn clear_column(column: impl Into<String>, range: impl Into<String>) -> Self {
        Self::new(
            LogEntryKind::ClearColumn {
                column_name: column.into(),
            },
            range,
        )
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, LogEntryKind::GetPart)
    }

    /// Parts that must already exist for this entry to run.
    pub fn source_parts(&self) -> Vec<&str> {
        match &self.kind {
            LogEntryKind::MergeParts { source_parts, .. } => {
                source_parts.iter().map(String::as_str).collect()
            }
            LogEntryKind::MutatePart { source_part } => vec![source_part.as_str()],
            LogEntryKind::GetPart
            | LogEntryKind::AttachPart { .. }
            | LogEntryKind::DropRange { .. }
            | LogEntryKind::ClearColumn { .. }
            | LogEntryKind::ReplaceRange { .. } => Vec::new(),
        }
    }

    /// Every part (or range) this entry claims while it executes.
    pub fn produced_parts(&self) -> Vec<&str> {
        let mut parts = vec![self.new_part_name.as_str()];
        if let LogEntryKind::ReplaceRange { new_part_names, .. } = &self.kind {
            parts.extend(new_part_names.iter().map(String::as_str));
        }
        parts
    }

    /// Parsed form of every name in `produced_parts`, first element is `new_part_name`.
    pub fn produced_part_infos(&self) -> Result<Vec<PartInfo>, PartNameError> {
        self.produced_parts()
            .into_iter()
            .map(PartInfo::from_part_name)
            .collect()
    }

    pub fn encode(&self) -> String {
        // Serializing plain strings and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode an entry read from `path`, rejecting entries with unusable part names.
    pub fn decode(path: &str, data: &str) -> Result<Self, LogError> {
        let entry: LogEntryData = serde_json::from_str(data).map_err(|source| LogError::Malformed {
            path: path.to_string(),
            source,
        })?;

        let mut names = entry.produced_parts();
        names.extend(entry.source_parts());
        for name in names {
            PartInfo::from_part_name(name).map_err(|source| LogError::BadPartName {
                path: path.to_string(),
                source,
            })?;
        }
        Ok(entry)
    }
}

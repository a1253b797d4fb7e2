use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

/// Event number carried by a stream's tombstone record.
pub const TOMBSTONE_EVENT_NUMBER: i64 = i64::MAX;

/// Monotonic boundary over a stream's event numbers: every event below it may go.
///
/// Stored as the first event number to keep, so combining two points is `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscardPoint(i64);

impl DiscardPoint {
    pub const KEEP_ALL: DiscardPoint = DiscardPoint(0);

    /// Discards every event except the tombstone.
    pub const DISCARD_ALL: DiscardPoint = DiscardPoint(TOMBSTONE_EVENT_NUMBER);

    pub fn discard_before(first_event_number_to_keep: i64) -> Self {
        Self(first_event_number_to_keep.max(0))
    }

    pub fn discard_including(event_number: i64) -> Self {
        Self::discard_before(event_number.saturating_add(1))
    }

    pub fn first_event_number_to_keep(&self) -> i64 {
        self.0
    }

    pub fn should_discard(&self, event_number: i64) -> bool {
        event_number < self.0
    }

    /// The later of the two boundaries.
    #[must_use]
    pub fn or(self, other: DiscardPoint) -> Self {
        self.max(other)
    }
}

impl Default for DiscardPoint {
    fn default() -> Self {
        Self::KEEP_ALL
    }
}

impl fmt::Display for DiscardPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DiscardPoint::KEEP_ALL => write!(f, "KeepAll"),
            DiscardPoint::DISCARD_ALL => write!(f, "DiscardAll"),
            DiscardPoint(n) => write!(f, "DiscardBefore({n})"),
        }
    }
}

/// Per-metastream scavenge data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetastreamData {
    pub is_tombstoned: bool,
    pub discard_point: DiscardPoint,
}

impl MetastreamData {
    pub const EMPTY: MetastreamData = MetastreamData {
        is_tombstoned: false,
        discard_point: DiscardPoint::KEEP_ALL,
    };
}

/// Calculation progress of an original stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalculationStatus {
    /// Needs calculating on the next run.
    #[default]
    Active,
    /// Nothing left to do until the stream changes.
    Archived,
    /// Fully scavenged; the cleaner may delete the row.
    Spent,
}

impl CalculationStatus {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            CalculationStatus::Active => 0,
            CalculationStatus::Archived => 1,
            CalculationStatus::Spent => 2,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(CalculationStatus::Active),
            1 => Some(CalculationStatus::Archived),
            2 => Some(CalculationStatus::Spent),
            _ => None,
        }
    }
}

/// Accumulated and calculated data for an original (non-meta) stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OriginalStreamData {
    pub max_age: Option<Duration>,
    pub max_count: Option<u64>,
    pub truncate_before: Option<i64>,
    pub is_tombstoned: bool,
    pub discard_point: DiscardPoint,
    pub maybe_discard_point: DiscardPoint,
    pub status: CalculationStatus,
}

impl OriginalStreamData {
    pub fn execution_info(&self) -> ChunkExecutionInfo {
        ChunkExecutionInfo {
            is_tombstoned: self.is_tombstoned,
            discard_point: self.discard_point,
            maybe_discard_point: self.maybe_discard_point,
            max_age: self.max_age,
        }
    }
}

/// What the chunk executor needs to know about a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkExecutionInfo {
    pub is_tombstoned: bool,
    pub discard_point: DiscardPoint,
    pub maybe_discard_point: DiscardPoint,
    pub max_age: Option<Duration>,
}

impl ChunkExecutionInfo {
    /// Used for streams with no recorded state.
    pub const KEEP_ALL: ChunkExecutionInfo = ChunkExecutionInfo {
        is_tombstoned: false,
        discard_point: DiscardPoint::KEEP_ALL,
        maybe_discard_point: DiscardPoint::KEEP_ALL,
        max_age: None,
    };
}

impl From<MetastreamData> for ChunkExecutionInfo {
    fn from(value: MetastreamData) -> Self {
        ChunkExecutionInfo {
            is_tombstoned: value.is_tombstoned,
            discard_point: value.discard_point,
            maybe_discard_point: DiscardPoint::KEEP_ALL,
            max_age: None,
        }
    }
}

/// Oldest and newest record timestamps seen in a logical chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTimeStampRange {
    pub min: Timestamp,
    pub max: Timestamp,
}

impl ChunkTimeStampRange {
    pub fn new(min: Timestamp, max: Timestamp) -> Self {
        Self { min, max }
    }
}

/// Resumable position within the original-stream tables.
///
/// Hash-keyed rows sort before id-keyed (collision) rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum StreamHandle {
    Hash(u64),
    Id(String),
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamHandle::Hash(hash) => write!(f, "Hash: {hash}"),
            StreamHandle::Id(id) => write!(f, "Id: {id}"),
        }
    }
}

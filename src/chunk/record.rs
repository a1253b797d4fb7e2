use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{chunk::ChunkResult, timestamp::Timestamp};

/// Physical record type in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// Carries an event; the only kind that can be scavenged.
    Prepare,
    /// Commits previously written prepares.
    Commit,
    /// Chunk and epoch bookkeeping.
    System,
}

/// A record as stored in a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub log_position: u64,
    /// Nil for control records.
    pub event_id: Ulid,
    pub kind: RecordKind,
    pub stream_id: String,
    /// Negative while the event number is not yet assigned.
    pub event_number: i64,
    pub event_type: String,
    pub timestamp: Timestamp,
    pub data: Vec<u8>,
}

impl LogRecord {
    pub fn prepare(
        stream_id: impl Into<String>,
        event_number: i64,
        event_type: impl Into<String>,
        timestamp: Timestamp,
        data: Vec<u8>,
    ) -> Self {
        Self {
            log_position: 0,
            event_id: Ulid::new(),
            kind: RecordKind::Prepare,
            stream_id: stream_id.into(),
            event_number,
            event_type: event_type.into(),
            timestamp,
            data,
        }
    }

    pub fn commit(timestamp: Timestamp) -> Self {
        Self::control(RecordKind::Commit, timestamp)
    }

    pub fn system(timestamp: Timestamp) -> Self {
        Self::control(RecordKind::System, timestamp)
    }

    fn control(kind: RecordKind, timestamp: Timestamp) -> Self {
        Self {
            log_position: 0,
            event_id: Ulid::nil(),
            kind,
            stream_id: String::new(),
            event_number: -1,
            event_type: String::new(),
            timestamp,
            data: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_event_id(self, event_id: Ulid) -> Self {
        Self { event_id, ..self }
    }

    #[must_use]
    pub fn at(self, log_position: u64) -> Self {
        Self {
            log_position,
            ..self
        }
    }

    pub fn is_scavengable(&self) -> bool {
        self.kind == RecordKind::Prepare
    }

    /// The fields the discard decision needs.
    pub fn for_scavenge(&self) -> RecordForScavenge<'_> {
        RecordForScavenge {
            stream_id: &self.stream_id,
            event_number: self.event_number,
            timestamp: self.timestamp,
            is_scavengable: self.is_scavengable(),
        }
    }

    /// Bytes of log this record occupies.
    pub fn size_on_log(&self) -> u64 {
        // fixed part: position, kind, event number, timestamp, length prefixes
        (40 + self.stream_id.len() + self.event_type.len() + self.data.len()) as u64
    }

    pub(crate) fn encode(&self) -> ChunkResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> ChunkResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Read-only projection of a [`LogRecord`] used to decide whether to keep it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordForScavenge<'a> {
    pub stream_id: &'a str,
    pub event_number: i64,
    pub timestamp: Timestamp,
    pub is_scavengable: bool,
}

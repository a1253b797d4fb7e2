//! Minimal event-log access used to persist scavenge point markers.

use std::{future::Future, pin::Pin};

use ulid::Ulid;

use crate::timestamp::Timestamp;

/// Expected version meaning "the stream must not exist yet".
pub const EXPECTED_VERSION_NO_STREAM: i64 = -1;

/// An event as stored in the log, with its envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub event_id: Ulid,
    pub stream_id: String,
    pub event_number: i64,
    pub event_type: String,
    pub data: Vec<u8>,
    /// Byte offset of the event's record in the log.
    pub log_position: u64,
    pub timestamp: Timestamp,
}

/// An event to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_id: Ulid,
    pub event_type: String,
    pub data: Vec<u8>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            event_id: Ulid::new(),
            event_type: event_type.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStreamResult {
    Success(Vec<StoredEvent>),
    NoStream,
    StreamDeleted,
    AccessDenied,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Success { event_number: i64 },
    WrongExpectedVersion { current: i64 },
    StreamDeleted,
    Error(String),
}

/// Read-backward-by-one and conditional append against a single stream.
///
/// Implementations report failures through the result enums; callers decide
/// whether to retry.
pub trait EventLog: Send + Sync {
    /// Read the last event of `stream_id`.
    fn read_last_event<'a>(
        &'a self,
        stream_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ReadStreamResult> + Send + 'a>>;

    /// Append `event` if the stream's last event number equals `expected_version`.
    fn append_event<'a>(
        &'a self,
        stream_id: &'a str,
        expected_version: i64,
        event: NewEvent,
    ) -> Pin<Box<dyn Future<Output = WriteResult> + Send + 'a>>;
}

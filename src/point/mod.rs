//! Scavenge points: immutable markers bounding a scavenge run.
//!
//! Each point is an event in the `$scavengePoints` system stream. Its position,
//! number and timestamp come from the stored event's envelope; the payload only
//! carries the threshold.

mod log;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use log::{
    EventLog, NewEvent, ReadStreamResult, StoredEvent, WriteResult, EXPECTED_VERSION_NO_STREAM,
};

use crate::{
    observability::{log_info, log_warn},
    timestamp::Timestamp,
};

/// System stream holding the scavenge point events.
pub const SCAVENGE_POINTS_STREAM: &str = "$scavengePoints";
/// Event type of a scavenge point event.
pub const SCAVENGE_POINT_EVENT_TYPE: &str = "$scavengePoint";

/// Bounds of one scavenge run.
///
/// `effective_now` is fixed for the whole run so age decisions do not drift
/// while the run is in progress. Points order by `event_number`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScavengePoint {
    event_number: i64,
    position: u64,
    effective_now: Timestamp,
    threshold: i32,
}

impl ScavengePoint {
    pub fn new(position: u64, event_number: i64, effective_now: Timestamp, threshold: i32) -> Self {
        Self {
            event_number,
            position,
            effective_now,
            threshold,
        }
    }

    /// Log position the run is bounded by.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn event_number(&self) -> i64 {
        self.event_number
    }

    pub fn effective_now(&self) -> Timestamp {
        self.effective_now
    }

    /// Minimum chunk weight before a chunk is rewritten.
    pub fn threshold(&self) -> i32 {
        self.threshold
    }
}

impl fmt::Display for ScavengePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SP-{}", self.event_number)
    }
}

/// JSON body of a scavenge point event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScavengePointPayload {
    pub threshold: i32,
}

impl ScavengePointPayload {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, ScavengePointError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ScavengePointError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Error)]
pub enum ScavengePointError {
    #[error("failed to get latest scavenge point: {0}")]
    Read(String),
    #[error("failed to add new scavenge point: {0}")]
    Write(String),
    #[error("unexpected scavenge point state: {0}")]
    Unexpected(String),
    #[error("invalid scavenge point payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Reads and appends scavenge points through an [`EventLog`].
///
/// Failures are reported as is; nothing here retries.
pub struct ScavengePointSource<L> {
    log: L,
}

impl<L> ScavengePointSource<L>
where
    L: EventLog,
{
    pub fn new(log: L) -> Self {
        Self { log }
    }

    pub fn event_log(&self) -> &L {
        &self.log
    }

    /// The most recent scavenge point, or `None` if none was ever written.
    pub async fn latest_scavenge_point(&self) -> Result<Option<ScavengePoint>, ScavengePointError> {
        log_info!(
            component = "scavenge_point",
            event = "latest_scavenge_point_reading",
        );

        let events = match self.log.read_last_event(SCAVENGE_POINTS_STREAM).await {
            ReadStreamResult::Success(events) => events,
            ReadStreamResult::NoStream => Vec::new(),
            ReadStreamResult::StreamDeleted => {
                return Err(ScavengePointError::Read("StreamDeleted".into()))
            }
            ReadStreamResult::AccessDenied => {
                return Err(ScavengePointError::Read("AccessDenied".into()))
            }
            ReadStreamResult::Error(message) => {
                return Err(ScavengePointError::Read(format!("Error. {message}")))
            }
        };

        let event = match events.as_slice() {
            [] => {
                log_info!(
                    component = "scavenge_point",
                    event = "no_scavenge_points",
                );
                return Ok(None);
            }
            [event] => event,
            _ => {
                return Err(ScavengePointError::Unexpected(format!(
                    "expected 1 event but got {}",
                    events.len()
                )))
            }
        };

        let payload = ScavengePointPayload::from_bytes(&event.data)?;
        let scavenge_point = ScavengePoint::new(
            event.log_position,
            event.event_number,
            event.timestamp,
            payload.threshold,
        );
        log_info!(
            component = "scavenge_point",
            event = "latest_scavenge_point_read",
            scavenge_point = %scavenge_point,
            position = scavenge_point.position(),
            threshold = scavenge_point.threshold(),
        );
        Ok(Some(scavenge_point))
    }

    /// Append a scavenge point, requiring the stream's last event to be `expected_version`.
    ///
    /// A stale `expected_version` fails instead of creating two points with the
    /// same number.
    pub async fn add_scavenge_point(
        &self,
        expected_version: i64,
        threshold: i32,
    ) -> Result<ScavengePoint, ScavengePointError> {
        let expected_number = expected_version + 1;
        log_info!(
            component = "scavenge_point",
            event = "scavenge_point_adding",
            event_number = expected_number,
            threshold,
        );

        let payload = ScavengePointPayload { threshold }.to_json_bytes()?;
        let event = NewEvent::new(SCAVENGE_POINT_EVENT_TYPE, payload);
        match self
            .log
            .append_event(SCAVENGE_POINTS_STREAM, expected_version, event)
            .await
        {
            WriteResult::Success { .. } => {}
            WriteResult::WrongExpectedVersion { current } => {
                log_warn!(
                    component = "scavenge_point",
                    event = "scavenge_point_conflict",
                    expected_version,
                    current,
                );
                return Err(ScavengePointError::Write(format!(
                    "WrongExpectedVersion (expected {expected_version}, current {current})"
                )));
            }
            WriteResult::StreamDeleted => {
                return Err(ScavengePointError::Write("StreamDeleted".into()))
            }
            WriteResult::Error(message) => {
                return Err(ScavengePointError::Write(format!("Error. {message}")))
            }
        }

        let scavenge_point = self.latest_scavenge_point().await?.ok_or_else(|| {
            ScavengePointError::Unexpected("scavenge point missing after write".into())
        })?;
        if scavenge_point.event_number() != expected_number {
            return Err(ScavengePointError::Unexpected(format!(
                "new scavenge point is number {} instead of {expected_number}",
                scavenge_point.event_number()
            )));
        }

        log_info!(
            component = "scavenge_point",
            event = "scavenge_point_added",
            scavenge_point = %scavenge_point,
        );
        Ok(scavenge_point)
    }
}

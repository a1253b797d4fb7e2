//! Resumption markers for the scavenge pipeline.
//!
//! Exactly one checkpoint is persisted at a time. It names the stage in
//! progress, the scavenge point that run belongs to, and how far the stage got.
//! `None` progress means nothing in the stage is done yet, not "unit zero".

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{point::ScavengePoint, state::StreamHandle};

/// How far a scavenge run has progressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum ScavengeCheckpoint {
    /// Scanning the log into the scavenge state.
    Accumulating {
        scavenge_point: ScavengePoint,
        done_logical_chunk_number: Option<u32>,
    },
    /// Turning accumulated metadata into discard points and chunk weights.
    Calculating {
        scavenge_point: ScavengePoint,
        done_stream_handle: Option<StreamHandle>,
    },
    /// Rewriting physical chunks.
    ExecutingChunks {
        scavenge_point: ScavengePoint,
        done_logical_chunk_number: Option<u32>,
    },
    /// Merging small rewritten chunks.
    MergingChunks { scavenge_point: ScavengePoint },
    /// Removing per-stream state that is no longer needed.
    Cleaning { scavenge_point: ScavengePoint },
    /// The run for this scavenge point is finished.
    Done { scavenge_point: ScavengePoint },
}

/// Stage discriminant, persisted next to the serialized checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScavengeStage {
    Accumulating,
    Calculating,
    ExecutingChunks,
    MergingChunks,
    Cleaning,
    Done,
}

impl ScavengeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScavengeStage::Accumulating => "Accumulating",
            ScavengeStage::Calculating => "Calculating",
            ScavengeStage::ExecutingChunks => "ExecutingChunks",
            ScavengeStage::MergingChunks => "MergingChunks",
            ScavengeStage::Cleaning => "Cleaning",
            ScavengeStage::Done => "Done",
        }
    }
}

impl ScavengeCheckpoint {
    pub fn scavenge_point(&self) -> &ScavengePoint {
        match self {
            ScavengeCheckpoint::Accumulating { scavenge_point, .. }
            | ScavengeCheckpoint::Calculating { scavenge_point, .. }
            | ScavengeCheckpoint::ExecutingChunks { scavenge_point, .. }
            | ScavengeCheckpoint::MergingChunks { scavenge_point }
            | ScavengeCheckpoint::Cleaning { scavenge_point }
            | ScavengeCheckpoint::Done { scavenge_point } => scavenge_point,
        }
    }

    pub fn stage(&self) -> ScavengeStage {
        match self {
            ScavengeCheckpoint::Accumulating { .. } => ScavengeStage::Accumulating,
            ScavengeCheckpoint::Calculating { .. } => ScavengeStage::Calculating,
            ScavengeCheckpoint::ExecutingChunks { .. } => ScavengeStage::ExecutingChunks,
            ScavengeCheckpoint::MergingChunks { .. } => ScavengeStage::MergingChunks,
            ScavengeCheckpoint::Cleaning { .. } => ScavengeStage::Cleaning,
            ScavengeCheckpoint::Done { .. } => ScavengeStage::Done,
        }
    }
}

fn fmt_done<T: fmt::Debug>(f: &mut fmt::Formatter<'_>, done: &Option<T>) -> fmt::Result {
    match done {
        Some(done) => write!(f, "done Some({done:?})"),
        None => write!(f, "done None"),
    }
}

impl fmt::Display for ScavengeCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScavengeCheckpoint::Accumulating {
                scavenge_point,
                done_logical_chunk_number,
            } => {
                write!(f, "Accumulating {scavenge_point} ")?;
                fmt_done(f, done_logical_chunk_number)
            }
            ScavengeCheckpoint::Calculating {
                scavenge_point,
                done_stream_handle,
            } => {
                write!(f, "Calculating {scavenge_point} ")?;
                match done_stream_handle {
                    Some(handle) => write!(f, "done Some({handle})"),
                    None => write!(f, "done None"),
                }
            }
            ScavengeCheckpoint::ExecutingChunks {
                scavenge_point,
                done_logical_chunk_number,
            } => {
                write!(f, "Executing chunks for {scavenge_point} ")?;
                fmt_done(f, done_logical_chunk_number)
            }
            ScavengeCheckpoint::MergingChunks { scavenge_point } => {
                write!(f, "Merging chunks for {scavenge_point}")
            }
            ScavengeCheckpoint::Cleaning { scavenge_point } => {
                write!(f, "Cleaning for {scavenge_point}")
            }
            ScavengeCheckpoint::Done { scavenge_point } => write!(f, "Done {scavenge_point}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Timestamp;

    fn sp(event_number: i64) -> ScavengePoint {
        ScavengePoint::new(4096, event_number, Timestamp::from_millis(10), 0)
    }

    #[test]
    fn display_matches_trace_lines() {
        let checkpoint = ScavengeCheckpoint::Accumulating {
            scavenge_point: sp(0),
            done_logical_chunk_number: None,
        };
        assert_eq!(checkpoint.to_string(), "Accumulating SP-0 done None");

        let checkpoint = ScavengeCheckpoint::ExecutingChunks {
            scavenge_point: sp(1),
            done_logical_chunk_number: Some(3),
        };
        assert_eq!(checkpoint.to_string(), "Executing chunks for SP-1 done Some(3)");
    }

    #[test]
    fn serialized_form_carries_stage_tag() {
        let checkpoint = ScavengeCheckpoint::Calculating {
            scavenge_point: sp(2),
            done_stream_handle: Some(StreamHandle::Id("ab-1".into())),
        };
        let json = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(json["kind"], "Calculating");
        assert_eq!(json["payload"]["done_stream_handle"]["value"], "ab-1");

        let decoded: ScavengeCheckpoint = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, checkpoint);
        assert_eq!(decoded.stage(), ScavengeStage::Calculating);
    }

    #[test]
    fn stages_are_ordered_forward() {
        assert!(ScavengeStage::Accumulating < ScavengeStage::Calculating);
        assert!(ScavengeStage::ExecutingChunks < ScavengeStage::MergingChunks);
        assert!(ScavengeStage::Cleaning < ScavengeStage::Done);
    }
}

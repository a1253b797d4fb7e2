//! Structured log events emitted by a scavenge run.
//!
//! Every event goes to the `scavenger` target through `tracing` and carries
//! two fields hosts filter on:
//!
//! - `component`: the part of the pipeline that emitted it, one of `scavenger`
//!   (stage transitions), `scavenge_point`, `executor`, `chunk`, `state` or
//!   `cleaner`
//! - `event`: a snake_case name such as `scavenge_started` or `chunk_switched`
//!
//! Levels follow the unit of work. A run and its stages log at `info`, each
//! physical chunk and checkpoint write at `debug`, and each discarded record at
//! `trace`, so a full scavenge stays quiet unless record-level tracing is
//! enabled. A failed run logs once at `error`. Problems the run survives, such
//! as a failed rollback or a scavenge point conflict, log at `warn`.
//!
//! No subscriber is installed here; the host process owns that choice.

/// Target for all scavenger log events.
pub(crate) const SCAVENGER_TARGET: &str = "scavenger";

/// Run and stage lifecycle events.
///
/// # Example
/// ```ignore
/// log_info!(
///     component = "scavenger",
///     event = "scavenge_started",
///     to = %scavenge_point,
/// );
/// ```
macro_rules! log_info {
    ($($field:tt)*) => {
        ::tracing::info!(target: $crate::observability::SCAVENGER_TARGET, $($field)*)
    };
}

/// Per-chunk and per-checkpoint events.
macro_rules! log_debug {
    ($($field:tt)*) => {
        ::tracing::debug!(target: $crate::observability::SCAVENGER_TARGET, $($field)*)
    };
}

/// Per-record events.
macro_rules! log_trace {
    ($($field:tt)*) => {
        ::tracing::trace!(target: $crate::observability::SCAVENGER_TARGET, $($field)*)
    };
}

macro_rules! log_warn {
    ($($field:tt)*) => {
        ::tracing::warn!(target: $crate::observability::SCAVENGER_TARGET, $($field)*)
    };
}

/// A run ended with an error.
macro_rules! log_error {
    ($($field:tt)*) => {
        ::tracing::error!(target: $crate::observability::SCAVENGER_TARGET, $($field)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_trace;
pub(crate) use log_warn;

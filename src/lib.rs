//! Scavenging engine for a chunked, append-only transaction log.
//!
//! A scavenge run is bounded by a [`ScavengePoint`]. Upstream stages
//! ([`Accumulator`], [`Calculator`]) fill the [`ScavengeState`] with per-stream
//! discard points and per-chunk weights; the [`ChunkExecutor`] then rewrites
//! every heavy enough chunk without the discardable records and swaps it in
//! through a [`ChunkManager`]. Progress is checkpointed in the state store after
//! every chunk, so a crashed or cancelled run resumes where it stopped.

mod observability;

/// Resumption markers for the pipeline.
pub mod checkpoint;

/// Chunk manager contract and reference chunk stores.
pub mod chunk;

/// Removal of per-stream state no later run needs.
pub mod cleaner;

/// Per-chunk rewriting and the discard decision.
pub mod executor;

/// Mapping between streams and their metadata streams.
pub mod metastream;

/// Run configuration.
pub mod option;

/// Scavenge points and the event log they live in.
pub mod point;

/// Pipeline driver.
pub mod scavenger;

/// Domain view over the state store.
pub mod state;

/// SQLite-backed scavenge maps.
pub mod store;

pub mod timestamp;

pub use crate::{
    checkpoint::{ScavengeCheckpoint, ScavengeStage},
    chunk::{ChunkManager, InMemoryChunkManager, LocalChunkManager, LogRecord},
    executor::{ChunkExecutor, Progress},
    metastream::{MetastreamLookup, PrefixMetastreamLookup},
    option::ScavengeOption,
    point::{EventLog, ScavengePoint, ScavengePointSource},
    scavenger::{Accumulator, Calculator, ScavengeError, Scavenger},
    state::ScavengeState,
    timestamp::Timestamp,
};

//! Durable side-store for scavenge state.
//!
//! Every logical per-stream map exists twice: a fast table keyed by the 64-bit
//! stream hash, and a collision table keyed by the full stream id, used only for
//! ids whose hashes collide. Callers route between the two using the collision
//! set (see [`crate::state::ScavengeState`]).

mod backend;
mod checkpoint;
mod error;
mod map;

use std::path::Path;

pub use backend::{BackendStats, SqliteBackend, SqliteTransaction};
pub use checkpoint::SqliteCheckpointMap;
pub use error::{StoreError, StoreResult};
pub use map::{ScavengeMap, SqlKey, SqlValue, SqliteChunkWeightMap, SqliteScavengeMap};

use crate::state::{ChunkTimeStampRange, MetastreamData, OriginalStreamData};

/// All tables of the scavenge state, bound to one connection.
pub struct ScavengeStore {
    pub(crate) backend: SqliteBackend,
    pub collisions: SqliteScavengeMap<String, ()>,
    pub hashes: SqliteScavengeMap<u64, String>,
    pub meta_storage: SqliteScavengeMap<u64, MetastreamData>,
    pub meta_collision_storage: SqliteScavengeMap<String, MetastreamData>,
    pub original_storage: SqliteScavengeMap<u64, OriginalStreamData>,
    pub original_collision_storage: SqliteScavengeMap<String, OriginalStreamData>,
    pub checkpoints: SqliteCheckpointMap,
    pub chunk_timestamp_ranges: SqliteScavengeMap<u32, ChunkTimeStampRange>,
    pub chunk_weights: SqliteChunkWeightMap,
}

impl ScavengeStore {
    pub fn open(path: impl AsRef<Path>, cache_size_bytes: usize) -> StoreResult<Self> {
        Self::initialize(SqliteBackend::open(path, cache_size_bytes)?)
    }

    pub fn open_in_memory(cache_size_bytes: usize) -> StoreResult<Self> {
        Self::initialize(SqliteBackend::open_in_memory(cache_size_bytes)?)
    }

    pub fn initialize(backend: SqliteBackend) -> StoreResult<Self> {
        Ok(Self {
            collisions: SqliteScavengeMap::new(backend.clone(), "CollisionStorageMap")?,
            hashes: SqliteScavengeMap::new(backend.clone(), "HashesMap")?,
            meta_storage: SqliteScavengeMap::new(backend.clone(), "MetaStorageMap")?,
            meta_collision_storage: SqliteScavengeMap::new(backend.clone(), "MetaCollisionMap")?,
            original_storage: SqliteScavengeMap::new(backend.clone(), "OriginalStreamStorageMap")?,
            original_collision_storage: SqliteScavengeMap::new(
                backend.clone(),
                "OriginalStreamCollisionStorageMap",
            )?,
            checkpoints: SqliteCheckpointMap::new(backend.clone())?,
            chunk_timestamp_ranges: SqliteScavengeMap::new(
                backend.clone(),
                "ChunkTimeStampRangeMap",
            )?,
            chunk_weights: SqliteChunkWeightMap::new(backend.clone())?,
            backend,
        })
    }

    pub fn backend(&self) -> &SqliteBackend {
        &self.backend
    }
}

//! Domain-level facade over the scavenge state store.

mod data;
mod hash;

use std::sync::Arc;

pub use data::{
    CalculationStatus, ChunkExecutionInfo, ChunkTimeStampRange, DiscardPoint, MetastreamData,
    OriginalStreamData, StreamHandle, TOMBSTONE_EVENT_NUMBER,
};
pub use hash::{StreamHasher, XxHashStreamHasher};

use crate::{
    checkpoint::ScavengeCheckpoint,
    observability::{log_debug, log_info},
    option::ScavengeOption,
    store::{
        BackendStats, ScavengeMap, ScavengeStore, SqlValue, SqliteScavengeMap, SqliteTransaction,
        StoreResult,
    },
};

/// Outcome of registering a stream id with the collision detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollisionResult {
    NoCollision,
    /// The id was already known to collide.
    KnownCollision,
    /// The id collides with `previous`, which has been moved to the collision tables.
    NewCollision { previous: String },
}

/// Per-stream discard metadata, chunk weights and the run checkpoint.
pub struct ScavengeState {
    store: ScavengeStore,
    hasher: Arc<dyn StreamHasher>,
}

impl ScavengeState {
    pub fn new(store: ScavengeStore, hasher: Arc<dyn StreamHasher>) -> Self {
        Self { store, hasher }
    }

    /// Open the state described by `option`, in memory when it names no path.
    pub fn open(option: &ScavengeOption, hasher: Arc<dyn StreamHasher>) -> StoreResult<Self> {
        let store = match option.state_db_path() {
            Some(path) => ScavengeStore::open(path, option.sqlite_cache_size_bytes)?,
            None => ScavengeStore::open_in_memory(option.sqlite_cache_size_bytes)?,
        };
        Ok(Self::new(store, hasher))
    }

    pub fn store(&self) -> &ScavengeStore {
        &self.store
    }

    pub fn stats(&self) -> StoreResult<BackendStats> {
        self.store.backend().stats()
    }

    /// Begin a transaction covering every subsequent mutation until it is finished.
    pub fn begin_transaction(&self) -> StoreResult<ScavengeTransaction<'_>> {
        Ok(ScavengeTransaction {
            inner: self.store.backend().begin_transaction()?,
            state: self,
        })
    }

    /// Persist a stage-start checkpoint in a transaction of its own.
    ///
    /// Fails with
    /// [`TransactionAlreadyOpen`](crate::store::StoreError::TransactionAlreadyOpen)
    /// while another transaction is open; use [`ScavengeTransaction::commit`]
    /// there instead.
    pub fn set_checkpoint(&self, checkpoint: &ScavengeCheckpoint) -> StoreResult<()> {
        self.begin_transaction()?.commit(checkpoint)
    }

    fn write_checkpoint(&self, checkpoint: &ScavengeCheckpoint) -> StoreResult<()> {
        log_debug!(
            component = "state",
            event = "checkpoint_set",
            checkpoint = %checkpoint,
        );
        self.store.checkpoints.set(&(), checkpoint)
    }

    pub fn try_get_checkpoint(&self) -> StoreResult<Option<ScavengeCheckpoint>> {
        self.store.checkpoints.get(&())
    }

    pub fn is_collision(&self, stream_id: &str) -> StoreResult<bool> {
        Ok(self.store.collisions.get(&stream_id.to_owned())?.is_some())
    }

    /// Register `stream_id`, recording a collision if its hash is already taken.
    ///
    /// On a new collision the earlier stream's rows move from the hash-keyed
    /// tables to the id-keyed tables so both streams stay addressable.
    pub fn detect_collision(&self, stream_id: &str) -> StoreResult<CollisionResult> {
        if self.is_collision(stream_id)? {
            return Ok(CollisionResult::KnownCollision);
        }

        let hash = self.hasher.hash(stream_id);
        let previous = match self.store.hashes.get(&hash)? {
            None => {
                self.store.hashes.set(&hash, &stream_id.to_owned())?;
                return Ok(CollisionResult::NoCollision);
            }
            Some(existing) if existing == stream_id => return Ok(CollisionResult::NoCollision),
            Some(existing) => existing,
        };

        self.store.collisions.set(&previous, &())?;
        self.store.collisions.set(&stream_id.to_owned(), &())?;
        if let Some(data) = self.store.meta_storage.try_remove(&hash)? {
            self.store.meta_collision_storage.set(&previous, &data)?;
        }
        if let Some(data) = self.store.original_storage.try_remove(&hash)? {
            self.store.original_collision_storage.set(&previous, &data)?;
        }

        log_info!(
            component = "state",
            event = "hash_collision_detected",
            stream_id = %stream_id,
            previous = %previous,
            hash,
        );
        Ok(CollisionResult::NewCollision { previous })
    }

    pub fn try_get_metastream_data(&self, stream_id: &str) -> StoreResult<Option<MetastreamData>> {
        self.routed_get(
            stream_id,
            &self.store.meta_storage,
            &self.store.meta_collision_storage,
        )
    }

    pub fn set_metastream_data(&self, stream_id: &str, data: &MetastreamData) -> StoreResult<()> {
        self.routed_set(
            stream_id,
            data,
            &self.store.meta_storage,
            &self.store.meta_collision_storage,
        )
    }

    pub fn delete_metastream_data(&self, stream_id: &str) -> StoreResult<bool> {
        self.routed_remove(
            stream_id,
            &self.store.meta_storage,
            &self.store.meta_collision_storage,
        )
    }

    pub fn try_get_original_stream_data(
        &self,
        stream_id: &str,
    ) -> StoreResult<Option<OriginalStreamData>> {
        self.routed_get(
            stream_id,
            &self.store.original_storage,
            &self.store.original_collision_storage,
        )
    }

    pub fn set_original_stream_data(
        &self,
        stream_id: &str,
        data: &OriginalStreamData,
    ) -> StoreResult<()> {
        self.routed_set(
            stream_id,
            data,
            &self.store.original_storage,
            &self.store.original_collision_storage,
        )
    }

    pub fn delete_original_stream_data(&self, stream_id: &str) -> StoreResult<bool> {
        self.routed_remove(
            stream_id,
            &self.store.original_storage,
            &self.store.original_collision_storage,
        )
    }

    /// Discard data for an original stream; `None` means nothing is recorded
    /// and the caller must keep every record.
    pub fn try_get_chunk_execution_info(
        &self,
        stream_id: &str,
    ) -> StoreResult<Option<ChunkExecutionInfo>> {
        Ok(self
            .try_get_original_stream_data(stream_id)?
            .map(|data| data.execution_info()))
    }

    /// Up to `limit` original streams after `after`, hash-keyed rows first.
    pub fn original_streams_after(
        &self,
        after: Option<&StreamHandle>,
        limit: usize,
    ) -> StoreResult<Vec<(StreamHandle, OriginalStreamData)>> {
        paged_after(
            after,
            limit,
            &self.store.original_storage,
            &self.store.original_collision_storage,
        )
    }

    pub fn all_original_streams(&self) -> StoreResult<Vec<(StreamHandle, OriginalStreamData)>> {
        self.original_streams_after(None, usize::MAX)
    }

    pub fn all_metastreams(&self) -> StoreResult<Vec<(StreamHandle, MetastreamData)>> {
        paged_after(
            None,
            usize::MAX,
            &self.store.meta_storage,
            &self.store.meta_collision_storage,
        )
    }

    pub fn delete_original_stream(&self, handle: &StreamHandle) -> StoreResult<bool> {
        match handle {
            StreamHandle::Hash(hash) => Ok(self.store.original_storage.try_remove(hash)?.is_some()),
            StreamHandle::Id(id) => Ok(self
                .store
                .original_collision_storage
                .try_remove(id)?
                .is_some()),
        }
    }

    pub fn delete_metastream(&self, handle: &StreamHandle) -> StoreResult<bool> {
        match handle {
            StreamHandle::Hash(hash) => Ok(self.store.meta_storage.try_remove(hash)?.is_some()),
            StreamHandle::Id(id) => Ok(self.store.meta_collision_storage.try_remove(id)?.is_some()),
        }
    }

    /// Total weight of logical chunks `start..=end`.
    pub fn sum_chunk_weights(&self, start: u32, end: u32) -> StoreResult<f32> {
        self.store.chunk_weights.sum(start, end)
    }

    pub fn reset_chunk_weights(&self, start: u32, end: u32) -> StoreResult<()> {
        self.store.chunk_weights.reset(start, end)
    }

    pub fn increase_chunk_weight(&self, logical_chunk_number: u32, delta: f32) -> StoreResult<()> {
        self.store.chunk_weights.increase(logical_chunk_number, delta)
    }

    pub fn set_chunk_timestamp_range(
        &self,
        logical_chunk_number: u32,
        range: ChunkTimeStampRange,
    ) -> StoreResult<()> {
        self.store
            .chunk_timestamp_ranges
            .set(&logical_chunk_number, &range)
    }

    pub fn try_get_chunk_timestamp_range(
        &self,
        logical_chunk_number: u32,
    ) -> StoreResult<Option<ChunkTimeStampRange>> {
        self.store.chunk_timestamp_ranges.get(&logical_chunk_number)
    }

    fn routed_get<V: SqlValue>(
        &self,
        stream_id: &str,
        by_hash: &SqliteScavengeMap<u64, V>,
        by_id: &SqliteScavengeMap<String, V>,
    ) -> StoreResult<Option<V>> {
        if self.is_collision(stream_id)? {
            by_id.get(&stream_id.to_owned())
        } else {
            by_hash.get(&self.hasher.hash(stream_id))
        }
    }

    fn routed_set<V: SqlValue>(
        &self,
        stream_id: &str,
        value: &V,
        by_hash: &SqliteScavengeMap<u64, V>,
        by_id: &SqliteScavengeMap<String, V>,
    ) -> StoreResult<()> {
        if self.is_collision(stream_id)? {
            by_id.set(&stream_id.to_owned(), value)
        } else {
            by_hash.set(&self.hasher.hash(stream_id), value)
        }
    }

    fn routed_remove<V: SqlValue>(
        &self,
        stream_id: &str,
        by_hash: &SqliteScavengeMap<u64, V>,
        by_id: &SqliteScavengeMap<String, V>,
    ) -> StoreResult<bool> {
        let removed = if self.is_collision(stream_id)? {
            by_id.try_remove(&stream_id.to_owned())?
        } else {
            by_hash.try_remove(&self.hasher.hash(stream_id))?
        };
        Ok(removed.is_some())
    }
}

fn paged_after<V: SqlValue>(
    after: Option<&StreamHandle>,
    limit: usize,
    by_hash: &SqliteScavengeMap<u64, V>,
    by_id: &SqliteScavengeMap<String, V>,
) -> StoreResult<Vec<(StreamHandle, V)>> {
    let mut out = Vec::new();
    let id_after = match after {
        None | Some(StreamHandle::Hash(_)) => {
            let hash_after = match after {
                Some(StreamHandle::Hash(hash)) => Some(hash),
                _ => None,
            };
            out.extend(
                by_hash
                    .records_after(hash_after, limit)?
                    .into_iter()
                    .map(|(hash, v)| (StreamHandle::Hash(hash), v)),
            );
            None
        }
        Some(StreamHandle::Id(id)) => Some(id),
    };
    let remaining = limit.saturating_sub(out.len());
    if remaining > 0 {
        out.extend(
            by_id
                .records_after(id_after, remaining)?
                .into_iter()
                .map(|(id, v)| (StreamHandle::Id(id), v)),
        );
    }
    Ok(out)
}

/// A state transaction. Committing also records the checkpoint it advances to,
/// so state mutations and progress become durable together.
pub struct ScavengeTransaction<'a> {
    inner: SqliteTransaction,
    state: &'a ScavengeState,
}

impl ScavengeTransaction<'_> {
    pub fn commit(self, checkpoint: &ScavengeCheckpoint) -> StoreResult<()> {
        self.state.write_checkpoint(checkpoint)?;
        self.inner.commit()
    }

    pub fn rollback(self) -> StoreResult<()> {
        self.inner.rollback()
    }
}

//! Chunk executor: rewrites physical chunks without the records the scavenge
//! state marks as discardable.
//!
//! Each physical chunk is processed inside one state transaction that also
//! advances the `ExecutingChunks` checkpoint, so a crash or cancellation
//! leaves the run resumable at the last committed chunk. Rewriting a chunk is
//! idempotent: decisions only depend on the state and the scavenge point.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::ScavengeCheckpoint,
    chunk::{ChunkError, ChunkManager, ChunkReader, ChunkWriter, RecordForScavenge},
    metastream::MetastreamLookup,
    observability::{log_debug, log_info, log_trace, log_warn},
    option::ScavengeOption,
    point::ScavengePoint,
    state::{ChunkExecutionInfo, ScavengeState},
    store::{StoreError, StoreResult},
};

/// How a call into the executor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Completed,
    /// Stopped by the cancellation token; the last committed checkpoint stands.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("chunk executor cannot resume from checkpoint {0}")]
    UnexpectedCheckpoint(String),
}

pub struct ChunkExecutor<L, M> {
    lookup: L,
    manager: M,
    chunk_size: u64,
    unsafe_ignore_hard_deletes: bool,
    cancellation_check_period: usize,
}

impl<L, M> ChunkExecutor<L, M>
where
    L: MetastreamLookup,
    M: ChunkManager,
{
    pub fn new(lookup: L, manager: M, option: &ScavengeOption) -> Self {
        Self {
            lookup,
            manager,
            chunk_size: option.get_chunk_size(),
            unsafe_ignore_hard_deletes: option.is_unsafe_ignore_hard_deletes(),
            cancellation_check_period: option.cancellation_check_period.max(1),
        }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Start executing chunks for `scavenge_point` from the beginning of the log.
    pub fn execute(
        &self,
        scavenge_point: &ScavengePoint,
        state: &ScavengeState,
        cancel: &CancellationToken,
    ) -> Result<Progress, ExecutorError> {
        let checkpoint = ScavengeCheckpoint::ExecutingChunks {
            scavenge_point: scavenge_point.clone(),
            done_logical_chunk_number: None,
        };
        state.set_checkpoint(&checkpoint)?;
        self.resume(&checkpoint, state, cancel)
    }

    /// Continue from an `ExecutingChunks` checkpoint, skipping chunks it names as done.
    pub fn resume(
        &self,
        checkpoint: &ScavengeCheckpoint,
        state: &ScavengeState,
        cancel: &CancellationToken,
    ) -> Result<Progress, ExecutorError> {
        let ScavengeCheckpoint::ExecutingChunks {
            scavenge_point,
            done_logical_chunk_number,
        } = checkpoint
        else {
            return Err(ExecutorError::UnexpectedCheckpoint(checkpoint.to_string()));
        };

        let start_from = done_logical_chunk_number.map_or(0, |done| done + 1);
        log_info!(
            component = "executor",
            event = "chunk_execution_started",
            scavenge_point = %scavenge_point,
            start_from,
            threshold = scavenge_point.threshold(),
            unsafe_ignore_hard_deletes = self.unsafe_ignore_hard_deletes,
        );

        let mut position = self.chunk_size * u64::from(start_from);
        while position < scavenge_point.position() {
            if cancel.is_cancelled() {
                return Ok(self.cancelled(scavenge_point));
            }

            let reader = self.manager.chunk_reader_for(position)?;
            if !reader.is_read_only() {
                log_debug!(
                    component = "executor",
                    event = "open_chunk_reached",
                    chunk_start = reader.chunk_start_number(),
                );
                break;
            }

            let chunk_end = reader.chunk_end_number();
            let transaction = state.begin_transaction()?;
            match self.process_physical_chunk(scavenge_point, state, &reader, cancel) {
                Ok(Progress::Completed) => {
                    transaction.commit(&ScavengeCheckpoint::ExecutingChunks {
                        scavenge_point: scavenge_point.clone(),
                        done_logical_chunk_number: Some(chunk_end),
                    })?;
                }
                Ok(Progress::Cancelled) => {
                    transaction.rollback()?;
                    return Ok(self.cancelled(scavenge_point));
                }
                Err(err) => {
                    if let Err(rollback_err) = transaction.rollback() {
                        log_warn!(
                            component = "executor",
                            event = "rollback_failed",
                            error = %rollback_err,
                        );
                    }
                    return Err(err);
                }
            }
            position = reader.chunk_end_position();
        }

        log_info!(
            component = "executor",
            event = "chunk_execution_completed",
            scavenge_point = %scavenge_point,
        );
        Ok(Progress::Completed)
    }

    fn cancelled(&self, scavenge_point: &ScavengePoint) -> Progress {
        log_info!(
            component = "executor",
            event = "chunk_execution_cancelled",
            scavenge_point = %scavenge_point,
        );
        Progress::Cancelled
    }

    fn process_physical_chunk(
        &self,
        scavenge_point: &ScavengePoint,
        state: &ScavengeState,
        reader: &M::Reader,
        cancel: &CancellationToken,
    ) -> Result<Progress, ExecutorError> {
        let (start, end) = (reader.chunk_start_number(), reader.chunk_end_number());
        let weight = state.sum_chunk_weights(start, end)?;

        if weight > scavenge_point.threshold() as f32 || self.unsafe_ignore_hard_deletes {
            if self.execute_physical_chunk(scavenge_point, state, reader, cancel)?
                == Progress::Cancelled
            {
                return Ok(Progress::Cancelled);
            }
        } else {
            log_debug!(
                component = "executor",
                event = "chunk_skipped",
                chunk_start = start,
                chunk_end = end,
                weight,
            );
        }

        state.reset_chunk_weights(start, end)?;

        if cancel.is_cancelled() {
            return Ok(Progress::Cancelled);
        }
        Ok(Progress::Completed)
    }

    /// Copy the kept records of `reader` into a new chunk and switch it in.
    pub fn execute_physical_chunk(
        &self,
        scavenge_point: &ScavengePoint,
        state: &ScavengeState,
        reader: &M::Reader,
        cancel: &CancellationToken,
    ) -> Result<Progress, ExecutorError> {
        let (start, end) = (reader.chunk_start_number(), reader.chunk_end_number());
        let mut writer = self.manager.create_chunk_writer(start, end)?;

        let mut kept = 0u64;
        let mut discarded = 0u64;
        let copied = (|| -> Result<Progress, ExecutorError> {
            let mut since_check = 0usize;
            for record in reader.read_records() {
                let record = record?;
                if self.should_discard(state, scavenge_point, &record.for_scavenge())? {
                    log_trace!(
                        component = "executor",
                        event = "record_discarded",
                        stream_id = %record.stream_id,
                        event_number = record.event_number,
                        log_position = record.log_position,
                    );
                    discarded += 1;
                } else {
                    writer.write_record(&record)?;
                    kept += 1;
                }

                since_check += 1;
                if since_check == self.cancellation_check_period {
                    since_check = 0;
                    if cancel.is_cancelled() {
                        return Ok(Progress::Cancelled);
                    }
                }
            }
            Ok(Progress::Completed)
        })();

        match copied {
            Ok(Progress::Completed) => {}
            Ok(Progress::Cancelled) => {
                writer.abort()?;
                log_debug!(
                    component = "executor",
                    event = "chunk_rewrite_abandoned",
                    chunk_start = start,
                    chunk_end = end,
                );
                return Ok(Progress::Cancelled);
            }
            Err(err) => {
                if let Err(abort_err) = writer.abort() {
                    log_warn!(
                        component = "executor",
                        event = "chunk_writer_abort_failed",
                        error = %abort_err,
                    );
                }
                return Err(err);
            }
        }

        let chunk = writer.finish()?;
        let new_chunk = self.manager.switch_chunk(chunk, true, false)?;
        log_debug!(
            component = "executor",
            event = "chunk_rewritten",
            chunk_start = start,
            chunk_end = end,
            new_chunk = %new_chunk,
            kept,
            discarded,
        );
        Ok(Progress::Completed)
    }

    /// Whether `record` can be left out of the rewritten chunk.
    pub fn should_discard(
        &self,
        state: &ScavengeState,
        scavenge_point: &ScavengePoint,
        record: &RecordForScavenge<'_>,
    ) -> StoreResult<bool> {
        if !record.is_scavengable {
            return Ok(false);
        }
        // unassigned numbers belong to uncommitted transactions
        if record.event_number < 0 {
            return Ok(false);
        }

        let is_meta_stream = self.lookup.is_meta_stream(record.stream_id);
        let info = if is_meta_stream {
            state
                .try_get_metastream_data(record.stream_id)?
                .map_or(ChunkExecutionInfo::KEEP_ALL, ChunkExecutionInfo::from)
        } else {
            state
                .try_get_chunk_execution_info(record.stream_id)?
                .unwrap_or(ChunkExecutionInfo::KEEP_ALL)
        };

        if info.is_tombstoned {
            if self.unsafe_ignore_hard_deletes {
                return Ok(true);
            }
            if is_meta_stream {
                return Ok(true);
            }
        }

        if info.discard_point.should_discard(record.event_number) {
            return Ok(true);
        }
        if !info.maybe_discard_point.should_discard(record.event_number) {
            return Ok(false);
        }
        Ok(match info.max_age {
            None => false,
            Some(max_age) => record.timestamp < scavenge_point.effective_now().saturating_sub(max_age),
        })
    }
}

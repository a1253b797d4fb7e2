//! Cleaning stage: drops per-stream state that no later run can use.

use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::ScavengeCheckpoint,
    executor::Progress,
    observability::{log_debug, log_info},
    option::ScavengeOption,
    point::ScavengePoint,
    state::{CalculationStatus, ScavengeState},
    store::StoreResult,
};

/// Deletes spent original streams, and with hard deletes ignored also every
/// tombstoned stream and all metastream data.
///
/// All deletions commit together with the `Done` checkpoint.
pub struct StateCleaner {
    unsafe_ignore_hard_deletes: bool,
}

impl StateCleaner {
    pub fn new(option: &ScavengeOption) -> Self {
        Self {
            unsafe_ignore_hard_deletes: option.is_unsafe_ignore_hard_deletes(),
        }
    }

    pub fn clean(
        &self,
        scavenge_point: &ScavengePoint,
        state: &ScavengeState,
        cancel: &CancellationToken,
    ) -> StoreResult<Progress> {
        if cancel.is_cancelled() {
            return Ok(Progress::Cancelled);
        }
        log_info!(
            component = "cleaner",
            event = "cleaning_started",
            scavenge_point = %scavenge_point,
            unsafe_ignore_hard_deletes = self.unsafe_ignore_hard_deletes,
        );

        let transaction = state.begin_transaction()?;
        let deleted = match self.delete_unneeded(state) {
            Ok(deleted) => deleted,
            Err(err) => {
                transaction.rollback()?;
                return Err(err);
            }
        };
        if cancel.is_cancelled() {
            transaction.rollback()?;
            return Ok(Progress::Cancelled);
        }
        transaction.commit(&ScavengeCheckpoint::Done {
            scavenge_point: scavenge_point.clone(),
        })?;

        log_info!(
            component = "cleaner",
            event = "cleaning_completed",
            scavenge_point = %scavenge_point,
            original_streams_deleted = deleted.0,
            metastreams_deleted = deleted.1,
        );
        Ok(Progress::Completed)
    }

    fn delete_unneeded(&self, state: &ScavengeState) -> StoreResult<(usize, usize)> {
        let mut originals = 0;
        for (handle, data) in state.all_original_streams()? {
            let spent = data.status == CalculationStatus::Spent;
            if spent || (self.unsafe_ignore_hard_deletes && data.is_tombstoned) {
                log_debug!(
                    component = "cleaner",
                    event = "original_stream_deleted",
                    stream = %handle,
                    spent,
                );
                if state.delete_original_stream(&handle)? {
                    originals += 1;
                }
            }
        }

        // Metadata records may already be gone from the chunks while the
        // stream is still live, so only unsafe runs can drop them.
        let mut metastreams = 0;
        if self.unsafe_ignore_hard_deletes {
            for (handle, _) in state.all_metastreams()? {
                if state.delete_metastream(&handle)? {
                    metastreams += 1;
                }
            }
        }
        Ok((originals, metastreams))
    }
}

//! Pipeline driver: picks the scavenge point and walks the stages forward from
//! the persisted checkpoint.
//!
//! Stages always run in the order `Accumulating`, `Calculating`,
//! `ExecutingChunks`, `MergingChunks`, `Cleaning`, `Done`. The checkpoint for a
//! stage is persisted before the stage starts, so a run interrupted anywhere is
//! resumed by calling [`Scavenger::run`] again.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::ScavengeCheckpoint,
    chunk::{ChunkError, ChunkManager},
    cleaner::StateCleaner,
    executor::{ChunkExecutor, ExecutorError, Progress},
    metastream::MetastreamLookup,
    observability::{log_debug, log_error, log_info},
    option::ScavengeOption,
    point::{
        EventLog, ScavengePoint, ScavengePointError, ScavengePointSource,
        EXPECTED_VERSION_NO_STREAM,
    },
    state::ScavengeState,
    store::StoreError,
};

#[derive(Debug, Error)]
pub enum ScavengeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    ScavengePoint(#[from] ScavengePointError),
    /// Failure reported by an accumulation or calculation stage.
    #[error("scavenge stage failed: {0}")]
    Stage(String),
}

/// Scans the log up to the scavenge point and records stream metadata,
/// tombstones and chunk timestamp ranges in the state.
///
/// Called with an `Accumulating` checkpoint; implementations resume after its
/// `done_logical_chunk_number` and should advance the checkpoint as they go.
pub trait Accumulator {
    fn accumulate(
        &self,
        checkpoint: &ScavengeCheckpoint,
        state: &ScavengeState,
        cancel: &CancellationToken,
    ) -> Result<Progress, ScavengeError>;
}

/// Turns accumulated metadata into discard points and chunk weights.
///
/// Called with a `Calculating` checkpoint; implementations resume after its
/// `done_stream_handle`.
pub trait Calculator {
    fn calculate(
        &self,
        checkpoint: &ScavengeCheckpoint,
        state: &ScavengeState,
        cancel: &CancellationToken,
    ) -> Result<Progress, ScavengeError>;
}

/// Drives one scavenge run at a time over a single state.
pub struct Scavenger<A, C, L, M, E> {
    state: ScavengeState,
    accumulator: A,
    calculator: C,
    executor: ChunkExecutor<L, M>,
    cleaner: StateCleaner,
    points: ScavengePointSource<E>,
    chunk_size: u64,
    threshold: i32,
}

impl<A, C, L, M, E> Scavenger<A, C, L, M, E>
where
    A: Accumulator,
    C: Calculator,
    L: MetastreamLookup,
    M: ChunkManager,
    E: EventLog,
{
    pub fn new(
        state: ScavengeState,
        accumulator: A,
        calculator: C,
        executor: ChunkExecutor<L, M>,
        points: ScavengePointSource<E>,
        option: &ScavengeOption,
    ) -> Self {
        Self {
            state,
            accumulator,
            calculator,
            executor,
            cleaner: StateCleaner::new(option),
            points,
            chunk_size: option.get_chunk_size(),
            threshold: option.get_threshold(),
        }
    }

    pub fn state(&self) -> &ScavengeState {
        &self.state
    }

    pub fn executor(&self) -> &ChunkExecutor<L, M> {
        &self.executor
    }

    /// Give back the state so a later run can continue from it.
    pub fn into_state(self) -> ScavengeState {
        self.state
    }

    /// Run or resume a scavenge until it is `Done` or `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Progress, ScavengeError> {
        let result = self.run_inner(cancel).await;
        if let Err(err) = &result {
            log_error!(
                component = "scavenger",
                event = "scavenge_failed",
                error = %err,
            );
        }
        result
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<Progress, ScavengeError> {
        if cancel.is_cancelled() {
            return Ok(Progress::Cancelled);
        }

        let checkpoint = match self.state.try_get_checkpoint()? {
            None => {
                log_info!(
                    component = "scavenger",
                    event = "scavenge_started_without_checkpoint",
                );
                self.start_new(None).await?
            }
            Some(ScavengeCheckpoint::Done { scavenge_point }) => {
                self.start_new(Some(&scavenge_point)).await?
            }
            Some(checkpoint) => {
                log_info!(
                    component = "scavenger",
                    event = "scavenge_resumed",
                    checkpoint = %checkpoint,
                );
                checkpoint
            }
        };
        self.run_stages(checkpoint, cancel).await
    }

    async fn start_new(
        &self,
        previous: Option<&ScavengePoint>,
    ) -> Result<ScavengeCheckpoint, ScavengeError> {
        let scavenge_point = self.next_scavenge_point(previous).await?;
        // accumulation restarts at the chunk holding the previous point
        let done_logical_chunk_number = previous.and_then(|previous| {
            u32::try_from(previous.position() / self.chunk_size)
                .ok()
                .and_then(|chunk| chunk.checked_sub(1))
        });

        match previous {
            Some(previous) => log_info!(
                component = "scavenger",
                event = "scavenge_started",
                from = %previous,
                to = %scavenge_point,
            ),
            None => log_info!(
                component = "scavenger",
                event = "scavenge_started",
                to = %scavenge_point,
            ),
        }

        let checkpoint = ScavengeCheckpoint::Accumulating {
            scavenge_point,
            done_logical_chunk_number,
        };
        self.state.set_checkpoint(&checkpoint)?;
        Ok(checkpoint)
    }

    /// The latest scavenge point if it is newer than `previous`, otherwise a new one.
    async fn next_scavenge_point(
        &self,
        previous: Option<&ScavengePoint>,
    ) -> Result<ScavengePoint, ScavengeError> {
        let latest = self.points.latest_scavenge_point().await?;
        let scavenge_point = match (latest, previous) {
            (Some(latest), None) => latest,
            (Some(latest), Some(previous)) if latest.event_number() > previous.event_number() => {
                latest
            }
            (Some(_), Some(previous)) => {
                self.points
                    .add_scavenge_point(previous.event_number(), self.threshold)
                    .await?
            }
            (None, _) => {
                self.points
                    .add_scavenge_point(EXPECTED_VERSION_NO_STREAM, self.threshold)
                    .await?
            }
        };
        Ok(scavenge_point)
    }

    async fn run_stages(
        &self,
        mut checkpoint: ScavengeCheckpoint,
        cancel: &CancellationToken,
    ) -> Result<Progress, ScavengeError> {
        loop {
            let scavenge_point = checkpoint.scavenge_point().clone();
            let (progress, next) = match &checkpoint {
                ScavengeCheckpoint::Accumulating { .. } => (
                    self.accumulator
                        .accumulate(&checkpoint, &self.state, cancel)?,
                    ScavengeCheckpoint::Calculating {
                        scavenge_point,
                        done_stream_handle: None,
                    },
                ),
                ScavengeCheckpoint::Calculating { .. } => (
                    self.calculator.calculate(&checkpoint, &self.state, cancel)?,
                    ScavengeCheckpoint::ExecutingChunks {
                        scavenge_point,
                        done_logical_chunk_number: None,
                    },
                ),
                ScavengeCheckpoint::ExecutingChunks { .. } => (
                    self.executor.resume(&checkpoint, &self.state, cancel)?,
                    ScavengeCheckpoint::MergingChunks { scavenge_point },
                ),
                ScavengeCheckpoint::MergingChunks { .. } => (
                    self.merge_chunks(&scavenge_point, cancel),
                    ScavengeCheckpoint::Cleaning { scavenge_point },
                ),
                ScavengeCheckpoint::Cleaning { .. } => (
                    self.cleaner.clean(&scavenge_point, &self.state, cancel)?,
                    ScavengeCheckpoint::Done { scavenge_point },
                ),
                ScavengeCheckpoint::Done { .. } => {
                    log_info!(
                        component = "scavenger",
                        event = "scavenge_completed",
                        scavenge_point = %scavenge_point,
                    );
                    return Ok(Progress::Completed);
                }
            };

            if progress == Progress::Cancelled {
                log_info!(
                    component = "scavenger",
                    event = "scavenge_cancelled",
                    checkpoint = %checkpoint,
                );
                return Ok(Progress::Cancelled);
            }
            self.state.set_checkpoint(&next)?;
            checkpoint = next;

            // stages block the calling thread; let other tasks run between them
            #[cfg(feature = "tokio")]
            tokio::task::yield_now().await;
        }
    }

    /// Merging is not performed; rewritten chunks keep their original ranges.
    fn merge_chunks(&self, scavenge_point: &ScavengePoint, cancel: &CancellationToken) -> Progress {
        if cancel.is_cancelled() {
            return Progress::Cancelled;
        }
        log_debug!(
            component = "scavenger",
            event = "chunk_merging_skipped",
            scavenge_point = %scavenge_point,
        );
        Progress::Completed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        chunk::{InMemoryChunkManager, LogRecord},
        checkpoint::ScavengeStage,
        metastream::PrefixMetastreamLookup,
        point::ScavengePointSource,
        state::{OriginalStreamData, StreamHandle, XxHashStreamHasher},
        timestamp::Timestamp,
    };

    const CHUNK_SIZE: u64 = 1_000;

    /// Records the checkpoints it is called with; optionally fails or cancels.
    #[derive(Clone, Default)]
    struct Probe {
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
        cancel: Option<CancellationToken>,
    }

    impl Probe {
        fn record(&self, checkpoint: &ScavengeCheckpoint) -> Result<Progress, ScavengeError> {
            self.calls.lock().unwrap().push(checkpoint.to_string());
            if self.fail {
                return Err(ScavengeError::Stage("probe failure".into()));
            }
            if let Some(cancel) = &self.cancel {
                cancel.cancel();
                return Ok(Progress::Cancelled);
            }
            Ok(Progress::Completed)
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Accumulator for Probe {
        fn accumulate(
            &self,
            checkpoint: &ScavengeCheckpoint,
            _state: &ScavengeState,
            _cancel: &CancellationToken,
        ) -> Result<Progress, ScavengeError> {
            self.record(checkpoint)
        }
    }

    impl Calculator for Probe {
        fn calculate(
            &self,
            checkpoint: &ScavengeCheckpoint,
            _state: &ScavengeState,
            _cancel: &CancellationToken,
        ) -> Result<Progress, ScavengeError> {
            self.record(checkpoint)
        }
    }

    type TestScavenger =
        Scavenger<Probe, Probe, PrefixMetastreamLookup, InMemoryChunkManager, InMemoryChunkManager>;

    fn log() -> InMemoryChunkManager {
        let clock = Arc::new(Mutex::new(0u64));
        InMemoryChunkManager::new(CHUNK_SIZE).with_clock(move || {
            let mut now = clock.lock().unwrap();
            *now += 10;
            Timestamp::from_millis(*now)
        })
    }

    fn scavenger(
        state: ScavengeState,
        log: &InMemoryChunkManager,
        accumulator: Probe,
        calculator: Probe,
    ) -> TestScavenger {
        let option = ScavengeOption::default()
            .chunk_size(CHUNK_SIZE)
            .threshold(-1);
        let executor = ChunkExecutor::new(PrefixMetastreamLookup, log.clone(), &option);
        Scavenger::new(
            state,
            accumulator,
            calculator,
            executor,
            ScavengePointSource::new(log.clone()),
            &option,
        )
    }

    fn new_state() -> ScavengeState {
        ScavengeState::open(&ScavengeOption::default(), Arc::new(XxHashStreamHasher)).unwrap()
    }

    #[tokio::test]
    async fn first_run_creates_a_scavenge_point_and_finishes() {
        let log = log();
        let accumulator = Probe::default();
        let calculator = Probe::default();
        let scavenger = scavenger(new_state(), &log, accumulator.clone(), calculator.clone());

        let progress = scavenger.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(progress, Progress::Completed);
        assert_eq!(accumulator.calls(), vec!["Accumulating SP-0 done None"]);
        assert_eq!(calculator.calls(), vec!["Calculating SP-0 done None"]);
        let checkpoint = scavenger.state().try_get_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.stage(), ScavengeStage::Done);
        assert_eq!(checkpoint.scavenge_point().event_number(), 0);
    }

    #[tokio::test]
    async fn existing_scavenge_point_is_used_on_first_run() {
        let log = log();
        let points = ScavengePointSource::new(log.clone());
        let existing = points
            .add_scavenge_point(EXPECTED_VERSION_NO_STREAM, 7)
            .await
            .unwrap();

        let scavenger = scavenger(new_state(), &log, Probe::default(), Probe::default());
        scavenger.run(&CancellationToken::new()).await.unwrap();

        let checkpoint = scavenger.state().try_get_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.scavenge_point(), &existing);
        assert_eq!(points.latest_scavenge_point().await.unwrap(), Some(existing));
    }

    #[tokio::test]
    async fn done_run_adds_the_next_point_and_accumulates_from_the_previous() {
        let log = log();
        for n in 0..30 {
            log.append(LogRecord::prepare("ab-1", n, "type", Timestamp::from_millis(1), Vec::new()))
                .unwrap();
        }
        let scavenger = scavenger(new_state(), &log, Probe::default(), Probe::default());
        scavenger.run(&CancellationToken::new()).await.unwrap();
        let first = scavenger
            .state()
            .try_get_checkpoint()
            .unwrap()
            .unwrap()
            .scavenge_point()
            .clone();
        let state = scavenger.into_state();

        let accumulator = Probe::default();
        let scavenger = scavenger_with(state, &log, accumulator.clone());
        scavenger.run(&CancellationToken::new()).await.unwrap();

        let expected_done = (first.position() / CHUNK_SIZE) as u32 - 1;
        assert_eq!(
            accumulator.calls(),
            vec![format!("Accumulating SP-1 done Some({expected_done})")]
        );
        let checkpoint = scavenger.state().try_get_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.scavenge_point().event_number(), 1);
    }

    fn scavenger_with(
        state: ScavengeState,
        log: &InMemoryChunkManager,
        accumulator: Probe,
    ) -> TestScavenger {
        scavenger(state, log, accumulator, Probe::default())
    }

    #[tokio::test]
    async fn resume_skips_completed_stages() {
        let log = log();
        let points = ScavengePointSource::new(log.clone());
        let scavenge_point = points
            .add_scavenge_point(EXPECTED_VERSION_NO_STREAM, 0)
            .await
            .unwrap();
        let state = new_state();
        let handle = StreamHandle::Hash(42);
        state
            .set_checkpoint(&ScavengeCheckpoint::Calculating {
                scavenge_point,
                done_stream_handle: Some(handle),
            })
            .unwrap();

        let accumulator = Probe::default();
        let calculator = Probe::default();
        let scavenger = scavenger(state, &log, accumulator.clone(), calculator.clone());
        scavenger.run(&CancellationToken::new()).await.unwrap();

        assert!(accumulator.calls().is_empty());
        assert_eq!(calculator.calls(), vec!["Calculating SP-0 done Some(Hash: 42)"]);
        assert_eq!(
            scavenger.state().try_get_checkpoint().unwrap().unwrap().stage(),
            ScavengeStage::Done
        );
    }

    #[tokio::test]
    async fn stage_failure_leaves_the_stage_checkpoint() {
        let log = log();
        let failing = Probe {
            fail: true,
            ..Probe::default()
        };
        let scavenger = scavenger(new_state(), &log, Probe::default(), failing);

        let err = scavenger.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, ScavengeError::Stage(_)), "{err}");
        assert_eq!(
            scavenger.state().try_get_checkpoint().unwrap().unwrap().stage(),
            ScavengeStage::Calculating
        );
    }

    #[tokio::test]
    async fn cancelled_stage_stops_the_pipeline() {
        let log = log();
        let cancel = CancellationToken::new();
        let cancelling = Probe {
            cancel: Some(cancel.clone()),
            ..Probe::default()
        };
        let calculator = Probe::default();
        let scavenger = scavenger(new_state(), &log, cancelling, calculator.clone());

        let progress = scavenger.run(&cancel).await.unwrap();

        assert_eq!(progress, Progress::Cancelled);
        assert!(calculator.calls().is_empty());
        assert_eq!(
            scavenger.state().try_get_checkpoint().unwrap().unwrap().stage(),
            ScavengeStage::Accumulating
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_adds_no_point() {
        let log = log();
        let scavenger = scavenger(new_state(), &log, Probe::default(), Probe::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(scavenger.run(&cancel).await.unwrap(), Progress::Cancelled);
        assert_eq!(scavenger.state().try_get_checkpoint().unwrap(), None);
        let points = ScavengePointSource::new(log);
        assert_eq!(points.latest_scavenge_point().await.unwrap(), None);
    }

    #[tokio::test]
    async fn cleaning_runs_before_done() {
        let log = log();
        let state = new_state();
        let spent = OriginalStreamData {
            status: crate::state::CalculationStatus::Spent,
            ..Default::default()
        };
        state.set_original_stream_data("spent-1", &spent).unwrap();

        let scavenger = scavenger(state, &log, Probe::default(), Probe::default());
        scavenger.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            scavenger
                .state()
                .try_get_original_stream_data("spent-1")
                .unwrap(),
            None
        );
    }
}

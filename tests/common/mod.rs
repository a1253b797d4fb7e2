//! Common test utilities for integration tests: a small accumulator and
//! calculator pair that understands `$maxCount` metadata and tombstones.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use scavenger::{
    chunk::{ChunkManager, ChunkReader, LogRecord, RecordKind},
    executor::Progress,
    metastream::{MetastreamLookup, PrefixMetastreamLookup},
    point::SCAVENGE_POINTS_STREAM,
    scavenger::{Accumulator, Calculator, ScavengeError},
    state::{
        CalculationStatus, ChunkTimeStampRange, DiscardPoint, MetastreamData, ScavengeState,
        StreamHandle, StreamHasher, XxHashStreamHasher, TOMBSTONE_EVENT_NUMBER,
    },
    ChunkExecutor, InMemoryChunkManager, ScavengeCheckpoint, ScavengeOption, ScavengePointSource,
    Scavenger, Timestamp,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub const CHUNK_SIZE: u64 = 1_000;
pub const DISCARD_WEIGHT: f32 = 2.0;

/// Body of a metadata event.
#[derive(Debug, Default, Deserialize)]
pub struct StreamMetadata {
    #[serde(rename = "$maxCount")]
    pub max_count: Option<u64>,
    #[serde(rename = "$tb")]
    pub truncate_before: Option<i64>,
}

pub fn max_count(n: u64) -> Vec<u8> {
    format!(r#"{{"$maxCount":{n}}}"#).into_bytes()
}

/// Where each accumulated event lives, shared by the accumulator and calculator of one run.
#[derive(Default)]
pub struct Catalog {
    /// stream id -> (event number, logical chunk)
    events: HashMap<String, Vec<(i64, u32)>>,
}

pub fn catalog() -> Arc<Mutex<Catalog>> {
    Arc::new(Mutex::new(Catalog::default()))
}

fn stage_err(err: impl std::fmt::Display) -> ScavengeError {
    ScavengeError::Stage(err.to_string())
}

pub struct LogAccumulator<M> {
    pub manager: M,
    pub catalog: Arc<Mutex<Catalog>>,
    pub chunk_size: u64,
}

impl<M> LogAccumulator<M>
where
    M: ChunkManager,
{
    fn accumulate_record(
        &self,
        state: &ScavengeState,
        record: &LogRecord,
        chunk: u32,
    ) -> Result<(), ScavengeError> {
        let lookup = PrefixMetastreamLookup;
        let stream = record.stream_id.as_str();
        state.detect_collision(stream)?;
        self.catalog
            .lock()
            .map_err(stage_err)?
            .events
            .entry(stream.to_string())
            .or_default()
            .push((record.event_number, chunk));

        if lookup.is_meta_stream(stream) {
            let original = lookup.original_stream_of(stream);
            state.detect_collision(&original)?;
            let metadata: StreamMetadata = serde_json::from_slice(&record.data).map_err(stage_err)?;
            let mut data = state
                .try_get_original_stream_data(&original)?
                .unwrap_or_default();
            data.max_count = metadata.max_count;
            data.truncate_before = metadata.truncate_before;
            data.status = CalculationStatus::Active;
            state.set_original_stream_data(&original, &data)?;

            let mut meta = state
                .try_get_metastream_data(stream)?
                .unwrap_or(MetastreamData::EMPTY);
            meta.discard_point = meta
                .discard_point
                .or(DiscardPoint::discard_before(record.event_number));
            state.set_metastream_data(stream, &meta)?;
        } else if record.event_number == TOMBSTONE_EVENT_NUMBER {
            let mut data = state
                .try_get_original_stream_data(stream)?
                .unwrap_or_default();
            data.is_tombstoned = true;
            data.status = CalculationStatus::Active;
            state.set_original_stream_data(stream, &data)?;

            let meta_stream = lookup.meta_stream_of(stream);
            let mut meta = state
                .try_get_metastream_data(&meta_stream)?
                .unwrap_or(MetastreamData::EMPTY);
            meta.is_tombstoned = true;
            state.set_metastream_data(&meta_stream, &meta)?;
        }
        Ok(())
    }
}

impl<M> Accumulator for LogAccumulator<M>
where
    M: ChunkManager,
{
    fn accumulate(
        &self,
        checkpoint: &ScavengeCheckpoint,
        state: &ScavengeState,
        cancel: &CancellationToken,
    ) -> Result<Progress, ScavengeError> {
        let ScavengeCheckpoint::Accumulating {
            scavenge_point,
            done_logical_chunk_number,
        } = checkpoint
        else {
            return Err(stage_err(format!("cannot accumulate from {checkpoint}")));
        };

        let mut position = self.chunk_size * u64::from(done_logical_chunk_number.map_or(0, |d| d + 1));
        while position < scavenge_point.position() {
            if cancel.is_cancelled() {
                return Ok(Progress::Cancelled);
            }
            let reader = self.manager.chunk_reader_for(position)?;
            let transaction = state.begin_transaction()?;
            let mut range: Option<(Timestamp, Timestamp)> = None;
            for record in reader.read_records() {
                let record = record?;
                if record.log_position >= scavenge_point.position() {
                    break;
                }
                range = Some(match range {
                    None => (record.timestamp, record.timestamp),
                    Some((min, max)) => (min.min(record.timestamp), max.max(record.timestamp)),
                });
                if record.kind != RecordKind::Prepare || record.stream_id == SCAVENGE_POINTS_STREAM {
                    continue;
                }
                let chunk = (record.log_position / self.chunk_size) as u32;
                self.accumulate_record(state, &record, chunk)?;
            }
            if let Some((min, max)) = range {
                state.set_chunk_timestamp_range(
                    reader.chunk_start_number(),
                    ChunkTimeStampRange::new(min, max),
                )?;
            }
            transaction.commit(&ScavengeCheckpoint::Accumulating {
                scavenge_point: scavenge_point.clone(),
                done_logical_chunk_number: Some(reader.chunk_end_number()),
            })?;
            position = reader.chunk_end_position();
        }
        Ok(Progress::Completed)
    }
}

pub struct LogCalculator {
    pub catalog: Arc<Mutex<Catalog>>,
}

impl LogCalculator {
    fn handle_of(state: &ScavengeState, stream: &str) -> Result<StreamHandle, ScavengeError> {
        if state.is_collision(stream)? {
            Ok(StreamHandle::Id(stream.to_string()))
        } else {
            Ok(StreamHandle::Hash(XxHashStreamHasher.hash(stream)))
        }
    }
}

impl Calculator for LogCalculator {
    fn calculate(
        &self,
        checkpoint: &ScavengeCheckpoint,
        state: &ScavengeState,
        cancel: &CancellationToken,
    ) -> Result<Progress, ScavengeError> {
        let ScavengeCheckpoint::Calculating {
            scavenge_point,
            done_stream_handle,
        } = checkpoint
        else {
            return Err(stage_err(format!("cannot calculate from {checkpoint}")));
        };
        let lookup = PrefixMetastreamLookup;
        let catalog = self.catalog.lock().map_err(stage_err)?;

        let mut names = HashMap::new();
        for stream in catalog.events.keys() {
            if !lookup.is_meta_stream(stream) {
                names.insert(Self::handle_of(state, stream)?, stream.clone());
            }
            let original = lookup.original_stream_of(stream);
            names.insert(Self::handle_of(state, &original)?, original);
        }

        let mut after = done_stream_handle.clone();
        loop {
            if cancel.is_cancelled() {
                return Ok(Progress::Cancelled);
            }
            let batch = state.original_streams_after(after.as_ref(), 2)?;
            let Some((last, _)) = batch.last() else {
                break;
            };
            let last = last.clone();

            let transaction = state.begin_transaction()?;
            for (handle, mut data) in batch {
                let Some(stream) = names.get(&handle) else {
                    continue;
                };
                let events = catalog.events.get(stream).cloned().unwrap_or_default();
                let last_event = events
                    .iter()
                    .map(|(n, _)| *n)
                    .filter(|n| *n != TOMBSTONE_EVENT_NUMBER)
                    .max();

                let mut discard_point = data.discard_point;
                if data.is_tombstoned {
                    discard_point = DiscardPoint::DISCARD_ALL;
                    data.status = CalculationStatus::Archived;
                } else {
                    if let (Some(max_count), Some(last_event)) = (data.max_count, last_event) {
                        discard_point = discard_point
                            .or(DiscardPoint::discard_before(last_event - max_count as i64 + 1));
                    }
                    if let Some(truncate_before) = data.truncate_before {
                        discard_point = discard_point.or(DiscardPoint::discard_before(truncate_before));
                    }
                }
                for (number, chunk) in &events {
                    if discard_point.should_discard(*number) {
                        state.increase_chunk_weight(*chunk, DISCARD_WEIGHT)?;
                    }
                }

                let meta_stream = lookup.meta_stream_of(stream);
                if let Some(meta) = state.try_get_metastream_data(&meta_stream)? {
                    for (number, chunk) in catalog.events.get(&meta_stream).into_iter().flatten() {
                        if meta.is_tombstoned || meta.discard_point.should_discard(*number) {
                            state.increase_chunk_weight(*chunk, DISCARD_WEIGHT)?;
                        }
                    }
                }

                data.discard_point = discard_point;
                state.set_original_stream_data(stream, &data)?;
            }
            transaction.commit(&ScavengeCheckpoint::Calculating {
                scavenge_point: scavenge_point.clone(),
                done_stream_handle: Some(last.clone()),
            })?;
            after = Some(last);
        }
        Ok(Progress::Completed)
    }
}

/// Records of `stream` left in the log, by event number.
pub fn event_numbers(manager: &InMemoryChunkManager, stream: &str) -> Vec<i64> {
    manager
        .all_records()
        .unwrap()
        .into_iter()
        .filter(|r| r.kind == RecordKind::Prepare && r.stream_id == stream)
        .map(|r| r.event_number)
        .collect()
}

pub type TestScavenger<M> = Scavenger<
    LogAccumulator<M>,
    LogCalculator,
    PrefixMetastreamLookup,
    M,
    InMemoryChunkManager,
>;

/// An in-memory log whose event-log clock advances 10ms per append.
pub fn log() -> InMemoryChunkManager {
    let clock = Arc::new(Mutex::new(0u64));
    InMemoryChunkManager::new(CHUNK_SIZE).with_clock(move || {
        let mut now = clock.lock().unwrap();
        *now += 10;
        Timestamp::from_millis(*now)
    })
}

pub fn in_memory_state() -> ScavengeState {
    ScavengeState::open(&ScavengeOption::default(), Arc::new(XxHashStreamHasher)).unwrap()
}

pub fn option() -> ScavengeOption {
    ScavengeOption::default().chunk_size(CHUNK_SIZE)
}

/// Scavenger over `log`, with a fresh accumulator/calculator pair.
pub fn scavenger(
    state: ScavengeState,
    log: &InMemoryChunkManager,
    option: &ScavengeOption,
) -> TestScavenger<InMemoryChunkManager> {
    let catalog = catalog();
    let accumulator = LogAccumulator {
        manager: log.clone(),
        catalog: catalog.clone(),
        chunk_size: option.get_chunk_size(),
    };
    let calculator = LogCalculator { catalog };
    let executor = ChunkExecutor::new(PrefixMetastreamLookup, log.clone(), option);
    Scavenger::new(
        state,
        accumulator,
        calculator,
        executor,
        ScavengePointSource::new(log.clone()),
        option,
    )
}

pub fn ts(millis: u64) -> Timestamp {
    Timestamp::from_millis(millis)
}

pub fn event(stream: &str, number: i64, at: u64) -> LogRecord {
    LogRecord::prepare(stream, number, "event", ts(at), Vec::new())
}

pub fn metadata(stream: &str, number: i64, at: u64, body: Vec<u8>) -> LogRecord {
    LogRecord::prepare(stream, number, "$metadata", ts(at), body)
}

pub fn tombstone(stream: &str, at: u64) -> LogRecord {
    LogRecord::prepare(stream, TOMBSTONE_EVENT_NUMBER, "$streamDeleted", ts(at), Vec::new())
}

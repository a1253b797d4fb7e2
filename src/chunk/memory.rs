//! In-memory chunk directory, used by tests and embedders without a file log.

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    chunk::{
        chunk_file_name, ChunkError, ChunkManager, ChunkReader, ChunkResult, ChunkWriter,
        LogRecord, PosMapEntry, RecordKind,
    },
    observability::log_debug,
    point::{EventLog, NewEvent, ReadStreamResult, StoredEvent, WriteResult},
    state::TOMBSTONE_EVENT_NUMBER,
    timestamp::Timestamp,
};

type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredChunk {
    start_number: u32,
    end_number: u32,
    version: u32,
    records: Vec<LogRecord>,
    posmap: Vec<PosMapEntry>,
    read_only: bool,
    hash: u32,
}

impl StoredChunk {
    fn open(number: u32) -> Self {
        Self {
            start_number: number,
            end_number: number,
            version: 0,
            records: Vec::new(),
            posmap: Vec::new(),
            read_only: false,
            hash: 0,
        }
    }

    fn name(&self) -> String {
        chunk_file_name(self.start_number, self.end_number, self.version)
    }
}

fn records_hash(records: &[LogRecord]) -> ChunkResult<u32> {
    let mut hasher = crc32fast::Hasher::new();
    for record in records {
        hasher.update(&record.encode()?);
    }
    Ok(hasher.finalize())
}

#[derive(Default)]
struct Inner {
    /// Keyed by start number; the highest entry may be the open chunk.
    chunks: BTreeMap<u32, Arc<StoredChunk>>,
    writer_position: u64,
    switched: Vec<String>,
}

impl Inner {
    fn covering(&self, logical_chunk_number: u32) -> Option<&Arc<StoredChunk>> {
        self.chunks
            .range(..=logical_chunk_number)
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.end_number >= logical_chunk_number)
    }

    fn source_version(&self, start: u32, end: u32) -> ChunkResult<u32> {
        let mut version = None;
        for chunk in self.chunks.range(start..=end).map(|(_, c)| c) {
            if chunk.end_number > end || !chunk.read_only {
                return Err(ChunkError::InvalidRange { start, end });
            }
            version = version.max(Some(chunk.version));
        }
        match (version, self.covering(start)) {
            (Some(version), Some(first)) if first.start_number == start => Ok(version),
            _ => Err(ChunkError::InvalidRange { start, end }),
        }
    }
}

/// Chunks held in memory, with an [`EventLog`] view over the prepares they contain.
///
/// Cloning shares the same directory.
#[derive(Clone)]
pub struct InMemoryChunkManager {
    inner: Arc<Mutex<Inner>>,
    chunk_size: u64,
    clock: Clock,
}

impl fmt::Debug for InMemoryChunkManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryChunkManager")
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl InMemoryChunkManager {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            chunk_size: chunk_size.max(1),
            clock: Arc::new(Timestamp::now),
        }
    }

    /// Use `clock` to stamp events appended through [`EventLog`].
    #[must_use]
    pub fn with_clock(self, clock: impl Fn() -> Timestamp + Send + Sync + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn lock(&self) -> ChunkResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| ChunkError::Poisoned)
    }

    /// Append `record` to the open chunk, returning its log position.
    ///
    /// A record that does not fit in the rest of the open chunk seals it and
    /// starts the next one.
    pub fn append(&self, record: LogRecord) -> ChunkResult<u64> {
        let mut inner = self.lock()?;
        self.append_locked(&mut inner, record)
    }

    fn append_locked(&self, inner: &mut Inner, record: LogRecord) -> ChunkResult<u64> {
        let size = record.size_on_log();
        if size > self.chunk_size {
            return Err(ChunkError::Corrupt(format!(
                "record of {size} bytes exceeds chunk size {}",
                self.chunk_size
            )));
        }
        let offset_in_chunk = inner.writer_position % self.chunk_size;
        if offset_in_chunk != 0 && offset_in_chunk + size > self.chunk_size {
            self.complete_locked(inner)?;
        }

        let position = inner.writer_position;
        let number = self.logical_chunk_number(position);
        let chunk = inner
            .chunks
            .entry(number)
            .or_insert_with(|| Arc::new(StoredChunk::open(number)));
        let chunk = Arc::make_mut(chunk);
        chunk.posmap.push(PosMapEntry {
            log_position: position,
            offset: chunk.records.len() as u64,
        });
        chunk.records.push(record.at(position));
        inner.writer_position = position + size;
        Ok(position)
    }

    /// Seal the open chunk; later appends start at the next chunk boundary.
    pub fn complete_chunk(&self) -> ChunkResult<()> {
        let mut inner = self.lock()?;
        self.complete_locked(&mut inner)
    }

    fn complete_locked(&self, inner: &mut Inner) -> ChunkResult<()> {
        let number = self.logical_chunk_number(inner.writer_position);
        let Some(chunk) = inner.chunks.get_mut(&number) else {
            return Ok(());
        };
        if chunk.read_only {
            return Ok(());
        }
        let chunk = Arc::make_mut(chunk);
        chunk.hash = records_hash(&chunk.records)?;
        chunk.read_only = true;
        inner.writer_position = u64::from(number + 1) * self.chunk_size;
        Ok(())
    }

    fn logical_chunk_number(&self, position: u64) -> u32 {
        u32::try_from(position / self.chunk_size).unwrap_or(u32::MAX)
    }

    pub fn writer_position(&self) -> ChunkResult<u64> {
        Ok(self.lock()?.writer_position)
    }

    /// Every record in log order.
    pub fn all_records(&self) -> ChunkResult<Vec<LogRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .chunks
            .values()
            .flat_map(|chunk| chunk.records.iter().cloned())
            .collect())
    }

    /// Resolve a record by its original log position.
    pub fn read_at(&self, log_position: u64) -> ChunkResult<Option<LogRecord>> {
        self.chunk_reader_for(log_position)?.read_at(log_position)
    }

    /// Names of current chunks, in log order.
    pub fn chunk_names(&self) -> ChunkResult<Vec<String>> {
        Ok(self.lock()?.chunks.values().map(|c| c.name()).collect())
    }

    /// Names returned by every successful [`ChunkManager::switch_chunk`].
    pub fn switched_chunks(&self) -> ChunkResult<Vec<String>> {
        Ok(self.lock()?.switched.clone())
    }

    fn last_event(inner: &Inner, stream_id: &str) -> Option<LogRecord> {
        inner
            .chunks
            .values()
            .flat_map(|chunk| chunk.records.iter())
            .filter(|r| r.kind == RecordKind::Prepare && r.stream_id == stream_id)
            .filter(|r| r.event_number >= 0)
            .max_by_key(|r| r.event_number)
            .cloned()
    }
}

impl ChunkManager for InMemoryChunkManager {
    type Chunk = MemoryChunk;
    type Reader = MemoryChunkReader;
    type Writer = MemoryChunkWriter;

    fn chunk_reader_for(&self, log_position: u64) -> ChunkResult<Self::Reader> {
        let inner = self.lock()?;
        let chunk = inner
            .covering(self.logical_chunk_number(log_position))
            .cloned()
            .ok_or(ChunkError::NotFound {
                position: log_position,
            })?;
        Ok(MemoryChunkReader {
            chunk,
            chunk_size: self.chunk_size,
        })
    }

    fn create_chunk_writer(&self, start: u32, end: u32) -> ChunkResult<Self::Writer> {
        let source_version = self.lock()?.source_version(start, end)?;
        Ok(MemoryChunkWriter {
            start,
            end,
            source_version,
            records: Vec::new(),
            posmap: Vec::new(),
        })
    }

    fn switch_chunk(
        &self,
        chunk: Self::Chunk,
        verify_hash: bool,
        remove_chunks_with_greater_numbers: bool,
    ) -> ChunkResult<String> {
        let MemoryChunk {
            data,
            source_version,
        } = chunk;
        let (start, end) = (data.start_number, data.end_number);

        let mut inner = self.lock()?;
        let current = inner
            .source_version(start, end)
            .map_err(|_| ChunkError::Superseded { start, end })?;
        if current != source_version {
            return Err(ChunkError::Superseded { start, end });
        }
        if verify_hash && records_hash(&data.records)? != data.hash {
            return Err(ChunkError::HashMismatch { name: data.name() });
        }

        let name = data.name();
        let stale: Vec<u32> = inner
            .chunks
            .keys()
            .copied()
            .filter(|n| (start..=end).contains(n) || (remove_chunks_with_greater_numbers && *n > end))
            .collect();
        for number in stale {
            inner.chunks.remove(&number);
        }
        inner.chunks.insert(start, Arc::new(data));
        inner.switched.push(name.clone());

        log_debug!(
            component = "chunk",
            event = "chunk_switched",
            chunk = %name,
        );
        Ok(name)
    }
}

/// Snapshot reader over one in-memory chunk.
#[derive(Debug, Clone)]
pub struct MemoryChunkReader {
    chunk: Arc<StoredChunk>,
    chunk_size: u64,
}

impl MemoryChunkReader {
    pub fn name(&self) -> String {
        self.chunk.name()
    }
}

impl ChunkReader for MemoryChunkReader {
    fn is_read_only(&self) -> bool {
        self.chunk.read_only
    }

    fn chunk_start_number(&self) -> u32 {
        self.chunk.start_number
    }

    fn chunk_end_number(&self) -> u32 {
        self.chunk.end_number
    }

    fn chunk_end_position(&self) -> u64 {
        u64::from(self.chunk.end_number + 1) * self.chunk_size
    }

    fn read_records(&self) -> Box<dyn Iterator<Item = ChunkResult<LogRecord>> + '_> {
        Box::new(self.chunk.records.iter().cloned().map(Ok))
    }

    fn read_at(&self, log_position: u64) -> ChunkResult<Option<LogRecord>> {
        let posmap = &self.chunk.posmap;
        let Ok(idx) = posmap.binary_search_by_key(&log_position, |e| e.log_position) else {
            return Ok(None);
        };
        let offset = posmap[idx].offset as usize;
        match self.chunk.records.get(offset) {
            Some(record) => Ok(Some(record.clone())),
            None => Err(ChunkError::Corrupt(format!(
                "posmap offset {offset} out of range in {}",
                self.chunk.name()
            ))),
        }
    }
}

/// Output of [`MemoryChunkWriter::finish`], ready to be switched in.
#[derive(Debug)]
pub struct MemoryChunk {
    data: StoredChunk,
    source_version: u32,
}

impl MemoryChunk {
    pub fn records(&self) -> &[LogRecord] {
        &self.data.records
    }

    pub fn name(&self) -> String {
        self.data.name()
    }
}

#[derive(Debug)]
pub struct MemoryChunkWriter {
    start: u32,
    end: u32,
    source_version: u32,
    records: Vec<LogRecord>,
    posmap: Vec<PosMapEntry>,
}

impl ChunkWriter for MemoryChunkWriter {
    type Chunk = MemoryChunk;

    fn write_record(&mut self, record: &LogRecord) -> ChunkResult<()> {
        self.posmap.push(PosMapEntry {
            log_position: record.log_position,
            offset: self.records.len() as u64,
        });
        self.records.push(record.clone());
        Ok(())
    }

    fn finish(self) -> ChunkResult<Self::Chunk> {
        let hash = records_hash(&self.records)?;
        Ok(MemoryChunk {
            data: StoredChunk {
                start_number: self.start,
                end_number: self.end,
                version: self.source_version + 1,
                records: self.records,
                posmap: self.posmap,
                read_only: true,
                hash,
            },
            source_version: self.source_version,
        })
    }

    fn abort(self) -> ChunkResult<()> {
        Ok(())
    }
}

impl EventLog for InMemoryChunkManager {
    fn read_last_event<'a>(
        &'a self,
        stream_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ReadStreamResult> + Send + 'a>> {
        Box::pin(async move {
            let inner = match self.lock() {
                Ok(inner) => inner,
                Err(err) => return ReadStreamResult::Error(err.to_string()),
            };
            match Self::last_event(&inner, stream_id) {
                None => ReadStreamResult::NoStream,
                Some(record) if record.event_number == TOMBSTONE_EVENT_NUMBER => {
                    ReadStreamResult::StreamDeleted
                }
                Some(record) => ReadStreamResult::Success(vec![StoredEvent {
                    event_id: record.event_id,
                    stream_id: record.stream_id,
                    event_number: record.event_number,
                    event_type: record.event_type,
                    data: record.data,
                    log_position: record.log_position,
                    timestamp: record.timestamp,
                }]),
            }
        })
    }

    fn append_event<'a>(
        &'a self,
        stream_id: &'a str,
        expected_version: i64,
        event: NewEvent,
    ) -> Pin<Box<dyn Future<Output = WriteResult> + Send + 'a>> {
        Box::pin(async move {
            let mut inner = match self.lock() {
                Ok(inner) => inner,
                Err(err) => return WriteResult::Error(err.to_string()),
            };
            let current = Self::last_event(&inner, stream_id).map_or(-1, |r| r.event_number);
            if current == TOMBSTONE_EVENT_NUMBER {
                return WriteResult::StreamDeleted;
            }
            if current != expected_version {
                return WriteResult::WrongExpectedVersion { current };
            }

            let now = (self.clock)();
            let event_number = current + 1;
            let prepare = LogRecord::prepare(stream_id, event_number, event.event_type, now, event.data)
                .with_event_id(event.event_id);
            let written = self
                .append_locked(&mut inner, prepare)
                .and_then(|_| self.append_locked(&mut inner, LogRecord::commit(now)));
            match written {
                Ok(_) => WriteResult::Success { event_number },
                Err(err) => WriteResult::Error(err.to_string()),
            }
        })
    }
}

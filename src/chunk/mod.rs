//! Chunk access contract used by the executor, plus two reference stores.
//!
//! A physical chunk covers one or more consecutive logical chunk numbers.
//! Rewriting produces a new version of the same range that keeps a posmap,
//! so records still resolve by their original log position.

mod frame;
mod local;
mod memory;
mod record;

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use frame::{decode_frames, encode_frame, Frame, FrameHeader, FrameKind};
pub use local::{LocalChunk, LocalChunkManager, LocalChunkReader, LocalChunkWriter};
pub use memory::{InMemoryChunkManager, MemoryChunk, MemoryChunkReader, MemoryChunkWriter};
pub use record::{LogRecord, RecordForScavenge, RecordKind};

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk io error: {0}")]
    Io(#[from] io::Error),
    #[error("chunk record codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("corrupt chunk: {0}")]
    Corrupt(String),
    #[error("no chunk contains log position {position}")]
    NotFound { position: u64 },
    #[error("invalid chunk range {start}..={end}")]
    InvalidRange { start: u32, end: u32 },
    #[error("chunk {start}..={end} was superseded while it was being rewritten")]
    Superseded { start: u32, end: u32 },
    #[error("chunk {name} failed hash verification")]
    HashMismatch { name: String },
    #[error("chunk manager lock poisoned")]
    Poisoned,
}

pub type ChunkResult<T> = Result<T, ChunkError>;

/// Maps an original log position to the record's offset inside a rewritten chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PosMapEntry {
    pub log_position: u64,
    pub offset: u64,
}

/// Name of a chunk covering logical chunks `start..=end` at `version`.
pub fn chunk_file_name(start: u32, end: u32, version: u32) -> String {
    format!("chunk-{start:06}.{end:06}.{version:06}")
}

/// Read access to one physical chunk.
pub trait ChunkReader {
    /// Sealed chunks are read-only; the open chunk still receives writes.
    fn is_read_only(&self) -> bool;

    fn chunk_start_number(&self) -> u32;

    fn chunk_end_number(&self) -> u32;

    /// First log position after this chunk.
    fn chunk_end_position(&self) -> u64;

    /// Records in log order.
    fn read_records(&self) -> Box<dyn Iterator<Item = ChunkResult<LogRecord>> + '_>;

    /// Resolve a record by its original log position.
    fn read_at(&self, log_position: u64) -> ChunkResult<Option<LogRecord>>;
}

/// Builds the replacement for a physical chunk.
pub trait ChunkWriter {
    type Chunk;

    /// Append `record` unchanged, recording its new offset in the posmap.
    fn write_record(&mut self, record: &LogRecord) -> ChunkResult<()>;

    /// Seal the output so it can be switched in.
    fn finish(self) -> ChunkResult<Self::Chunk>;

    /// Discard the partial output.
    fn abort(self) -> ChunkResult<()>;
}

/// Directory of physical chunks.
pub trait ChunkManager {
    type Chunk;
    type Reader: ChunkReader;
    type Writer: ChunkWriter<Chunk = Self::Chunk>;

    fn chunk_reader_for(&self, log_position: u64) -> ChunkResult<Self::Reader>;

    /// Start a replacement for logical chunks `start..=end`, bound to their current version.
    fn create_chunk_writer(&self, start: u32, end: u32) -> ChunkResult<Self::Writer>;

    /// Atomically replace the chunks covered by `chunk`, returning the new chunk's name.
    ///
    /// Fails with [`ChunkError::Superseded`] if the source changed since the
    /// writer was created.
    fn switch_chunk(
        &self,
        chunk: Self::Chunk,
        verify_hash: bool,
        remove_chunks_with_greater_numbers: bool,
    ) -> ChunkResult<String>;
}

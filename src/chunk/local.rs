//! Chunk directory on the local filesystem.
//!
//! Each physical chunk is one file named `chunk-SSSSSS.EEEEEE.VVVVVV`. Its body
//! is a header frame, one frame per record, a posmap frame and a footer frame.
//! Replacements are written to a temp file, fsynced, renamed over and the
//! directory fsynced before the old versions are deleted.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{
    chunk::{
        chunk_file_name,
        frame::{decode_frames, encode_frame, FrameKind},
        ChunkError, ChunkManager, ChunkReader, ChunkResult, ChunkWriter, LogRecord, PosMapEntry,
    },
    observability::{log_debug, log_info, log_warn},
};

const CHUNK_FILE_PATTERN: &str = r"^chunk-(\d{6})\.(\d{6})\.(\d{6})$";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ChunkHeaderPayload {
    start: u32,
    end: u32,
    version: u32,
    chunk_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ChunkFooterPayload {
    record_count: u64,
    sealed: bool,
}

#[derive(Debug, Clone)]
struct ChunkFile {
    start: u32,
    end: u32,
    version: u32,
    sealed: bool,
    path: PathBuf,
}

impl ChunkFile {
    fn name(&self) -> String {
        chunk_file_name(self.start, self.end, self.version)
    }
}

/// Fully decoded chunk file.
struct DecodedChunk {
    header: ChunkHeaderPayload,
    footer: ChunkFooterPayload,
    /// `(frame offset, record)` in file order.
    records: Vec<(u64, LogRecord)>,
    posmap: Vec<PosMapEntry>,
}

fn decode_chunk(bytes: &[u8]) -> ChunkResult<DecodedChunk> {
    let frames = decode_frames(bytes)?;
    let (first, rest) = frames
        .split_first()
        .ok_or_else(|| ChunkError::Corrupt("empty chunk file".into()))?;
    if first.kind != FrameKind::Header {
        return Err(ChunkError::Corrupt("chunk does not start with a header".into()));
    }
    let header: ChunkHeaderPayload = serde_json::from_slice(first.payload)?;

    let mut records = Vec::new();
    let mut posmap: Option<Vec<PosMapEntry>> = None;
    let mut footer: Option<ChunkFooterPayload> = None;
    for frame in rest {
        if footer.is_some() {
            return Err(ChunkError::Corrupt("frame after chunk footer".into()));
        }
        match frame.kind {
            FrameKind::Record => records.push((frame.offset, LogRecord::decode(frame.payload)?)),
            FrameKind::PosMap => posmap = Some(serde_json::from_slice(frame.payload)?),
            FrameKind::Footer => footer = Some(serde_json::from_slice(frame.payload)?),
            FrameKind::Header => {
                return Err(ChunkError::Corrupt("duplicate chunk header".into()));
            }
        }
    }

    let footer = footer.ok_or_else(|| ChunkError::Corrupt("chunk footer missing".into()))?;
    if footer.record_count != records.len() as u64 {
        return Err(ChunkError::Corrupt(format!(
            "footer counts {} records, found {}",
            footer.record_count,
            records.len()
        )));
    }
    Ok(DecodedChunk {
        header,
        footer,
        records,
        posmap: posmap.ok_or_else(|| ChunkError::Corrupt("chunk posmap missing".into()))?,
    })
}

fn sync_dir(dir: &Path) -> ChunkResult<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Highest version among the sealed chunks exactly tiling `start..=end`.
fn range_version(chunks: &BTreeMap<u32, ChunkFile>, start: u32, end: u32) -> ChunkResult<u32> {
    let mut version = None;
    let mut next = start;
    for file in chunks.range(start..=end).map(|(_, f)| f) {
        if file.start != next || file.end > end || !file.sealed {
            return Err(ChunkError::InvalidRange { start, end });
        }
        version = version.max(Some(file.version));
        next = file.end + 1;
    }
    match version {
        Some(version) if next == end + 1 => Ok(version),
        _ => Err(ChunkError::InvalidRange { start, end }),
    }
}

/// Chunk files in one directory.
#[derive(Debug)]
pub struct LocalChunkManager {
    dir: PathBuf,
    chunk_size: u64,
    chunks: Mutex<BTreeMap<u32, ChunkFile>>,
}

impl LocalChunkManager {
    /// Open the chunk directory at `dir`, creating it if needed.
    ///
    /// Leftover temp files are removed. Where several files cover the same
    /// logical chunk, the highest version wins and the rest are deleted.
    pub fn open(dir: impl Into<PathBuf>, chunk_size: u64) -> ChunkResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let pattern = Regex::new(CHUNK_FILE_PATTERN)
            .map_err(|err| ChunkError::Corrupt(format!("chunk file pattern: {err}")))?;

        let mut candidates = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TMP_SUFFIX) {
                log_warn!(
                    component = "chunk",
                    event = "chunk_temp_file_removed",
                    file = %name,
                );
                fs::remove_file(entry.path())?;
                continue;
            }
            let Some(captures) = pattern.captures(&name) else {
                continue;
            };
            let number = |idx: usize| -> ChunkResult<u32> {
                captures[idx]
                    .parse()
                    .map_err(|_| ChunkError::Corrupt(format!("bad chunk file name {name}")))
            };
            let (start, end, version) = (number(1)?, number(2)?, number(3)?);
            let decoded = decode_chunk(&fs::read(entry.path())?)?;
            if (decoded.header.start, decoded.header.end, decoded.header.version)
                != (start, end, version)
            {
                return Err(ChunkError::Corrupt(format!(
                    "chunk header does not match file name {name}"
                )));
            }
            candidates.push(ChunkFile {
                start,
                end,
                version,
                sealed: decoded.footer.sealed,
                path: entry.path(),
            });
        }

        candidates.sort_by(|a, b| b.version.cmp(&a.version).then(a.start.cmp(&b.start)));
        let mut chunks: BTreeMap<u32, ChunkFile> = BTreeMap::new();
        for file in candidates {
            let overlaps = chunks.values().any(|c| c.start <= file.end && file.start <= c.end);
            if overlaps {
                log_info!(
                    component = "chunk",
                    event = "superseded_chunk_removed",
                    file = %file.name(),
                );
                fs::remove_file(&file.path)?;
            } else {
                chunks.insert(file.start, file);
            }
        }

        log_info!(
            component = "chunk",
            event = "chunk_directory_opened",
            dir = %dir.display(),
            chunks = chunks.len(),
        );
        Ok(Self {
            dir,
            chunk_size: chunk_size.max(1),
            chunks: Mutex::new(chunks),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn lock(&self) -> ChunkResult<MutexGuard<'_, BTreeMap<u32, ChunkFile>>> {
        self.chunks.lock().map_err(|_| ChunkError::Poisoned)
    }

    /// Add a new chunk for the unused range `start..=end`.
    ///
    /// Records must lie inside the range's log positions. An unsealed chunk
    /// stands for the chunk still being written.
    pub fn write_chunk(
        &self,
        start: u32,
        end: u32,
        records: &[LogRecord],
        sealed: bool,
    ) -> ChunkResult<String> {
        if end < start {
            return Err(ChunkError::InvalidRange { start, end });
        }
        let first = u64::from(start) * self.chunk_size;
        let last = u64::from(end + 1) * self.chunk_size;
        if records
            .iter()
            .any(|r| r.log_position < first || r.log_position >= last)
        {
            return Err(ChunkError::InvalidRange { start, end });
        }
        {
            let chunks = self.lock()?;
            if chunks.values().any(|c| c.start <= end && start <= c.end) {
                return Err(ChunkError::InvalidRange { start, end });
            }
        }

        let mut writer = LocalChunkWriter::create(self, start, end, 0, None, sealed)?;
        for record in records {
            writer.write_record(record)?;
        }
        let chunk = writer.finish()?;
        let mut chunks = self.lock()?;
        self.install(&mut chunks, chunk, false)
    }

    /// Resolve a record by its original log position.
    pub fn read_at(&self, log_position: u64) -> ChunkResult<Option<LogRecord>> {
        self.chunk_reader_for(log_position)?.read_at(log_position)
    }

    pub fn chunk_names(&self) -> ChunkResult<Vec<String>> {
        Ok(self.lock()?.values().map(ChunkFile::name).collect())
    }

    /// Rename the finished temp file into place and drop the files it replaces.
    fn install(
        &self,
        chunks: &mut BTreeMap<u32, ChunkFile>,
        chunk: LocalChunk,
        remove_chunks_with_greater_numbers: bool,
    ) -> ChunkResult<String> {
        let name = chunk_file_name(chunk.start, chunk.end, chunk.version);
        let path = self.dir.join(&name);
        fs::rename(&chunk.tmp_path, &path)?;
        sync_dir(&self.dir)?;

        let stale: Vec<u32> = chunks
            .keys()
            .copied()
            .filter(|n| {
                (chunk.start..=chunk.end).contains(n)
                    || (remove_chunks_with_greater_numbers && *n > chunk.end)
            })
            .collect();
        for number in stale {
            if let Some(old) = chunks.remove(&number) {
                fs::remove_file(&old.path)?;
            }
        }
        chunks.insert(chunk.start, ChunkFile {
            start: chunk.start,
            end: chunk.end,
            version: chunk.version,
            sealed: chunk.sealed,
            path,
        });
        Ok(name)
    }
}

impl ChunkManager for LocalChunkManager {
    type Chunk = LocalChunk;
    type Reader = LocalChunkReader;
    type Writer = LocalChunkWriter;

    fn chunk_reader_for(&self, log_position: u64) -> ChunkResult<Self::Reader> {
        let number = u32::try_from(log_position / self.chunk_size)
            .map_err(|_| ChunkError::NotFound {
                position: log_position,
            })?;
        let file = {
            let chunks = self.lock()?;
            chunks
                .range(..=number)
                .next_back()
                .map(|(_, f)| f.clone())
                .filter(|f| f.end >= number)
                .ok_or(ChunkError::NotFound {
                    position: log_position,
                })?
        };

        let decoded = decode_chunk(&fs::read(&file.path)?)?;
        Ok(LocalChunkReader {
            name: file.name(),
            start: decoded.header.start,
            end: decoded.header.end,
            sealed: decoded.footer.sealed,
            chunk_size: self.chunk_size,
            records: decoded.records,
            posmap: decoded.posmap,
        })
    }

    fn create_chunk_writer(&self, start: u32, end: u32) -> ChunkResult<Self::Writer> {
        let source_version = range_version(&*self.lock()?, start, end)?;
        LocalChunkWriter::create(self, start, end, source_version + 1, Some(source_version), true)
    }

    fn switch_chunk(
        &self,
        chunk: Self::Chunk,
        verify_hash: bool,
        remove_chunks_with_greater_numbers: bool,
    ) -> ChunkResult<String> {
        let (start, end) = (chunk.start, chunk.end);
        let mut chunks = self.lock()?;

        let current = range_version(&chunks, start, end).ok();
        if current.is_none() || current != chunk.source_version {
            fs::remove_file(&chunk.tmp_path)?;
            return Err(ChunkError::Superseded { start, end });
        }
        if verify_hash {
            let verified = fs::read(&chunk.tmp_path)
                .map_err(ChunkError::from)
                .and_then(|bytes| decode_chunk(&bytes));
            if let Err(err) = verified {
                let name = chunk_file_name(start, end, chunk.version);
                log_warn!(
                    component = "chunk",
                    event = "chunk_verification_failed",
                    chunk = %name,
                    error = %err,
                );
                fs::remove_file(&chunk.tmp_path)?;
                return Err(ChunkError::HashMismatch { name });
            }
        }

        let name = self.install(&mut chunks, chunk, remove_chunks_with_greater_numbers)?;
        log_debug!(
            component = "chunk",
            event = "chunk_switched",
            chunk = %name,
        );
        Ok(name)
    }
}

/// A decoded chunk file.
#[derive(Debug)]
pub struct LocalChunkReader {
    name: String,
    start: u32,
    end: u32,
    sealed: bool,
    chunk_size: u64,
    records: Vec<(u64, LogRecord)>,
    posmap: Vec<PosMapEntry>,
}

impl LocalChunkReader {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ChunkReader for LocalChunkReader {
    fn is_read_only(&self) -> bool {
        self.sealed
    }

    fn chunk_start_number(&self) -> u32 {
        self.start
    }

    fn chunk_end_number(&self) -> u32 {
        self.end
    }

    fn chunk_end_position(&self) -> u64 {
        u64::from(self.end + 1) * self.chunk_size
    }

    fn read_records(&self) -> Box<dyn Iterator<Item = ChunkResult<LogRecord>> + '_> {
        Box::new(self.records.iter().map(|(_, record)| Ok(record.clone())))
    }

    fn read_at(&self, log_position: u64) -> ChunkResult<Option<LogRecord>> {
        let Ok(idx) = self
            .posmap
            .binary_search_by_key(&log_position, |e| e.log_position)
        else {
            return Ok(None);
        };
        let offset = self.posmap[idx].offset;
        match self.records.binary_search_by_key(&offset, |(o, _)| *o) {
            Ok(found) => Ok(Some(self.records[found].1.clone())),
            Err(_) => Err(ChunkError::Corrupt(format!(
                "posmap offset {offset} does not start a record in {}",
                self.name
            ))),
        }
    }
}

/// A finished chunk file waiting in its temp location.
#[derive(Debug)]
pub struct LocalChunk {
    start: u32,
    end: u32,
    version: u32,
    /// `None` for a brand-new range.
    source_version: Option<u32>,
    sealed: bool,
    tmp_path: PathBuf,
}

impl LocalChunk {
    pub fn name(&self) -> String {
        chunk_file_name(self.start, self.end, self.version)
    }
}

/// Streams records into a temp chunk file.
#[derive(Debug)]
pub struct LocalChunkWriter {
    start: u32,
    end: u32,
    version: u32,
    source_version: Option<u32>,
    sealed: bool,
    tmp_path: PathBuf,
    file: BufWriter<File>,
    offset: u64,
    posmap: Vec<PosMapEntry>,
    record_count: u64,
}

impl LocalChunkWriter {
    fn create(
        manager: &LocalChunkManager,
        start: u32,
        end: u32,
        version: u32,
        source_version: Option<u32>,
        sealed: bool,
    ) -> ChunkResult<Self> {
        let tmp_name = format!(
            "{}.{}{TMP_SUFFIX}",
            chunk_file_name(start, end, version),
            Ulid::new()
        );
        let tmp_path = manager.dir.join(tmp_name);
        let mut writer = Self {
            start,
            end,
            version,
            source_version,
            sealed,
            file: BufWriter::new(File::create(&tmp_path)?),
            tmp_path,
            offset: 0,
            posmap: Vec::new(),
            record_count: 0,
        };
        let header = ChunkHeaderPayload {
            start,
            end,
            version,
            chunk_size: manager.chunk_size,
        };
        writer.write_frame(FrameKind::Header, &serde_json::to_vec(&header)?)?;
        Ok(writer)
    }

    /// Write one frame, returning its offset.
    fn write_frame(&mut self, kind: FrameKind, payload: &[u8]) -> ChunkResult<u64> {
        let frame = encode_frame(kind, payload)?;
        let offset = self.offset;
        self.file.write_all(&frame)?;
        self.offset += frame.len() as u64;
        Ok(offset)
    }
}

impl ChunkWriter for LocalChunkWriter {
    type Chunk = LocalChunk;

    fn write_record(&mut self, record: &LogRecord) -> ChunkResult<()> {
        let offset = self.write_frame(FrameKind::Record, &record.encode()?)?;
        self.posmap.push(PosMapEntry {
            log_position: record.log_position,
            offset,
        });
        self.record_count += 1;
        Ok(())
    }

    fn finish(mut self) -> ChunkResult<Self::Chunk> {
        self.posmap.sort_unstable();
        let posmap = serde_json::to_vec(&self.posmap)?;
        self.write_frame(FrameKind::PosMap, &posmap)?;
        let footer = ChunkFooterPayload {
            record_count: self.record_count,
            sealed: self.sealed,
        };
        self.write_frame(FrameKind::Footer, &serde_json::to_vec(&footer)?)?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(LocalChunk {
            start: self.start,
            end: self.end,
            version: self.version,
            source_version: self.source_version,
            sealed: self.sealed,
            tmp_path: self.tmp_path,
        })
    }

    fn abort(self) -> ChunkResult<()> {
        let Self { file, tmp_path, .. } = self;
        drop(file);
        fs::remove_file(tmp_path)?;
        Ok(())
    }
}

//! Frame encoding and decoding for local chunk files.

use std::convert::TryFrom;

use crate::chunk::{ChunkError, ChunkResult};

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

/// Magic constant identifying chunk frames (`"SCVC"`).
pub const FRAME_MAGIC: u32 = 0x5343_5643;

/// Bytes of header preceding each frame payload.
pub const FRAME_HEADER_SIZE: usize = 4 + 2 + 2 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Chunk range and version; always first.
    Header,
    /// One log record.
    Record,
    /// Log position to frame offset table.
    PosMap,
    /// Record count and seal flag; always last.
    Footer,
}

impl FrameKind {
    pub const fn as_u16(self) -> u16 {
        match self {
            FrameKind::Header => 0,
            FrameKind::Record => 1,
            FrameKind::PosMap => 2,
            FrameKind::Footer => 3,
        }
    }
}

impl TryFrom<u16> for FrameKind {
    type Error = ChunkError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Header),
            1 => Ok(FrameKind::Record),
            2 => Ok(FrameKind::PosMap),
            3 => Ok(FrameKind::Footer),
            other => Err(ChunkError::Corrupt(format!("unknown frame kind {other}"))),
        }
    }
}

/// Header prepended to every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// Payload length in bytes.
    pub len: u32,
    /// CRC32 of the payload only.
    pub crc32: u32,
}

impl FrameHeader {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        buf.extend_from_slice(&FRAME_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.kind.as_u16().to_le_bytes());
        buf.extend_from_slice(&self.len.to_le_bytes());
        buf.extend_from_slice(&self.crc32.to_le_bytes());
    }

    fn decode_from(bytes: &[u8]) -> ChunkResult<Self> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(ChunkError::Corrupt("frame header truncated".into()));
        }
        let magic = u32::from_le_bytes(read_array(&bytes[0..4]));
        if magic != FRAME_MAGIC {
            return Err(ChunkError::Corrupt("frame magic mismatch".into()));
        }
        let version = u16::from_le_bytes(read_array(&bytes[4..6]));
        if version != FRAME_VERSION {
            return Err(ChunkError::Corrupt(format!(
                "unsupported frame version {version}"
            )));
        }
        let kind = FrameKind::try_from(u16::from_le_bytes(read_array(&bytes[6..8])))?;
        let len = u32::from_le_bytes(read_array(&bytes[8..12]));
        let crc32 = u32::from_le_bytes(read_array(&bytes[12..16]));
        Ok(FrameHeader { kind, len, crc32 })
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Encode one frame.
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> ChunkResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ChunkError::Corrupt("frame payload exceeds u32::MAX".into()))?;
    let header = FrameHeader {
        kind,
        len,
        crc32: crc32fast::hash(payload),
    };
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    header.encode_into(&mut buf);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// A decoded frame borrowed from the file buffer.
#[derive(Debug)]
pub struct Frame<'a> {
    /// Offset of the frame header from the start of the file.
    pub offset: u64,
    pub kind: FrameKind,
    pub payload: &'a [u8],
}

/// Decode every frame in `bytes`, verifying each payload checksum.
pub fn decode_frames(bytes: &[u8]) -> ChunkResult<Vec<Frame<'_>>> {
    let mut frames = Vec::new();
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        let header = FrameHeader::decode_from(&bytes[cursor..])?;
        let start = cursor + FRAME_HEADER_SIZE;
        let end = start + header.len as usize;
        if end > bytes.len() {
            return Err(ChunkError::Corrupt(format!(
                "frame payload truncated at offset {cursor}"
            )));
        }
        let payload = &bytes[start..end];
        if crc32fast::hash(payload) != header.crc32 {
            return Err(ChunkError::Corrupt(format!(
                "frame payload crc32 mismatch at offset {cursor}"
            )));
        }
        frames.push(Frame {
            offset: cursor as u64,
            kind: header.kind,
            payload,
        });
        cursor = end;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_decode_in_order_with_offsets() {
        let mut bytes = encode_frame(FrameKind::Header, b"head").unwrap();
        let second_offset = bytes.len() as u64;
        bytes.extend(encode_frame(FrameKind::Record, b"record-one").unwrap());
        bytes.extend(encode_frame(FrameKind::Footer, b"").unwrap());

        let frames = decode_frames(&bytes).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].offset, second_offset);
        assert_eq!(frames[1].kind, FrameKind::Record);
        assert_eq!(frames[1].payload, b"record-one");
        assert_eq!(frames[2].payload, b"");
    }

    #[test]
    fn payload_corruption_is_detected() {
        let mut bytes = encode_frame(FrameKind::Record, b"payload").unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(decode_frames(&bytes), Err(ChunkError::Corrupt(_))));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let bytes = encode_frame(FrameKind::Record, b"payload").unwrap();
        assert!(decode_frames(&bytes[..bytes.len() - 2]).is_err());
        assert!(decode_frames(&bytes[..FRAME_HEADER_SIZE - 1]).is_err());
    }

    #[test]
    fn bad_magic_and_kind_are_rejected() {
        let mut bytes = encode_frame(FrameKind::Record, b"x").unwrap();
        bytes[0] ^= 0xFF;
        assert!(decode_frames(&bytes).is_err());

        let mut bytes = encode_frame(FrameKind::Record, b"x").unwrap();
        bytes[6] = 9;
        assert!(decode_frames(&bytes).is_err());
    }
}

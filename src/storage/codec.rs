//! Binary framing for container records.
//!
//! Two frame kinds are written:
//! - Header frames carry a JSON-serialized record with a version byte,
//!   length prefix and CRC32 checksum.
//! - Payload frames carry raw little-endian dataset bytes with a 64-bit
//!   length prefix and CRC32 checksum; they always directly follow the
//!   header frame that describes them.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Seek, SeekFrom, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current codec version.
pub const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying a ReactorDB container file.
pub const MAGIC: [u8; 4] = *b"RXDB";

/// Length of the file header (magic + version).
pub const FILE_HEADER_LEN: u64 = 5;

/// Header frames above this size are rejected as corrupt.
const MAX_HEADER_SIZE: usize = 64 * 1024 * 1024;

/// Serializes a record header with checksum.
///
/// Format:
/// ```text
/// [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
/// ```
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;

    let len = u32::try_from(data.len()).map_err(|_| {
        IoError::new(
            ErrorKind::InvalidData,
            format!("record header of {} bytes is too large", data.len()),
        )
    })?;

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&checksum(&data).to_le_bytes());

    Ok(out)
}

/// Deserializes a record header, verifying its checksum.
///
/// # Errors
/// - `UnexpectedEof` if the frame is truncated
/// - `InvalidData` on checksum mismatch, unknown version or bad JSON
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;

    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version: {} (expected {CODEC_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_HEADER_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("record size {len} exceeds maximum {MAX_HEADER_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    verify(reader, &data)?;

    serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Frames a raw payload.
///
/// Format:
/// ```text
/// [length: 8 bytes LE][data: N bytes][crc32: 4 bytes LE]
/// ```
#[must_use]
pub fn encode_raw(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len() + 4);
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(&checksum(data).to_le_bytes());
    out
}

/// Reads a raw payload frame, verifying its checksum.
pub fn decode_raw(reader: &mut impl Read) -> IoResult<Vec<u8>> {
    let len = read_raw_len(reader)?;
    let len = usize::try_from(len)
        .map_err(|_| IoError::new(ErrorKind::InvalidData, "payload length overflows usize"))?;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    verify(reader, &data)?;
    Ok(data)
}

/// Skips over a raw payload frame without reading its bytes.
///
/// Returns `UnexpectedEof` if the frame extends past `file_len`.
pub fn skip_raw<R: Read + Seek>(reader: &mut R, file_len: u64) -> IoResult<()> {
    let len = read_raw_len(reader)?;
    let pos = reader.stream_position()?;
    let end = pos
        .checked_add(len)
        .and_then(|p| p.checked_add(4))
        .ok_or_else(|| IoError::new(ErrorKind::InvalidData, "payload length overflow"))?;
    if end > file_len {
        return Err(IoError::new(
            ErrorKind::UnexpectedEof,
            format!("payload frame ends at {end}, file is {file_len} bytes"),
        ));
    }
    reader.seek(SeekFrom::Start(end))?;
    Ok(())
}

/// Write the file header (magic + version).
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])?;
    Ok(())
}

/// Read and validate the file header.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;

    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;

    Ok(version[0])
}

fn read_raw_len(reader: &mut impl Read) -> IoResult<u64> {
    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes)?;
    Ok(u64::from_le_bytes(len_bytes))
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn verify(reader: &mut impl Read, data: &[u8]) -> IoResult<()> {
    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = checksum(data);
    if stored != computed {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored:08x}, computed={computed:08x} (data corrupted)"),
        ));
    }
    Ok(())
}

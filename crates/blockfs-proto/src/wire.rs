use bytes::{Buf, BufMut};
use thiserror::Error;

use blockfs_types::{ChecksumParams, ChecksumType};

/// Errors raised while encoding or decoding wire data.
///
/// Everything here signals a corrupted or incompatible session, except
/// `ChecksumMismatch`, which carries the byte offset of the failing chunk so
/// the caller can report exactly where corruption was observed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("invalid UTF-8 in length-prefixed string")]
    InvalidString,

    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("unknown status value: {0}")]
    UnknownStatus(u16),

    #[error("unsupported protocol version: {0}")]
    BadVersion(u16),

    #[error("unknown checksum type: {0:#04x}")]
    BadChecksumType(u8),

    #[error("packet length {packet_len} inconsistent with data length {data_len}")]
    BadPacketLength { packet_len: u32, data_len: u32 },

    #[error("packet data length {data_len} not a multiple of {bytes_per_checksum} in a non-final packet")]
    BadChunking {
        data_len: u32,
        bytes_per_checksum: u32,
    },

    #[error("sequence number gap: expected {expected}, got {got}")]
    SeqnoGap { expected: i64, got: i64 },

    #[error("checksum mismatch at block offset {offset}")]
    ChecksumMismatch { offset: u64 },
}

/// Check that `buf` has at least `need` readable bytes.
pub fn ensure(buf: &impl Buf, need: usize) -> Result<(), ProtoError> {
    let have = buf.remaining();
    if have < need {
        return Err(ProtoError::Truncated { need, have });
    }
    Ok(())
}

pub fn get_u8(buf: &mut impl Buf) -> Result<u8, ProtoError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut impl Buf) -> Result<u16, ProtoError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut impl Buf) -> Result<u32, ProtoError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut impl Buf) -> Result<u64, ProtoError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

pub fn get_i64(buf: &mut impl Buf) -> Result<i64, ProtoError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

/// Read a length-prefixed (u16) UTF-8 string.
pub fn get_string(buf: &mut impl Buf) -> Result<String, ProtoError> {
    let raw = get_byte_string(buf)?;
    String::from_utf8(raw).map_err(|_| ProtoError::InvalidString)
}

/// Read a length-prefixed (u16) opaque byte string.
pub fn get_byte_string(buf: &mut impl Buf) -> Result<Vec<u8>, ProtoError> {
    let len = get_u16(buf)? as usize;
    ensure(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Write a length-prefixed (u16) UTF-8 string.
pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_byte_string(buf, s.as_bytes());
}

/// Write a length-prefixed (u16) opaque byte string.
pub fn put_byte_string(buf: &mut impl BufMut, bytes: &[u8]) {
    debug_assert!(bytes.len() <= u16::MAX as usize);
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

/// Write the checksum header: 1-byte algorithm, 4-byte chunk width.
pub fn put_checksum_header(buf: &mut impl BufMut, params: &ChecksumParams) {
    buf.put_u8(params.kind as u8);
    buf.put_u32(params.bytes_per_checksum);
}

/// Read the checksum header written by `put_checksum_header`.
pub fn get_checksum_header(buf: &mut impl Buf) -> Result<ChecksumParams, ProtoError> {
    let kind_byte = get_u8(buf)?;
    let kind = ChecksumType::from_wire(kind_byte).ok_or(ProtoError::BadChecksumType(kind_byte))?;
    let bytes_per_checksum = get_u32(buf)?;
    Ok(ChecksumParams::new(kind, bytes_per_checksum))
}

/// Length in bytes of an encoded checksum header.
pub const CHECKSUM_HEADER_LEN: usize = 5;

/// Verify the checksum region of a packet against its data region.
///
/// `offset_in_block` is where the packet's first data byte lands in the
/// block; a mismatch reports the offset of the failing chunk's first byte.
pub fn verify_chunks(
    params: &ChecksumParams,
    offset_in_block: u64,
    checksums: &[u8],
    data: &[u8],
) -> Result<(), ProtoError> {
    let csize = params.checksum_size();
    if csize == 0 {
        return Ok(());
    }
    let bpc = params.bytes_per_checksum as usize;
    for (i, chunk) in data.chunks(bpc).enumerate() {
        let want = checksums
            .get(i * csize..(i + 1) * csize)
            .ok_or(ProtoError::Truncated {
                need: (i + 1) * csize,
                have: checksums.len(),
            })?;
        let recorded = u32::from_be_bytes([want[0], want[1], want[2], want[3]]);
        if !params.verify(chunk, recorded) {
            return Err(ProtoError::ChecksumMismatch {
                offset: offset_in_block + (i * bpc) as u64,
            });
        }
    }
    Ok(())
}

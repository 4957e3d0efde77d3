//! Buffered field readers for the stream-oriented wire protocol.
//!
//! The protocol has no outer framing; both sides read fields in the order
//! the opcode dictates. These helpers pull exactly the bytes each field
//! needs from an `AsyncRead`.

use tokio::io::{AsyncRead, AsyncReadExt};

use blockfs_proto::ProtoError;
use blockfs_types::ChecksumParams;

use crate::error::NetError;

pub async fn read_u8<R: AsyncRead + Unpin>(r: &mut R) -> Result<u8, NetError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).await?;
    Ok(buf[0])
}

pub async fn read_u16<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16, NetError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

pub async fn read_u32<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32, NetError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

pub async fn read_u64<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64, NetError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await?;
    Ok(u64::from_be_bytes(buf))
}

pub async fn read_i64<R: AsyncRead + Unpin>(r: &mut R) -> Result<i64, NetError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await?;
    Ok(i64::from_be_bytes(buf))
}

/// Read exactly `len` bytes.
pub async fn read_exact_vec<R: AsyncRead + Unpin>(
    r: &mut R,
    len: usize,
) -> Result<Vec<u8>, NetError> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read a length-prefixed (u16) opaque byte string.
pub async fn read_byte_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, NetError> {
    let len = read_u16(r).await? as usize;
    read_exact_vec(r, len).await
}

/// Read a length-prefixed (u16) UTF-8 string.
pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, NetError> {
    let raw = read_byte_string(r).await?;
    String::from_utf8(raw).map_err(|_| NetError::Proto(ProtoError::InvalidString))
}

/// Read a checksum header (1-byte algorithm + 4-byte chunk width).
pub async fn read_checksum_header<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ChecksumParams, NetError> {
    let buf = read_exact_vec(r, blockfs_proto::wire::CHECKSUM_HEADER_LEN).await?;
    let mut slice = buf.as_slice();
    Ok(blockfs_proto::wire::get_checksum_header(&mut slice)?)
}

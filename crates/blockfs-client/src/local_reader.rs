//! Short-circuit block reader: when the chosen replica lives on this host,
//! read the block's data and checksum files straight from disk instead of
//! going through the wire protocol. Same API surface and checksum semantics
//! as the remote reader.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use blockfs_types::{Block, ChecksumParams};

use crate::block_reader::BlockReader;
use crate::error::{ClientError, ClientResult};
use crate::namenode::LocalBlockPaths;

/// Version tag at the front of a replica's checksum metadata file.
pub const LOCAL_META_VERSION: u16 = 1;

impl std::fmt::Debug for LocalBlockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBlockReader").finish_non_exhaustive()
    }
}

/// Block reader over a local replica's on-disk files.
pub struct LocalBlockReader {
    file: tokio::fs::File,
    params: ChecksumParams,
    verify: bool,
    /// All per-chunk checksums, loaded from the metadata file up front.
    checksums: Vec<u8>,
    /// Index of the next chunk to read.
    chunk_index: usize,
    /// Block offset of the next byte to read from the data file.
    pos: u64,
    block_len: u64,
    bytes_to_skip: u64,
    buffered: Vec<u8>,
    buf_pos: usize,
    closed: bool,
}

impl LocalBlockReader {
    /// Open the data and metadata files and position at the chunk containing
    /// `start_offset`.
    pub async fn open(
        paths: &LocalBlockPaths,
        block: &Block,
        start_offset: u64,
        verify: bool,
    ) -> ClientResult<Self> {
        let meta = tokio::fs::read(&paths.meta_path).await?;
        let mut slice = meta.as_slice();
        let version = blockfs_proto::wire::get_u16(&mut slice)?;
        if version != LOCAL_META_VERSION {
            return Err(ClientError::ProtocolViolation(format!(
                "unsupported replica metadata version {version}"
            )));
        }
        let params = blockfs_proto::wire::get_checksum_header(&mut slice)?;
        let checksums = slice.to_vec();

        let bpc = params.bytes_per_checksum as u64;
        let aligned = start_offset - start_offset % bpc;

        let mut file = tokio::fs::File::open(&paths.data_path).await?;
        file.seek(std::io::SeekFrom::Start(aligned)).await?;

        Ok(Self {
            file,
            params,
            verify,
            checksums,
            chunk_index: (aligned / bpc) as usize,
            pos: aligned,
            block_len: block.len,
            bytes_to_skip: start_offset - aligned,
            buffered: Vec::new(),
            buf_pos: 0,
            closed: false,
        })
    }

    async fn next_chunk(&mut self) -> ClientResult<()> {
        let bpc = self.params.bytes_per_checksum as u64;
        let chunk_len = bpc.min(self.block_len - self.pos) as usize;
        let mut chunk = vec![0u8; chunk_len];
        self.file
            .read_exact(&mut chunk)
            .await
            .map_err(|e| ClientError::Io(e.to_string()))?;

        if self.verify {
            let csize = self.params.checksum_size();
            let want = self
                .checksums
                .get(self.chunk_index * csize..(self.chunk_index + 1) * csize)
                .ok_or_else(|| {
                    ClientError::ProtocolViolation(format!(
                        "replica metadata too short for chunk {}",
                        self.chunk_index
                    ))
                })?;
            let recorded = u32::from_be_bytes([want[0], want[1], want[2], want[3]]);
            if !self.params.verify(&chunk, recorded) {
                return Err(ClientError::ChecksumMismatch { offset: self.pos });
            }
        }

        let discard = self.bytes_to_skip.min(chunk.len() as u64) as usize;
        self.bytes_to_skip -= discard as u64;
        self.pos += chunk.len() as u64;
        self.chunk_index += 1;
        self.buffered = chunk;
        self.buf_pos = discard;
        Ok(())
    }
}

#[async_trait]
impl BlockReader for LocalBlockReader {
    async fn read(&mut self, buf: &mut [u8]) -> ClientResult<usize> {
        if self.closed {
            return Err(ClientError::StreamClosed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.buf_pos < self.buffered.len() {
                let n = buf.len().min(self.buffered.len() - self.buf_pos);
                buf[..n].copy_from_slice(&self.buffered[self.buf_pos..self.buf_pos + n]);
                self.buf_pos += n;
                return Ok(n);
            }
            if self.pos >= self.block_len {
                return Ok(0);
            }
            self.next_chunk().await?;
        }
    }

    async fn skip(&mut self, n: u64) -> ClientResult<u64> {
        let mut skipped = 0u64;
        let mut scratch = vec![0u8; self.params.bytes_per_checksum as usize];
        while skipped < n {
            let want = ((n - skipped) as usize).min(scratch.len());
            let got = self.read(&mut scratch[..want]).await?;
            if got == 0 {
                break;
            }
            skipped += got as u64;
        }
        Ok(skipped)
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

//! Reads a byte range of a single block from one storage-node connection,
//! validating checksums chunk by chunk.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use blockfs_net::{io as net_io, IoStream};
use blockfs_proto::{
    op::Status, PacketHeader, ReadBlockRequest, PACKET_HEADER_LEN,
};
use blockfs_types::{AccessToken, Block, ChecksumParams, SequenceNumber};

use crate::error::{ClientError, ClientResult};

/// One open block read: a stream of validated bytes with forward skip.
#[async_trait]
pub trait BlockReader: Send {
    /// Deliver up to `buf.len()` validated bytes; `Ok(0)` is end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> ClientResult<usize>;

    /// Read and discard `n` bytes; returns how many were actually skipped.
    /// Backward seeks are not possible on a reader.
    async fn skip(&mut self, n: u64) -> ClientResult<u64>;

    /// Release the reader. Idempotent; the reader is unusable afterwards.
    async fn close(&mut self);
}

/// Read as much of `buf` as the reader can supply before end of stream.
pub async fn read_full(reader: &mut dyn BlockReader, buf: &mut [u8]) -> ClientResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

impl std::fmt::Debug for RemoteBlockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBlockReader").finish_non_exhaustive()
    }
}

/// Block reader speaking the wire protocol to a storage node.
pub struct RemoteBlockReader {
    stream: Box<dyn IoStream>,
    params: ChecksumParams,
    verify: bool,
    /// Bytes still to discard because the node started one chunk early.
    bytes_to_skip: u64,
    /// Offset the next packet must start at.
    expected_offset: u64,
    last_seqno: SequenceNumber,
    buffered: Vec<u8>,
    buf_pos: usize,
    /// The final packet arrived; end of stream once the buffer drains.
    eos_pending: bool,
    eos: bool,
    all_verified: bool,
    checksum_ok_sent: bool,
    closed: bool,
}

impl RemoteBlockReader {
    /// Send a read-block request over `stream` and parse the reply preamble.
    ///
    /// A non-success status distinguishes an invalid/expired access token
    /// (retryable with a refreshed token) from generic failure.
    pub async fn open(
        mut stream: Box<dyn IoStream>,
        block: &Block,
        token: &AccessToken,
        client_name: &str,
        start_offset: u64,
        len: u64,
        verify: bool,
    ) -> ClientResult<Self> {
        let request = ReadBlockRequest {
            block: block.clone(),
            start_offset,
            len,
            client_name: client_name.to_string(),
            token: token.clone(),
        };
        stream
            .write_all(&request.encode())
            .await
            .map_err(|e| ClientError::Net(e.into()))?;
        stream.flush().await.map_err(|e| ClientError::Net(e.into()))?;

        let raw_status = net_io::read_u16(&mut stream).await?;
        let status =
            Status::from_wire(raw_status).ok_or_else(|| ClientError::ProtocolViolation(format!(
                "unknown read-block status {raw_status}"
            )))?;
        match status {
            Status::Success => {}
            Status::ErrorAccessToken => {
                return Err(ClientError::AccessTokenInvalid(format!(
                    "read of {block} refused"
                )))
            }
            other => {
                return Err(ClientError::Net(blockfs_net::NetError::Io(format!(
                    "read of {block} failed with status {other:?}"
                ))))
            }
        }

        let params = net_io::read_checksum_header(&mut stream).await?;
        let first_chunk_offset = net_io::read_u64(&mut stream).await?;

        let bpc = params.bytes_per_checksum as u64;
        if first_chunk_offset > start_offset
            || (bpc > 0 && first_chunk_offset + bpc <= start_offset)
        {
            return Err(ClientError::ProtocolViolation(format!(
                "first chunk offset {first_chunk_offset} out of range for requested {start_offset}"
            )));
        }

        Ok(Self {
            stream,
            params,
            verify,
            bytes_to_skip: start_offset - first_chunk_offset,
            expected_offset: first_chunk_offset,
            last_seqno: SequenceNumber(-1),
            buffered: Vec::new(),
            buf_pos: 0,
            eos_pending: false,
            eos: false,
            all_verified: true,
            checksum_ok_sent: false,
            closed: false,
        })
    }

    pub fn checksum_params(&self) -> ChecksumParams {
        self.params
    }

    /// Pull the next packet off the wire into the buffer.
    async fn next_packet(&mut self) -> ClientResult<()> {
        let raw = net_io::read_exact_vec(&mut self.stream, PACKET_HEADER_LEN).await?;
        let header = PacketHeader::decode(raw.as_slice().try_into().expect("fixed length"));
        header.validate(&self.params, self.last_seqno.next())?;
        if header.offset_in_block != self.expected_offset {
            return Err(ClientError::ProtocolViolation(format!(
                "packet offset {} does not continue stream at {}",
                header.offset_in_block, self.expected_offset
            )));
        }
        self.last_seqno = header.seqno;

        let checksums =
            net_io::read_exact_vec(&mut self.stream, header.checksums_len(&self.params)).await?;
        let data = net_io::read_exact_vec(&mut self.stream, header.data_len as usize).await?;

        if self.verify {
            if let Err(e) = blockfs_proto::wire::verify_chunks(
                &self.params,
                header.offset_in_block,
                &checksums,
                &data,
            ) {
                self.all_verified = false;
                return Err(e.into());
            }
        }

        self.expected_offset += data.len() as u64;
        let discard = self.bytes_to_skip.min(data.len() as u64) as usize;
        self.bytes_to_skip -= discard as u64;
        self.buffered = data;
        self.buf_pos = discard;
        if header.last_in_block || header.data_len == 0 {
            self.eos_pending = true;
        }
        Ok(())
    }

    /// Tell the node every checksum verified. Best effort; failures are
    /// logged and ignored.
    async fn send_checksum_ok(&mut self) {
        let status = (Status::ChecksumOk as u16).to_be_bytes();
        if let Err(e) = self.stream.write_all(&status).await {
            debug!("could not send checksum-ok: {e}");
            return;
        }
        if let Err(e) = self.stream.flush().await {
            debug!("could not flush checksum-ok: {e}");
        }
    }
}

#[async_trait]
impl BlockReader for RemoteBlockReader {
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
            if self.eos_pending {
                self.eos = true;
            }
            if self.eos {
                if self.verify && self.all_verified && !self.checksum_ok_sent {
                    self.checksum_ok_sent = true;
                    self.send_checksum_ok().await;
                }
                return Ok(0);
            }
            self.next_packet().await?;
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
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stream.shutdown().await;
    }
}

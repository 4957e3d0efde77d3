use bytes::{BufMut, Bytes, BytesMut};

use blockfs_types::{ChecksumParams, SequenceNumber};

use crate::wire::ProtoError;

/// Fixed-size packet header preceding the checksum and data regions.
///
/// Wire layout (big-endian): total packet length (4B), offset in block (8B),
/// sequence number (8B), last-packet flag (1B), data length excluding
/// checksums (4B). `packet_len` counts the data-length field plus the
/// checksum and data regions, i.e. everything after the first 21 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_len: u32,
    pub offset_in_block: u64,
    pub seqno: SequenceNumber,
    pub last_in_block: bool,
    pub data_len: u32,
}

pub const PACKET_HEADER_LEN: usize = 25;

impl PacketHeader {
    pub fn encode(&self) -> [u8; PACKET_HEADER_LEN] {
        let mut buf = [0u8; PACKET_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.packet_len.to_be_bytes());
        buf[4..12].copy_from_slice(&self.offset_in_block.to_be_bytes());
        buf[12..20].copy_from_slice(&self.seqno.0.to_be_bytes());
        buf[20] = self.last_in_block as u8;
        buf[21..25].copy_from_slice(&self.data_len.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; PACKET_HEADER_LEN]) -> Self {
        Self {
            packet_len: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            offset_in_block: u64::from_be_bytes(buf[4..12].try_into().unwrap()),
            seqno: SequenceNumber(i64::from_be_bytes(buf[12..20].try_into().unwrap())),
            last_in_block: buf[20] != 0,
            data_len: u32::from_be_bytes(buf[21..25].try_into().unwrap()),
        }
    }

    /// Size in bytes of the checksum region implied by `data_len`.
    pub fn checksums_len(&self, params: &ChecksumParams) -> usize {
        params.chunk_count(self.data_len as usize) * params.checksum_size()
    }

    /// Validate internal consistency and sequence ordering.
    ///
    /// `expected_seqno` is the successor of the last sequence number seen on
    /// this stream. Any violation is fatal for the stream; these errors are
    /// never retried locally.
    pub fn validate(
        &self,
        params: &ChecksumParams,
        expected_seqno: SequenceNumber,
    ) -> Result<(), ProtoError> {
        let checksums_len = self.checksums_len(params) as u32;
        if self.packet_len != 4 + checksums_len + self.data_len {
            return Err(ProtoError::BadPacketLength {
                packet_len: self.packet_len,
                data_len: self.data_len,
            });
        }
        if !self.last_in_block
            && self.data_len % params.bytes_per_checksum != 0
        {
            return Err(ProtoError::BadChunking {
                data_len: self.data_len,
                bytes_per_checksum: params.bytes_per_checksum,
            });
        }
        if self.seqno != expected_seqno {
            return Err(ProtoError::SeqnoGap {
                expected: expected_seqno.0,
                got: self.seqno.0,
            });
        }
        Ok(())
    }
}

/// An outgoing packet: one or more checksummed chunks plus bookkeeping.
///
/// Chunks are appended until the packet holds `max_chunks` of them or the
/// block boundary is reached, at which point the writer enqueues it for
/// transmission. Redelivered packets (pipeline recovery) reuse the same
/// sequence number and encoded contents.
#[derive(Debug, Clone)]
pub struct Packet {
    pub seqno: SequenceNumber,
    pub offset_in_block: u64,
    pub last_in_block: bool,
    params: ChecksumParams,
    max_chunks: usize,
    checksums: Vec<u8>,
    data: Vec<u8>,
}

impl Packet {
    pub fn new(
        params: ChecksumParams,
        offset_in_block: u64,
        seqno: SequenceNumber,
        max_chunks: usize,
    ) -> Self {
        Self {
            seqno,
            offset_in_block,
            last_in_block: false,
            params,
            max_chunks,
            checksums: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Create a zero-payload heartbeat packet.
    pub fn heartbeat(params: ChecksumParams) -> Self {
        Self::new(params, 0, SequenceNumber::HEARTBEAT, 0)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.seqno.is_heartbeat()
    }

    /// Append one chunk, computing its checksum.
    ///
    /// The caller must not exceed `max_chunks`; the writer sizes packets so
    /// that never happens.
    pub fn write_chunk(&mut self, chunk: &[u8]) {
        assert!(
            self.num_chunks() < self.max_chunks,
            "packet already holds {} chunks",
            self.max_chunks
        );
        assert!(chunk.len() <= self.params.bytes_per_checksum as usize);
        let sum = self.params.compute(chunk);
        self.checksums.extend_from_slice(&sum.to_be_bytes());
        self.data.extend_from_slice(chunk);
    }

    pub fn num_chunks(&self) -> usize {
        if self.params.checksum_size() == 0 {
            return usize::from(!self.data.is_empty());
        }
        self.checksums.len() / self.params.checksum_size()
    }

    pub fn is_full(&self) -> bool {
        self.num_chunks() >= self.max_chunks
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Offset in the block one past this packet's last data byte.
    pub fn end_offset_in_block(&self) -> u64 {
        self.offset_in_block + self.data.len() as u64
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            packet_len: 4 + self.checksums.len() as u32 + self.data.len() as u32,
            offset_in_block: self.offset_in_block,
            seqno: self.seqno,
            last_in_block: self.last_in_block,
            data_len: self.data.len() as u32,
        }
    }

    /// Serialize as `header ‖ checksums ‖ data`.
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(PACKET_HEADER_LEN + self.checksums.len() + self.data.len());
        buf.put_slice(&self.header().encode());
        buf.put_slice(&self.checksums);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// End-of-block marker: a zero packet length terminates the packet stream.
pub fn end_of_block_marker() -> [u8; 4] {
    0u32.to_be_bytes()
}

use bytes::{Buf, BufMut, Bytes, BytesMut};

use blockfs_types::{
    AccessToken, Block, BlockId, ChecksumParams, GenerationStamp, NodeAddress,
};

use crate::op::{Opcode, Status, DATA_TRANSFER_VERSION};
use crate::wire::{self, ProtoError};

fn put_preamble(buf: &mut BytesMut, opcode: Opcode) {
    buf.put_u16(DATA_TRANSFER_VERSION);
    buf.put_u8(opcode as u8);
}

/// Read and check the version + opcode preamble of an incoming request.
pub fn get_preamble(buf: &mut impl Buf) -> Result<Opcode, ProtoError> {
    let version = wire::get_u16(buf)?;
    if version != DATA_TRANSFER_VERSION {
        return Err(ProtoError::BadVersion(version));
    }
    let raw = wire::get_u8(buf)?;
    Opcode::from_wire(raw).ok_or(ProtoError::UnknownOpcode(raw))
}

fn put_block(buf: &mut BytesMut, block: &Block) {
    buf.put_u64(*block.id);
    buf.put_u64(*block.generation);
}

fn get_block_identity(buf: &mut impl Buf) -> Result<(BlockId, GenerationStamp), ProtoError> {
    let id = BlockId(wire::get_u64(buf)?);
    let generation = GenerationStamp(wire::get_u64(buf)?);
    Ok((id, generation))
}

// ---------------------------------------------------------------------------
// Read-block
// ---------------------------------------------------------------------------

/// Request to stream a byte range of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlockRequest {
    pub block: Block,
    pub start_offset: u64,
    pub len: u64,
    pub client_name: String,
    pub token: AccessToken,
}

impl ReadBlockRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_preamble(&mut buf, Opcode::ReadBlock);
        put_block(&mut buf, &self.block);
        buf.put_u64(self.start_offset);
        buf.put_u64(self.len);
        wire::put_string(&mut buf, &self.client_name);
        wire::put_byte_string(&mut buf, self.token.as_bytes());
        buf.freeze()
    }

    /// Decode the fields following the preamble.
    pub fn decode_body(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        let (id, generation) = get_block_identity(buf)?;
        let start_offset = wire::get_u64(buf)?;
        let len = wire::get_u64(buf)?;
        let client_name = wire::get_string(buf)?;
        let token = AccessToken(wire::get_byte_string(buf)?);
        Ok(Self {
            block: Block::new(id, generation, 0),
            start_offset,
            len,
            client_name,
            token,
        })
    }
}

/// Preamble of a read-block response.
///
/// On success the node reports the negotiated checksum parameters and the
/// chunk-aligned offset at which the returned byte stream actually starts,
/// which is at most one chunk before the requested offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlockReply {
    pub status: Status,
    pub params: ChecksumParams,
    pub first_chunk_offset: u64,
}

impl ReadBlockReply {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(self.status as u16);
        if self.status.is_success() {
            wire::put_checksum_header(&mut buf, &self.params);
            buf.put_u64(self.first_chunk_offset);
        }
        buf.freeze()
    }
}

// ---------------------------------------------------------------------------
// Write-block
// ---------------------------------------------------------------------------

/// Request to open a block-write pipeline.
///
/// The client only talks to the first node; the downstream list tells that
/// node who to forward to, forming the chained pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBlockRequest {
    pub block: Block,
    /// Total number of nodes in the pipeline, this node included.
    pub pipeline_size: u32,
    /// Set when re-establishing the pipeline during recovery.
    pub is_recovery: bool,
    pub client_name: String,
    /// Nodes after the first, in pipeline order.
    pub downstream: Vec<NodeAddress>,
    pub token: AccessToken,
    pub params: ChecksumParams,
}

impl WriteBlockRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_preamble(&mut buf, Opcode::WriteBlock);
        put_block(&mut buf, &self.block);
        buf.put_u32(self.pipeline_size);
        buf.put_u8(self.is_recovery as u8);
        wire::put_string(&mut buf, &self.client_name);
        buf.put_u32(self.downstream.len() as u32);
        for node in &self.downstream {
            wire::put_string(&mut buf, &node.to_string());
        }
        wire::put_byte_string(&mut buf, self.token.as_bytes());
        wire::put_checksum_header(&mut buf, &self.params);
        buf.freeze()
    }

    /// Decode the fields following the preamble.
    pub fn decode_body(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        let (id, generation) = get_block_identity(buf)?;
        let pipeline_size = wire::get_u32(buf)?;
        let is_recovery = wire::get_u8(buf)? != 0;
        let client_name = wire::get_string(buf)?;
        let count = wire::get_u32(buf)? as usize;
        let mut downstream = Vec::with_capacity(count);
        for _ in 0..count {
            let s = wire::get_string(buf)?;
            downstream.push(s.parse().map_err(|_| ProtoError::InvalidString)?);
        }
        let token = AccessToken(wire::get_byte_string(buf)?);
        let params = wire::get_checksum_header(buf)?;
        Ok(Self {
            block: Block::new(id, generation, 0),
            pipeline_size,
            is_recovery,
            client_name,
            downstream,
            token,
            params,
        })
    }
}

/// Single ack frame answering a pipeline setup request.
///
/// A non-success status names the first node that reported failure; an empty
/// name with a failure status is read as the first node by convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSetupAck {
    pub status: Status,
    pub first_bad_node: String,
}

impl WriteSetupAck {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            first_bad_node: String::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(self.status as u16);
        wire::put_string(&mut buf, &self.first_bad_node);
        buf.freeze()
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        let raw = wire::get_u16(buf)?;
        let status = Status::from_wire(raw).ok_or(ProtoError::UnknownStatus(raw))?;
        let first_bad_node = wire::get_string(buf)?;
        Ok(Self {
            status,
            first_bad_node,
        })
    }
}

// ---------------------------------------------------------------------------
// Block-checksum
// ---------------------------------------------------------------------------

/// Request the CRC digest summary of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockChecksumRequest {
    pub block: Block,
    pub token: AccessToken,
}

impl BlockChecksumRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_preamble(&mut buf, Opcode::BlockChecksum);
        put_block(&mut buf, &self.block);
        wire::put_byte_string(&mut buf, self.token.as_bytes());
        buf.freeze()
    }

    pub fn decode_body(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        let (id, generation) = get_block_identity(buf)?;
        let token = AccessToken(wire::get_byte_string(buf)?);
        Ok(Self {
            block: Block::new(id, generation, 0),
            token,
        })
    }
}

/// Per-block checksum summary: the MD5 of the block's chunk CRCs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockChecksumReply {
    pub status: Status,
    pub bytes_per_crc: u32,
    pub crcs_per_block: u64,
    pub md5: [u8; 16],
}

impl BlockChecksumReply {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(self.status as u16);
        if self.status.is_success() {
            buf.put_u32(self.bytes_per_crc);
            buf.put_u64(self.crcs_per_block);
            buf.put_slice(&self.md5);
        }
        buf.freeze()
    }
}

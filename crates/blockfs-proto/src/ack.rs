use bytes::{Buf, BufMut, Bytes, BytesMut};

use blockfs_types::SequenceNumber;

use crate::op::Status;
use crate::wire::{self, ProtoError};

/// One acknowledgement frame read back from the pipeline's first node.
///
/// Carries the acknowledged sequence number and one status per replica, in
/// pipeline order. A non-success status identifies the first failing replica
/// by its index in `replies`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineAck {
    pub seqno: SequenceNumber,
    pub replies: Vec<Status>,
}

impl PipelineAck {
    pub fn new(seqno: SequenceNumber, replies: Vec<Status>) -> Self {
        Self { seqno, replies }
    }

    /// Success acknowledgement from every replica in an `n`-node pipeline.
    pub fn success(seqno: SequenceNumber, n: usize) -> Self {
        Self::new(seqno, vec![Status::Success; n])
    }

    /// Index of the first replica reporting a non-success status, if any.
    pub fn first_bad_index(&self) -> Option<usize> {
        self.replies.iter().position(|s| !s.is_success())
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + 2 + 2 * self.replies.len());
        buf.put_i64(self.seqno.0);
        buf.put_u16(self.replies.len() as u16);
        for reply in &self.replies {
            buf.put_u16(*reply as u16);
        }
        buf.freeze()
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        let seqno = SequenceNumber(wire::get_i64(buf)?);
        let count = wire::get_u16(buf)? as usize;
        let mut replies = Vec::with_capacity(count);
        for _ in 0..count {
            let raw = wire::get_u16(buf)?;
            replies.push(Status::from_wire(raw).ok_or(ProtoError::UnknownStatus(raw))?);
        }
        Ok(Self { seqno, replies })
    }

    /// Encoded length of an ack frame for an `n`-replica pipeline.
    pub fn encoded_len(n: usize) -> usize {
        8 + 2 + 2 * n
    }
}

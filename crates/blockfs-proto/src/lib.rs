//! Binary data-transfer protocol between the client and storage nodes.
//!
//! Every exchange starts with a 2-byte protocol version and a 1-byte opcode,
//! followed by opcode-specific fields. All multi-byte integers are big-endian;
//! strings and opaque byte strings are length-prefixed. The packet format
//! (header, per-chunk checksums, data) is shared by the read and write paths.

pub mod ack;
pub mod op;
pub mod packet;
pub mod request;
pub mod wire;

pub use ack::PipelineAck;
pub use op::{Opcode, Status, DATA_TRANSFER_VERSION};
pub use packet::{end_of_block_marker, Packet, PacketHeader, PACKET_HEADER_LEN};
pub use request::{
    BlockChecksumReply, ReadBlockRequest, ReadBlockReply, WriteBlockRequest, WriteSetupAck,
};
pub use wire::ProtoError;

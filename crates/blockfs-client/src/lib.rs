//! Client-side data path of a distributed block-structured filesystem.
//!
//! Turns file-level read/write requests into block-location lookups, binary
//! wire-protocol exchanges with storage nodes, and checksum-verified byte
//! streams. The read path ([`FileReader`]) fails over transparently across
//! replicas; the write path ([`FileWriter`]) pipelines checksummed packets
//! through a replica chain with background acknowledgement tracking and
//! mid-stream pipeline recovery.

pub mod block_reader;
pub mod checksum;
pub mod client;
pub mod config;
pub mod error;
pub mod local_reader;
pub mod namenode;
pub(crate) mod queue;
pub mod reader;
pub(crate) mod streamer;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_support;

pub use checksum::FileChecksum;
pub use client::Client;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use namenode::{DatanodeAdmin, FileStatus, LocalBlockPaths, Namenode};
pub use reader::FileReader;
pub use writer::FileWriter;

//! Interfaces to the external collaborators: the metadata service and the
//! per-node admin RPC surface of storage nodes.
//!
//! The data path consumes both through narrow async traits so the wire/RPC
//! substrate stays pluggable and tests can script behavior per path or per
//! node.

use std::path::PathBuf;

use async_trait::async_trait;

use blockfs_types::{AccessToken, Block, LocatedBlock, LocatedBlocks, NodeAddress};

use crate::error::ClientResult;

/// Summary of one file as known by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub path: String,
    pub length: u64,
    pub block_size: u64,
    pub replication: u32,
    pub is_dir: bool,
}

/// Operations consumed from the metadata service.
#[async_trait]
pub trait Namenode: Send + Sync {
    /// Locations of the blocks covering `[offset, offset + length)`.
    async fn get_block_locations(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> ClientResult<LocatedBlocks>;

    /// Create a new file and take its write lease.
    async fn create(
        &self,
        path: &str,
        client_name: &str,
        overwrite: bool,
        replication: u32,
        block_size: u64,
    ) -> ClientResult<()>;

    /// Reopen an existing file for append; returns its last block when that
    /// block is partially filled.
    async fn append(&self, path: &str, client_name: &str) -> ClientResult<Option<LocatedBlock>>;

    /// Allocate the next block of `path`, avoiding `excluded` nodes.
    async fn add_block(
        &self,
        path: &str,
        client_name: &str,
        excluded: &[NodeAddress],
    ) -> ClientResult<LocatedBlock>;

    /// Discard an allocated block that could not be written.
    async fn abandon_block(
        &self,
        block: &Block,
        path: &str,
        client_name: &str,
    ) -> ClientResult<()>;

    /// Finalize the file. `false` means not all blocks have reached their
    /// minimal replication yet; the caller retries.
    async fn complete(&self, path: &str, client_name: &str) -> ClientResult<bool>;

    /// Persist block allocations so concurrent readers can discover them
    /// before the file is closed.
    async fn fsync(&self, path: &str, client_name: &str) -> ClientResult<()>;

    /// Fire-and-forget report of corrupt replicas for out-of-band repair.
    async fn report_bad_blocks(&self, blocks: &[LocatedBlock]) -> ClientResult<()>;

    async fn rename(&self, src: &str, dst: &str) -> ClientResult<bool>;

    async fn delete(&self, path: &str, recursive: bool) -> ClientResult<bool>;

    async fn mkdirs(&self, path: &str) -> ClientResult<bool>;

    async fn set_replication(&self, path: &str, replication: u32) -> ClientResult<bool>;

    async fn file_info(&self, path: &str) -> ClientResult<Option<FileStatus>>;

    /// Keep the client's write leases alive.
    async fn renew_lease(&self, client_name: &str) -> ClientResult<()>;
}

/// Local filesystem location of one replica's data and checksum files,
/// used by the short-circuit read path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBlockPaths {
    pub data_path: PathBuf,
    pub meta_path: PathBuf,
}

/// Admin operations addressed to an individual storage node.
#[async_trait]
pub trait DatanodeAdmin: Send + Sync {
    /// Ask `primary` to coordinate block recovery across `pipeline`: fence
    /// stale writers, agree on the block's final length, and issue a new
    /// generation stamp and access token.
    async fn recover_block(
        &self,
        primary: &NodeAddress,
        block: &Block,
        is_append: bool,
        pipeline: &[NodeAddress],
    ) -> ClientResult<LocatedBlock>;

    /// Learn the true on-disk length of a block from one of its replicas.
    async fn get_block_info(&self, node: &NodeAddress, block: &Block) -> ClientResult<Block>;

    /// Resolve the on-disk paths of a local replica for short-circuit reads.
    /// An access-denied answer permanently disables short-circuit mode for
    /// the asking stream.
    async fn local_block_paths(
        &self,
        node: &NodeAddress,
        block: &Block,
        token: &AccessToken,
    ) -> ClientResult<LocalBlockPaths>;
}

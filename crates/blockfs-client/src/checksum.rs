//! Whole-file checksum retrieval: the MD5 of the per-block MD5s of the
//! per-chunk CRCs, gathered by contacting each block's replicas directly.

use std::fmt;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::info;

use blockfs_net::io as net_io;
use blockfs_proto::{op::Status, request::BlockChecksumRequest};
use blockfs_types::LocatedBlock;

use crate::client::SessionCtx;
use crate::error::{ClientError, ClientResult};

/// Aggregated whole-file checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChecksum {
    pub bytes_per_crc: u32,
    pub crcs_per_block: u64,
    pub md5: [u8; 16],
}

impl fmt::Display for FileChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MD5-of-{}MD5-of-{}CRC32C:",
            self.crcs_per_block, self.bytes_per_crc
        )?;
        for b in self.md5 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Ask one replica for its block's checksum summary.
async fn block_checksum(
    ctx: &SessionCtx,
    node: &blockfs_types::NodeAddress,
    located: &LocatedBlock,
) -> ClientResult<(u32, u64, [u8; 16])> {
    let mut stream = ctx.connector.connect(node).await?;
    let request = BlockChecksumRequest {
        block: located.block.clone(),
        token: located.token.clone(),
    };
    stream
        .write_all(&request.encode())
        .await
        .map_err(|e| ClientError::Net(e.into()))?;
    stream.flush().await.map_err(|e| ClientError::Net(e.into()))?;

    let raw_status = net_io::read_u16(&mut stream).await?;
    let status = Status::from_wire(raw_status).ok_or_else(|| {
        ClientError::ProtocolViolation(format!("unknown block-checksum status {raw_status}"))
    })?;
    match status {
        Status::Success => {}
        Status::ErrorAccessToken => {
            return Err(ClientError::AccessTokenInvalid(format!(
                "checksum of {} refused",
                located.block
            )))
        }
        other => {
            return Err(ClientError::Net(blockfs_net::NetError::Io(format!(
                "checksum of {} failed with status {other:?}",
                located.block
            ))))
        }
    }
    let bytes_per_crc = net_io::read_u32(&mut stream).await?;
    let crcs_per_block = net_io::read_u64(&mut stream).await?;
    let md5_raw = net_io::read_exact_vec(&mut stream, 16).await?;
    let md5: [u8; 16] = md5_raw.as_slice().try_into().expect("fixed length");
    Ok((bytes_per_crc, crcs_per_block, md5))
}

/// Compute the whole-file checksum of `path`.
///
/// Per block, replicas are tried in order until one answers; a single
/// locations refetch is allowed for expired access tokens across the whole
/// call.
pub(crate) async fn file_checksum(ctx: &Arc<SessionCtx>, path: &str) -> ClientResult<FileChecksum> {
    let mut locations = ctx
        .namenode
        .get_block_locations(path, 0, u64::MAX)
        .await?;

    let mut md5_concat: Vec<u8> = Vec::new();
    let mut bytes_per_crc: u32 = 0;
    let mut crcs_per_block: u64 = 0;
    let mut refetched = false;

    let mut i = 0;
    while i < locations.blocks.len() {
        let located = locations.blocks[i].clone();
        let mut answer = None;
        let mut token_rejected = false;
        for node in &located.nodes {
            match block_checksum(ctx, node, &located).await {
                Ok(reply) => {
                    answer = Some(reply);
                    break;
                }
                Err(e) if e.is_token_error() && !refetched => {
                    token_rejected = true;
                    break;
                }
                Err(e) => {
                    info!(%node, block = %located.block, "block checksum failed: {e}");
                }
            }
        }

        if token_rejected {
            // Fresh locations carry fresh tokens; retry the same block.
            refetched = true;
            locations = ctx
                .namenode
                .get_block_locations(path, 0, u64::MAX)
                .await?;
            continue;
        }
        let (bpc, cpb, md5) = answer.ok_or_else(|| {
            ClientError::Internal(format!(
                "no replica of {} answered the checksum request",
                located.block
            ))
        })?;

        if i == 0 {
            bytes_per_crc = bpc;
        } else if bpc != bytes_per_crc {
            return Err(ClientError::ProtocolViolation(format!(
                "checksum chunk width changed between blocks: {bytes_per_crc} then {bpc}"
            )));
        }
        if i == 0 {
            crcs_per_block = cpb;
        }
        md5_concat.extend_from_slice(&md5);
        i += 1;
    }

    let digest = md5::compute(&md5_concat);
    Ok(FileChecksum {
        bytes_per_crc,
        crcs_per_block,
        md5: digest.0,
    })
}

use serde::{Deserialize, Serialize};

use crate::address::NodeAddress;
use crate::block::{AccessToken, Block};

/// A block together with where it lives and the credential to access it.
///
/// Produced by the metadata service for each read/write request. The replica
/// list is ordered by the service's placement preference; the client walks it
/// front to back when choosing a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatedBlock {
    pub block: Block,
    /// File-relative offset of the block's first byte.
    pub start_offset: u64,
    pub nodes: Vec<NodeAddress>,
    pub token: AccessToken,
}

impl LocatedBlock {
    pub fn new(
        block: Block,
        start_offset: u64,
        nodes: Vec<NodeAddress>,
        token: AccessToken,
    ) -> Self {
        Self {
            block,
            start_offset,
            nodes,
            token,
        }
    }

    /// File-relative offset one past the block's last byte.
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.block.len
    }

    /// Whether `offset` falls inside this block's byte range.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start_offset && offset < self.end_offset()
    }
}

/// An ordered, non-overlapping list of located blocks covering a window of a
/// file, plus the file's total length.
///
/// Invariants: blocks are sorted by `start_offset` and never overlap. The
/// list may have gaps relative to the whole file; `insert_range` extends it
/// as new windows are fetched from the metadata service. For a file under
/// construction the length (and the last block's length) may still grow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatedBlocks {
    pub file_length: u64,
    pub under_construction: bool,
    pub blocks: Vec<LocatedBlock>,
}

impl LocatedBlocks {
    pub fn new(file_length: u64, under_construction: bool, blocks: Vec<LocatedBlock>) -> Self {
        Self {
            file_length,
            under_construction,
            blocks,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&LocatedBlock> {
        self.blocks.get(idx)
    }

    pub fn last_block(&self) -> Option<&LocatedBlock> {
        self.blocks.last()
    }

    /// Locate the cached block containing `offset`.
    ///
    /// Returns `Ok(index)` when a cached block covers the offset, and
    /// `Err(insertion_index)` when none does. The insertion index is where a
    /// newly fetched range for that offset belongs.
    pub fn find_block(&self, offset: u64) -> Result<usize, usize> {
        self.blocks.binary_search_by(|blk| {
            if offset < blk.start_offset {
                std::cmp::Ordering::Greater
            } else if offset >= blk.end_offset() {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        })
    }

    /// Merge a freshly fetched run of blocks into the cache at `idx`.
    ///
    /// Blocks whose start offset matches a cached entry replace it wholesale
    /// (the fresh copy carries current replica lists and tokens); the rest
    /// are spliced in, keeping the sorted, non-overlapping invariant.
    pub fn insert_range(&mut self, idx: usize, new_blocks: Vec<LocatedBlock>) {
        let mut old_idx = idx;
        let mut pending: Vec<LocatedBlock> = Vec::new();

        for nb in new_blocks {
            // Skip over cached entries that precede the incoming block.
            while old_idx < self.blocks.len()
                && self.blocks[old_idx].start_offset < nb.start_offset
            {
                old_idx += 1;
            }
            if old_idx < self.blocks.len()
                && self.blocks[old_idx].start_offset == nb.start_offset
            {
                // Flush anything queued before the match, then replace.
                let n = pending.len();
                self.blocks.splice(old_idx..old_idx, pending.drain(..));
                old_idx += n;
                self.blocks[old_idx] = nb;
                old_idx += 1;
            } else {
                pending.push(nb);
            }
        }
        self.blocks.splice(old_idx..old_idx, pending);
    }

    /// Overwrite the cached file length (under-construction correction).
    pub fn set_file_length(&mut self, len: u64) {
        self.file_length = len;
    }
}

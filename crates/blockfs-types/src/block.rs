use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{BlockId, GenerationStamp};

/// A single block of a file: identifier, generation stamp, and byte length.
///
/// Blocks are owned by the metadata service; the client only holds copies.
/// The generation stamp changes exclusively through pipeline recovery, which
/// hands the client a whole new `Block` value. `len` may be corrected in
/// place for the last block of a file under construction, once the true
/// on-disk length has been learned from a storage node.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub generation: GenerationStamp,
    pub len: u64,
}

impl Block {
    pub fn new(id: BlockId, generation: GenerationStamp, len: u64) -> Self {
        Self {
            id,
            generation,
            len,
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk_{}_{}", self.id, self.generation)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(len={})", self, self.len)
    }
}

/// Opaque, time-limited credential authorizing access to one block.
///
/// The client never inspects the contents; it round-trips the bytes to
/// storage nodes as issued by the metadata service.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessToken(pub Vec<u8>);

impl AccessToken {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken({} bytes)", self.0.len())
    }
}

use serde::{Deserialize, Serialize};

/// Checksum algorithm negotiated for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChecksumType {
    /// No checksumming; the checksum region of each packet is empty.
    Null = 0,
    /// CRC32C, 4 bytes per chunk.
    Crc32C = 1,
}

impl ChecksumType {
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ChecksumType::Null),
            1 => Some(ChecksumType::Crc32C),
            _ => None,
        }
    }

    /// Size in bytes of one checksum value.
    pub fn size(&self) -> usize {
        match self {
            ChecksumType::Null => 0,
            ChecksumType::Crc32C => 4,
        }
    }
}

/// Checksum parameters for one stream: algorithm plus chunking width.
///
/// Negotiated once when a reader or writer is opened and constant for the
/// stream's whole lifetime; a value that changes mid-stream is a protocol
/// violation surfaced by the packet codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumParams {
    pub kind: ChecksumType,
    pub bytes_per_checksum: u32,
}

impl ChecksumParams {
    pub fn new(kind: ChecksumType, bytes_per_checksum: u32) -> Self {
        Self {
            kind,
            bytes_per_checksum,
        }
    }

    pub fn crc32c(bytes_per_checksum: u32) -> Self {
        Self::new(ChecksumType::Crc32C, bytes_per_checksum)
    }

    /// Size in bytes of one checksum value.
    pub fn checksum_size(&self) -> usize {
        self.kind.size()
    }

    /// Number of chunks needed to cover `data_len` bytes.
    pub fn chunk_count(&self, data_len: usize) -> usize {
        data_len.div_ceil(self.bytes_per_checksum as usize)
    }

    /// Compute the checksum of one chunk.
    pub fn compute(&self, chunk: &[u8]) -> u32 {
        match self.kind {
            ChecksumType::Null => 0,
            ChecksumType::Crc32C => crc32c::crc32c(chunk),
        }
    }

    /// Verify one chunk against its recorded checksum value.
    pub fn verify(&self, chunk: &[u8], recorded: u32) -> bool {
        match self.kind {
            ChecksumType::Null => true,
            ChecksumType::Crc32C => crc32c::crc32c(chunk) == recorded,
        }
    }
}

impl Default for ChecksumParams {
    fn default() -> Self {
        Self::crc32c(512)
    }
}

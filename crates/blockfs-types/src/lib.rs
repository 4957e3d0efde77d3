#[macro_use]
pub mod strong_type;

pub mod address;
pub mod block;
pub mod checksum;
pub mod ids;
pub mod located;

// Re-export commonly used items at the crate root.
pub use address::NodeAddress;
pub use block::{AccessToken, Block};
pub use checksum::{ChecksumParams, ChecksumType};
pub use ids::*;
pub use located::{LocatedBlock, LocatedBlocks};

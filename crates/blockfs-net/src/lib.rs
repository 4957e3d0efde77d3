//! Transport seam between the blockfs client and storage nodes.
//!
//! The data-transfer protocol runs over plain byte streams; this crate
//! provides the [`Connector`] trait that produces them, the TCP
//! implementation used in production, buffered wire-read helpers, and the
//! process-wide address-locality cache consulted by the short-circuit read
//! path.

pub mod conn;
pub mod error;
pub mod io;
pub mod locality;

pub use conn::{Connector, IoStream, TcpConnector};
pub use error::NetError;
pub use locality::is_local_address;

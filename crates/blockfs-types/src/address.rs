use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Endpoint of a storage node.
///
/// The address doubles as the node's identity on the client side: the
/// dead-node set, the excluded-node list, and pipeline membership are all
/// keyed by it. `Ord` is lexicographic over `(host, port)`, which gives
/// every client the same total order when electing a recovery primary.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to a socket address for connecting.
    pub fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("no address resolved for {}", self),
                )
            })
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    /// Parse an address string like `"storage-1:50010"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port_str) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost);
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressParseError::InvalidPort)?;
        Ok(NodeAddress::new(host, port))
    }
}

/// Errors when parsing a `NodeAddress` from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("missing ':' port separator")]
    MissingPort,
    #[error("empty host")]
    EmptyHost,
    #[error("invalid port number")]
    InvalidPort,
}

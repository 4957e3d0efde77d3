use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use blockfs_types::NodeAddress;

use crate::error::NetError;

/// A bidirectional byte stream to a storage node.
///
/// The data-transfer protocol is stream-oriented, so the seam is the plain
/// Tokio I/O traits; tests substitute `tokio::io::duplex` pairs driven by
/// scripted fake nodes.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Trait for types that can establish new connections to a storage node.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &NodeAddress) -> Result<Box<dyn IoStream>, NetError>;
}

/// TCP connector used in production.
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &NodeAddress) -> Result<Box<dyn IoStream>, NetError> {
        let sa = addr.to_socket_addr().map_err(|e| NetError::ConnectFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(sa))
            .await
            .map_err(|_| NetError::Timeout(self.connect_timeout))?
            .map_err(|e| NetError::ConnectFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(NetError::from)?;
        Ok(Box::new(stream))
    }
}

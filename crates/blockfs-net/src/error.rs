use thiserror::Error;

use blockfs_proto::ProtoError;

/// Errors that can occur in the transport layer.
///
/// Variants carry rendered strings rather than source errors so the type is
/// `Clone`; the client stores the first fatal error of a stream and replays
/// it to every later caller.
#[derive(Debug, Clone, Error)]
pub enum NetError {
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Establishing a connection failed.
    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// An operation timed out.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// An I/O error from the underlying stream.
    #[error("io error: {0}")]
    Io(String),

    /// A wire-format violation while parsing stream data.
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            NetError::ConnectionClosed
        } else {
            NetError::Io(err.to_string())
        }
    }
}

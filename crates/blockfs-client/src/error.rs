//! Client error taxonomy.
//!
//! A closed enumeration with explicit matching takes the place of remote
//! error-class introspection. Every variant is `Clone`: a stream stores its
//! first fatal error and replays it to all later callers, including both
//! background workers and foreground waiters.

use blockfs_net::NetError;
use blockfs_proto::ProtoError;

/// Errors that can occur during client operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The path does not exist on the metadata service.
    #[error("not found: {0}")]
    NotFound(String),

    /// Permission denied by the metadata service or a storage node.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// A namespace or disk-space quota would be exceeded.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Create of a path that already exists without overwrite.
    #[error("file already exists: {0}")]
    FileAlreadyExists(String),

    /// The previous block has not reached its replication target yet.
    /// Retryable with back-off.
    #[error("not yet replicated: {0}")]
    NotYetReplicated(String),

    /// The write lease on the file expired.
    #[error("lease expired: {0}")]
    LeaseExpired(String),

    /// A storage node rejected the block access token. Retryable once with
    /// freshly fetched locations, which carry a new token.
    #[error("access token invalid: {0}")]
    AccessTokenInvalid(String),

    /// The session is corrupted: malformed header, out-of-order ack, or a
    /// checksum-parameter change mid-stream. Fatal, never retried.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Chunk data did not match its recorded checksum. Carries the block
    /// offset of the failing chunk. Propagated immediately, never masked.
    #[error("checksum mismatch at block offset {offset}")]
    ChecksumMismatch { offset: u64 },

    /// A transport-level failure.
    #[error("network error: {0}")]
    Net(#[from] NetError),

    /// Local file I/O failure (short-circuit reads).
    #[error("io error: {0}")]
    Io(String),

    /// Every known replica of a block is in the dead-node set.
    #[error("no live replica for {block}")]
    NoLiveReplica { block: String },

    /// Location refetch rounds exhausted without acquiring the block.
    #[error("could not obtain {block} after {attempts} location fetches")]
    BlockAcquireFailed { block: String, attempts: u32 },

    /// The write pipeline collapsed to zero usable nodes.
    #[error("all pipeline nodes failed: {0}")]
    AllNodesFailed(String),

    /// Block recovery retries exhausted.
    #[error("pipeline recovery failed: {0}")]
    RecoveryFailed(String),

    /// Completing the file did not succeed within the client-wide timeout.
    #[error("could not complete file: {0}")]
    CompleteTimeout(String),

    /// Operation against a closed stream with no stored error.
    #[error("stream closed")]
    StreamClosed,

    /// The client session has been shut down.
    #[error("filesystem closed")]
    NotRunning,

    /// An internal / unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether a refreshed access token could make the operation succeed.
    pub fn is_token_error(&self) -> bool {
        matches!(self, ClientError::AccessTokenInvalid(_))
    }
}

impl From<ProtoError> for ClientError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::ChecksumMismatch { offset } => ClientError::ChecksumMismatch { offset },
            other => ClientError::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        ClientError::Internal(err.to_string())
    }
}

/// Convenience result type.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

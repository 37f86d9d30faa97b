//! Coordination Client Error Hierarchy
//!
//! Service-native failures ([`ServiceError`]) are translated exactly once, at the
//! connection boundary, into [`Error`]. Higher-level recipes (transactions, locks,
//! queues) only ever observe the translated types.

use config::ConfigError;

use crate::service::ServiceError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Target path is absent
    #[error("No node at path: {path}")]
    NoNode { path: String },

    /// `create` target already present
    #[error("Node already exists at path: {path}")]
    NodeExists { path: String },

    /// Any other service failure, propagated unmodified
    #[error(transparent)]
    Service(ServiceError),

    /// Payload encoding/decoding failures
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Configuration validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Operation requires an opened session
    #[error("Client is not opened")]
    NotOpened,

    #[error("Client is already opened")]
    AlreadyOpened,

    /// Commit was attempted with no buffered operations
    #[error("Write request '{comment}' has no operations")]
    EmptyTransaction { comment: String },

    /// Recursive create/delete cannot be expressed inside an atomic batch
    #[error("Recursive operation on {path} must be the only operation of its write request")]
    RecursiveInBatch { path: String },

    /// `consume()` called without a claimed item
    #[error("Queue {queue} has no claimed item to consume")]
    NothingClaimed { queue: String },

    /// Claimed queue entry without a payload
    #[error("Queue entry {path} carries no payload")]
    EmptyEntry { path: String },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal invariant violations
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<ServiceError> for Error {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NoNode { path } => Error::NoNode { path },
            ServiceError::NodeExists { path } => Error::NodeExists { path },
            other => Error::Service(other),
        }
    }
}

impl Error {
    pub fn is_no_node(&self) -> bool {
        matches!(self, Error::NoNode { .. })
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, Error::NodeExists { .. })
    }
}

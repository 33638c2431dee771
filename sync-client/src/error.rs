//! Error types for sync-client.

use std::time::Duration;

use inline_sync_types::{describe_rpc_error, Method, RpcErrorCode, WireError};

use crate::transport::TransportError;

/// Outcome of a failed RPC call.
#[derive(Debug, thiserror::Error)]
pub enum RpcCallError {
    /// The server answered with an error.
    #[error("{}", describe_rpc_error(*code, message, *status))]
    Rpc {
        /// Server error code.
        code: RpcErrorCode,
        /// Server message.
        message: String,
        /// HTTP-style status, 0 if absent.
        status: i32,
    },

    /// No reply arrived in time.
    #[error("{method} timed out after {}ms", after.as_millis())]
    Timeout {
        /// Method that was called.
        method: Method,
        /// How long the caller waited.
        after: Duration,
    },

    /// The session reset before a reply arrived.
    #[error("session stopped")]
    Stopped,

    /// No open session to send on.
    #[error("not connected")]
    NotConnected,

    /// Transport error while sending.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame could not be encoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The reply's variant did not match the method.
    #[error("unexpected result: expected {expected}, got {actual}")]
    UnexpectedResult {
        /// Method that was called.
        expected: Method,
        /// Method the result belongs to.
        actual: Method,
    },
}

impl RpcCallError {
    /// Whether retrying the same call later might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcCallError::Rpc { code, .. } => {
                matches!(code, RpcErrorCode::RateLimited | RpcErrorCode::InternalError)
            }
            RpcCallError::Timeout { .. }
            | RpcCallError::Stopped
            | RpcCallError::NotConnected
            | RpcCallError::Transport(_) => true,
            RpcCallError::Wire(_) | RpcCallError::UnexpectedResult { .. } => false,
        }
    }
}

/// Sync storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored bucket key could not be parsed.
    #[error("invalid bucket key: {0}")]
    InvalidBucketKey(String),

    /// Storage refused the operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Domain apply errors.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The update could not be persisted.
    #[error("apply failed: {0}")]
    Failed(String),

    /// The update refers to state the domain does not have.
    #[error("missing dependency: {0}")]
    MissingDependency(String),
}

//! P2P-specific error types.

use std::io;
use thiserror::Error;

use crate::wire::WireError;

/// Errors that can occur during TCP transport operations.
#[derive(Debug, Error)]
pub enum P2pError {
    /// Failed to connect to peer.
    #[error("failed to connect to {endpoint}: {source}")]
    ConnectionFailed {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Failed to send message.
    #[error("failed to send frame to {endpoint}: {source}")]
    SendFailed {
        endpoint: String,
        #[source]
        source: WireError,
    },

    /// Failed to receive message.
    #[error("failed to receive frame: {0}")]
    ReceiveFailed(#[from] WireError),

    /// Listener bind failed.
    #[error("failed to bind listener on {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Inbound channel closed unexpectedly.
    #[error("inbound channel closed")]
    ChannelClosed,

    /// Timeout waiting for operation.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl From<P2pError> for crate::transport::TransportError {
    fn from(err: P2pError) -> Self {
        use crate::transport::TransportError;
        match err {
            P2pError::ConnectionFailed { .. } => TransportError::ConnectionFailed(err.to_string()),
            P2pError::SendFailed { .. } => TransportError::SendFailed(err.to_string()),
            P2pError::Timeout(msg) => TransportError::Timeout(msg),
            P2pError::ChannelClosed => TransportError::Closed,
            other => TransportError::Other(other.to_string()),
        }
    }
}

//! Transport Abstraction for Session Message Passing
//!
//! A transport moves opaque frames between endpoints. It knows nothing about
//! parties, sessions or rounds; the router layers those on top.
//!
//! ## Architecture
//!
//! ```text
//! MessageRouter
//!     ↓
//! Transport trait (abstract)
//!     ├─ TcpTransport (direct peer connections)
//!     └─ MemoryTransport (in-process clusters)
//!     ↓
//! InboundStream (one per node, consumed by the router)
//! ```
//!
//! Sends are best-effort: a failed send is reported to the caller and never
//! retried here.

use std::sync::Arc;

use async_trait::async_trait;
use common::PeerEndpoint;
use serde::{Deserialize, Serialize};

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Failed to open a connection to the endpoint.
    ConnectionFailed(String),
    /// Message send failed on an open connection.
    SendFailed(String),
    /// Nothing is listening at the endpoint.
    NotConnected(String),
    /// Frame could not be encoded.
    InvalidMessage(String),
    /// Timeout waiting for the peer.
    Timeout(String),
    /// The local transport has been shut down.
    Closed,
    /// Other transport-specific error.
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            Self::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            Self::NotConnected(msg) => write!(f, "Not connected: {}", msg),
            Self::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            Self::Timeout(msg) => write!(f, "Timeout: {}", msg),
            Self::Closed => write!(f, "Transport closed"),
            Self::Other(msg) => write!(f, "Transport error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Transport type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportType {
    /// Direct TCP connections between nodes.
    Tcp,
    /// For testing: in-memory message passing.
    InMemory,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::InMemory => write!(f, "in-memory"),
        }
    }
}

/// A raw frame received from the substrate.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Remote address the frame arrived from, when the substrate knows it.
    /// This is the connection's source, not necessarily the peer's listen
    /// endpoint.
    pub source: Option<String>,
    pub bytes: Vec<u8>,
}

/// Unbounded inbound frame sequence.
///
/// The receiver can be cloned, so a new consumer can take over if the
/// routing task is restarted.
pub type InboundStream = async_channel::Receiver<InboundFrame>;

/// Transport trait for peer message passing.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Endpoint other nodes use to reach this one.
    fn local_endpoint(&self) -> &PeerEndpoint;

    /// Get the transport type.
    fn transport_type(&self) -> TransportType;

    /// Deliver one frame to an endpoint.
    async fn send(&self, endpoint: &PeerEndpoint, bytes: Vec<u8>) -> Result<(), TransportError>;
}

/// Shared transport handle.
pub type SharedTransport = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::ConnectionFailed("refused".to_string());
        assert_eq!(err.to_string(), "Connection failed: refused");
        assert_eq!(TransportError::Closed.to_string(), "Transport closed");
    }

    #[test]
    fn test_transport_type_display() {
        assert_eq!(TransportType::Tcp.to_string(), "tcp");
        assert_eq!(TransportType::InMemory.to_string(), "in-memory");
    }
}

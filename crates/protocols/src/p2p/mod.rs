//! Direct TCP transport between nodes.
//!
//! Each node listens on its P2P port and opens one outbound connection per
//! peer endpoint. Inbound connections are read-only; outbound connections
//! are write-only.

pub mod connection;
pub mod error;
pub mod receiver;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use common::PeerEndpoint;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use connection::{ConnectionManager, DEFAULT_P2P_PORT};
pub use error::P2pError;

use crate::transport::{InboundStream, Transport, TransportError, TransportType};

/// TCP implementation of [`Transport`].
pub struct TcpTransport {
    local: PeerEndpoint,
    connections: ConnectionManager,
}

impl TcpTransport {
    /// Bind a listener and return the transport with its inbound stream.
    ///
    /// `advertised` is the endpoint peers use to reach this node. When `None`
    /// the bound socket address is advertised.
    pub async fn bind(
        listen_addr: SocketAddr,
        advertised: Option<PeerEndpoint>,
        cancel: CancellationToken,
    ) -> Result<(Self, InboundStream, JoinHandle<()>), P2pError> {
        let (tx, rx) = async_channel::unbounded();
        let (bound, handle) = receiver::spawn_receiver(listen_addr, tx, cancel).await?;
        let local = advertised.unwrap_or_else(|| PeerEndpoint::new(bound.to_string()));

        let transport = Self {
            local,
            connections: ConnectionManager::new(connection::CONNECT_TIMEOUT),
        };
        Ok((transport, rx, handle))
    }

    /// Override the outbound connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connections = ConnectionManager::new(timeout);
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_endpoint(&self) -> &PeerEndpoint {
        &self.local
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    async fn send(&self, endpoint: &PeerEndpoint, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.connections.send(endpoint, &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_frames_arrive_in_order() {
        let cancel = CancellationToken::new();
        let (receiver, inbound, _handle) =
            TcpTransport::bind("127.0.0.1:0".parse().unwrap(), None, cancel.clone())
                .await
                .unwrap();
        let (sender, _sender_inbound, _sender_handle) =
            TcpTransport::bind("127.0.0.1:0".parse().unwrap(), None, cancel.clone())
                .await
                .unwrap();

        let target = receiver.local_endpoint().clone();
        for i in 0u8..3 {
            sender.send(&target, vec![i; 4]).await.unwrap();
        }

        for i in 0u8..3 {
            let frame = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame.bytes, vec![i; 4]);
            assert!(frame.source.is_some());
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_bind_conflict_reported() {
        let cancel = CancellationToken::new();
        let (first, _inbound, _handle) =
            TcpTransport::bind("127.0.0.1:0".parse().unwrap(), None, cancel.clone())
                .await
                .unwrap();
        let taken: SocketAddr = first.local_endpoint().as_str().parse().unwrap();

        let result = TcpTransport::bind(taken, None, cancel.clone()).await;
        assert!(matches!(result, Err(P2pError::BindFailed { .. })));
        cancel.cancel();
    }
}

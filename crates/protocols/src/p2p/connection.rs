//! TCP connection management for peer messaging.
//!
//! Keeps one outbound connection per endpoint and reconnects once when a
//! write fails on a stale connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::PeerEndpoint;
use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::error::P2pError;
use crate::wire::write_frame;

/// Default P2P port.
pub const DEFAULT_P2P_PORT: u16 = 5040;

/// Connection timeout.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Writer = Arc<Mutex<WriteHalf<TcpStream>>>;

/// Manages outbound TCP connections to peer nodes.
pub struct ConnectionManager {
    /// Active connections: endpoint -> write half of TcpStream.
    connections: RwLock<HashMap<PeerEndpoint, Writer>>,
    connect_timeout: Duration,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Connect to an endpoint, reusing an existing connection.
    async fn connect(&self, endpoint: &PeerEndpoint) -> Result<Writer, P2pError> {
        // Check if we already have a connection
        {
            let connections = self.connections.read().await;
            if let Some(conn) = connections.get(endpoint) {
                return Ok(conn.clone());
            }
        }

        debug!("Connecting to {}", endpoint);

        // Connect with timeout
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(endpoint.as_str()),
        )
        .await
        .map_err(|_| P2pError::Timeout(format!("connecting to {}", endpoint)))?
        .map_err(|e| P2pError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            source: e,
        })?;

        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true).ok();

        info!("Connected to peer at {}", endpoint);

        // Only the write half is kept; inbound frames arrive through the listener
        let (read_half, write_half) = tokio::io::split(stream);
        drop(read_half);

        let write_arc = Arc::new(Mutex::new(write_half));
        let mut connections = self.connections.write().await;
        // Another task may have connected concurrently; keep the first one.
        let entry = connections.entry(endpoint.clone()).or_insert(write_arc);
        Ok(entry.clone())
    }

    async fn write_once(&self, endpoint: &PeerEndpoint, body: &[u8]) -> Result<(), P2pError> {
        let conn = self.connect(endpoint).await?;
        let mut writer = conn.lock().await;
        write_frame(&mut *writer, body)
            .await
            .map_err(|e| P2pError::SendFailed {
                endpoint: endpoint.to_string(),
                source: e,
            })
    }

    /// Send one frame to an endpoint.
    ///
    /// A write failure on a cached connection drops it and retries once on a
    /// fresh connection, covering peers that restarted since the last send.
    pub async fn send(&self, endpoint: &PeerEndpoint, body: &[u8]) -> Result<(), P2pError> {
        match self.write_once(endpoint, body).await {
            Ok(()) => Ok(()),
            Err(P2pError::SendFailed { .. }) => {
                self.remove_connection(endpoint).await;
                debug!("Retrying send to {} on a fresh connection", endpoint);
                let result = self.write_once(endpoint, body).await;
                if result.is_err() {
                    self.remove_connection(endpoint).await;
                }
                result
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a connection (e.g., on error).
    pub async fn remove_connection(&self, endpoint: &PeerEndpoint) {
        let mut connections = self.connections.write().await;
        if connections.remove(endpoint).is_some() {
            debug!("Removed connection to {}", endpoint);
        }
    }

    /// Number of cached outbound connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_reports_endpoint() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager = ConnectionManager::new(Duration::from_secs(1));
        let endpoint = PeerEndpoint::new(addr.to_string());
        let err = manager.send(&endpoint, b"hello").await.unwrap_err();

        assert!(err.to_string().contains(&addr.to_string()));
        assert_eq!(manager.connection_count().await, 0);
    }
}

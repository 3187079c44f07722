//! P2P receiver task for handling incoming connections and frames.
//!
//! Accepts TCP connections and forwards every frame, undecoded, to the
//! node's inbound stream.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::P2pError;
use crate::transport::InboundFrame;
use crate::wire::read_frame;

/// Bind the listener and spawn the accept loop.
///
/// Binding happens before this returns so callers see port conflicts
/// immediately. Returns the bound address (useful with port 0).
pub async fn spawn_receiver(
    listen_addr: SocketAddr,
    inbound: async_channel::Sender<InboundFrame>,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), P2pError> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| P2pError::BindFailed {
            address: listen_addr.to_string(),
            source: e,
        })?;
    let local_addr = listener.local_addr().map_err(|e| P2pError::BindFailed {
        address: listen_addr.to_string(),
        source: e,
    })?;

    info!("P2P listener bound to {}", local_addr);

    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => info!("P2P receiver stopped"),
            _ = run_receiver(listener, inbound) => error!("P2P receiver exited unexpectedly"),
        }
    });

    Ok((local_addr, handle))
}

/// Run the accept loop.
async fn run_receiver(listener: TcpListener, inbound: async_channel::Sender<InboundFrame>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                debug!("Accepted P2P connection from {}", peer_addr);

                // Disable Nagle's algorithm
                socket.set_nodelay(true).ok();

                // Spawn handler for this connection
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, peer_addr, inbound).await {
                        debug!("Connection from {} ended: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                // Continue listening
            }
        }
    }
}

/// Handle a single incoming connection.
async fn handle_connection(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    inbound: async_channel::Sender<InboundFrame>,
) -> Result<(), P2pError> {
    let source = peer_addr.to_string();

    while let Some(bytes) = read_frame(&mut socket).await? {
        debug!("Received {} byte frame from {}", bytes.len(), peer_addr);

        inbound
            .send(InboundFrame {
                source: Some(source.clone()),
                bytes,
            })
            .await
            .map_err(|_| P2pError::ChannelClosed)?;
    }

    debug!("Connection from {} closed", peer_addr);
    Ok(())
}

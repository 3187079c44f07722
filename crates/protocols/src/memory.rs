//! In-process transport for tests and local clusters.
//!
//! A [`MemoryNetwork`] is a shared switchboard mapping endpoints to inbound
//! channels. Nodes join it to obtain a transport and an inbound stream.
//! Individual links can be slowed down; a slowed link still delivers in order.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use common::PeerEndpoint;
use tokio::sync::RwLock;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::transport::{InboundFrame, InboundStream, Transport, TransportError, TransportType};

type Link = (PeerEndpoint, PeerEndpoint);

/// Shared switchboard for [`MemoryTransport`]s.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<PeerEndpoint, async_channel::Sender<InboundFrame>>>,
    /// Delayed links: (from, to) -> queue drained by a forwarding task.
    delayed: RwLock<HashMap<Link, DelayedLink>>,
}

#[derive(Clone)]
struct DelayedLink {
    delay: Duration,
    queue: async_channel::Sender<(Instant, InboundFrame)>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach an endpoint. Rejoining an endpoint replaces its inbound stream.
    pub async fn join(self: &Arc<Self>, endpoint: PeerEndpoint) -> (MemoryTransport, InboundStream) {
        let (tx, rx) = async_channel::unbounded();
        self.nodes.write().await.insert(endpoint.clone(), tx);
        debug!("{} joined memory network", endpoint);

        let transport = MemoryTransport {
            network: Arc::clone(self),
            local: endpoint,
        };
        (transport, rx)
    }

    /// Detach an endpoint; later sends to it fail.
    pub async fn leave(&self, endpoint: &PeerEndpoint) {
        if let Some(tx) = self.nodes.write().await.remove(endpoint) {
            tx.close();
        }
    }

    pub async fn endpoints(&self) -> Vec<PeerEndpoint> {
        self.nodes.read().await.keys().cloned().collect()
    }

    /// Hold every frame sent from `from` to `to` for `delay` before delivery.
    pub async fn delay_link(self: &Arc<Self>, from: PeerEndpoint, to: PeerEndpoint, delay: Duration) {
        let (queue, pending) = async_channel::unbounded::<(Instant, InboundFrame)>();
        let network = Arc::downgrade(self);
        let target = to.clone();
        tokio::spawn(forward_delayed(network, target, pending));

        debug!("Link {} -> {} delayed by {:?}", from, to, delay);
        self.delayed
            .write()
            .await
            .insert((from, to), DelayedLink { delay, queue });
    }

    async fn deliver(&self, to: &PeerEndpoint, frame: InboundFrame) -> Result<(), TransportError> {
        let tx = self
            .nodes
            .read()
            .await
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(to.to_string()))?;
        tx.try_send(frame)
            .map_err(|_| TransportError::NotConnected(to.to_string()))
    }
}

async fn forward_delayed(
    network: Weak<MemoryNetwork>,
    to: PeerEndpoint,
    pending: async_channel::Receiver<(Instant, InboundFrame)>,
) {
    while let Ok((due, frame)) = pending.recv().await {
        sleep_until(due).await;
        let Some(network) = network.upgrade() else {
            break;
        };
        if let Err(e) = network.deliver(&to, frame).await {
            debug!("Delayed frame to {} lost: {}", to, e);
        }
    }
}

/// Transport backed by a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: PeerEndpoint,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_endpoint(&self) -> &PeerEndpoint {
        &self.local
    }

    fn transport_type(&self) -> TransportType {
        TransportType::InMemory
    }

    async fn send(&self, endpoint: &PeerEndpoint, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.network.nodes.read().await.contains_key(endpoint) {
            return Err(TransportError::NotConnected(endpoint.to_string()));
        }

        let frame = InboundFrame {
            source: Some(self.local.to_string()),
            bytes,
        };

        let link = self
            .network
            .delayed
            .read()
            .await
            .get(&(self.local.clone(), endpoint.clone()))
            .cloned();
        match link {
            Some(link) => link
                .queue
                .try_send((Instant::now() + link.delay, frame))
                .map_err(|_| TransportError::NotConnected(endpoint.to_string())),
            None => self.network.deliver(endpoint, frame).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_delivery() {
        let network = MemoryNetwork::new();
        let (a, _a_inbound) = network.join("node-a".into()).await;
        let (_b, b_inbound) = network.join("node-b".into()).await;

        a.send(&"node-b".into(), vec![1, 2]).await.unwrap();

        let frame = b_inbound.recv().await.unwrap();
        assert_eq!(frame.bytes, vec![1, 2]);
        assert_eq!(frame.source.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_send_to_unknown_endpoint_fails() {
        let network = MemoryNetwork::new();
        let (a, _inbound) = network.join("node-a".into()).await;

        let err = a.send(&"node-x".into(), vec![1]).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_leave_closes_endpoint() {
        let network = MemoryNetwork::new();
        let (a, _a_inbound) = network.join("node-a".into()).await;
        let (_b, b_inbound) = network.join("node-b".into()).await;

        network.leave(&"node-b".into()).await;

        assert!(a.send(&"node-b".into(), vec![1]).await.is_err());
        assert!(b_inbound.recv().await.is_err());
        assert_eq!(network.endpoints().await, vec![PeerEndpoint::from("node-a")]);
    }

    #[tokio::test]
    async fn test_delayed_link_keeps_order() {
        let network = MemoryNetwork::new();
        let (a, a_inbound) = network.join("node-a".into()).await;
        let (b, b_inbound) = network.join("node-b".into()).await;
        let (_c, c_inbound) = network.join("node-c".into()).await;
        network
            .delay_link("node-a".into(), "node-b".into(), Duration::from_millis(200))
            .await;

        let started = Instant::now();
        for i in 0..3u8 {
            a.send(&"node-b".into(), vec![i]).await.unwrap();
        }
        // Other links are unaffected
        a.send(&"node-c".into(), vec![9]).await.unwrap();
        assert_eq!(c_inbound.try_recv().unwrap().bytes, vec![9]);
        assert!(b_inbound.try_recv().is_err());

        for i in 0..3u8 {
            assert_eq!(b_inbound.recv().await.unwrap().bytes, vec![i]);
        }
        assert!(started.elapsed() >= Duration::from_millis(200));

        // The reverse direction is not delayed
        b.send(&"node-a".into(), vec![7]).await.unwrap();
        assert_eq!(a_inbound.try_recv().unwrap().bytes, vec![7]);
    }
}

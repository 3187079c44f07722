//! Peer registry mapping party identities to network endpoints.
//!
//! Entries come from static configuration or from peer announcements. An
//! endpoint belongs to at most one party: announcing a party at an endpoint
//! already bound to another party evicts the stale binding.

use std::collections::HashMap;
use std::time::Instant;

use common::{PartyId, PeerEndpoint};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("cannot register the local party as a peer")]
    LocalParty,

    #[error("empty endpoint for party {0}")]
    EmptyEndpoint(PartyId),
}

/// Information about a peer node.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub party: PartyId,
    pub endpoint: PeerEndpoint,
    /// Whether the last send to or frame from the peer succeeded.
    pub is_online: bool,
    pub last_seen: Option<Instant>,
}

/// Serializable view for the info endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub party: PartyId,
    pub endpoint: PeerEndpoint,
    pub is_online: bool,
    pub last_seen_ms_ago: Option<u64>,
}

impl From<&PeerInfo> for PeerSummary {
    fn from(info: &PeerInfo) -> Self {
        Self {
            party: info.party.clone(),
            endpoint: info.endpoint.clone(),
            is_online: info.is_online,
            last_seen_ms_ago: info.last_seen.map(|t| t.elapsed().as_millis() as u64),
        }
    }
}

/// Result of looking up a party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(PeerEndpoint),
    Unresolved,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryUpdate {
    Added,
    Moved { previous: PeerEndpoint },
    Unchanged,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<PartyId, PeerInfo>,
    by_endpoint: HashMap<PeerEndpoint, PartyId>,
}

/// Registry of known peers.
pub struct PeerRegistry {
    local: PartyId,
    inner: RwLock<Inner>,
}

impl PeerRegistry {
    pub fn new(local: PartyId) -> Self {
        Self {
            local,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn local_party(&self) -> &PartyId {
        &self.local
    }

    /// Add or update a party's endpoint.
    pub async fn upsert(
        &self,
        party: PartyId,
        endpoint: PeerEndpoint,
    ) -> Result<RegistryUpdate, RegistryError> {
        if party == self.local {
            return Err(RegistryError::LocalParty);
        }
        if endpoint.as_str().is_empty() {
            return Err(RegistryError::EmptyEndpoint(party));
        }

        let mut inner = self.inner.write().await;

        // Evict any other party bound to this endpoint
        if let Some(owner) = inner.by_endpoint.get(&endpoint).cloned() {
            if owner != party {
                warn!(
                    "Endpoint {} moved from party {} to {}, evicting stale binding",
                    endpoint,
                    owner.short(),
                    party.short()
                );
                inner.peers.remove(&owner);
            }
        }

        let update = match inner.peers.get(&party) {
            Some(existing) if existing.endpoint == endpoint => RegistryUpdate::Unchanged,
            Some(existing) => RegistryUpdate::Moved {
                previous: existing.endpoint.clone(),
            },
            None => RegistryUpdate::Added,
        };

        if let RegistryUpdate::Moved { previous } = &update {
            inner.by_endpoint.remove(previous);
            info!(
                "Party {} moved from {} to {}",
                party.short(),
                previous,
                endpoint
            );
        }

        inner.by_endpoint.insert(endpoint.clone(), party.clone());
        let entry = inner.peers.entry(party.clone()).or_insert_with(|| PeerInfo {
            party: party.clone(),
            endpoint: endpoint.clone(),
            is_online: true,
            last_seen: None,
        });
        entry.endpoint = endpoint;

        if update == RegistryUpdate::Added {
            debug!("Added peer {} to registry", party.short());
        }
        Ok(update)
    }

    /// Current endpoint for a party.
    pub async fn resolve(&self, party: &PartyId) -> Resolution {
        let inner = self.inner.read().await;
        match inner.peers.get(party) {
            Some(info) => Resolution::Resolved(info.endpoint.clone()),
            None => Resolution::Unresolved,
        }
    }

    /// Reverse lookup by endpoint.
    pub async fn party_at(&self, endpoint: &PeerEndpoint) -> Option<PartyId> {
        self.inner.read().await.by_endpoint.get(endpoint).cloned()
    }

    pub async fn remove(&self, party: &PartyId) {
        let mut inner = self.inner.write().await;
        if let Some(info) = inner.peers.remove(party) {
            inner.by_endpoint.remove(&info.endpoint);
            debug!("Removed peer {} from registry", party.short());
        }
    }

    /// Mark a peer as offline.
    pub async fn mark_offline(&self, party: &PartyId) {
        let mut inner = self.inner.write().await;
        if let Some(peer) = inner.peers.get_mut(party) {
            if peer.is_online {
                debug!("Marked peer {} as offline", party.short());
            }
            peer.is_online = false;
        }
    }

    /// Mark a peer as online and refresh its last-seen time.
    pub async fn mark_online(&self, party: &PartyId) {
        let mut inner = self.inner.write().await;
        if let Some(peer) = inner.peers.get_mut(party) {
            if !peer.is_online {
                debug!("Marked peer {} as online", party.short());
            }
            peer.is_online = true;
            peer.last_seen = Some(Instant::now());
        }
    }

    pub async fn is_online(&self, party: &PartyId) -> bool {
        let inner = self.inner.read().await;
        inner.peers.get(party).map(|p| p.is_online).unwrap_or(false)
    }

    /// All known peers, sorted by party id.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let inner = self.inner.read().await;
        let mut peers: Vec<PeerInfo> = inner.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.party.cmp(&b.party));
        peers
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PeerRegistry {
        PeerRegistry::new("local".into())
    }

    #[tokio::test]
    async fn test_resolve_known_and_unknown() {
        let registry = registry();
        registry
            .upsert("p1".into(), "10.0.0.1:5040".into())
            .await
            .unwrap();

        assert_eq!(
            registry.resolve(&"p1".into()).await,
            Resolution::Resolved("10.0.0.1:5040".into())
        );
        assert_eq!(registry.resolve(&"p2".into()).await, Resolution::Unresolved);
    }

    #[tokio::test]
    async fn test_rejects_local_party() {
        let registry = registry();
        let err = registry
            .upsert("local".into(), "10.0.0.1:5040".into())
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::LocalParty);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_reconnect_with_new_address() {
        let registry = registry();
        registry
            .upsert("p1".into(), "10.0.0.1:5040".into())
            .await
            .unwrap();
        let update = registry
            .upsert("p1".into(), "10.0.0.9:5040".into())
            .await
            .unwrap();

        assert_eq!(
            update,
            RegistryUpdate::Moved {
                previous: "10.0.0.1:5040".into()
            }
        );
        assert_eq!(registry.party_at(&"10.0.0.1:5040".into()).await, None);
        assert_eq!(
            registry.party_at(&"10.0.0.9:5040".into()).await,
            Some("p1".into())
        );
    }

    #[tokio::test]
    async fn test_endpoint_collision_evicts_stale_party() {
        let registry = registry();
        registry
            .upsert("p1".into(), "10.0.0.1:5040".into())
            .await
            .unwrap();
        registry
            .upsert("p2".into(), "10.0.0.1:5040".into())
            .await
            .unwrap();

        assert_eq!(registry.resolve(&"p1".into()).await, Resolution::Unresolved);
        assert_eq!(
            registry.resolve(&"p2".into()).await,
            Resolution::Resolved("10.0.0.1:5040".into())
        );
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_online_tracking() {
        let registry = registry();
        registry
            .upsert("p1".into(), "10.0.0.1:5040".into())
            .await
            .unwrap();

        registry.mark_offline(&"p1".into()).await;
        assert!(!registry.is_online(&"p1".into()).await);

        registry.mark_online(&"p1".into()).await;
        assert!(registry.is_online(&"p1".into()).await);
        assert!(registry.peers().await[0].last_seen.is_some());
    }
}

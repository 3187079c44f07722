//! Node state shared with the HTTP handlers.

use std::sync::Arc;
use std::time::Instant;

use common::{PartyId, ProtocolMetrics};
use protocols::{KeyShareStore, PeerRegistry, PreParamsProvider};
use uuid::Uuid;

use crate::manager::SessionManager;

/// Node state.
pub struct NodeState {
    pub node_id: Uuid,
    pub party: PartyId,
    pub started_at: Instant,
    pub manager: Arc<SessionManager>,
    pub registry: Arc<PeerRegistry>,
    pub pre_params: Arc<PreParamsProvider>,
    pub shares: Arc<KeyShareStore>,
    pub metrics: Arc<ProtocolMetrics>,
}

impl NodeState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

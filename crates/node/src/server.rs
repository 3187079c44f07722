//! Wiring of one TSS node: router, session manager, HTTP routes.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{delete, get, post},
    Router,
};
use common::{PartyId, PeerEndpoint, ProtocolMetrics, TssConfig};
use protocols::{
    EngineFactory, InboundStream, KeyShareStore, MessageRouter, PeerRegistry, PreParamsProvider,
    RegistryError, RegistryUpdate, SharedTransport,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::handlers;
use crate::manager::SessionManager;
use crate::session::SessionServices;
use crate::state::NodeState;

/// Everything a node needs from its environment.
pub struct NodeComponents {
    pub party: PartyId,
    pub config: TssConfig,
    pub transport: SharedTransport,
    pub inbound: InboundStream,
    pub engines: Arc<dyn EngineFactory>,
    pub pre_params: Arc<PreParamsProvider>,
    pub shares: Arc<KeyShareStore>,
}

pub struct TssServer {
    state: Arc<NodeState>,
    router: Arc<MessageRouter>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TssServer {
    /// Start the router and background tasks. Must run inside a runtime.
    pub fn start(components: NodeComponents, shutdown: CancellationToken) -> Self {
        let NodeComponents {
            party,
            config,
            transport,
            inbound,
            engines,
            pre_params,
            shares,
        } = components;

        let metrics = Arc::new(ProtocolMetrics::new(party.as_str()));
        let registry = Arc::new(PeerRegistry::new(party.clone()));
        let router = Arc::new(MessageRouter::new(
            party.clone(),
            transport,
            Arc::clone(&registry),
            Arc::clone(&metrics),
        ));

        let services = Arc::new(SessionServices {
            local: party.clone(),
            config,
            router: Arc::clone(&router),
            engines,
            pre_params: Arc::clone(&pre_params),
            shares: Arc::clone(&shares),
            metrics: Arc::clone(&metrics),
        });
        let manager = SessionManager::new(services, shutdown.child_token());

        let tasks = vec![
            router.spawn_inbound(inbound, shutdown.clone()),
            manager.spawn_cleanup_task(),
        ];

        let state = Arc::new(NodeState {
            node_id: Uuid::new_v4(),
            party,
            started_at: Instant::now(),
            manager,
            registry,
            pre_params,
            shares,
            metrics,
        });

        Self {
            state,
            router,
            shutdown,
            tasks,
        }
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.state.manager
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn party(&self) -> &PartyId {
        &self.state.party
    }

    /// Bind a peer to a static endpoint.
    pub async fn add_peer(
        &self,
        party: PartyId,
        endpoint: PeerEndpoint,
    ) -> Result<RegistryUpdate, RegistryError> {
        self.state.registry.upsert(party, endpoint).await
    }

    /// Announce ourselves to every known peer.
    pub async fn announce(&self) {
        for peer in self.state.registry.peers().await {
            match self.router.announce(&peer.endpoint, false).await {
                Ok(()) => debug!("Announced to {} at {}", peer.party.short(), peer.endpoint),
                Err(e) => warn!(
                    "Could not announce to {} at {}: {}",
                    peer.party.short(),
                    peer.endpoint,
                    e
                ),
            }
        }
    }

    /// Keygen and keysign API.
    pub fn tss_routes(&self) -> Router {
        Router::new()
            .route("/keygen", post(handlers::keygen))
            .route("/keysign", post(handlers::keysign))
            .with_state(Arc::clone(&self.state))
    }

    /// Liveness, metrics and inspection API.
    pub fn info_routes(&self) -> Router {
        Router::new()
            .route("/ping", get(handlers::ping))
            .route("/status", get(handlers::status))
            .route("/metrics", get(handlers::metrics))
            .route("/peers", get(handlers::list_peers))
            .route("/sessions", get(handlers::list_sessions))
            .route("/sessions/{session_id}", delete(handlers::cancel_session))
            .with_state(Arc::clone(&self.state))
    }

    /// Cancel live sessions and stop background tasks.
    pub async fn stop(self) {
        info!("Stopping node {}", self.state.party.short());
        self.state.manager.shutdown().await;
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

/// Serve `app` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

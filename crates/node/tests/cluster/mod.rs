//! In-process cluster of TSS nodes connected by a memory network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{
    KeygenRequest, KeysignRequest, Outcome, PartyId, PeerEndpoint, SessionOutput, SessionRequest,
    TssConfig,
};
use futures::future::join_all;
use protocols::{
    EngineContext, EngineError, EngineEvent, EngineFactory, KeyShareStore, MemoryNetwork,
    OutboundMessage, PreParamsProvider, ProtocolEngine, ReferenceEngineFactory,
};
use tokio_util::sync::CancellationToken;
use tss_node::{NodeComponents, TssServer};

pub const PRE_PARAMS_LEN: usize = 64;

pub fn fast_config() -> TssConfig {
    TssConfig {
        keygen_timeout: Duration::from_secs(5),
        keysign_timeout: Duration::from_secs(5),
        pre_param_timeout: Duration::from_secs(2),
        join_timeout: Duration::from_secs(3),
        ready_interval: Duration::from_millis(50),
        session_retention: Duration::from_secs(60),
        cleanup_interval: Duration::from_secs(60),
    }
}

pub fn party(index: usize) -> PartyId {
    PartyId::new(format!("02{:064x}", index + 1))
}

pub fn endpoint(index: usize) -> PeerEndpoint {
    format!("node-{}", index).as_str().into()
}

pub struct LocalCluster {
    pub network: Arc<MemoryNetwork>,
    pub nodes: Vec<TssServer>,
    shutdown: CancellationToken,
}

impl LocalCluster {
    pub async fn start(n: usize) -> Self {
        let engines = (0..n)
            .map(|_| Arc::new(ReferenceEngineFactory) as Arc<dyn EngineFactory>)
            .collect();
        Self::with_engines(engines, fast_config()).await
    }

    /// One node per engine factory, every node knowing every other.
    pub async fn with_engines(engines: Vec<Arc<dyn EngineFactory>>, config: TssConfig) -> Self {
        let network = MemoryNetwork::new();
        let shutdown = CancellationToken::new();

        let mut nodes = Vec::with_capacity(engines.len());
        for (i, engines) in engines.into_iter().enumerate() {
            let (transport, inbound) = network.join(endpoint(i)).await;
            let pre_params = Arc::new(PreParamsProvider::ready(
                party(i),
                engines.clone(),
                vec![7u8; PRE_PARAMS_LEN],
            ));
            nodes.push(TssServer::start(
                NodeComponents {
                    party: party(i),
                    config: config.clone(),
                    transport: Arc::new(transport),
                    inbound,
                    engines,
                    pre_params,
                    shares: Arc::new(KeyShareStore::in_memory()),
                },
                shutdown.child_token(),
            ));
        }

        for (i, node) in nodes.iter().enumerate() {
            for j in 0..nodes.len() {
                if i != j {
                    node.add_peer(party(j), endpoint(j))
                        .await
                        .unwrap();
                }
            }
        }

        Self {
            network,
            nodes,
            shutdown,
        }
    }

    /// Delay every frame node `from` sends to node `to`.
    pub async fn slow_link(&self, from: usize, to: usize, delay: Duration) {
        self.network
            .delay_link(endpoint(from), endpoint(to), delay)
            .await;
    }

    pub fn parties(&self) -> Vec<PartyId> {
        (0..self.nodes.len()).map(party).collect()
    }

    pub fn keygen_request(&self) -> SessionRequest {
        KeygenRequest::new(self.parties()).unwrap().into()
    }

    pub fn keysign_request(&self, pool_pub_key: &str, message: &[u8], signers: &[usize]) -> SessionRequest {
        KeysignRequest::new(
            pool_pub_key,
            message.to_vec(),
            signers.iter().map(|i| party(*i)).collect(),
        )
        .unwrap()
        .into()
    }

    /// Submit `request` on the given nodes concurrently and wait for all outcomes.
    pub async fn run_on(&self, request: &SessionRequest, on: &[usize]) -> Vec<Outcome> {
        let runs = on.iter().map(|i| {
            let manager = self.nodes[*i].manager().clone();
            let request = request.clone();
            async move { manager.join(request).await.unwrap().wait().await }
        });
        join_all(runs).await
    }

    pub async fn run_all(&self, request: &SessionRequest) -> Vec<Outcome> {
        let all: Vec<usize> = (0..self.nodes.len()).collect();
        self.run_on(request, &all).await
    }

    /// Keygen on every node, returning the agreed pool key.
    pub async fn keygen(&self) -> String {
        let outcomes = self.run_all(&self.keygen_request()).await;
        let keys: Vec<String> = outcomes.into_iter().map(pool_key).collect();
        assert!(keys.iter().all(|k| *k == keys[0]), "nodes disagree: {:?}", keys);
        keys[0].clone()
    }

    pub async fn stop(self) {
        for node in self.nodes {
            node.stop().await;
        }
        self.shutdown.cancel();
    }
}

pub fn pool_key(outcome: Outcome) -> String {
    match outcome {
        Outcome::Success {
            output: SessionOutput::Keygen(output),
        } => output.public_key,
        other => panic!("keygen failed: {:?}", other),
    }
}

/// Wraps the reference factory and counts engine creations.
pub struct CountingFactory {
    pub created: AtomicUsize,
}

impl CountingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
        })
    }

    pub fn count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl EngineFactory for CountingFactory {
    fn create(&self, ctx: EngineContext) -> Result<Box<dyn ProtocolEngine>, EngineError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        ReferenceEngineFactory.create(ctx)
    }

    fn generate_pre_params(&self) -> Result<Vec<u8>, EngineError> {
        ReferenceEngineFactory.generate_pre_params()
    }
}

/// How a misbehaving engine misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Never sends anything.
    Mute,
    /// Broadcasts garbage in round 1.
    Garbage,
    /// Broadcasts two different well-formed commitments in round 1.
    Equivocate,
    /// Commits to one contribution and reveals another.
    BadReveal,
}

pub struct FaultyFactory(pub Fault);

impl EngineFactory for FaultyFactory {
    fn create(&self, ctx: EngineContext) -> Result<Box<dyn ProtocolEngine>, EngineError> {
        match self.0 {
            Fault::Mute | Fault::Garbage => Ok(Box::new(FaultyEngine { fault: self.0 })),
            Fault::Equivocate | Fault::BadReveal => Ok(Box::new(TwoFacedEngine {
                fault: self.0,
                honest: ReferenceEngineFactory.create(ctx.clone())?,
                decoy: ReferenceEngineFactory.create(ctx)?,
            })),
        }
    }

    fn generate_pre_params(&self) -> Result<Vec<u8>, EngineError> {
        Ok(vec![0u8; PRE_PARAMS_LEN])
    }
}

struct FaultyEngine {
    fault: Fault,
}

impl ProtocolEngine for FaultyEngine {
    fn total_rounds(&self) -> u16 {
        2
    }

    fn current_round(&self) -> u16 {
        1
    }

    fn start(&mut self) -> Result<Vec<OutboundMessage>, EngineError> {
        Ok(match self.fault {
            Fault::Mute => Vec::new(),
            Fault::Garbage => vec![OutboundMessage::broadcast(1, vec![0xde, 0xad])],
            Fault::Equivocate | Fault::BadReveal => {
                unreachable!("FaultyFactory builds TwoFacedEngine for {:?}", self.fault)
            }
        })
    }

    fn handle_message(
        &mut self,
        _round: u16,
        _sender: &PartyId,
        _payload: &[u8],
    ) -> Result<EngineEvent, EngineError> {
        Ok(EngineEvent::Accepted)
    }
}

/// Runs the reference protocol, but also speaks for a decoy instance with
/// its own contribution.
struct TwoFacedEngine {
    fault: Fault,
    honest: Box<dyn ProtocolEngine>,
    decoy: Box<dyn ProtocolEngine>,
}

impl ProtocolEngine for TwoFacedEngine {
    fn total_rounds(&self) -> u16 {
        self.honest.total_rounds()
    }

    fn current_round(&self) -> u16 {
        self.honest.current_round()
    }

    fn start(&mut self) -> Result<Vec<OutboundMessage>, EngineError> {
        let decoy = self.decoy.start()?;
        if self.fault == Fault::BadReveal {
            return Ok(decoy);
        }
        let mut outbound = self.honest.start()?;
        outbound.extend(decoy);
        Ok(outbound)
    }

    fn handle_message(
        &mut self,
        round: u16,
        sender: &PartyId,
        payload: &[u8],
    ) -> Result<EngineEvent, EngineError> {
        self.honest.handle_message(round, sender, payload)
    }
}

/// Engine factory that panics when a session creates its engine.
pub struct PanickingFactory;

impl EngineFactory for PanickingFactory {
    fn create(&self, _ctx: EngineContext) -> Result<Box<dyn ProtocolEngine>, EngineError> {
        panic!("engine construction blew up");
    }

    fn generate_pre_params(&self) -> Result<Vec<u8>, EngineError> {
        Ok(vec![0u8; PRE_PARAMS_LEN])
    }
}

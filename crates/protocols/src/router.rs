//! Message router between the transport and live sessions.
//!
//! Inbound: decode the frame, check it targets a registered session and that
//! the sender is one of its participants, then push it onto that session's
//! queue. Anything else is dropped and logged, never surfaced as an error.
//!
//! Outbound: resolve each recipient through the peer registry and send
//! best-effort, reporting per-peer failures back to the session.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    EventType, LogEvent, PartyId, PeerEndpoint, ProtocolMetrics, RunTag, SessionId,
};
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{PeerRegistry, Resolution};
use crate::transport::{InboundFrame, InboundStream, SharedTransport, TransportError};
use crate::wire::{PeerAnnouncement, ReadyMessage, RoundMessage, WireMessage};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("session {0} already has a route")]
    AlreadyRegistered(SessionId),
}

/// Message delivered to a session's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInbound {
    Ready(ReadyMessage),
    Round(RoundMessage),
}

/// What happened to an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundDisposition {
    Delivered,
    PeerAnnounced,
    /// Session terminated recently; dropped quietly.
    Retired,
    UnknownSession,
    UnknownSender,
    Misaddressed,
    Undecodable,
}

impl InboundDisposition {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::PeerAnnounced => "peer_announced",
            Self::Retired => "retired_session",
            Self::UnknownSession => "unknown_session",
            Self::UnknownSender => "unknown_sender",
            Self::Misaddressed => "misaddressed",
            Self::Undecodable => "undecodable",
        }
    }
}

/// Per-peer results of one outbound dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<PartyId>,
    pub failed: Vec<(PartyId, String)>,
}

impl DispatchReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Route {
    participants: HashSet<PartyId>,
    tx: async_channel::Sender<SessionInbound>,
}

/// Routes frames between the transport and session queues.
pub struct MessageRouter {
    local: PartyId,
    transport: SharedTransport,
    registry: Arc<PeerRegistry>,
    metrics: Arc<ProtocolMetrics>,
    routes: RwLock<HashMap<SessionId, Route>>,
    /// Tombstones: session id -> time of termination.
    retired: RwLock<HashMap<SessionId, Instant>>,
    seq: AtomicU64,
}

impl MessageRouter {
    pub fn new(
        local: PartyId,
        transport: SharedTransport,
        registry: Arc<PeerRegistry>,
        metrics: Arc<ProtocolMetrics>,
    ) -> Self {
        Self {
            local,
            transport,
            registry,
            metrics,
            routes: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn local_party(&self) -> &PartyId {
        &self.local
    }

    pub fn local_endpoint(&self) -> &PeerEndpoint {
        self.transport.local_endpoint()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Open a queue for a session. Clears any tombstone for the id.
    pub async fn register(
        &self,
        session_id: &SessionId,
        participants: &[PartyId],
    ) -> Result<async_channel::Receiver<SessionInbound>, RouterError> {
        let mut routes = self.routes.write().await;
        if routes.contains_key(session_id) {
            return Err(RouterError::AlreadyRegistered(session_id.clone()));
        }

        let (tx, rx) = async_channel::unbounded();
        routes.insert(
            session_id.clone(),
            Route {
                participants: participants.iter().cloned().collect(),
                tx,
            },
        );
        drop(routes);

        self.retired.write().await.remove(session_id);
        debug!("Registered route for session {}", session_id.short());
        Ok(rx)
    }

    /// Close a session's queue and leave a tombstone for stray traffic.
    pub async fn unregister(&self, session_id: &SessionId) -> bool {
        let removed = self.routes.write().await.remove(session_id);
        match removed {
            Some(route) => {
                route.tx.close();
                self.retired
                    .write()
                    .await
                    .insert(session_id.clone(), Instant::now());
                debug!("Unregistered route for session {}", session_id.short());
                true
            }
            None => false,
        }
    }

    pub async fn is_registered(&self, session_id: &SessionId) -> bool {
        self.routes.read().await.contains_key(session_id)
    }

    pub async fn is_retired(&self, session_id: &SessionId) -> bool {
        self.retired.read().await.contains_key(session_id)
    }

    pub async fn active_routes(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Forget tombstones older than `retention`.
    pub async fn purge_retired(&self, retention: Duration) -> usize {
        let mut retired = self.retired.write().await;
        let before = retired.len();
        retired.retain(|_, at| at.elapsed() < retention);
        before - retired.len()
    }

    /// Encode and send one message to one party.
    async fn send_to(&self, party: &PartyId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let endpoint = match self.registry.resolve(party).await {
            Resolution::Resolved(endpoint) => endpoint,
            Resolution::Unresolved => {
                return Err(TransportError::NotConnected(format!(
                    "no endpoint for party {}",
                    party.short()
                )))
            }
        };

        let len = bytes.len() as u64;
        match self.transport.send(&endpoint, bytes).await {
            Ok(()) => {
                self.metrics.inc_messages_sent(len);
                Ok(())
            }
            Err(e) => {
                self.metrics.inc_send_failures();
                if self.registry.is_online(party).await {
                    LogEvent::new(EventType::PeerOffline)
                        .with_party(party.as_str())
                        .with_error(e.to_string())
                        .emit();
                }
                self.registry.mark_offline(party).await;
                Err(e)
            }
        }
    }

    async fn fan_out(&self, recipients: &[PartyId], msg: &WireMessage) -> DispatchReport {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                return DispatchReport {
                    delivered: Vec::new(),
                    failed: recipients
                        .iter()
                        .map(|p| (p.clone(), e.to_string()))
                        .collect(),
                }
            }
        };

        let sends = recipients
            .iter()
            .filter(|p| **p != self.local)
            .map(|party| {
                let bytes = bytes.clone();
                async move { (party.clone(), self.send_to(party, bytes).await) }
            });

        let mut report = DispatchReport::default();
        for (party, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered.push(party),
                Err(e) => {
                    debug!("Send to {} failed: {}", party.short(), e);
                    report.failed.push((party, e.to_string()));
                }
            }
        }
        report
    }

    /// Announce session readiness, or answer the announcement of run `ack`.
    pub async fn send_ready(
        &self,
        session_id: &SessionId,
        run: RunTag,
        ack: Option<RunTag>,
        recipients: &[PartyId],
    ) -> DispatchReport {
        let msg = WireMessage::Ready(ReadyMessage {
            session_id: session_id.clone(),
            sender: self.local.clone(),
            run,
            ack,
        });
        self.fan_out(recipients, &msg).await
    }

    /// Send one round message to `recipients`.
    ///
    /// `target` is stamped into the message for point-to-point messages and
    /// is None for broadcasts.
    pub async fn dispatch_round(
        &self,
        session_id: &SessionId,
        run: RunTag,
        round: u16,
        target: Option<&PartyId>,
        recipients: &[PartyId],
        payload: Vec<u8>,
    ) -> DispatchReport {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let msg = WireMessage::Round(RoundMessage::new(
            session_id.clone(),
            self.local.clone(),
            run,
            target.cloned(),
            round,
            payload,
            seq,
        ));
        let report = self.fan_out(recipients, &msg).await;
        debug!(
            "Session {} round {}: sent to {}/{} peers",
            session_id.short(),
            round,
            report.delivered.len(),
            recipients.len()
        );
        report
    }

    fn announcement(&self, reply: bool) -> Result<Vec<u8>, TransportError> {
        WireMessage::Hello(PeerAnnouncement {
            party: self.local.clone(),
            endpoint: self.transport.local_endpoint().clone(),
            reply,
        })
        .encode()
        .map_err(|e| TransportError::InvalidMessage(e.to_string()))
    }

    /// Tell a peer who we are and where we listen.
    pub async fn announce(&self, endpoint: &PeerEndpoint, reply: bool) -> Result<(), TransportError> {
        let bytes = self.announcement(reply)?;
        self.transport.send(endpoint, bytes).await
    }

    /// Handle one inbound frame.
    pub async fn handle_frame(&self, frame: InboundFrame) -> InboundDisposition {
        let len = frame.bytes.len() as u64;
        let msg = match WireMessage::decode(&frame.bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(
                    "Failed to decode frame from {}: {}",
                    frame.source.as_deref().unwrap_or("unknown"),
                    e
                );
                return self.dropped(None, None, InboundDisposition::Undecodable);
            }
        };

        let (session_id, sender, inbound) = match msg {
            WireMessage::Hello(hello) => return self.handle_hello(hello).await,
            WireMessage::Ready(ready) => (
                ready.session_id.clone(),
                ready.sender.clone(),
                SessionInbound::Ready(ready),
            ),
            WireMessage::Round(round) => {
                if round.recipient.as_ref().is_some_and(|r| *r != self.local) {
                    return self.dropped(
                        Some(&round.session_id),
                        Some(&round.sender),
                        InboundDisposition::Misaddressed,
                    );
                }
                (
                    round.session_id.clone(),
                    round.sender.clone(),
                    SessionInbound::Round(round),
                )
            }
        };

        let disposition = {
            let routes = self.routes.read().await;
            match routes.get(&session_id) {
                Some(route) if !route.participants.contains(&sender) || sender == self.local => {
                    InboundDisposition::UnknownSender
                }
                Some(route) => match route.tx.try_send(inbound) {
                    Ok(()) => InboundDisposition::Delivered,
                    Err(_) => InboundDisposition::Retired,
                },
                None => InboundDisposition::UnknownSession,
            }
        };

        if disposition == InboundDisposition::UnknownSession && self.is_retired(&session_id).await {
            // Late traffic for a finished run
            self.metrics.inc_messages_dropped();
            debug!(
                "Dropped late message for retired session {} from {}",
                session_id.short(),
                sender.short()
            );
            return InboundDisposition::Retired;
        }

        match disposition {
            InboundDisposition::Delivered => {
                self.metrics.inc_messages_received(len);
                self.registry.mark_online(&sender).await;
                disposition
            }
            other => self.dropped(Some(&session_id), Some(&sender), other),
        }
    }

    async fn handle_hello(&self, hello: PeerAnnouncement) -> InboundDisposition {
        if hello.party == self.local {
            return InboundDisposition::PeerAnnounced;
        }

        match self
            .registry
            .upsert(hello.party.clone(), hello.endpoint.clone())
            .await
        {
            Ok(update) => {
                debug!("Peer {} announced at {}: {:?}", hello.party.short(), hello.endpoint, update);
                self.registry.mark_online(&hello.party).await;
                LogEvent::new(EventType::PeerOnline)
                    .with_party(hello.party.as_str())
                    .with_context("endpoint", hello.endpoint.as_str())
                    .emit();
            }
            Err(e) => {
                warn!("Ignoring announcement from {}: {}", hello.party.short(), e);
                return InboundDisposition::PeerAnnounced;
            }
        }

        if !hello.reply {
            // Answered off the inbound path: connecting to the endpoint may stall
            match self.announcement(true) {
                Ok(bytes) => {
                    let transport = Arc::clone(&self.transport);
                    tokio::spawn(async move {
                        if let Err(e) = transport.send(&hello.endpoint, bytes).await {
                            debug!(
                                "Failed to answer announcement from {}: {}",
                                hello.party.short(),
                                e
                            );
                        }
                    });
                }
                Err(e) => warn!("Failed to encode announcement: {}", e),
            }
        }
        InboundDisposition::PeerAnnounced
    }

    fn dropped(
        &self,
        session_id: Option<&SessionId>,
        sender: Option<&PartyId>,
        disposition: InboundDisposition,
    ) -> InboundDisposition {
        self.metrics.inc_messages_dropped();

        let mut event = LogEvent::new(EventType::MessageDropped)
            .with_context("reason", disposition.as_str());
        if let Some(id) = session_id {
            event = event.with_correlation_id(id.as_str());
        }
        if let Some(sender) = sender {
            event = event.with_party(sender.as_str());
        }
        event.emit();
        disposition
    }

    /// Consume the transport's inbound stream until cancelled or closed.
    pub fn spawn_inbound(
        self: &Arc<Self>,
        inbound: InboundStream,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            info!("Message router started for party {}", router.local.short());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = inbound.recv() => match frame {
                        Ok(frame) => {
                            router.handle_frame(frame).await;
                        }
                        Err(_) => {
                            warn!("Inbound stream closed");
                            break;
                        }
                    },
                }
            }
            info!("Message router stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::transport::{Transport, TransportType};
    use async_trait::async_trait;

    /// Transport whose sends never complete.
    struct StalledTransport {
        local: PeerEndpoint,
    }

    #[async_trait]
    impl Transport for StalledTransport {
        fn local_endpoint(&self) -> &PeerEndpoint {
            &self.local
        }

        fn transport_type(&self) -> TransportType {
            TransportType::Tcp
        }

        async fn send(&self, _endpoint: &PeerEndpoint, _bytes: Vec<u8>) -> Result<(), TransportError> {
            futures::future::pending().await
        }
    }

    struct Harness {
        router: Arc<MessageRouter>,
        peer_inbound: InboundStream,
        session: SessionId,
    }

    async fn harness() -> Harness {
        let network = MemoryNetwork::new();
        let (local, _local_inbound) = network.join("local-ep".into()).await;
        let (_peer, peer_inbound) = network.join("peer-ep".into()).await;

        let registry = Arc::new(PeerRegistry::new("local".into()));
        registry
            .upsert("peer".into(), "peer-ep".into())
            .await
            .unwrap();

        let router = Arc::new(MessageRouter::new(
            "local".into(),
            Arc::new(local),
            registry,
            Arc::new(ProtocolMetrics::new("local")),
        ));
        Harness {
            router,
            peer_inbound,
            session: SessionId::from("s1"),
        }
    }

    fn round_frame(session: &SessionId, sender: &str, recipient: Option<&str>) -> InboundFrame {
        let msg = WireMessage::Round(RoundMessage::new(
            session.clone(),
            sender.into(),
            1,
            recipient.map(PartyId::from),
            1,
            vec![1, 2, 3],
            0,
        ));
        InboundFrame {
            source: None,
            bytes: msg.encode().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_delivers_to_registered_session() {
        let h = harness().await;
        let rx = h
            .router
            .register(&h.session, &["local".into(), "peer".into()])
            .await
            .unwrap();

        let disposition = h.router.handle_frame(round_frame(&h.session, "peer", None)).await;
        assert_eq!(disposition, InboundDisposition::Delivered);

        match rx.recv().await.unwrap() {
            SessionInbound::Round(msg) => assert_eq!(msg.payload, vec![1, 2, 3]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejects_non_participant_sender() {
        let h = harness().await;
        let _rx = h
            .router
            .register(&h.session, &["local".into(), "peer".into()])
            .await
            .unwrap();

        let disposition = h
            .router
            .handle_frame(round_frame(&h.session, "intruder", None))
            .await;
        assert_eq!(disposition, InboundDisposition::UnknownSender);
        assert_eq!(h.router.metrics.snapshot().messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_unknown_and_retired_sessions() {
        let h = harness().await;
        let disposition = h.router.handle_frame(round_frame(&h.session, "peer", None)).await;
        assert_eq!(disposition, InboundDisposition::UnknownSession);

        let _rx = h
            .router
            .register(&h.session, &["local".into(), "peer".into()])
            .await
            .unwrap();
        assert!(h.router.unregister(&h.session).await);

        let disposition = h.router.handle_frame(round_frame(&h.session, "peer", None)).await;
        assert_eq!(disposition, InboundDisposition::Retired);

        assert_eq!(h.router.purge_retired(Duration::ZERO).await, 1);
        assert!(!h.router.is_retired(&h.session).await);
    }

    #[tokio::test]
    async fn test_misaddressed_and_garbage_frames_dropped() {
        let h = harness().await;
        let _rx = h
            .router
            .register(&h.session, &["local".into(), "peer".into()])
            .await
            .unwrap();

        let disposition = h
            .router
            .handle_frame(round_frame(&h.session, "peer", Some("someone-else")))
            .await;
        assert_eq!(disposition, InboundDisposition::Misaddressed);

        let disposition = h
            .router
            .handle_frame(InboundFrame {
                source: None,
                bytes: vec![0xff; 3],
            })
            .await;
        assert_eq!(disposition, InboundDisposition::Undecodable);
    }

    #[tokio::test]
    async fn test_double_register_rejected() {
        let h = harness().await;
        let _rx = h.router.register(&h.session, &["local".into()]).await.unwrap();
        let err = h
            .router
            .register(&h.session, &["local".into()])
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::AlreadyRegistered(h.session.clone()));
    }

    #[tokio::test]
    async fn test_dispatch_reports_unresolved_peer() {
        let h = harness().await;
        let report = h
            .router
            .dispatch_round(
                &h.session,
                9,
                1,
                None,
                &["local".into(), "peer".into(), "ghost".into()],
                vec![4, 5],
            )
            .await;

        assert_eq!(report.delivered, vec![PartyId::from("peer")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, PartyId::from("ghost"));

        let frame = h.peer_inbound.recv().await.unwrap();
        match WireMessage::decode(&frame.bytes).unwrap() {
            WireMessage::Round(msg) => {
                assert_eq!(msg.run, 9);
                assert_eq!(msg.sender, PartyId::from("local"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hello_updates_registry_and_replies() {
        let h = harness().await;
        let hello = WireMessage::Hello(PeerAnnouncement {
            party: "newcomer".into(),
            endpoint: "peer-ep".into(),
            reply: false,
        });
        let disposition = h
            .router
            .handle_frame(InboundFrame {
                source: None,
                bytes: hello.encode().unwrap(),
            })
            .await;
        assert_eq!(disposition, InboundDisposition::PeerAnnounced);

        // Same endpoint as "peer": the stale binding is evicted
        assert_eq!(
            h.router.registry.resolve(&"peer".into()).await,
            Resolution::Unresolved
        );

        let frame = h.peer_inbound.recv().await.unwrap();
        match WireMessage::decode(&frame.bytes).unwrap() {
            WireMessage::Hello(reply) => {
                assert!(reply.reply);
                assert_eq!(reply.party, PartyId::from("local"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ready_answer_echoes_announced_run() {
        let h = harness().await;
        let report = h
            .router
            .send_ready(&h.session, 11, Some(22), &["peer".into()])
            .await;
        assert!(report.all_delivered());

        let frame = h.peer_inbound.recv().await.unwrap();
        match WireMessage::decode(&frame.bytes).unwrap() {
            WireMessage::Ready(ready) => {
                assert_eq!(ready.run, 11);
                assert_eq!(ready.ack, Some(22));
                assert_eq!(ready.sender, PartyId::from("local"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hello_answer_does_not_block_inbound() {
        let router = MessageRouter::new(
            "local".into(),
            Arc::new(StalledTransport {
                local: "local-ep".into(),
            }),
            Arc::new(PeerRegistry::new("local".into())),
            Arc::new(ProtocolMetrics::new("local")),
        );
        let session = SessionId::from("s1");
        let rx = router
            .register(&session, &["local".into(), "peer".into()])
            .await
            .unwrap();

        let hello = WireMessage::Hello(PeerAnnouncement {
            party: "peer".into(),
            endpoint: "unreachable-ep".into(),
            reply: false,
        });
        let disposition = tokio::time::timeout(
            Duration::from_millis(500),
            router.handle_frame(InboundFrame {
                source: None,
                bytes: hello.encode().unwrap(),
            }),
        )
        .await
        .expect("hello handling waited on the answer");
        assert_eq!(disposition, InboundDisposition::PeerAnnounced);

        // Frames behind the hello are still delivered
        let disposition = router.handle_frame(round_frame(&session, "peer", None)).await;
        assert_eq!(disposition, InboundDisposition::Delivered);
        assert!(rx.try_recv().is_ok());
    }
}

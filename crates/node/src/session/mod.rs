//! One keygen or keysign run.
//!
//! A session moves `Initializing -> Running(round) -> terminal`. While
//! initializing it obtains pre-params, loads the key share for keysign, and
//! exchanges readiness with every peer so that each side knows the other's
//! run tag. Only then is the engine created and round 1 sent. Round traffic
//! is accepted only when it carries the run tag its sender announced.
//!
//! The session owns its engine and its inbound queue exclusively; the manager
//! observes it through the state channel and the outcome it returns.

pub mod round;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use common::{
    BlameReason, BlameRecord, EventType, LogEvent, Outcome, PartyId, ProtocolMetrics, RunTag,
    SessionError, SessionId, SessionRequest, SessionSpan, TssConfig,
};
use protocols::{
    DispatchReport, EngineContext, EngineError, EngineEvent, EngineFactory, EngineOutput,
    KeyShareStore, MessageRouter, OutboundMessage, PreParams, PreParamsProvider, ProtocolEngine,
    ReadyMessage, Rejection, RoundMessage, SessionInbound,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reconciler::{ResultReconciler, Termination};

pub use round::{Classification, RoundTracker};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Running { round: u16 },
    Succeeded,
    TimedOut,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::TimedOut | Self::Aborted)
    }

    pub fn for_outcome(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Success { .. } => Self::Succeeded,
            Outcome::Timeout { .. } => Self::TimedOut,
            Outcome::Abort { .. } => Self::Aborted,
        }
    }
}

/// Process-wide services every session draws on.
pub struct SessionServices {
    pub local: PartyId,
    pub config: TssConfig,
    pub router: Arc<MessageRouter>,
    pub engines: Arc<dyn EngineFactory>,
    pub pre_params: Arc<PreParamsProvider>,
    pub shares: Arc<KeyShareStore>,
    pub metrics: Arc<ProtocolMetrics>,
}

fn engine_failure(e: EngineError) -> Termination {
    Termination::local(SessionError::Engine {
        reason: e.to_string(),
    })
}

fn init_failure(reason: String) -> Termination {
    Termination::local(SessionError::InitializationFailure {
        reason,
        unresolved: Vec::new(),
    })
}

fn route_closed() -> Termination {
    Termination::local(SessionError::Engine {
        reason: "session message route closed".to_string(),
    })
}

pub struct Session {
    id: SessionId,
    request: SessionRequest,
    run: RunTag,
    services: Arc<SessionServices>,
    reconciler: ResultReconciler,
    inbound: async_channel::Receiver<SessionInbound>,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    /// Participants other than the local party.
    peers: Vec<PartyId>,
    /// Run tag each peer announced.
    peer_runs: HashMap<PartyId, RunTag>,
    /// Round traffic received before readiness completed.
    early: Vec<RoundMessage>,
    /// Transport failures; reported, never terminal.
    deferred: Vec<SessionError>,
    span: SessionSpan,
}

impl Session {
    pub fn new(
        request: SessionRequest,
        services: Arc<SessionServices>,
        inbound: async_channel::Receiver<SessionInbound>,
        cancel: CancellationToken,
        state: watch::Sender<SessionState>,
    ) -> Self {
        let id = request.session_id();
        let peers = request
            .participants()
            .iter()
            .filter(|p| **p != services.local)
            .cloned()
            .collect();
        let span = SessionSpan::new(id.as_str(), request.kind().as_str())
            .with_party(services.local.as_str());
        let reconciler = ResultReconciler::new(Arc::clone(&services.shares));

        Self {
            id,
            request,
            run: rand::random(),
            services,
            reconciler,
            inbound,
            cancel,
            state,
            peers,
            peer_runs: HashMap::new(),
            early: Vec::new(),
            deferred: Vec::new(),
            span,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn run_tag(&self) -> RunTag {
        self.run
    }

    /// Drive the session to its terminal outcome.
    pub async fn run(mut self) -> Outcome {
        info!(
            "Session {} ({}) starting: {} participants, run {:016x}",
            self.id.short(),
            self.request.kind(),
            self.request.participants().len(),
            self.run
        );
        LogEvent::new(EventType::SessionStarted)
            .with_correlation_id(self.id.as_str())
            .with_protocol(self.request.kind().as_str())
            .with_party(self.services.local.as_str())
            .emit();

        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Termination::local(SessionError::Cancelled {
                reason: "session cancelled".to_string(),
            })),
            result = self.drive() => result,
        };

        let outcome = match result {
            Ok(output) => self.reconciler.success(&self.request, output).await,
            Err(termination) => self.reconciler.failure(termination, &self.deferred),
        };
        self.finish(&outcome);
        outcome
    }

    async fn drive(&mut self) -> Result<EngineOutput, Termination> {
        let pre_params = self.acquire_pre_params().await?;
        let share = self.load_share().await?;
        self.await_peers().await?;

        let ctx = EngineContext {
            session_id: self.id.clone(),
            local: self.services.local.clone(),
            participants: self.request.participants().to_vec(),
            request: self.request.clone(),
            pre_params,
            share,
        };
        let mut engine = self.services.engines.create(ctx).map_err(engine_failure)?;
        self.run_protocol(engine.as_mut()).await
    }

    async fn acquire_pre_params(&self) -> Result<PreParams, Termination> {
        let limit = self.services.config.pre_param_timeout;
        match tokio::time::timeout(limit, self.services.pre_params.get()).await {
            Ok(Ok(pre_params)) => Ok(pre_params),
            Ok(Err(e)) => Err(init_failure(e.to_string())),
            Err(_) => Err(Termination::timeout(
                SessionError::InitializationFailure {
                    reason: format!("pre-params not available within {:?}", limit),
                    unresolved: Vec::new(),
                },
                BlameRecord::new(),
            )),
        }
    }

    async fn load_share(&self) -> Result<Option<Vec<u8>>, Termination> {
        let SessionRequest::Keysign(req) = &self.request else {
            return Ok(None);
        };

        let stored = match self.services.shares.load(req.pool_pub_key()).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                return Err(init_failure(format!(
                    "no local key share for pool key {}",
                    req.pool_pub_key()
                )))
            }
            Err(e) => return Err(init_failure(e.to_string())),
        };

        if let Some(outsider) = req
            .participants()
            .iter()
            .find(|p| !stored.participants.contains(p))
        {
            return Err(init_failure(format!(
                "signer {} did not take part in keygen for {}",
                outsider.short(),
                req.pool_pub_key()
            )));
        }
        Ok(Some(stored.share))
    }

    fn pending_peers(&self) -> Vec<PartyId> {
        self.peers
            .iter()
            .filter(|p| !self.peer_runs.contains_key(*p))
            .cloned()
            .collect()
    }

    /// Exchange readiness until every peer's run tag is known.
    async fn await_peers(&mut self) -> Result<(), Termination> {
        let deadline = sleep_until(Instant::now() + self.services.config.join_timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.services.config.ready_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.peer_runs.len() < self.peers.len() {
            tokio::select! {
                _ = &mut deadline => return Err(self.join_timed_out()),
                _ = ticker.tick() => {
                    let pending = self.pending_peers();
                    let report = self
                        .services
                        .router
                        .send_ready(&self.id, self.run, None, &pending)
                        .await;
                    if !report.all_delivered() {
                        debug!(
                            "Session {}: {} of {} pending peers unreachable",
                            self.id.short(),
                            report.failed.len(),
                            pending.len()
                        );
                    }
                }
                inbound = self.inbound.recv() => match inbound {
                    Ok(SessionInbound::Ready(ready)) => self.on_ready(ready, true).await,
                    Ok(SessionInbound::Round(msg)) => self.early.push(msg),
                    Err(_) => return Err(route_closed()),
                },
            }
        }

        info!(
            "Session {}: all {} peers ready",
            self.id.short(),
            self.peers.len()
        );
        Ok(())
    }

    fn join_timed_out(&self) -> Termination {
        let missing = self.pending_peers();
        warn!(
            "Session {}: {} peers not ready within {:?}",
            self.id.short(),
            missing.len(),
            self.services.config.join_timeout
        );

        let mut blame = BlameRecord::new();
        for party in &missing {
            blame.blame_unresolved(party.clone());
        }
        Termination::timeout(
            SessionError::InitializationFailure {
                reason: format!(
                    "{} of {} peers not ready within {:?}",
                    missing.len(),
                    self.peers.len(),
                    self.services.config.join_timeout
                ),
                unresolved: missing,
            },
            blame,
        )
    }

    /// Record a peer's readiness and answer its announcements.
    ///
    /// A peer counts as ready only once it answers an announcement of this
    /// run, so an answer sent by the peer's previous run never binds this
    /// one. Tags only change while initializing; the latest answer wins.
    /// Once running, only announcements from a peer's known run are answered.
    async fn on_ready(&mut self, ready: ReadyMessage, initializing: bool) {
        let sender = ready.sender.clone();

        match ready.ack {
            Some(ack) if ack != self.run => {
                debug!(
                    "Session {}: ignoring answer from {} to run {:016x}",
                    self.id.short(),
                    sender.short(),
                    ack
                );
            }
            Some(_) if initializing => self.peer_ready(sender, ready.run),
            Some(_) => {
                if self.peer_runs.get(&sender) != Some(&ready.run) {
                    warn!(
                        "Session {}: {} answered from run {:016x} after the protocol started",
                        self.id.short(),
                        sender.short(),
                        ready.run
                    );
                }
            }
            None if initializing || self.peer_runs.get(&sender) == Some(&ready.run) => {
                let report = self
                    .services
                    .router
                    .send_ready(
                        &self.id,
                        self.run,
                        Some(ready.run),
                        std::slice::from_ref(&sender),
                    )
                    .await;
                self.record_failures(report);
            }
            None => {
                debug!(
                    "Session {}: not answering {} for run {:016x}, protocol already started",
                    self.id.short(),
                    sender.short(),
                    ready.run
                );
            }
        }
    }

    fn peer_ready(&mut self, sender: PartyId, run: RunTag) {
        match self.peer_runs.insert(sender.clone(), run) {
            None => {
                debug!(
                    "Session {}: {} ready with run {:016x}",
                    self.id.short(),
                    sender.short(),
                    run
                );
                LogEvent::new(EventType::PeerReady)
                    .with_correlation_id(self.id.as_str())
                    .with_party(sender.as_str())
                    .emit();
            }
            Some(previous) if previous != run => {
                info!(
                    "Session {}: {} restarted, run {:016x} -> {:016x}",
                    self.id.short(),
                    sender.short(),
                    previous,
                    run
                );
            }
            Some(_) => {}
        }
    }

    async fn run_protocol(
        &mut self,
        engine: &mut dyn ProtocolEngine,
    ) -> Result<EngineOutput, Termination> {
        let phase = self.services.config.protocol_timeout(self.request.kind());
        let deadline = sleep_until(Instant::now() + phase);
        tokio::pin!(deadline);

        let mut rounds = RoundTracker::new(engine.total_rounds(), self.peers.iter().cloned());
        self.enter_round(rounds.current());
        let outbound = engine.start().map_err(engine_failure)?;
        self.dispatch(outbound).await;

        let early: VecDeque<RoundMessage> = std::mem::take(&mut self.early).into();
        if let Some(output) = self.process(engine, &mut rounds, early).await? {
            return Ok(output);
        }

        loop {
            tokio::select! {
                _ = &mut deadline => return Err(self.round_timed_out(&rounds)),
                inbound = self.inbound.recv() => match inbound {
                    Ok(SessionInbound::Ready(ready)) => self.on_ready(ready, false).await,
                    Ok(SessionInbound::Round(msg)) => {
                        let queue = VecDeque::from([msg]);
                        if let Some(output) = self.process(engine, &mut rounds, queue).await? {
                            return Ok(output);
                        }
                    }
                    Err(_) => return Err(route_closed()),
                },
            }
        }
    }

    /// Feed queued messages to the engine, replaying held messages each
    /// time a round advances.
    async fn process(
        &mut self,
        engine: &mut dyn ProtocolEngine,
        rounds: &mut RoundTracker,
        mut queue: VecDeque<RoundMessage>,
    ) -> Result<Option<EngineOutput>, Termination> {
        while let Some(msg) = queue.pop_front() {
            if !self.is_current_run(&msg) {
                continue;
            }
            if msg.payload.is_empty() {
                return Err(self.malformed(&msg, "empty payload".to_string()));
            }

            match rounds.classify(msg.round, &msg.sender, &msg.payload) {
                Classification::OutOfRange => {
                    let reason = format!("round {} outside 1..={}", msg.round, rounds.total());
                    return Err(self.malformed(&msg, reason));
                }
                Classification::Equivocation => {
                    let reason = "conflicting messages for the same round".to_string();
                    return Err(self.malformed(&msg, reason));
                }
                Classification::Duplicate => {
                    debug!(
                        "Session {}: duplicate round {} message from {}",
                        self.id.short(),
                        msg.round,
                        msg.sender.short()
                    );
                }
                Classification::Stale => {
                    debug!(
                        "Session {}: stale round {} message from {}",
                        self.id.short(),
                        msg.round,
                        msg.sender.short()
                    );
                }
                Classification::Future => rounds.buffer(msg),
                Classification::Current => {
                    rounds.record(msg.round, &msg.sender, &msg.payload);
                    let event = engine
                        .handle_message(msg.round, &msg.sender, &msg.payload)
                        .map_err(engine_failure)?;

                    match event {
                        EngineEvent::Accepted => {}
                        EngineEvent::Rejected(rejection) => {
                            return Err(self.rejected(&msg, rejection));
                        }
                        EngineEvent::Completed(output) => {
                            self.complete_round();
                            return Ok(Some(output));
                        }
                        EngineEvent::RoundAdvanced(outbound) => {
                            self.complete_round();
                            let next = rounds.advance();
                            if engine.current_round() != next {
                                return Err(Termination::local(SessionError::Engine {
                                    reason: format!(
                                        "engine reports round {}, expected {}",
                                        engine.current_round(),
                                        next
                                    ),
                                }));
                            }
                            self.enter_round(next);
                            self.dispatch(outbound).await;
                            queue.extend(rounds.take_pending(next));
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    /// Round traffic is only accepted under the run tag its sender announced.
    fn is_current_run(&self, msg: &RoundMessage) -> bool {
        if self.peer_runs.get(&msg.sender) == Some(&msg.run) {
            return true;
        }
        debug!(
            "Session {}: dropping round {} from {} for run {:016x}",
            self.id.short(),
            msg.round,
            msg.sender.short(),
            msg.run
        );
        self.services.metrics.inc_messages_dropped();
        LogEvent::new(EventType::MessageDropped)
            .with_correlation_id(self.id.as_str())
            .with_party(msg.sender.as_str())
            .with_round(msg.round)
            .with_context("reason", "stale_run")
            .emit();
        false
    }

    fn malformed(&self, msg: &RoundMessage, reason: String) -> Termination {
        self.blame_sender(msg, BlameReason::Malformed, reason)
    }

    fn rejected(&self, msg: &RoundMessage, rejection: Rejection) -> Termination {
        match rejection {
            Rejection::Malformed(reason) => self.blame_sender(msg, BlameReason::Malformed, reason),
            Rejection::Invalid(reason) => {
                self.blame_sender(msg, BlameReason::ProtocolRejection, reason)
            }
        }
    }

    fn blame_sender(&self, msg: &RoundMessage, reason: BlameReason, detail: String) -> Termination {
        warn!(
            "Session {}: round {} message from {} rejected ({}): {}",
            self.id.short(),
            msg.round,
            msg.sender.short(),
            reason,
            detail
        );
        LogEvent::new(EventType::ProtocolError)
            .with_correlation_id(self.id.as_str())
            .with_party(msg.sender.as_str())
            .with_round(msg.round)
            .with_error(detail.clone())
            .emit();

        let mut blame = BlameRecord::new();
        blame.blame(msg.sender.clone(), reason, Some(msg.round), Some(detail.clone()));
        Termination::abort(
            SessionError::ProtocolRejection {
                party: msg.sender.clone(),
                round: msg.round,
                reason: detail,
            },
            blame,
        )
    }

    fn round_timed_out(&self, rounds: &RoundTracker) -> Termination {
        let round = rounds.current();
        let missing = rounds.missing();
        self.span.record_round_timeout(missing.len());
        warn!(
            "Session {}: round {} timed out after {:?}, missing {} peers",
            self.id.short(),
            round,
            rounds.round_elapsed(),
            missing.len()
        );

        let mut blame = BlameRecord::new();
        for party in &missing {
            blame.blame(
                party.clone(),
                BlameReason::NoResponse,
                Some(round),
                Some(format!("no round {} message before the deadline", round)),
            );
        }
        Termination::timeout(SessionError::ProtocolTimeout { round, missing }, blame)
    }

    fn enter_round(&mut self, round: u16) {
        self.state.send_replace(SessionState::Running { round });
        self.span.record_round_start(round);
    }

    fn complete_round(&mut self) {
        let duration = self.span.record_round_complete();
        self.services.metrics.inc_rounds_completed();
        self.services
            .metrics
            .record_round_duration(self.request.kind().as_str(), duration);
    }

    async fn dispatch(&mut self, outbound: Vec<OutboundMessage>) {
        for msg in outbound {
            let recipients = match &msg.recipient {
                Some(party) if self.peers.contains(party) => vec![party.clone()],
                Some(party) => {
                    warn!(
                        "Session {}: engine addressed non-participant {}",
                        self.id.short(),
                        party.short()
                    );
                    continue;
                }
                None => self.peers.clone(),
            };

            let report = self
                .services
                .router
                .dispatch_round(
                    &self.id,
                    self.run,
                    msg.round,
                    msg.recipient.as_ref(),
                    &recipients,
                    msg.payload,
                )
                .await;
            self.record_failures(report);
        }
    }

    fn record_failures(&mut self, report: DispatchReport) {
        for (party, reason) in report.failed {
            LogEvent::new(EventType::TransportError)
                .with_correlation_id(self.id.as_str())
                .with_party(party.as_str())
                .with_error(reason.clone())
                .emit();
            self.deferred
                .push(SessionError::TransportFailure { party, reason });
        }
    }

    fn finish(&self, outcome: &Outcome) {
        let kind = self.request.kind().as_str();
        let elapsed = self.span.elapsed();
        let metrics = &self.services.metrics;
        metrics.record_session_duration(kind, elapsed);
        self.state.send_replace(SessionState::for_outcome(outcome));

        let event_type = match outcome {
            Outcome::Success { .. } => {
                metrics.inc_sessions_completed();
                EventType::SessionCompleted
            }
            Outcome::Timeout { .. } => {
                metrics.inc_sessions_timeout();
                EventType::SessionTimeout
            }
            Outcome::Abort {
                error: SessionError::Cancelled { .. },
                ..
            } => {
                metrics.inc_sessions_cancelled();
                EventType::SessionCancelled
            }
            Outcome::Abort { .. } => {
                metrics.inc_sessions_failed();
                EventType::SessionFailed
            }
        };

        let mut event = LogEvent::new(event_type)
            .with_correlation_id(self.id.as_str())
            .with_protocol(kind)
            .with_party(self.services.local.as_str())
            .with_duration(elapsed);
        if let Some(error) = outcome.error() {
            event = event.with_error(error.to_string());
        }
        if let Some(blame) = outcome.blame().filter(|b| !b.is_empty()) {
            let parties: Vec<&str> = blame.blamed.iter().map(|b| b.party.short()).collect();
            event = event.with_context("blamed", parties.join(","));
        }
        event.emit();

        info!(
            "Session {} finished: {} in {:.2}s",
            self.id.short(),
            outcome.status(),
            elapsed.as_secs_f64()
        );
    }
}

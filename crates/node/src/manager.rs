//! Session manager: single-flight admission of keygen and keysign requests.
//!
//! The first request for a session id creates the session, registers its
//! message route and spawns its task. Every later request for the same id
//! while it is live attaches to the same outcome. A session leaves the live
//! table and loses its route in one step, under the table's write lock, so a
//! request arriving afterwards always starts a fresh run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    BlameRecord, EventType, LogEvent, Outcome, PartyId, ProtocolKind, RequestError, SessionError,
    SessionId, SessionRequest,
};
use protocols::RouterError;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::session::{Session, SessionServices, SessionState};

#[derive(Debug, Error)]
pub enum JoinError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("could not route session: {0}")]
    Route(#[from] RouterError),

    #[error("node is shutting down")]
    ShuttingDown,
}

/// Waiter's handle on a session outcome.
pub struct SessionHandle {
    session_id: SessionId,
    joined_existing: bool,
    outcome: watch::Receiver<Option<Outcome>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// True if the request attached to a session already in flight.
    pub fn joined_existing(&self) -> bool {
        self.joined_existing
    }

    /// Wait for the session's outcome.
    pub async fn wait(mut self) -> Outcome {
        let delivered = match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        delivered.unwrap_or_else(|| Outcome::Abort {
            error: SessionError::Engine {
                reason: "session ended without an outcome".to_string(),
            },
            blame: BlameRecord::new(),
        })
    }
}

struct SessionEntry {
    kind: ProtocolKind,
    participants: usize,
    created_at: Instant,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
    outcome: watch::Receiver<Option<Outcome>>,
    waiters: usize,
}

struct RetiredEntry {
    kind: ProtocolKind,
    participants: usize,
    state: SessionState,
    status: &'static str,
    duration: Duration,
    finished_at: Instant,
}

/// Summary of a live or recently finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub kind: ProtocolKind,
    #[serde(flatten)]
    pub state: SessionState,
    pub participants: usize,
    pub waiters: usize,
    pub age_ms: u64,
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

pub struct SessionManager {
    services: Arc<SessionServices>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    retired: RwLock<HashMap<SessionId, RetiredEntry>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(services: Arc<SessionServices>, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            services,
            sessions: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn services(&self) -> &Arc<SessionServices> {
        &self.services
    }

    /// Create or join the session for `request`.
    pub async fn join(
        self: &Arc<Self>,
        request: SessionRequest,
    ) -> Result<SessionHandle, JoinError> {
        let local = &self.services.local;
        if !request.includes(local) {
            return Err(RequestError::LocalPartyNotIncluded(local.clone()).into());
        }
        if self.shutdown.is_cancelled() {
            return Err(JoinError::ShuttingDown);
        }

        let session_id = request.session_id();
        let kind = request.kind();
        let mut sessions = self.sessions.write().await;
        // Checked again under the lock so shutdown() sees every admitted session
        if self.shutdown.is_cancelled() {
            return Err(JoinError::ShuttingDown);
        }

        if let Some(entry) = sessions.get_mut(&session_id) {
            entry.waiters += 1;
            self.services.metrics.inc_sessions_joined();
            debug!(
                "Request joined session {} ({} waiters)",
                session_id.short(),
                entry.waiters
            );
            LogEvent::new(EventType::SessionJoined)
                .with_correlation_id(session_id.as_str())
                .with_protocol(kind.as_str())
                .with_context("waiters", entry.waiters.to_string())
                .emit();
            return Ok(SessionHandle {
                session_id,
                joined_existing: true,
                outcome: entry.outcome.clone(),
            });
        }

        let inbound = self
            .services
            .router
            .register(&session_id, request.participants())
            .await?;
        let cancel = self.shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(SessionState::Initializing);
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let participants = request.participants().len();
        let session = Session::new(
            request,
            Arc::clone(&self.services),
            inbound,
            cancel.clone(),
            state_tx,
        );
        sessions.insert(
            session_id.clone(),
            SessionEntry {
                kind,
                participants,
                created_at: Instant::now(),
                cancel,
                state: state_rx,
                outcome: outcome_rx.clone(),
                waiters: 1,
            },
        );
        drop(sessions);

        self.services.metrics.inc_sessions_started();
        LogEvent::new(EventType::SessionCreated)
            .with_correlation_id(session_id.as_str())
            .with_protocol(kind.as_str())
            .with_party(self.services.local.as_str())
            .with_context("participants", participants.to_string())
            .emit();

        let manager = Arc::clone(self);
        let id = session_id.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            // A panicking session must still be retired
            let outcome = match tokio::spawn(session.run()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Session {} task failed: {}", id.short(), e);
                    manager.services.metrics.inc_sessions_failed();
                    LogEvent::new(EventType::SessionFailed)
                        .with_correlation_id(id.as_str())
                        .with_protocol(kind.as_str())
                        .with_error(e.to_string())
                        .emit();
                    Outcome::Abort {
                        error: SessionError::Engine {
                            reason: format!("session task failed: {}", e),
                        },
                        blame: BlameRecord::new(),
                    }
                }
            };
            manager.finish(&id, outcome, started.elapsed(), outcome_tx).await;
        });

        Ok(SessionHandle {
            session_id,
            joined_existing: false,
            outcome: outcome_rx,
        })
    }

    /// Retire a finished session and release its waiters.
    async fn finish(
        &self,
        session_id: &SessionId,
        outcome: Outcome,
        duration: Duration,
        outcome_tx: watch::Sender<Option<Outcome>>,
    ) {
        let mut sessions = self.sessions.write().await;
        self.services.router.unregister(session_id).await;
        let entry = sessions.remove(session_id);
        drop(sessions);

        if let Some(entry) = entry {
            self.retired.write().await.insert(
                session_id.clone(),
                RetiredEntry {
                    kind: entry.kind,
                    participants: entry.participants,
                    state: SessionState::for_outcome(&outcome),
                    status: outcome.status(),
                    duration,
                    finished_at: Instant::now(),
                },
            );
        }

        outcome_tx.send_replace(Some(outcome));
    }

    /// Cancel a live session and wait for its outcome.
    pub async fn cancel(&self, session_id: &SessionId) -> Option<Outcome> {
        let (cancel, mut outcome) = {
            let sessions = self.sessions.read().await;
            let entry = sessions.get(session_id)?;
            (entry.cancel.clone(), entry.outcome.clone())
        };

        info!("Cancelling session {}", session_id.short());
        cancel.cancel();
        let delivered = outcome.wait_for(Option::is_some).await.ok()?.clone();
        delivered
    }

    /// Cancel every live session and wait for all of them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let receivers: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|e| e.outcome.clone())
            .collect();

        if !receivers.is_empty() {
            info!("Waiting for {} sessions to stop", receivers.len());
        }
        for mut outcome in receivers {
            let _ = outcome.wait_for(Option::is_some).await;
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_active(&self, session_id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Live sessions followed by recently finished ones.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| SessionSummary {
                session_id: id.clone(),
                kind: entry.kind,
                state: *entry.state.borrow(),
                participants: entry.participants,
                waiters: entry.waiters,
                age_ms: entry.created_at.elapsed().as_millis() as u64,
                live: true,
                status: None,
            })
            .collect();

        summaries.extend(self.retired.read().await.iter().map(|(id, entry)| {
            SessionSummary {
                session_id: id.clone(),
                kind: entry.kind,
                state: entry.state,
                participants: entry.participants,
                waiters: 0,
                age_ms: (entry.duration + entry.finished_at.elapsed()).as_millis() as u64,
                live: false,
                status: Some(entry.status.to_string()),
            }
        }));
        summaries
    }

    /// Drop retired sessions and router tombstones past the retention window.
    pub async fn cleanup(&self) -> usize {
        let retention = self.services.config.session_retention;
        let removed = {
            let mut retired = self.retired.write().await;
            let before = retired.len();
            retired.retain(|_, entry| entry.finished_at.elapsed() < retention);
            before - retired.len()
        };
        let tombstones = self.services.router.purge_retired(retention).await;
        if removed > 0 || tombstones > 0 {
            debug!(
                "Session cleanup: {} retired sessions, {} tombstones removed",
                removed, tombstones
            );
        }
        removed
    }

    /// Periodically purge expired session records until shutdown.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let interval = self.services.config.cleanup_interval;
        info!(
            "Starting session cleanup task (interval: {}s)",
            interval.as_secs_f64()
        );

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            // The first tick completes immediately, so skip it
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        trace!("Running session cleanup...");
                        manager.cleanup().await;
                    }
                }
            }
        })
    }

    pub fn local_party(&self) -> &PartyId {
        &self.services.local
    }
}

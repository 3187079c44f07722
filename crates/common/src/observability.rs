//! Observability primitives for the session coordinator.
//!
//! - **Structured events**: [`LogEvent`] serialises to JSON and is emitted
//!   through `tracing`, keyed by session id as correlation id.
//! - **Metrics**: [`ProtocolMetrics`] holds atomic counters and duration
//!   samples; [`MetricsSnapshot`] is what `/metrics` returns.
//! - **Session spans**: [`SessionSpan`] tracks round timing for one session.
//!
//! ```ignore
//! use common::observability::{EventType, LogEvent};
//!
//! LogEvent::new(EventType::SessionCreated)
//!     .with_correlation_id(session_id.as_str())
//!     .with_protocol("keygen")
//!     .emit();
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Maximum number of duration samples retained per histogram.
const MAX_DURATION_SAMPLES: usize = 1000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Standardized event types for structured logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Session lifecycle
    SessionCreated,
    SessionJoined,
    SessionStarted,
    SessionCompleted,
    SessionFailed,
    SessionTimeout,
    SessionCancelled,

    // Protocol rounds
    RoundStarted,
    RoundCompleted,
    RoundTimeout,
    MessageSent,
    MessageReceived,
    MessageDropped,

    // Peers
    PeerReady,
    PeerOnline,
    PeerOffline,

    // Prerequisites
    PreParamsReady,
    PreParamsFailed,

    // Errors
    TransportError,
    ProtocolError,
    ValidationError,
}

impl EventType {
    fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::SessionFailed
                | Self::SessionTimeout
                | Self::SessionCancelled
                | Self::RoundTimeout
                | Self::PeerOffline
                | Self::PreParamsFailed
                | Self::TransportError
                | Self::ProtocolError
                | Self::ValidationError
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SessionCreated => "session_created",
            Self::SessionJoined => "session_joined",
            Self::SessionStarted => "session_started",
            Self::SessionCompleted => "session_completed",
            Self::SessionFailed => "session_failed",
            Self::SessionTimeout => "session_timeout",
            Self::SessionCancelled => "session_cancelled",
            Self::RoundStarted => "round_started",
            Self::RoundCompleted => "round_completed",
            Self::RoundTimeout => "round_timeout",
            Self::MessageSent => "message_sent",
            Self::MessageReceived => "message_received",
            Self::MessageDropped => "message_dropped",
            Self::PeerReady => "peer_ready",
            Self::PeerOnline => "peer_online",
            Self::PeerOffline => "peer_offline",
            Self::PreParamsReady => "pre_params_ready",
            Self::PreParamsFailed => "pre_params_failed",
            Self::TransportError => "transport_error",
            Self::ProtocolError => "protocol_error",
            Self::ValidationError => "validation_error",
        };
        write!(f, "{}", s)
    }
}

/// A structured log event with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub event_type: EventType,
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Correlation ID for tracing (the session id).
    pub correlation_id: Option<String>,
    /// Party identity the event concerns.
    pub party: Option<String>,
    /// Protocol name (keygen, keysign).
    pub protocol: Option<String>,
    pub round: Option<u16>,
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub context: HashMap<String, String>,
    pub error: Option<String>,
}

impl LogEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp_ms: now_ms(),
            correlation_id: None,
            party: None,
            protocol: None,
            round: None,
            duration_ms: None,
            context: HashMap::new(),
            error: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_party(mut self, party: impl Into<String>) -> Self {
        self.party = Some(party.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_round(mut self, round: u16) -> Self {
        self.round = Some(round);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Emit this event using tracing.
    pub fn emit(&self) {
        let json = serde_json::to_string(&self).unwrap_or_default();

        if self.event_type.is_warning() {
            tracing::warn!(event = %json, "observability_event");
        } else {
            tracing::info!(event = %json, "observability_event");
        }
    }
}

/// A sample for a duration histogram.
#[derive(Debug, Clone)]
struct DurationSample {
    protocol: String,
    duration_ms: u64,
}

/// Thread-safe coordinator metrics.
#[derive(Debug)]
pub struct ProtocolMetrics {
    pub node_id: String,

    sessions_started: AtomicU64,
    sessions_joined: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,
    sessions_timeout: AtomicU64,
    sessions_cancelled: AtomicU64,

    rounds_completed: AtomicU64,

    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    messages_bytes_sent: AtomicU64,
    messages_bytes_received: AtomicU64,
    send_failures: AtomicU64,

    round_durations: RwLock<Vec<DurationSample>>,
    session_durations: RwLock<Vec<DurationSample>>,
}

impl ProtocolMetrics {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            sessions_started: AtomicU64::new(0),
            sessions_joined: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            sessions_timeout: AtomicU64::new(0),
            sessions_cancelled: AtomicU64::new(0),
            rounds_completed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_bytes_sent: AtomicU64::new(0),
            messages_bytes_received: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            round_durations: RwLock::new(Vec::new()),
            session_durations: RwLock::new(Vec::new()),
        }
    }

    pub fn inc_sessions_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_joined(&self) {
        self.sessions_joined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_timeout(&self) {
        self.sessions_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_cancelled(&self) {
        self.sessions_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rounds_completed(&self) {
        self.rounds_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_sent(&self, bytes: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.messages_bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_messages_received(&self, bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.messages_bytes_received
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_messages_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round_duration(&self, protocol: &str, duration: Duration) {
        push_sample(&self.round_durations, protocol, duration);
    }

    pub fn record_session_duration(&self, protocol: &str, duration: Duration) {
        push_sample(&self.session_durations, protocol, duration);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            node_id: self.node_id.clone(),
            timestamp_ms: now_ms(),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_joined: self.sessions_joined.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            sessions_timeout: self.sessions_timeout.load(Ordering::Relaxed),
            sessions_cancelled: self.sessions_cancelled.load(Ordering::Relaxed),
            rounds_completed: self.rounds_completed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_bytes_sent: self.messages_bytes_sent.load(Ordering::Relaxed),
            messages_bytes_received: self.messages_bytes_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            round_duration_avg_ms: average_by_protocol(&self.round_durations),
            session_duration_avg_ms: average_by_protocol(&self.session_durations),
        }
    }
}

fn push_sample(samples: &RwLock<Vec<DurationSample>>, protocol: &str, duration: Duration) {
    if let Ok(mut samples) = samples.write() {
        samples.push(DurationSample {
            protocol: protocol.to_string(),
            duration_ms: duration.as_millis() as u64,
        });
        if samples.len() > MAX_DURATION_SAMPLES {
            samples.remove(0);
        }
    }
}

fn average_by_protocol(samples: &RwLock<Vec<DurationSample>>) -> HashMap<String, f64> {
    let mut sums: HashMap<String, (u64, u64)> = HashMap::new();
    if let Ok(samples) = samples.read() {
        for sample in samples.iter() {
            let entry = sums.entry(sample.protocol.clone()).or_insert((0, 0));
            entry.0 += sample.duration_ms;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(k, (sum, count))| (k, sum as f64 / count as f64))
        .collect()
}

/// A snapshot of current metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub node_id: String,
    pub timestamp_ms: u64,

    pub sessions_started: u64,
    pub sessions_joined: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub sessions_timeout: u64,
    pub sessions_cancelled: u64,
    pub rounds_completed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub messages_bytes_sent: u64,
    pub messages_bytes_received: u64,
    pub send_failures: u64,

    // protocol -> avg ms
    pub round_duration_avg_ms: HashMap<String, f64>,
    pub session_duration_avg_ms: HashMap<String, f64>,
}

/// Round timing for one session.
pub struct SessionSpan {
    session_id: String,
    protocol: String,
    party: Option<String>,
    start_time: Instant,
    current_round: u16,
    round_start: Option<Instant>,
}

impl SessionSpan {
    pub fn new(session_id: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            protocol: protocol.into(),
            party: None,
            start_time: Instant::now(),
            current_round: 0,
            round_start: None,
        }
    }

    pub fn with_party(mut self, party: impl Into<String>) -> Self {
        self.party = Some(party.into());
        self
    }

    fn event(&self, event_type: EventType) -> LogEvent {
        let mut event = LogEvent::new(event_type)
            .with_correlation_id(&self.session_id)
            .with_protocol(&self.protocol);
        if let Some(party) = &self.party {
            event = event.with_party(party);
        }
        event
    }

    pub fn current_round(&self) -> u16 {
        self.current_round
    }

    pub fn record_round_start(&mut self, round: u16) {
        self.current_round = round;
        self.round_start = Some(Instant::now());
        self.event(EventType::RoundStarted).with_round(round).emit();
    }

    /// Record completion of the current round and return its duration.
    pub fn record_round_complete(&mut self) -> Duration {
        let duration = self
            .round_start
            .take()
            .map(|s| s.elapsed())
            .unwrap_or(Duration::ZERO);

        self.event(EventType::RoundCompleted)
            .with_round(self.current_round)
            .with_duration(duration)
            .emit();

        duration
    }

    pub fn record_round_timeout(&self, missing: usize) {
        self.event(EventType::RoundTimeout)
            .with_round(self.current_round)
            .with_context("missing", missing.to_string())
            .emit();
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_builder() {
        let event = LogEvent::new(EventType::SessionCreated)
            .with_correlation_id("session-123")
            .with_party("02abcd")
            .with_protocol("keygen")
            .with_round(1)
            .with_context("participants", "4");

        assert_eq!(event.event_type, EventType::SessionCreated);
        assert_eq!(event.correlation_id, Some("session-123".to_string()));
        assert_eq!(event.party, Some("02abcd".to_string()));
        assert_eq!(event.protocol, Some("keygen".to_string()));
        assert_eq!(event.round, Some(1));
        assert_eq!(event.context.get("participants"), Some(&"4".to_string()));
    }

    #[test]
    fn test_metrics_counters() {
        let metrics = ProtocolMetrics::new("test-node");

        metrics.inc_sessions_started();
        metrics.inc_sessions_started();
        metrics.inc_sessions_joined();
        metrics.inc_sessions_completed();
        metrics.inc_messages_sent(100);
        metrics.inc_messages_received(200);
        metrics.inc_messages_dropped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_started, 2);
        assert_eq!(snapshot.sessions_joined, 1);
        assert_eq!(snapshot.sessions_completed, 1);
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(snapshot.messages_bytes_sent, 100);
        assert_eq!(snapshot.messages_bytes_received, 200);
        assert_eq!(snapshot.messages_dropped, 1);
    }

    #[test]
    fn test_metrics_duration_recording() {
        let metrics = ProtocolMetrics::new("test-node");

        metrics.record_round_duration("keygen", Duration::from_millis(100));
        metrics.record_round_duration("keygen", Duration::from_millis(200));
        metrics.record_round_duration("keysign", Duration::from_millis(50));

        let snapshot = metrics.snapshot();
        let keygen = snapshot.round_duration_avg_ms["keygen"];
        assert!((keygen - 150.0).abs() < 0.01, "Expected 150, got {}", keygen);
        assert!((snapshot.round_duration_avg_ms["keysign"] - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::SessionJoined.to_string(), "session_joined");
        assert_eq!(EventType::MessageDropped.to_string(), "message_dropped");
        assert!(EventType::RoundTimeout.is_warning());
        assert!(!EventType::RoundCompleted.is_warning());
    }

    #[test]
    fn test_session_span_rounds() {
        let mut span = SessionSpan::new("s1", "keygen").with_party("p1");
        span.record_round_start(1);
        assert_eq!(span.current_round(), 1);
        span.record_round_complete();
        span.record_round_start(2);
        assert_eq!(span.current_round(), 2);
    }
}

//! Common types shared between TSS coordinator components.

pub mod api;
pub mod blame;
pub mod config;
pub mod observability;
pub mod outcome;
pub mod request;
pub mod types;

pub use api::{
    ErrorResponse, KeygenHttpRequest, KeygenHttpResponse, KeysignHttpRequest, KeysignHttpResponse,
};
pub use blame::{Blame, BlameReason, BlameRecord};
pub use config::TssConfig;
pub use observability::{EventType, LogEvent, MetricsSnapshot, ProtocolMetrics, SessionSpan};
pub use outcome::{KeygenOutput, KeysignOutput, Outcome, SessionError, SessionOutput};
pub use request::{KeygenRequest, KeysignRequest, RequestError, SessionRequest};
pub use types::{PartyId, PeerEndpoint, ProtocolKind, RunTag, SessionId};

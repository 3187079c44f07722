//! TSS node: session coordination for threshold ECDSA keygen and keysign.
//!
//! ```text
//! HTTP (POST /keygen, POST /keysign)
//!     ↓
//! SessionManager ── one Session per session id
//!     ↓                  ↓
//! MessageRouter     ProtocolEngine
//!     ↓
//! Transport
//! ```

pub mod config;
pub mod handlers;
pub mod identity;
pub mod manager;
pub mod reconciler;
pub mod server;
pub mod session;
pub mod state;

pub use manager::{JoinError, SessionHandle, SessionManager, SessionSummary};
pub use server::{NodeComponents, TssServer};
pub use session::{SessionServices, SessionState};

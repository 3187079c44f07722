//! Networking, routing and protocol-engine plumbing for TSS sessions.
//!
//! ```text
//! Session
//!     ↓
//! MessageRouter ── PeerRegistry (party id -> endpoint)
//!     ↓
//! Transport trait
//!     ├─ TcpTransport (length-prefixed frames)
//!     └─ MemoryTransport (tests, local clusters)
//! ```

pub mod encoding;
pub mod engine;
pub mod memory;
pub mod p2p;
pub mod pre_params;
pub mod registry;
pub mod router;
pub mod share_store;
pub mod transport;
pub mod wire;

pub use engine::{
    EngineContext, EngineError, EngineEvent, EngineFactory, EngineOutput, OutboundMessage,
    ProtocolEngine, ReferenceEngineFactory, Rejection,
};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use p2p::TcpTransport;
pub use pre_params::{PreParams, PreParamsError, PreParamsProvider};
pub use registry::{PeerInfo, PeerRegistry, PeerSummary, RegistryError, RegistryUpdate, Resolution};
pub use router::{
    DispatchReport, InboundDisposition, MessageRouter, RouterError, SessionInbound,
};
pub use share_store::{KeyShareStore, ShareStoreError, StoredKeyShare};
pub use transport::{
    InboundFrame, InboundStream, SharedTransport, Transport, TransportError, TransportType,
};
pub use wire::{PeerAnnouncement, ReadyMessage, RoundMessage, WireError, WireMessage};

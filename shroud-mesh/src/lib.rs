//! # Shroud Mesh
//!
//! Mesh message layer for Project Shroud: peer-to-peer envelopes,
//! TTL-bounded flooding with deduplication, store-and-forward relay, and
//! end-to-end encrypted chat sessions layered on the hybrid ratchet from
//! `shroud-crypto`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐ frames ┌──────────┐ envelopes ┌─────────┐
//! │Transport │───────▶│ MeshNode │──────────▶│ Relay   │
//! │ (radio)  │◀───────│ (owner)  │◀──────────│ (store) │
//! └──────────┘        └────┬─────┘           └─────────┘
//!                          │ events
//!                    ┌─────▼──────┐
//!                    │ ChatManager│  scanners, wallets, UI
//!                    └────────────┘
//! ```
//!
//! The transport is an abstract framed byte channel (`broadcast`,
//! `send_to`, frame/peer observation streams); no assumption is made about
//! the underlying radio. Each stateful component has exactly one writer —
//! state is owned by a task and reached through bounded channels.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chat;
pub mod message;
pub mod node;
pub mod peer;
pub mod relay;
pub mod service;
pub mod transport;

pub use chat::{ChatManager, ChatSessionState, ChatUpdate};
pub use message::{
    AcknowledgmentPayload, ChatAcceptPayload, ChatDeclinePayload, ChatEndPayload,
    ChatMessagePayload, ChatRequestPayload, DiscoveryPayload, MeshMessage,
    MetaAddressRequestPayload, MetaAddressResponsePayload, MessageType, ProtocolVersion,
    StealthPaymentPayload, MAX_ENVELOPE_SIZE, MAX_TTL,
};
pub use node::{
    spawn_node_task, MeshNode, NodeCommand, NodeConfig, NodeEvent, NodeStats, ProcessResult,
};
pub use peer::{ConnectionState, Peer, PeerCapabilities};
pub use relay::{
    spawn_relay_task, MessageRelay, RelayCommand, RelayConfig, RelayEvent, RelayStats,
};
pub use service::{spawn_mesh_service, ServiceCommand, ServiceConfig, ServiceEvent};
pub use transport::{OutboundFrame, TransportEvent, TransportHandle};

use thiserror::Error;

/// Errors that can occur in the mesh layer.
#[derive(Debug, Error)]
pub enum MeshError {
    /// An envelope failed to decode or violated an envelope invariant.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// A typed payload failed to decode or validate.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// An encoded envelope exceeded the transport frame limit.
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Encoded size of the offending envelope.
        size: usize,
        /// The enforced maximum.
        max: usize,
    },

    /// The referenced peer is not in the peer table.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// The referenced chat session does not exist.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// An operation arrived in a session state that does not allow it.
    #[error("Invalid session state: expected {expected}, got {actual}")]
    InvalidState {
        /// The state the operation requires.
        expected: String,
        /// The state the session is actually in.
        actual: String,
    },

    /// The transport channel is gone; surfaced unchanged to the caller.
    #[error("Transport channel closed")]
    ChannelClosed,

    /// A cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[from] shroud_crypto::CryptoError),
}

/// Result type for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

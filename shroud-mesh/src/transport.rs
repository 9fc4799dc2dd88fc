//! # Shroud Mesh - Transport Seam Module
//!
//! The boundary to the external framed byte channel.
//!
//! The mesh requires exactly five primitives from its transport:
//! `broadcast(bytes)`, `sendTo(peerId, bytes)`, and the three observation
//! streams (frames, peer sightings, disconnects). They are modeled as
//! value-passing channels so the core makes no assumption about the
//! underlying radio; tests drive the same channels a radio binding would.

use tokio::sync::mpsc;

use crate::message::MeshMessage;
use crate::peer::PeerCapabilities;
use crate::{MeshError, Result};

/// Events flowing from the transport into the mesh.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A framed message arrived from a peer.
    Frame {
        /// The sending peer.
        peer_id: String,
        /// The raw frame bytes.
        bytes: Vec<u8>,
    },
    /// The transport observed a peer (advertisement, scan result).
    PeerObserved {
        /// The observed peer.
        peer_id: String,
        /// Signal strength of the observation (dBm).
        rssi: i16,
        /// Advertised local name, if any.
        local_name: Option<String>,
        /// Advertised capabilities, if any.
        capabilities: Option<PeerCapabilities>,
    },
    /// A peer's link went down.
    PeerDisconnected {
        /// The peer that disconnected.
        peer_id: String,
    },
}

/// Frames flowing from the mesh out to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Deliver to every connected peer.
    Broadcast(Vec<u8>),
    /// Deliver to one peer.
    Unicast {
        /// The destination peer.
        peer_id: String,
        /// The raw frame bytes.
        bytes: Vec<u8>,
    },
}

/// Sender half handed to components that emit envelopes.
///
/// Encoding happens here, so the 4,096-byte frame cap is enforced before
/// anything reaches the transport: an oversized envelope fails with
/// `PayloadTooLarge` and no state changes anywhere.
#[derive(Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<OutboundFrame>,
}

impl TransportHandle {
    /// Wrap the outbound channel of a transport binding.
    pub fn new(outbound: mpsc::Sender<OutboundFrame>) -> Self {
        Self { outbound }
    }

    /// Encode and broadcast an envelope to all connected peers.
    pub async fn broadcast(&self, message: &MeshMessage) -> Result<()> {
        let bytes = message.encode()?;
        self.outbound
            .send(OutboundFrame::Broadcast(bytes))
            .await
            .map_err(|_| MeshError::ChannelClosed)
    }

    /// Encode and send an envelope to a single peer.
    pub async fn send_to(&self, peer_id: &str, message: &MeshMessage) -> Result<()> {
        let bytes = message.encode()?;
        self.outbound
            .send(OutboundFrame::Unicast {
                peer_id: peer_id.to_owned(),
                bytes,
            })
            .await
            .map_err(|_| MeshError::ChannelClosed)
    }
}

//! # Shroud Mesh - Peer Module
//!
//! Records for peers observed on the transport.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::message::MAX_ENVELOPE_SIZE;

/// A peer is considered stale for UI purposes after this long without a
/// sighting.
pub const PEER_STALE_UI: Duration = Duration::from_secs(30);

/// Peers unseen for this long are pruned from the table.
pub const PEER_PRUNE_TIMEOUT: Duration = Duration::from_secs(60);

/// Link state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link.
    Disconnected,
    /// Link being established.
    Connecting,
    /// Link up; frames flow.
    Connected,
    /// Link being torn down.
    Disconnecting,
}

/// Capabilities a peer advertises during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCapabilities {
    /// The peer can decapsulate hybrid (post-quantum) payloads.
    pub supports_hybrid: bool,
    /// The peer participates in store-and-forward relaying.
    pub can_relay: bool,
    /// The peer currently has ledger connectivity.
    pub has_connectivity: bool,
    /// Largest frame the peer accepts.
    pub max_message_size: usize,
    /// Mesh protocol version the peer speaks.
    pub protocol_version: u8,
}

impl Default for PeerCapabilities {
    fn default() -> Self {
        Self {
            supports_hybrid: false,
            can_relay: true,
            has_connectivity: false,
            max_message_size: MAX_ENVELOPE_SIZE,
            protocol_version: 1,
        }
    }
}

/// One observed peer.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Transport-assigned peer id.
    pub id: String,
    /// Human-readable name, when advertised.
    pub name: Option<String>,
    /// Last observed signal strength (dBm).
    pub rssi: i16,
    /// Advertised capabilities.
    pub capabilities: PeerCapabilities,
    /// When this peer was first observed.
    pub discovered_at: Instant,
    /// When this peer was last observed.
    pub last_seen_at: Instant,
    /// Current link state.
    pub connection_state: ConnectionState,
}

impl Peer {
    /// Record a newly observed peer.
    pub fn new(id: &str, rssi: i16) -> Self {
        let now = Instant::now();
        Self {
            id: id.to_owned(),
            name: None,
            rssi,
            capabilities: PeerCapabilities::default(),
            discovered_at: now,
            last_seen_at: now,
            connection_state: ConnectionState::Connected,
        }
    }

    /// Refresh the last-seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen_at = Instant::now();
    }

    /// Stale iff nothing has been heard from the peer within `timeout`.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_seen_at.elapsed() > timeout
    }

    /// Whether this peer is currently usable as a relay hop.
    pub fn is_relay_candidate(&self, min_rssi: i16) -> bool {
        self.connection_state == ConnectionState::Connected
            && self.capabilities.can_relay
            && self.rssi >= min_rssi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_peer_is_fresh() {
        let peer = Peer::new("peer-a", -60);
        assert!(!peer.is_stale(Duration::from_secs(1)));
        assert_eq!(peer.connection_state, ConnectionState::Connected);
    }

    #[test]
    fn test_staleness_is_timeout_relative() {
        let mut peer = Peer::new("peer-a", -60);
        peer.last_seen_at = Instant::now() - Duration::from_secs(45);

        assert!(peer.is_stale(PEER_STALE_UI));
        assert!(!peer.is_stale(PEER_PRUNE_TIMEOUT));
    }

    #[test]
    fn test_relay_candidate_gating() {
        let mut peer = Peer::new("peer-a", -60);
        assert!(peer.is_relay_candidate(-80));

        peer.rssi = -90;
        assert!(!peer.is_relay_candidate(-80));

        peer.rssi = -60;
        peer.capabilities.can_relay = false;
        assert!(!peer.is_relay_candidate(-80));

        peer.capabilities.can_relay = true;
        peer.connection_state = ConnectionState::Disconnected;
        assert!(!peer.is_relay_candidate(-80));
    }

    #[test]
    fn test_capabilities_default() {
        let caps = PeerCapabilities::default();
        assert!(caps.can_relay);
        assert_eq!(caps.max_message_size, MAX_ENVELOPE_SIZE);
        assert_eq!(caps.protocol_version, 1);
    }
}

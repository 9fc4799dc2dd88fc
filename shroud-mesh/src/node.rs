//! # Shroud Mesh - Node Module
//!
//! The single owner of mesh bookkeeping: the peer table, the dedup cache,
//! the pending-delivery queue, and the envelope processing state machine.
//!
//! `MeshNode` is plain state with `&mut self` methods; `spawn_node_task`
//! wraps it in a task that drains transport events and commands from
//! bounded channels, which is the only way concurrent callers reach it.
//! Cross-owner reads go through value snapshots.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::message::{
    AcknowledgmentPayload, DiscoveryPayload, MeshMessage, MessageType, MetaAddressRequestPayload,
    MetaAddressResponsePayload, StealthPaymentPayload,
};
use crate::peer::{ConnectionState, Peer, PeerCapabilities, PEER_PRUNE_TIMEOUT};
use crate::transport::{OutboundFrame, TransportEvent};
use crate::Result;

/// Dedup cache capacity.
pub const DEDUP_CAPACITY: usize = 1000;

/// Pending-delivery queue capacity; the oldest entry is dropped on
/// overflow.
pub const PENDING_QUEUE_CAPACITY: usize = 100;

/// Subscriber event channel depth.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Our peer id as the transport advertises it.
    pub peer_id: String,
    /// Our display name for discovery and meta-address responses.
    pub local_name: Option<String>,
    /// TTL for payment envelopes we originate (hops).
    pub payment_ttl: u8,
    /// Envelopes older than this are dropped as expired.
    pub max_message_age: Duration,
    /// Our classical meta-address, offered on request.
    pub classical_meta_address: Option<String>,
    /// Our hybrid meta-address, offered when the requester prefers it.
    pub hybrid_meta_address: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: Uuid::new_v4().to_string(),
            local_name: None,
            payment_ttl: 5,
            max_message_age: Duration::from_secs(3600),
            classical_meta_address: None,
            hybrid_meta_address: None,
        }
    }
}

/// Outcome of processing one incoming envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    /// Delivered locally; nothing to forward.
    Processed,
    /// Delivered locally; re-emit this decremented copy.
    Relay(MeshMessage),
    /// Already seen; dropped.
    Duplicate,
    /// Older than the age limit; dropped.
    Expired,
    /// Malformed in some way; dropped and counted.
    Invalid,
}

/// Events published to node subscribers.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A payment payload addressed to the mesh arrived.
    PaymentReceived {
        /// The envelope id (for acknowledgment bookkeeping).
        message_id: Uuid,
        /// The decoded payment.
        payload: StealthPaymentPayload,
    },
    /// A peer acknowledged a stored envelope.
    AcknowledgmentReceived(Uuid),
    /// A peer answered a meta-address request.
    MetaAddressReceived(MetaAddressResponsePayload),
    /// A chat envelope arrived; routed to the chat manager.
    ChatEnvelope(MeshMessage),
}

/// Counters over the node's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Envelopes accepted into the dedup set.
    pub received: u64,
    /// Payment payloads published to subscribers.
    pub published: u64,
    /// Envelopes re-emitted with a decremented TTL.
    pub relayed: u64,
    /// Envelopes dropped as duplicates.
    pub duplicates: u64,
    /// Envelopes dropped as expired.
    pub expired: u64,
    /// Envelopes dropped as invalid.
    pub invalid: u64,
}

/// Bounded FIFO set of recently seen envelope ids.
///
/// When full, the oldest tenth of the cache is purged in one sweep.
struct DedupCache {
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    fn insert(&mut self, id: Uuid) {
        if self.seen.contains(&id) {
            return;
        }
        if self.seen.len() >= self.capacity {
            let purge = (self.capacity / 10).max(1);
            for _ in 0..purge {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
        self.seen.insert(id);
        self.order.push_back(id);
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// The single owner of peer and message bookkeeping.
pub struct MeshNode {
    config: NodeConfig,
    peers: HashMap<String, Peer>,
    dedup: DedupCache,
    pending: VecDeque<MeshMessage>,
    stats: NodeStats,
    events: mpsc::Sender<NodeEvent>,
}

impl MeshNode {
    /// Create a node and the subscriber end of its event stream.
    pub fn new(config: NodeConfig) -> (Self, mpsc::Receiver<NodeEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                config,
                peers: HashMap::new(),
                dedup: DedupCache::new(DEDUP_CAPACITY),
                pending: VecDeque::new(),
                stats: NodeStats::default(),
                events,
            },
            events_rx,
        )
    }

    /// Our peer id.
    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    /// Lifetime counters (value copy).
    pub fn stats(&self) -> NodeStats {
        self.stats
    }

    // === Peer table ===

    /// Insert or replace a peer record.
    pub fn add_peer(&mut self, peer: Peer) {
        self.peers.insert(peer.id.clone(), peer);
    }

    /// Update a peer in place; `PeerNotFound` if absent.
    pub fn update_peer(&mut self, id: &str, update: impl FnOnce(&mut Peer)) -> Result<()> {
        let peer = self
            .peers
            .get_mut(id)
            .ok_or_else(|| crate::MeshError::PeerNotFound(id.to_owned()))?;
        update(peer);
        Ok(())
    }

    /// Remove a peer record.
    pub fn remove_peer(&mut self, id: &str) -> Option<Peer> {
        self.peers.remove(id)
    }

    /// Record a transport observation of a peer.
    pub fn observe_peer(
        &mut self,
        id: &str,
        rssi: i16,
        name: Option<String>,
        capabilities: Option<PeerCapabilities>,
    ) {
        let peer = self.peers.entry(id.to_owned()).or_insert_with(|| Peer::new(id, rssi));
        peer.rssi = rssi;
        peer.connection_state = ConnectionState::Connected;
        if name.is_some() {
            peer.name = name;
        }
        if let Some(caps) = capabilities {
            peer.capabilities = caps;
        }
        peer.touch();
    }

    /// Mark a peer disconnected without forgetting it.
    pub fn mark_disconnected(&mut self, id: &str) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.connection_state = ConnectionState::Disconnected;
        }
    }

    /// Drop peers unseen for longer than `timeout`; returns how many went.
    pub fn prune_stale(&mut self, timeout: Duration) -> usize {
        let before = self.peers.len();
        self.peers.retain(|_, peer| !peer.is_stale(timeout));
        before - self.peers.len()
    }

    /// Drop peers unseen past the default prune timeout.
    pub fn prune_stale_default(&mut self) -> usize {
        self.prune_stale(PEER_PRUNE_TIMEOUT)
    }

    /// Value snapshot of all currently connected peers.
    pub fn connected_peers(&self) -> Vec<Peer> {
        self.peers
            .values()
            .filter(|p| p.connection_state == ConnectionState::Connected)
            .cloned()
            .collect()
    }

    // === Envelope processing ===

    /// Process one incoming envelope.
    ///
    /// The algorithm, in order: TTL sanity (a zero or over-limit TTL never
    /// touches the dedup set), dedup check, age check, dedup insertion,
    /// then type dispatch. Per-envelope failures become
    /// [`ProcessResult::Invalid`]; the stream itself never aborts.
    pub fn process_incoming(&mut self, envelope: MeshMessage) -> ProcessResult {
        if envelope.ttl == 0 || envelope.ttl > crate::message::MAX_TTL {
            self.stats.invalid += 1;
            return ProcessResult::Invalid;
        }
        if self.dedup.contains(&envelope.id) {
            self.stats.duplicates += 1;
            return ProcessResult::Duplicate;
        }
        if Duration::from_secs(envelope.age_seconds()) > self.config.max_message_age {
            self.stats.expired += 1;
            return ProcessResult::Expired;
        }

        self.dedup.insert(envelope.id);
        self.stats.received += 1;

        if let Some(peer) = self.peers.get_mut(&envelope.origin_peer_id) {
            peer.touch();
        }

        match envelope.message_type {
            MessageType::StealthPayment => self.handle_payment(envelope),
            MessageType::Acknowledgment => self.handle_acknowledgment(&envelope),
            MessageType::Discovery => self.handle_discovery(&envelope),
            MessageType::Heartbeat => ProcessResult::Processed,
            MessageType::MetaAddressRequest => self.handle_meta_request(&envelope),
            MessageType::MetaAddressResponse => self.handle_meta_response(&envelope),
            MessageType::ChatRequest
            | MessageType::ChatAccept
            | MessageType::ChatDecline
            | MessageType::ChatMessage
            | MessageType::ChatEnd => {
                self.publish(NodeEvent::ChatEnvelope(envelope));
                ProcessResult::Processed
            }
        }
    }

    /// Record an envelope we originated so its echoes drop as duplicates.
    pub fn register_outgoing(&mut self, id: Uuid) {
        self.dedup.insert(id);
    }

    /// Queue an envelope for delivery on the next transport drain. The
    /// queue is bounded; the oldest entry is dropped on overflow.
    pub fn enqueue_outbound(&mut self, envelope: MeshMessage) {
        if self.pending.len() >= PENDING_QUEUE_CAPACITY {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(id = %dropped.id, "pending queue full, dropping oldest");
            }
        }
        self.pending.push_back(envelope);
    }

    /// Take everything waiting for the transport.
    pub fn drain_outbound(&mut self) -> Vec<MeshMessage> {
        self.pending.drain(..).collect()
    }

    /// Build a payment envelope with our configured TTL.
    pub fn payment_envelope(&self, payload: &StealthPaymentPayload) -> Result<MeshMessage> {
        MeshMessage::payment(&self.config.peer_id, payload, self.config.payment_ttl)
    }

    /// Build a meta-address request for our connected peers.
    pub fn meta_address_request(&self, prefer_hybrid: bool) -> Result<MeshMessage> {
        let payload = MetaAddressRequestPayload {
            requester_peer_id: self.config.peer_id.clone(),
            requester_name: self.config.local_name.clone(),
            prefer_hybrid,
        };
        MeshMessage::direct(MessageType::MetaAddressRequest, &self.config.peer_id, payload.encode()?)
    }

    /// Build a discovery announcement for our own node.
    pub fn discovery_envelope(&self, capabilities: PeerCapabilities) -> Result<MeshMessage> {
        let payload = DiscoveryPayload {
            peer_id: self.config.peer_id.clone(),
            name: self.config.local_name.clone(),
            capabilities,
        };
        MeshMessage::direct(MessageType::Discovery, &self.config.peer_id, payload.encode()?)
    }

    /// Build a heartbeat beacon.
    pub fn heartbeat_envelope(&self) -> Result<MeshMessage> {
        MeshMessage::direct(MessageType::Heartbeat, &self.config.peer_id, Vec::new())
    }

    // === Private methods ===

    fn handle_payment(&mut self, envelope: MeshMessage) -> ProcessResult {
        let payload = match StealthPaymentPayload::decode(&envelope.payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(id = %envelope.id, "payment payload rejected: {e}");
                self.stats.invalid += 1;
                return ProcessResult::Invalid;
            }
        };

        self.stats.published += 1;
        self.publish(NodeEvent::PaymentReceived {
            message_id: envelope.id,
            payload,
        });

        // Acknowledge receipt toward the origin
        match MeshMessage::acknowledgment(&self.config.peer_id, envelope.id) {
            Ok(ack) => self.enqueue_outbound(ack),
            Err(e) => warn!("failed to build acknowledgment: {e}"),
        }

        match envelope.forwarded() {
            Some(forwarded) => {
                self.stats.relayed += 1;
                ProcessResult::Relay(forwarded)
            }
            None => ProcessResult::Processed,
        }
    }

    fn handle_acknowledgment(&mut self, envelope: &MeshMessage) -> ProcessResult {
        match AcknowledgmentPayload::decode(&envelope.payload) {
            Ok(payload) => {
                self.publish(NodeEvent::AcknowledgmentReceived(payload.message_id));
                ProcessResult::Processed
            }
            Err(_) => {
                self.stats.invalid += 1;
                ProcessResult::Invalid
            }
        }
    }

    fn handle_discovery(&mut self, envelope: &MeshMessage) -> ProcessResult {
        match DiscoveryPayload::decode(&envelope.payload) {
            Ok(payload) => {
                let peer = self
                    .peers
                    .entry(payload.peer_id.clone())
                    .or_insert_with(|| Peer::new(&payload.peer_id, -70));
                peer.name = payload.name;
                peer.capabilities = payload.capabilities;
                peer.touch();
                ProcessResult::Processed
            }
            Err(_) => {
                self.stats.invalid += 1;
                ProcessResult::Invalid
            }
        }
    }

    /// Answer a meta-address request.
    ///
    /// Hybrid is offered iff the requester prefers it and we own one;
    /// otherwise the classical address, if configured. The response is
    /// broadcast rather than unicast: the transport already exposes the
    /// connected-peer set, and requesters filter by their own pending
    /// request while other peers discard unmatched responses.
    fn handle_meta_request(&mut self, envelope: &MeshMessage) -> ProcessResult {
        let request = match MetaAddressRequestPayload::decode(&envelope.payload) {
            Ok(request) => request,
            Err(_) => {
                self.stats.invalid += 1;
                return ProcessResult::Invalid;
            }
        };
        if request.requester_peer_id == self.config.peer_id {
            return ProcessResult::Processed;
        }

        let chosen = if request.prefer_hybrid && self.config.hybrid_meta_address.is_some() {
            self.config.hybrid_meta_address.clone().map(|a| (a, true))
        } else {
            self.config.classical_meta_address.clone().map(|a| (a, false))
        };

        if let Some((meta_address, is_hybrid)) = chosen {
            let payload = MetaAddressResponsePayload {
                responder_peer_id: self.config.peer_id.clone(),
                responder_name: self.config.local_name.clone(),
                meta_address,
                is_hybrid,
            };
            match payload
                .encode()
                .and_then(|bytes| MeshMessage::direct(MessageType::MetaAddressResponse, &self.config.peer_id, bytes))
            {
                Ok(response) => self.enqueue_outbound(response),
                Err(e) => warn!("failed to build meta-address response: {e}"),
            }
        }
        ProcessResult::Processed
    }

    fn handle_meta_response(&mut self, envelope: &MeshMessage) -> ProcessResult {
        match MetaAddressResponsePayload::decode(&envelope.payload) {
            Ok(payload) => {
                self.publish(NodeEvent::MetaAddressReceived(payload));
                ProcessResult::Processed
            }
            Err(_) => {
                self.stats.invalid += 1;
                ProcessResult::Invalid
            }
        }
    }

    fn publish(&self, event: NodeEvent) {
        if self.events.try_send(event).is_err() {
            warn!("event subscriber lagging, dropping event");
        }
    }

    #[cfg(test)]
    fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    #[cfg(test)]
    fn dedup_contains(&self, id: &Uuid) -> bool {
        self.dedup.contains(id)
    }
}

/// Commands accepted by the node owner task.
#[derive(Debug)]
pub enum NodeCommand {
    /// Encode and broadcast an envelope we originate.
    Broadcast(MeshMessage),
    /// Request a stats snapshot.
    Stats(oneshot::Sender<NodeStats>),
    /// Request a connected-peer snapshot.
    ConnectedPeers(oneshot::Sender<Vec<Peer>>),
    /// Drop peers unseen past the given timeout.
    PruneStale(Duration),
    /// Stop the task.
    Shutdown,
}

/// Spawn the owner task for a node.
///
/// The task is the node's single writer: it drains transport events and
/// commands, re-emits relayed envelopes, and flushes the pending-delivery
/// queue. It ends when both channels close or on `Shutdown`.
pub fn spawn_node_task(
    mut node: MeshNode,
    mut transport_events: mpsc::Receiver<TransportEvent>,
    mut commands: mpsc::Receiver<NodeCommand>,
    outbound: mpsc::Sender<OutboundFrame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = transport_events.recv() => {
                    match event {
                        Some(event) => handle_transport_event(&mut node, event, &outbound).await,
                        None => break,
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(NodeCommand::Broadcast(envelope)) => {
                            node.register_outgoing(envelope.id);
                            send_envelope(&envelope, &outbound).await;
                        }
                        Some(NodeCommand::Stats(reply)) => {
                            let _ = reply.send(node.stats());
                        }
                        Some(NodeCommand::ConnectedPeers(reply)) => {
                            let _ = reply.send(node.connected_peers());
                        }
                        Some(NodeCommand::PruneStale(timeout)) => {
                            node.prune_stale(timeout);
                        }
                        Some(NodeCommand::Shutdown) | None => break,
                    }
                }
            }
            flush_pending(&mut node, &outbound).await;
        }
    })
}

async fn handle_transport_event(
    node: &mut MeshNode,
    event: TransportEvent,
    outbound: &mpsc::Sender<OutboundFrame>,
) {
    match event {
        TransportEvent::Frame { peer_id, bytes } => {
            let envelope = match MeshMessage::decode(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(%peer_id, "undecodable frame: {e}");
                    return;
                }
            };
            if let ProcessResult::Relay(forwarded) = node.process_incoming(envelope) {
                send_envelope(&forwarded, outbound).await;
            }
        }
        TransportEvent::PeerObserved {
            peer_id,
            rssi,
            local_name,
            capabilities,
        } => {
            node.observe_peer(&peer_id, rssi, local_name, capabilities);
        }
        TransportEvent::PeerDisconnected { peer_id } => {
            node.mark_disconnected(&peer_id);
        }
    }
}

async fn flush_pending(node: &mut MeshNode, outbound: &mpsc::Sender<OutboundFrame>) {
    for envelope in node.drain_outbound() {
        node.register_outgoing(envelope.id);
        send_envelope(&envelope, outbound).await;
    }
}

async fn send_envelope(envelope: &MeshMessage, outbound: &mpsc::Sender<OutboundFrame>) {
    match envelope.encode() {
        Ok(bytes) => {
            if outbound.send(OutboundFrame::Broadcast(bytes)).await.is_err() {
                warn!("transport outbound channel closed");
            }
        }
        Err(e) => warn!(id = %envelope.id, "dropping unencodable envelope: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn payment_envelope(ttl: u8) -> MeshMessage {
        let identity = shroud_crypto::StealthIdentity::generate(false).unwrap();
        let output = shroud_crypto::derive_stealth_output(&identity.meta_address()).unwrap();
        let payload = StealthPaymentPayload::new_v1(&output, 1_000, None, None);
        MeshMessage::payment("origin-peer", &payload, ttl).unwrap()
    }

    fn test_node(config: NodeConfig) -> (MeshNode, mpsc::Receiver<NodeEvent>) {
        MeshNode::new(config)
    }

    #[test]
    fn test_payment_is_published_relayed_and_acked() {
        let (mut node, mut events) = test_node(NodeConfig::default());
        let envelope = payment_envelope(5);

        let result = node.process_incoming(envelope.clone());
        match result {
            ProcessResult::Relay(forwarded) => {
                assert_eq!(forwarded.ttl, envelope.ttl - 1);
                assert_eq!(forwarded.id, envelope.id);
            }
            other => panic!("expected relay, got {other:?}"),
        }

        match events.try_recv().unwrap() {
            NodeEvent::PaymentReceived { message_id, .. } => assert_eq!(message_id, envelope.id),
            other => panic!("expected payment event, got {other:?}"),
        }

        // Receipt acknowledgment queued for the transport
        let outbound = node.drain_outbound();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].message_type, MessageType::Acknowledgment);
    }

    #[test]
    fn test_duplicate_is_dropped() {
        let (mut node, _events) = test_node(NodeConfig::default());
        let envelope = payment_envelope(5);

        assert!(matches!(
            node.process_incoming(envelope.clone()),
            ProcessResult::Relay(_)
        ));
        assert_eq!(node.process_incoming(envelope), ProcessResult::Duplicate);

        let stats = node.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn test_ttl_one_is_not_relayed() {
        let (mut node, _events) = test_node(NodeConfig::default());
        assert_eq!(
            node.process_incoming(payment_envelope(1)),
            ProcessResult::Processed
        );
    }

    #[test]
    fn test_ttl_zero_never_enters_dedup() {
        let (mut node, _events) = test_node(NodeConfig::default());
        let mut envelope = payment_envelope(5);
        envelope.ttl = 0;
        let id = envelope.id;

        assert_eq!(node.process_incoming(envelope.clone()), ProcessResult::Invalid);
        assert!(!node.dedup_contains(&id));

        // The same id with a sane TTL is still fresh
        envelope.ttl = 5;
        assert!(matches!(node.process_incoming(envelope), ProcessResult::Relay(_)));
    }

    #[test]
    fn test_overlimit_ttl_is_invalid() {
        let (mut node, _events) = test_node(NodeConfig::default());
        let mut envelope = payment_envelope(5);
        envelope.ttl = crate::message::MAX_TTL + 1;
        assert_eq!(node.process_incoming(envelope), ProcessResult::Invalid);
    }

    #[test]
    fn test_expired_envelope_dropped_before_dedup() {
        let (mut node, _events) = test_node(NodeConfig::default());
        let mut envelope = payment_envelope(5);
        envelope.created_at = Utc::now() - chrono::Duration::hours(2);
        let id = envelope.id;

        assert_eq!(node.process_incoming(envelope), ProcessResult::Expired);
        assert!(!node.dedup_contains(&id));
        assert_eq!(node.stats().expired, 1);
    }

    #[test]
    fn test_undecodable_payment_is_invalid() {
        let (mut node, _events) = test_node(NodeConfig::default());
        let envelope =
            MeshMessage::new(MessageType::StealthPayment, 5, "p", b"not json".to_vec()).unwrap();
        assert_eq!(node.process_incoming(envelope), ProcessResult::Invalid);
        assert_eq!(node.stats().invalid, 1);
    }

    #[test]
    fn test_meta_request_response_selection() {
        let config = NodeConfig {
            peer_id: "us".into(),
            classical_meta_address: Some("ClassicMeta".into()),
            hybrid_meta_address: Some("HybridMeta".into()),
            ..NodeConfig::default()
        };
        let (mut node, _events) = test_node(config);

        let request = MetaAddressRequestPayload {
            requester_peer_id: "them".into(),
            requester_name: None,
            prefer_hybrid: true,
        };
        let envelope = MeshMessage::direct(
            MessageType::MetaAddressRequest,
            "them",
            request.encode().unwrap(),
        )
        .unwrap();
        assert_eq!(node.process_incoming(envelope), ProcessResult::Processed);

        let outbound = node.drain_outbound();
        assert_eq!(outbound.len(), 1);
        let response =
            MetaAddressResponsePayload::decode(&outbound[0].payload).unwrap();
        assert_eq!(response.meta_address, "HybridMeta");
        assert!(response.is_hybrid);
        assert_eq!(outbound[0].ttl, 1);

        // A requester without the hybrid preference gets the classical form
        let request = MetaAddressRequestPayload {
            requester_peer_id: "them".into(),
            requester_name: None,
            prefer_hybrid: false,
        };
        let envelope = MeshMessage::direct(
            MessageType::MetaAddressRequest,
            "them",
            request.encode().unwrap(),
        )
        .unwrap();
        node.process_incoming(envelope);
        let outbound = node.drain_outbound();
        let response =
            MetaAddressResponsePayload::decode(&outbound[0].payload).unwrap();
        assert_eq!(response.meta_address, "ClassicMeta");
        assert!(!response.is_hybrid);
    }

    #[test]
    fn test_meta_request_without_configured_address() {
        let (mut node, _events) = test_node(NodeConfig::default());
        let request = MetaAddressRequestPayload {
            requester_peer_id: "them".into(),
            requester_name: None,
            prefer_hybrid: false,
        };
        let envelope = MeshMessage::direct(
            MessageType::MetaAddressRequest,
            "them",
            request.encode().unwrap(),
        )
        .unwrap();
        assert_eq!(node.process_incoming(envelope), ProcessResult::Processed);
        assert!(node.drain_outbound().is_empty());
    }

    #[test]
    fn test_own_meta_request_is_ignored() {
        let config = NodeConfig {
            peer_id: "us".into(),
            classical_meta_address: Some("ClassicMeta".into()),
            ..NodeConfig::default()
        };
        let (mut node, _events) = test_node(config);
        let request = MetaAddressRequestPayload {
            requester_peer_id: "us".into(),
            requester_name: None,
            prefer_hybrid: false,
        };
        let envelope = MeshMessage::direct(
            MessageType::MetaAddressRequest,
            "us",
            request.encode().unwrap(),
        )
        .unwrap();
        node.process_incoming(envelope);
        assert!(node.drain_outbound().is_empty());
    }

    #[test]
    fn test_chat_envelope_is_published_not_relayed() {
        let (mut node, mut events) = test_node(NodeConfig::default());
        let envelope =
            MeshMessage::direct(MessageType::ChatMessage, "them", b"{}".to_vec()).unwrap();
        assert_eq!(node.process_incoming(envelope.clone()), ProcessResult::Processed);
        assert!(matches!(
            events.try_recv().unwrap(),
            NodeEvent::ChatEnvelope(received) if received.id == envelope.id
        ));
    }

    #[test]
    fn test_peer_lifecycle_and_prune() {
        let (mut node, _events) = test_node(NodeConfig::default());
        node.observe_peer("a", -55, Some("Alice".into()), None);
        node.observe_peer("b", -70, None, None);
        assert_eq!(node.connected_peers().len(), 2);

        node.mark_disconnected("b");
        assert_eq!(node.connected_peers().len(), 1);

        // Backdate peer a and prune
        node.update_peer("a", |peer| {
            peer.last_seen_at = std::time::Instant::now() - Duration::from_secs(120);
        })
        .unwrap();
        assert_eq!(node.prune_stale(Duration::from_secs(60)), 1);
        assert!(node.remove_peer("a").is_none());
    }

    #[test]
    fn test_dedup_cache_purges_oldest_tenth() {
        let mut cache = DedupCache::new(DEDUP_CAPACITY);
        let ids: Vec<Uuid> = (0..=DEDUP_CAPACITY).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            cache.insert(*id);
        }

        assert!(cache.len() <= DEDUP_CAPACITY);
        // The earliest entries were purged, the latest survive
        assert!(!cache.contains(&ids[0]));
        assert!(cache.contains(&ids[DEDUP_CAPACITY]));
    }

    #[test]
    fn test_pending_queue_drops_oldest() {
        let (mut node, _events) = test_node(NodeConfig::default());
        let mut first_id = None;
        for _ in 0..=PENDING_QUEUE_CAPACITY {
            let envelope = node.heartbeat_envelope().unwrap();
            if first_id.is_none() {
                first_id = Some(envelope.id);
            }
            node.enqueue_outbound(envelope);
        }
        let drained = node.drain_outbound();
        assert_eq!(drained.len(), PENDING_QUEUE_CAPACITY);
        assert!(drained.iter().all(|e| Some(e.id) != first_id));
    }

    #[tokio::test]
    async fn test_node_task_relays_frames() {
        let (node, mut events) = test_node(NodeConfig::default());
        let (transport_tx, transport_rx) = mpsc::channel(16);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);

        let handle = spawn_node_task(node, transport_rx, command_rx, outbound_tx);

        let envelope = payment_envelope(5);
        transport_tx
            .send(TransportEvent::Frame {
                peer_id: "neighbor".into(),
                bytes: envelope.encode().unwrap(),
            })
            .await
            .unwrap();

        // The relayed copy goes out with a decremented TTL
        let mut saw_relay = false;
        let mut saw_ack = false;
        for _ in 0..2 {
            match outbound_rx.recv().await.unwrap() {
                OutboundFrame::Broadcast(bytes) => {
                    let sent = MeshMessage::decode(&bytes).unwrap();
                    match sent.message_type {
                        MessageType::StealthPayment => {
                            assert_eq!(sent.ttl, envelope.ttl - 1);
                            saw_relay = true;
                        }
                        MessageType::Acknowledgment => saw_ack = true,
                        other => panic!("unexpected outbound type {other:?}"),
                    }
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(saw_relay && saw_ack);

        assert!(matches!(
            events.recv().await.unwrap(),
            NodeEvent::PaymentReceived { .. }
        ));

        let (reply_tx, reply_rx) = oneshot::channel();
        command_tx.send(NodeCommand::Stats(reply_tx)).await.unwrap();
        let stats = reply_rx.await.unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.relayed, 1);

        command_tx.send(NodeCommand::Shutdown).await.unwrap();
        handle.await.unwrap();
    }
}

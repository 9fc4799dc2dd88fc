//! # Shroud Mesh - Message Relay Module
//!
//! Store-and-forward for payment envelopes: messages are held while no
//! suitable next hop exists, re-emitted in bounded cycles when one
//! appears, and dropped once acknowledged, expired, or evicted.
//!
//! The relay is a single-owner component; `spawn_relay_task` runs it on a
//! cooperative loop with a cancellable periodic prune. Errors inside the
//! prune cycle never propagate upward — failures surface only as events.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::message::MeshMessage;
use crate::peer::Peer;

/// Acknowledged-id set hard cap.
pub const ACK_SET_CAPACITY: usize = 1000;

/// Size the acknowledged-id set is purged down to when it overflows.
pub const ACK_SET_PURGE_TO: usize = 800;

/// Event channel depth.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Cap on simultaneously stored envelopes; oldest evicted beyond it.
    pub max_stored_messages: usize,
    /// Stored envelopes older than this are pruned.
    pub message_expiry: Duration,
    /// How often the prune task runs.
    pub prune_interval: Duration,
    /// Master switch for relaying.
    pub enable_relay: bool,
    /// Minimum peer signal strength to count as a relay hop (dBm).
    pub min_relay_rssi: i16,
    /// Upper bound on envelopes re-emitted per relay cycle.
    pub max_messages_per_cycle: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_stored_messages: 100,
            message_expiry: Duration::from_secs(3600),
            prune_interval: Duration::from_secs(60),
            enable_relay: true,
            min_relay_rssi: -80,
            max_messages_per_cycle: 10,
        }
    }
}

/// Events emitted by the relay.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// An envelope entered the store.
    MessageStored(Uuid),
    /// An envelope was re-emitted.
    MessageRelayed(Uuid),
    /// An envelope was acknowledged and removed.
    MessageAcknowledged(Uuid),
    /// An envelope aged out.
    MessageExpired(Uuid),
    /// An envelope was evicted to make room.
    MessageEvicted(Uuid),
    /// A relay cycle failed; the envelopes stay stored for the next one.
    RelayFailed {
        /// The envelopes that failed to go out.
        ids: Vec<Uuid>,
        /// The transport's error, surfaced unchanged.
        error: String,
    },
}

/// Counters and sizes for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Envelopes currently stored.
    pub stored: usize,
    /// Ids currently in the acknowledged set.
    pub acknowledged: usize,
    /// Total re-emissions.
    pub relayed_total: u64,
    /// Total envelopes acknowledged.
    pub acknowledged_total: u64,
    /// Total envelopes expired.
    pub expired_total: u64,
    /// Total envelopes evicted.
    pub evicted_total: u64,
}

struct StoredMessage {
    envelope: MeshMessage,
    received_at: Instant,
    relay_count: u32,
    last_relay_attempt: Option<Instant>,
}

/// The store-and-forward relay. Single writer: its owner task.
pub struct MessageRelay {
    config: RelayConfig,
    stored: HashMap<Uuid, StoredMessage>,
    order: VecDeque<Uuid>,
    acknowledged: HashSet<Uuid>,
    ack_order: VecDeque<Uuid>,
    events: mpsc::Sender<RelayEvent>,
    stats: RelayStats,
}

impl MessageRelay {
    /// Create a relay and the subscriber end of its event stream.
    pub fn new(config: RelayConfig) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                config,
                stored: HashMap::new(),
                order: VecDeque::new(),
                acknowledged: HashSet::new(),
                ack_order: VecDeque::new(),
                events,
                stats: RelayStats::default(),
            },
            events_rx,
        )
    }

    /// The active configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Hold an envelope for forwarding.
    ///
    /// A no-op for envelopes already stored or already acknowledged. At
    /// capacity, the oldest stored envelope is evicted first.
    pub fn store_message(&mut self, envelope: MeshMessage) {
        let id = envelope.id;
        if self.stored.contains_key(&id) || self.acknowledged.contains(&id) {
            return;
        }

        while self.stored.len() >= self.config.max_stored_messages {
            let Some(oldest) = self.pop_oldest_stored() else {
                break;
            };
            self.stored.remove(&oldest);
            self.stats.evicted_total += 1;
            self.emit(RelayEvent::MessageEvicted(oldest));
        }

        self.stored.insert(
            id,
            StoredMessage {
                envelope,
                received_at: Instant::now(),
                relay_count: 0,
                last_relay_attempt: None,
            },
        );
        self.order.push_back(id);
        self.emit(RelayEvent::MessageStored(id));
    }

    /// Select up to `max_messages_per_cycle` stored envelopes for
    /// re-emission, as TTL-decremented copies.
    ///
    /// Returns nothing when relaying is disabled or no connected peer
    /// clears the signal threshold.
    pub fn prepare_relay(&self, peers: &[Peer]) -> Vec<MeshMessage> {
        if !self.config.enable_relay {
            return Vec::new();
        }
        if !peers
            .iter()
            .any(|p| p.is_relay_candidate(self.config.min_relay_rssi))
        {
            return Vec::new();
        }

        let mut cycle = Vec::new();
        for id in &self.order {
            if cycle.len() >= self.config.max_messages_per_cycle {
                break;
            }
            let Some(stored) = self.stored.get(id) else {
                continue;
            };
            if stored.received_at.elapsed() > self.config.message_expiry {
                continue;
            }
            if let Some(forwarded) = stored.envelope.forwarded() {
                cycle.push(forwarded);
            }
        }
        cycle
    }

    /// Record a successful re-emission.
    pub fn mark_relayed(&mut self, id: Uuid) {
        if let Some(stored) = self.stored.get_mut(&id) {
            stored.relay_count += 1;
            stored.last_relay_attempt = Some(Instant::now());
            self.stats.relayed_total += 1;
            self.emit(RelayEvent::MessageRelayed(id));
        }
    }

    /// Record a failed relay cycle; the envelopes stay for the next one.
    pub fn report_relay_failure(&mut self, ids: Vec<Uuid>, error: String) {
        debug!("relay cycle failed for {} envelopes: {error}", ids.len());
        self.emit(RelayEvent::RelayFailed { ids, error });
    }

    /// Drop an acknowledged envelope and remember its id so a late copy
    /// is not re-stored.
    pub fn mark_acknowledged(&mut self, id: Uuid) {
        if self.acknowledged.contains(&id) {
            return;
        }
        if self.stored.remove(&id).is_some() {
            self.stats.acknowledged_total += 1;
            self.emit(RelayEvent::MessageAcknowledged(id));
        }
        self.acknowledged.insert(id);
        self.ack_order.push_back(id);
        if self.acknowledged.len() > ACK_SET_CAPACITY {
            while self.acknowledged.len() > ACK_SET_PURGE_TO {
                if let Some(oldest) = self.ack_order.pop_front() {
                    self.acknowledged.remove(&oldest);
                }
            }
        }
    }

    /// Drop expired envelopes; returns how many went.
    pub fn prune(&mut self) -> usize {
        let expiry = self.config.message_expiry;
        let expired: Vec<Uuid> = self
            .stored
            .iter()
            .filter(|(_, stored)| stored.received_at.elapsed() > expiry)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.stored.remove(id);
            self.stats.expired_total += 1;
            self.emit(RelayEvent::MessageExpired(*id));
        }
        expired.len()
    }

    /// Whether an envelope is currently stored.
    pub fn is_stored(&self, id: &Uuid) -> bool {
        self.stored.contains_key(id)
    }

    /// Whether an envelope id has been acknowledged.
    pub fn is_acknowledged(&self, id: &Uuid) -> bool {
        self.acknowledged.contains(id)
    }

    /// Counter and size snapshot.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            stored: self.stored.len(),
            acknowledged: self.acknowledged.len(),
            ..self.stats
        }
    }

    // === Private methods ===

    /// Oldest id still present in the store (the order queue keeps ids of
    /// removed envelopes until they surface here).
    fn pop_oldest_stored(&mut self) -> Option<Uuid> {
        while let Some(id) = self.order.pop_front() {
            if self.stored.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn emit(&self, event: RelayEvent) {
        if self.events.try_send(event).is_err() {
            debug!("relay event subscriber lagging, dropping event");
        }
    }

    #[cfg(test)]
    fn backdate(&mut self, id: &Uuid, age: Duration) {
        if let Some(stored) = self.stored.get_mut(id) {
            stored.received_at = Instant::now() - age;
        }
    }
}

/// Commands accepted by the relay owner task.
#[derive(Debug)]
pub enum RelayCommand {
    /// Hold an envelope for forwarding.
    Store(MeshMessage),
    /// Record a successful re-emission.
    MarkRelayed(Uuid),
    /// Drop an acknowledged envelope.
    MarkAcknowledged(Uuid),
    /// Select a relay cycle against a peer snapshot.
    PrepareRelay {
        /// Connected-peer snapshot from the node owner.
        peers: Vec<Peer>,
        /// Where to send the cycle.
        reply: oneshot::Sender<Vec<MeshMessage>>,
    },
    /// Request a stats snapshot.
    Stats(oneshot::Sender<RelayStats>),
    /// Stop the task.
    Shutdown,
}

/// Spawn the relay owner task.
///
/// Runs the periodic prune on `prune_interval` and serves commands until
/// `Shutdown` arrives or the channel closes; dropping the command sender
/// cancels the task, and a second shutdown is a no-op.
pub fn spawn_relay_task(
    mut relay: MessageRelay,
    mut commands: mpsc::Receiver<RelayCommand>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut prune_timer = tokio::time::interval(relay.config.prune_interval);
        prune_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = prune_timer.tick() => {
                    relay.prune();
                }
                command = commands.recv() => {
                    match command {
                        Some(RelayCommand::Store(envelope)) => relay.store_message(envelope),
                        Some(RelayCommand::MarkRelayed(id)) => relay.mark_relayed(id),
                        Some(RelayCommand::MarkAcknowledged(id)) => relay.mark_acknowledged(id),
                        Some(RelayCommand::PrepareRelay { peers, reply }) => {
                            let _ = reply.send(relay.prepare_relay(&peers));
                        }
                        Some(RelayCommand::Stats(reply)) => {
                            let _ = reply.send(relay.stats());
                        }
                        Some(RelayCommand::Shutdown) | None => break,
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, StealthPaymentPayload};

    fn payment_envelope(ttl: u8) -> MeshMessage {
        let identity = shroud_crypto::StealthIdentity::generate(false).unwrap();
        let output = shroud_crypto::derive_stealth_output(&identity.meta_address()).unwrap();
        let payload = StealthPaymentPayload::new_v1(&output, 500, None, None);
        MeshMessage::payment("origin", &payload, ttl).unwrap()
    }

    fn relay_peer(rssi: i16) -> Peer {
        Peer::new("hop", rssi)
    }

    #[test]
    fn test_store_and_duplicate() {
        let (mut relay, mut events) = MessageRelay::new(RelayConfig::default());
        let envelope = payment_envelope(5);

        relay.store_message(envelope.clone());
        relay.store_message(envelope.clone());
        assert_eq!(relay.stats().stored, 1);
        assert!(matches!(
            events.try_recv().unwrap(),
            RelayEvent::MessageStored(id) if id == envelope.id
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_store_after_acknowledgment_is_a_noop() {
        let (mut relay, _events) = MessageRelay::new(RelayConfig::default());
        let envelope = payment_envelope(5);

        relay.store_message(envelope.clone());
        relay.mark_acknowledged(envelope.id);
        assert!(!relay.is_stored(&envelope.id));

        relay.store_message(envelope.clone());
        assert!(!relay.is_stored(&envelope.id));
        assert!(relay.is_acknowledged(&envelope.id));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let config = RelayConfig {
            max_stored_messages: 3,
            ..RelayConfig::default()
        };
        let (mut relay, mut events) = MessageRelay::new(config);

        let envelopes: Vec<MeshMessage> = (0..4).map(|_| payment_envelope(5)).collect();
        for envelope in &envelopes {
            relay.store_message(envelope.clone());
        }

        assert_eq!(relay.stats().stored, 3);
        assert!(!relay.is_stored(&envelopes[0].id));
        assert!(relay.is_stored(&envelopes[3].id));

        let mut saw_eviction = false;
        while let Ok(event) = events.try_recv() {
            if let RelayEvent::MessageEvicted(id) = event {
                assert_eq!(id, envelopes[0].id);
                saw_eviction = true;
            }
        }
        assert!(saw_eviction);
    }

    #[test]
    fn test_prepare_relay_requires_eligible_peer() {
        let (mut relay, _events) = MessageRelay::new(RelayConfig::default());
        relay.store_message(payment_envelope(5));

        // No peers at all
        assert!(relay.prepare_relay(&[]).is_empty());
        // A peer below the signal threshold
        assert!(relay.prepare_relay(&[relay_peer(-95)]).is_empty());
        // A strong enough peer
        assert_eq!(relay.prepare_relay(&[relay_peer(-60)]).len(), 1);
    }

    #[test]
    fn test_prepare_relay_disabled() {
        let config = RelayConfig {
            enable_relay: false,
            ..RelayConfig::default()
        };
        let (mut relay, _events) = MessageRelay::new(config);
        relay.store_message(payment_envelope(5));
        assert!(relay.prepare_relay(&[relay_peer(-60)]).is_empty());
    }

    #[test]
    fn test_prepare_relay_decrements_and_bounds() {
        let config = RelayConfig {
            max_messages_per_cycle: 2,
            ..RelayConfig::default()
        };
        let (mut relay, _events) = MessageRelay::new(config);

        for _ in 0..3 {
            relay.store_message(payment_envelope(5));
        }
        // An exhausted envelope (TTL 1) never leaves the store
        relay.store_message(payment_envelope(1));

        let cycle = relay.prepare_relay(&[relay_peer(-60)]);
        assert_eq!(cycle.len(), 2);
        assert!(cycle.iter().all(|e| e.ttl == 4));
    }

    #[test]
    fn test_mark_relayed_tracks_counts() {
        let (mut relay, _events) = MessageRelay::new(RelayConfig::default());
        let envelope = payment_envelope(5);
        relay.store_message(envelope.clone());

        relay.mark_relayed(envelope.id);
        relay.mark_relayed(envelope.id);
        assert_eq!(relay.stats().relayed_total, 2);
        // Unknown ids are ignored
        relay.mark_relayed(Uuid::new_v4());
        assert_eq!(relay.stats().relayed_total, 2);
    }

    #[test]
    fn test_ack_set_purges_to_low_water_mark() {
        let (mut relay, _events) = MessageRelay::new(RelayConfig::default());
        for _ in 0..=ACK_SET_CAPACITY {
            relay.mark_acknowledged(Uuid::new_v4());
        }
        assert_eq!(relay.stats().acknowledged, ACK_SET_PURGE_TO);
    }

    #[test]
    fn test_prune_expires_old_messages() {
        let (mut relay, mut events) = MessageRelay::new(RelayConfig::default());
        let old = payment_envelope(5);
        let fresh = payment_envelope(5);
        relay.store_message(old.clone());
        relay.store_message(fresh.clone());
        relay.backdate(&old.id, Duration::from_secs(7200));

        assert_eq!(relay.prune(), 1);
        assert!(!relay.is_stored(&old.id));
        assert!(relay.is_stored(&fresh.id));

        let mut saw_expiry = false;
        while let Ok(event) = events.try_recv() {
            if let RelayEvent::MessageExpired(id) = event {
                assert_eq!(id, old.id);
                saw_expiry = true;
            }
        }
        assert!(saw_expiry);
    }

    #[test]
    fn test_relay_failure_keeps_messages() {
        let (mut relay, mut events) = MessageRelay::new(RelayConfig::default());
        let envelope = payment_envelope(5);
        relay.store_message(envelope.clone());

        relay.report_relay_failure(vec![envelope.id], "write timeout".into());
        assert!(relay.is_stored(&envelope.id));

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let RelayEvent::RelayFailed { ids, error } = event {
                assert_eq!(ids, vec![envelope.id]);
                assert_eq!(error, "write timeout");
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_relay_task_prunes_periodically() {
        let config = RelayConfig {
            message_expiry: Duration::from_millis(1),
            prune_interval: Duration::from_millis(20),
            ..RelayConfig::default()
        };
        let (relay, mut events) = MessageRelay::new(config);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let handle = spawn_relay_task(relay, commands_rx);

        let envelope = payment_envelope(5);
        commands_tx
            .send(RelayCommand::Store(envelope.clone()))
            .await
            .unwrap();

        // Stored, then expired by the periodic prune without intervention
        assert!(matches!(
            events.recv().await.unwrap(),
            RelayEvent::MessageStored(id) if id == envelope.id
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RelayEvent::MessageExpired(id) if id == envelope.id
        ));

        let (reply_tx, reply_rx) = oneshot::channel();
        commands_tx.send(RelayCommand::Stats(reply_tx)).await.unwrap();
        assert_eq!(reply_rx.await.unwrap().stored, 0);

        commands_tx.send(RelayCommand::Shutdown).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_task_serves_cycles() {
        let (relay, _events) = MessageRelay::new(RelayConfig::default());
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let handle = spawn_relay_task(relay, commands_rx);

        let envelope = payment_envelope(5);
        commands_tx
            .send(RelayCommand::Store(envelope.clone()))
            .await
            .unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        commands_tx
            .send(RelayCommand::PrepareRelay {
                peers: vec![relay_peer(-60)],
                reply: reply_tx,
            })
            .await
            .unwrap();
        let cycle = reply_rx.await.unwrap();
        assert_eq!(cycle.len(), 1);
        assert_eq!(cycle[0].ttl, 4);

        // Dropping the sender cancels the task
        drop(commands_tx);
        handle.await.unwrap();
    }
}

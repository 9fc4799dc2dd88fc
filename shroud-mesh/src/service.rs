//! # Shroud Mesh - Service Module
//!
//! One running mesh peer: the node, the relay store, and the chat manager
//! wired together behind a single owner task.
//!
//! The service consumes transport events, drives the periodic work
//! (heartbeats, relay cycles, relay pruning, chat cleanup) on cooperative
//! timers, and exposes a command channel for the application: send a
//! payment, ask peers for a meta-address, run chat sessions. Everything
//! the application needs back arrives on one event stream.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::chat::{ChatManager, ChatUpdate};
use crate::message::{MeshMessage, MessageType, MetaAddressResponsePayload, StealthPaymentPayload};
use crate::node::{MeshNode, NodeConfig, NodeEvent, NodeStats, ProcessResult};
use crate::relay::{MessageRelay, RelayConfig, RelayStats};
use crate::transport::{OutboundFrame, TransportEvent};
use crate::{MeshError, Result};

/// Service event channel depth.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Configuration for a full mesh peer.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Relay configuration.
    pub relay: RelayConfig,
    /// How often to beacon a heartbeat.
    pub heartbeat_interval: Duration,
    /// How often to attempt a store-and-forward relay cycle.
    pub relay_cycle_interval: Duration,
    /// How often to expire stale chat requests and idle sessions.
    pub chat_cleanup_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            relay: RelayConfig::default(),
            heartbeat_interval: Duration::from_secs(15),
            relay_cycle_interval: Duration::from_secs(30),
            chat_cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// A stealth payment addressed to the mesh arrived; hand it to the
    /// scanner and the settlement collaborator.
    PaymentReceived(StealthPaymentPayload),
    /// A peer shared its meta-address.
    MetaAddressReceived(MetaAddressResponsePayload),
    /// A chat session changed or produced a message.
    Chat(ChatUpdate),
}

/// Commands the application sends to its mesh peer.
#[derive(Debug)]
pub enum ServiceCommand {
    /// Wrap a payment payload in an envelope and flood it.
    SendPayment {
        /// The payment to send.
        payload: StealthPaymentPayload,
        /// Resolves with the envelope id used on the mesh.
        reply: oneshot::Sender<Result<Uuid>>,
    },
    /// Ask connected peers for their meta-address.
    RequestMetaAddress {
        /// Prefer the hybrid form where peers own one.
        prefer_hybrid: bool,
    },
    /// Open a chat session with a peer.
    InitiateChat {
        /// The peer to chat with.
        peer_id: String,
        /// Resolves with the new session id.
        reply: oneshot::Sender<Result<Uuid>>,
    },
    /// Accept a pending incoming chat request.
    AcceptChat {
        /// The session to accept.
        session_id: Uuid,
        /// Resolves when the acceptance is on the wire.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Decline a pending incoming chat request.
    DeclineChat {
        /// The session to decline.
        session_id: Uuid,
        /// Resolves when the decline is on the wire.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Encrypt and send a chat message.
    SendChatMessage {
        /// The session to send on.
        session_id: Uuid,
        /// The plaintext.
        text: String,
        /// Resolves when the message is on the wire; on error the caller
        /// keeps the text and the session stays usable.
        reply: oneshot::Sender<Result<()>>,
    },
    /// End a chat session and scrub its keys.
    EndChat {
        /// The session to end.
        session_id: Uuid,
        /// Resolves when the notice is on the wire.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Request node statistics.
    NodeStats(oneshot::Sender<NodeStats>),
    /// Request relay statistics.
    RelayStats(oneshot::Sender<RelayStats>),
    /// Stop the service.
    Shutdown,
}

/// Spawn a full mesh peer.
///
/// Returns the command sender, the application event stream, and the task
/// handle. The task ends on `Shutdown` or when the command and transport
/// channels both close.
pub fn spawn_mesh_service(
    config: ServiceConfig,
    transport_events: mpsc::Receiver<TransportEvent>,
    outbound: mpsc::Sender<OutboundFrame>,
) -> (
    mpsc::Sender<ServiceCommand>,
    mpsc::Receiver<ServiceEvent>,
    tokio::task::JoinHandle<()>,
) {
    let (commands_tx, commands_rx) = mpsc::channel(32);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let handle = tokio::spawn(run_service(
        config,
        transport_events,
        commands_rx,
        outbound,
        events_tx,
    ));
    (commands_tx, events_rx, handle)
}

struct Service {
    node: MeshNode,
    relay: MessageRelay,
    chat: ChatManager,
    outbound: mpsc::Sender<OutboundFrame>,
    events: mpsc::Sender<ServiceEvent>,
}

async fn run_service(
    config: ServiceConfig,
    mut transport_events: mpsc::Receiver<TransportEvent>,
    mut commands: mpsc::Receiver<ServiceCommand>,
    outbound: mpsc::Sender<OutboundFrame>,
    events: mpsc::Sender<ServiceEvent>,
) {
    let peer_id = config.node.peer_id.clone();
    let local_name = config.node.local_name.clone();
    // The node's event receiver stays outside the Service so the select
    // arms below borrow it independently of the handlers
    let (node, mut node_events) = MeshNode::new(config.node);
    let (relay, _relay_events) = MessageRelay::new(config.relay.clone());

    let mut service = Service {
        node,
        relay,
        chat: ChatManager::new(&peer_id, local_name),
        outbound,
        events,
    };

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    let mut relay_cycle = tokio::time::interval(config.relay_cycle_interval);
    let mut relay_prune = tokio::time::interval(config.relay.prune_interval);
    let mut chat_cleanup = tokio::time::interval(config.chat_cleanup_interval);

    loop {
        tokio::select! {
            event = transport_events.recv() => {
                match event {
                    Some(event) => service.handle_transport_event(event).await,
                    None => break,
                }
            }
            command = commands.recv() => {
                match command {
                    Some(ServiceCommand::Shutdown) | None => break,
                    Some(command) => service.handle_command(command).await,
                }
            }
            event = node_events.recv() => {
                if let Some(event) = event {
                    service.handle_node_event(event).await;
                }
            }
            _ = heartbeat.tick() => service.send_heartbeat().await,
            _ = relay_cycle.tick() => service.run_relay_cycle().await,
            _ = relay_prune.tick() => { service.relay.prune(); }
            _ = chat_cleanup.tick() => service.run_chat_cleanup(),
        }
        service.flush_node_outbound().await;
    }
}

impl Service {
    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame { peer_id, bytes } => {
                let envelope = match MeshMessage::decode(&bytes) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!(%peer_id, "undecodable frame: {e}");
                        return;
                    }
                };
                let is_payment = envelope.message_type == MessageType::StealthPayment;
                let original = envelope.clone();

                match self.node.process_incoming(envelope) {
                    ProcessResult::Relay(forwarded) => {
                        // Hold the original for later cycles toward peers
                        // that are not reachable right now
                        if is_payment {
                            self.relay.store_message(original);
                        }
                        if let Err(e) = self.broadcast(&forwarded).await {
                            warn!(id = %forwarded.id, "relay emission failed: {e}");
                        }
                    }
                    ProcessResult::Processed if is_payment => {
                        self.relay.store_message(original);
                    }
                    _ => {}
                }
            }
            TransportEvent::PeerObserved {
                peer_id,
                rssi,
                local_name,
                capabilities,
            } => {
                self.node.observe_peer(&peer_id, rssi, local_name, capabilities);
            }
            TransportEvent::PeerDisconnected { peer_id } => {
                self.node.mark_disconnected(&peer_id);
            }
        }
    }

    async fn handle_node_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::PaymentReceived { payload, .. } => {
                self.publish(ServiceEvent::PaymentReceived(payload));
            }
            NodeEvent::AcknowledgmentReceived(message_id) => {
                self.relay.mark_acknowledged(message_id);
            }
            NodeEvent::MetaAddressReceived(payload) => {
                self.publish(ServiceEvent::MetaAddressReceived(payload));
            }
            NodeEvent::ChatEnvelope(envelope) => match self.chat.handle_envelope(&envelope) {
                Ok(update) => self.publish(ServiceEvent::Chat(update)),
                Err(e) => debug!(id = %envelope.id, "chat envelope rejected: {e}"),
            },
        }
    }

    async fn handle_command(&mut self, command: ServiceCommand) {
        match command {
            ServiceCommand::SendPayment { payload, reply } => {
                let result = self.send_payment(&payload).await;
                let _ = reply.send(result);
            }
            ServiceCommand::RequestMetaAddress { prefer_hybrid } => {
                match self.node.meta_address_request(prefer_hybrid) {
                    Ok(envelope) => {
                        self.node.register_outgoing(envelope.id);
                        let _ = self.broadcast(&envelope).await;
                    }
                    Err(e) => warn!("failed to build meta-address request: {e}"),
                }
            }
            ServiceCommand::InitiateChat { peer_id, reply } => {
                let result = self.initiate_chat(&peer_id).await;
                let _ = reply.send(result);
            }
            ServiceCommand::AcceptChat { session_id, reply } => {
                let result = self.accept_chat(session_id).await;
                let _ = reply.send(result);
            }
            ServiceCommand::DeclineChat { session_id, reply } => {
                let result = self.decline_chat(session_id).await;
                let _ = reply.send(result);
            }
            ServiceCommand::SendChatMessage {
                session_id,
                text,
                reply,
            } => {
                let result = self.send_chat_message(session_id, &text).await;
                let _ = reply.send(result);
            }
            ServiceCommand::EndChat { session_id, reply } => {
                let result = self.end_chat(session_id).await;
                let _ = reply.send(result);
            }
            ServiceCommand::NodeStats(reply) => {
                let _ = reply.send(self.node.stats());
            }
            ServiceCommand::RelayStats(reply) => {
                let _ = reply.send(self.relay.stats());
            }
            ServiceCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    async fn send_payment(&mut self, payload: &StealthPaymentPayload) -> Result<Uuid> {
        let envelope = self.node.payment_envelope(payload)?;
        self.node.register_outgoing(envelope.id);
        // Stored so unreachable peers get it on a later cycle
        self.relay.store_message(envelope.clone());
        self.broadcast(&envelope).await?;
        Ok(envelope.id)
    }

    async fn initiate_chat(&mut self, peer_id: &str) -> Result<Uuid> {
        let (session_id, payload) = self.chat.initiate(peer_id)?;
        let envelope = MeshMessage::direct(
            MessageType::ChatRequest,
            self.node.peer_id(),
            payload.encode()?,
        )?;
        self.unicast(peer_id, &envelope).await?;
        Ok(session_id)
    }

    async fn accept_chat(&mut self, session_id: Uuid) -> Result<()> {
        let payload = self.chat.accept(session_id)?;
        let peer_id = self.chat_peer(session_id)?;
        let envelope = MeshMessage::direct(
            MessageType::ChatAccept,
            self.node.peer_id(),
            payload.encode()?,
        )?;
        self.unicast(&peer_id, &envelope).await
    }

    async fn decline_chat(&mut self, session_id: Uuid) -> Result<()> {
        let payload = self.chat.decline(session_id)?;
        let peer_id = self.chat_peer(session_id)?;
        let envelope = MeshMessage::direct(
            MessageType::ChatDecline,
            self.node.peer_id(),
            payload.encode()?,
        )?;
        self.unicast(&peer_id, &envelope).await
    }

    async fn send_chat_message(&mut self, session_id: Uuid, text: &str) -> Result<()> {
        let payload = self.chat.send_message(session_id, text)?;
        let peer_id = self.chat_peer(session_id)?;
        let envelope = MeshMessage::direct(
            MessageType::ChatMessage,
            self.node.peer_id(),
            payload.encode()?,
        )?;
        self.unicast(&peer_id, &envelope).await
    }

    async fn end_chat(&mut self, session_id: Uuid) -> Result<()> {
        let payload = self.chat.end(session_id)?;
        let peer_id = self.chat_peer(session_id)?;
        let envelope = MeshMessage::direct(
            MessageType::ChatEnd,
            self.node.peer_id(),
            payload.encode()?,
        )?;
        self.unicast(&peer_id, &envelope).await
    }

    async fn send_heartbeat(&mut self) {
        match self.node.heartbeat_envelope() {
            Ok(envelope) => {
                self.node.register_outgoing(envelope.id);
                let _ = self.broadcast(&envelope).await;
            }
            Err(e) => warn!("failed to build heartbeat: {e}"),
        }
    }

    /// One store-and-forward cycle: forward stored envelopes when an
    /// eligible hop exists. A transport failure keeps the envelopes stored
    /// and is retried on the next cycle.
    async fn run_relay_cycle(&mut self) {
        let peers = self.node.connected_peers();
        let cycle = self.relay.prepare_relay(&peers);
        if cycle.is_empty() {
            return;
        }

        let ids: Vec<Uuid> = cycle.iter().map(|e| e.id).collect();
        for envelope in &cycle {
            if let Err(e) = self.broadcast(envelope).await {
                self.relay.report_relay_failure(ids, e.to_string());
                return;
            }
            self.relay.mark_relayed(envelope.id);
        }
    }

    fn run_chat_cleanup(&mut self) {
        for session_id in self.chat.cleanup() {
            self.publish(ServiceEvent::Chat(ChatUpdate::Ended(session_id)));
        }
    }

    async fn flush_node_outbound(&mut self) {
        for envelope in self.node.drain_outbound() {
            self.node.register_outgoing(envelope.id);
            let _ = self.broadcast(&envelope).await;
        }
    }

    // === Private helpers ===

    fn chat_peer(&self, session_id: Uuid) -> Result<String> {
        self.chat
            .peer_of(session_id)
            .map(str::to_owned)
            .ok_or_else(|| MeshError::SessionNotFound(session_id.to_string()))
    }

    async fn broadcast(&self, envelope: &MeshMessage) -> Result<()> {
        let bytes = envelope.encode()?;
        self.outbound
            .send(OutboundFrame::Broadcast(bytes))
            .await
            .map_err(|_| MeshError::ChannelClosed)
    }

    async fn unicast(&self, peer_id: &str, envelope: &MeshMessage) -> Result<()> {
        let bytes = envelope.encode()?;
        self.outbound
            .send(OutboundFrame::Unicast {
                peer_id: peer_id.to_owned(),
                bytes,
            })
            .await
            .map_err(|_| MeshError::ChannelClosed)
    }

    fn publish(&self, event: ServiceEvent) {
        if self.events.try_send(event).is_err() {
            warn!("service event subscriber lagging, dropping event");
        }
    }
}

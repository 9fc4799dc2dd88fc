//! # Shroud Mesh - Chat Module
//!
//! Session lifecycle for end-to-end encrypted chat over the mesh.
//!
//! The [`ChatManager`] owns every session and is its single writer. A
//! session walks `Initializing → PendingAccept | PendingLocalAccept →
//! Active → Ending → Ended`; the hybrid key agreement and ratchet live in
//! `shroud-crypto`, this module wires them to the chat control payloads
//! and enforces the state machine. Ending a session scrubs all key
//! material.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use shroud_crypto::ratchet::{respond, HandshakeInitiator, RatchetState};

use crate::message::{
    ChatAcceptPayload, ChatDeclinePayload, ChatEndPayload, ChatMessagePayload, ChatRequestPayload,
    MeshMessage, MessageType,
};
use crate::{MeshError, Result};

/// Pending chat requests older than this are expired by `cleanup()`.
pub const REQUEST_EXPIRY: Duration = Duration::from_secs(120);

/// Active sessions idle longer than this are ended by `cleanup()`.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(1800);

/// Lifecycle states of a chat session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatSessionState {
    /// Being created; no wire traffic yet.
    Initializing,
    /// Request sent; waiting for the peer to accept.
    PendingAccept,
    /// Request received; waiting for the local user to accept.
    PendingLocalAccept,
    /// Key agreement complete; messages flow.
    Active,
    /// Teardown in progress.
    Ending,
    /// Closed; key material scrubbed.
    Ended,
}

impl fmt::Display for ChatSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::PendingAccept => "pendingAccept",
            Self::PendingLocalAccept => "pendingLocalAccept",
            Self::Active => "active",
            Self::Ending => "ending",
            Self::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// What an incoming chat envelope did to the session table.
#[derive(Debug, Clone)]
pub enum ChatUpdate {
    /// A peer asked to chat; awaiting local accept or decline.
    RequestReceived {
        /// The new session.
        session_id: Uuid,
        /// Who is asking.
        peer_id: String,
        /// Their display name.
        peer_name: Option<String>,
    },
    /// The peer accepted our request; the session is active.
    Accepted(Uuid),
    /// The peer declined our request.
    Declined(Uuid),
    /// A chat message decrypted successfully.
    MessageReceived {
        /// The session it belongs to.
        session_id: Uuid,
        /// The plaintext.
        text: String,
    },
    /// The peer ended the session.
    Ended(Uuid),
}

struct ChatSession {
    peer_id: String,
    peer_name: Option<String>,
    state: ChatSessionState,
    handshake: Option<HandshakeInitiator>,
    pending_bundle: Option<ChatRequestPayload>,
    ratchet: Option<RatchetState>,
    created_at: Instant,
    last_activity: Instant,
}

impl ChatSession {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn scrub(&mut self) {
        if let Some(ref mut ratchet) = self.ratchet {
            ratchet.scrub();
        }
        self.handshake = None;
        self.pending_bundle = None;
    }
}

/// Owner of all chat sessions on this node.
pub struct ChatManager {
    local_peer_id: String,
    local_name: Option<String>,
    sessions: HashMap<Uuid, ChatSession>,
}

impl ChatManager {
    /// Create a manager for this node's identity.
    pub fn new(local_peer_id: &str, local_name: Option<String>) -> Self {
        Self {
            local_peer_id: local_peer_id.to_owned(),
            local_name,
            sessions: HashMap::new(),
        }
    }

    /// Start a session with a peer.
    ///
    /// Generates the hybrid handshake material and returns the request
    /// payload to send; the session waits in `PendingAccept`.
    pub fn initiate(&mut self, peer_id: &str) -> Result<(Uuid, ChatRequestPayload)> {
        let session_id = Uuid::new_v4();
        let handshake = HandshakeInitiator::new()?;
        let payload = ChatRequestPayload::from_bundle(
            session_id,
            &self.local_peer_id,
            self.local_name.clone(),
            &handshake.public_bundle(),
        );

        let now = Instant::now();
        self.sessions.insert(
            session_id,
            ChatSession {
                peer_id: peer_id.to_owned(),
                peer_name: None,
                state: ChatSessionState::PendingAccept,
                handshake: Some(handshake),
                pending_bundle: None,
                ratchet: None,
                created_at: now,
                last_activity: now,
            },
        );
        Ok((session_id, payload))
    }

    /// Record an incoming chat request; the session waits for the local
    /// user in `PendingLocalAccept`.
    pub fn handle_request(&mut self, payload: &ChatRequestPayload) -> Result<ChatUpdate> {
        // Validate the handshake material before surfacing the request
        payload.to_bundle()?;
        if self.sessions.contains_key(&payload.session_id) {
            return Err(MeshError::InvalidPayload(format!(
                "duplicate chat session {}",
                payload.session_id
            )));
        }

        let now = Instant::now();
        self.sessions.insert(
            payload.session_id,
            ChatSession {
                peer_id: payload.requester_peer_id.clone(),
                peer_name: payload.requester_name.clone(),
                state: ChatSessionState::PendingLocalAccept,
                handshake: None,
                pending_bundle: Some(payload.clone()),
                ratchet: None,
                created_at: now,
                last_activity: now,
            },
        );
        Ok(ChatUpdate::RequestReceived {
            session_id: payload.session_id,
            peer_id: payload.requester_peer_id.clone(),
            peer_name: payload.requester_name.clone(),
        })
    }

    /// Locally accept a pending request: performs the responder side of
    /// the key agreement and activates the session.
    pub fn accept(&mut self, session_id: Uuid) -> Result<ChatAcceptPayload> {
        let local_peer_id = self.local_peer_id.clone();
        let session = self.session_mut(session_id)?;
        Self::expect_state(session, session_id, ChatSessionState::PendingLocalAccept)?;

        let request = session
            .pending_bundle
            .take()
            .ok_or_else(|| MeshError::InvalidPayload("missing handshake bundle".into()))?;
        let bundle = request.to_bundle()?;

        let (ratchet, response) = respond(&session_id.to_string(), &bundle)?;
        session.ratchet = Some(ratchet);
        session.state = ChatSessionState::Active;
        session.touch();

        Ok(ChatAcceptPayload::from_response(session_id, &local_peer_id, &response))
    }

    /// Locally decline a pending request.
    pub fn decline(&mut self, session_id: Uuid) -> Result<ChatDeclinePayload> {
        let local_peer_id = self.local_peer_id.clone();
        let session = self.session_mut(session_id)?;
        Self::expect_state(session, session_id, ChatSessionState::PendingLocalAccept)?;

        session.scrub();
        session.state = ChatSessionState::Ended;
        Ok(ChatDeclinePayload {
            session_id,
            responder_peer_id: local_peer_id,
        })
    }

    /// Complete the key agreement after the peer accepted our request.
    pub fn handle_accept(&mut self, payload: &ChatAcceptPayload) -> Result<ChatUpdate> {
        let session = self.session_mut(payload.session_id)?;
        Self::expect_state(session, payload.session_id, ChatSessionState::PendingAccept)?;

        let handshake = session
            .handshake
            .take()
            .ok_or_else(|| MeshError::InvalidPayload("missing handshake state".into()))?;
        let response = payload.to_response()?;

        session.ratchet = Some(handshake.complete(&payload.session_id.to_string(), &response)?);
        session.state = ChatSessionState::Active;
        session.touch();
        Ok(ChatUpdate::Accepted(payload.session_id))
    }

    /// The peer declined our request.
    pub fn handle_decline(&mut self, payload: &ChatDeclinePayload) -> Result<ChatUpdate> {
        let session = self.session_mut(payload.session_id)?;
        Self::expect_state(session, payload.session_id, ChatSessionState::PendingAccept)?;

        session.scrub();
        session.state = ChatSessionState::Ended;
        Ok(ChatUpdate::Declined(payload.session_id))
    }

    /// Encrypt a message for an active session.
    ///
    /// On failure the session stays `Active` and unchanged; the caller
    /// keeps the input text.
    pub fn send_message(&mut self, session_id: Uuid, text: &str) -> Result<ChatMessagePayload> {
        let session = self.session_mut(session_id)?;
        Self::expect_state(session, session_id, ChatSessionState::Active)?;

        let ratchet = session
            .ratchet
            .as_mut()
            .ok_or_else(|| MeshError::InvalidPayload("session has no ratchet".into()))?;
        let message = ratchet.encrypt(text.as_bytes())?;
        session.touch();
        Ok(ChatMessagePayload::from_ratchet_message(session_id, &message))
    }

    /// Decrypt an incoming chat message.
    pub fn handle_message(&mut self, payload: &ChatMessagePayload) -> Result<ChatUpdate> {
        let session = self.session_mut(payload.session_id)?;
        Self::expect_state(session, payload.session_id, ChatSessionState::Active)?;

        let ratchet = session
            .ratchet
            .as_mut()
            .ok_or_else(|| MeshError::InvalidPayload("session has no ratchet".into()))?;
        let plaintext = ratchet.decrypt(&payload.to_ratchet_message()?)?;
        session.touch();

        let text = String::from_utf8(plaintext)
            .map_err(|_| MeshError::InvalidPayload("message is not valid UTF-8".into()))?;
        Ok(ChatUpdate::MessageReceived {
            session_id: payload.session_id,
            text,
        })
    }

    /// End a session locally, scrubbing all key material.
    pub fn end(&mut self, session_id: Uuid) -> Result<ChatEndPayload> {
        let session = self.session_mut(session_id)?;
        if session.state == ChatSessionState::Ended {
            return Err(MeshError::InvalidState {
                expected: "any live state".into(),
                actual: ChatSessionState::Ended.to_string(),
            });
        }
        session.state = ChatSessionState::Ending;
        session.scrub();
        session.state = ChatSessionState::Ended;
        Ok(ChatEndPayload { session_id })
    }

    /// The peer ended a session.
    pub fn handle_end(&mut self, payload: &ChatEndPayload) -> Result<ChatUpdate> {
        let session = self.session_mut(payload.session_id)?;
        session.state = ChatSessionState::Ending;
        session.scrub();
        session.state = ChatSessionState::Ended;
        Ok(ChatUpdate::Ended(payload.session_id))
    }

    /// Route a chat envelope to the matching handler.
    pub fn handle_envelope(&mut self, envelope: &MeshMessage) -> Result<ChatUpdate> {
        match envelope.message_type {
            MessageType::ChatRequest => {
                self.handle_request(&ChatRequestPayload::decode(&envelope.payload)?)
            }
            MessageType::ChatAccept => {
                self.handle_accept(&ChatAcceptPayload::decode(&envelope.payload)?)
            }
            MessageType::ChatDecline => {
                self.handle_decline(&ChatDeclinePayload::decode(&envelope.payload)?)
            }
            MessageType::ChatMessage => {
                self.handle_message(&ChatMessagePayload::decode(&envelope.payload)?)
            }
            MessageType::ChatEnd => self.handle_end(&ChatEndPayload::decode(&envelope.payload)?),
            other => Err(MeshError::InvalidPayload(format!(
                "not a chat envelope: {other:?}"
            ))),
        }
    }

    /// Expire stale pending requests and idle sessions; returns the ids
    /// that were ended.
    pub fn cleanup(&mut self) -> Vec<Uuid> {
        let mut ended = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            let expired = match session.state {
                ChatSessionState::PendingAccept | ChatSessionState::PendingLocalAccept => {
                    session.created_at.elapsed() > REQUEST_EXPIRY
                }
                ChatSessionState::Active => session.last_activity.elapsed() > IDLE_TIMEOUT,
                _ => false,
            };
            if expired {
                debug!(session = %id, state = %session.state, "expiring chat session");
                session.scrub();
                session.state = ChatSessionState::Ended;
                ended.push(*id);
            }
        }
        ended
    }

    /// Current state of a session, if it exists.
    pub fn state(&self, session_id: Uuid) -> Option<ChatSessionState> {
        self.sessions.get(&session_id).map(|s| s.state)
    }

    /// The peer a session talks to.
    pub fn peer_of(&self, session_id: Uuid) -> Option<&str> {
        self.sessions.get(&session_id).map(|s| s.peer_id.as_str())
    }

    /// The display name the peer advertised in its request, if any.
    pub fn peer_name_of(&self, session_id: Uuid) -> Option<&str> {
        self.sessions
            .get(&session_id)
            .and_then(|s| s.peer_name.as_deref())
    }

    /// Ids of all currently active sessions.
    pub fn active_sessions(&self) -> Vec<Uuid> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.state == ChatSessionState::Active)
            .map(|(id, _)| *id)
            .collect()
    }

    // === Private methods ===

    fn session_mut(&mut self, session_id: Uuid) -> Result<&mut ChatSession> {
        self.sessions
            .get_mut(&session_id)
            .ok_or_else(|| MeshError::SessionNotFound(session_id.to_string()))
    }

    fn expect_state(
        session: &ChatSession,
        session_id: Uuid,
        expected: ChatSessionState,
    ) -> Result<()> {
        if session.state != expected {
            debug!(session = %session_id, "operation in wrong state");
            return Err(MeshError::InvalidState {
                expected: expected.to_string(),
                actual: session.state.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn establish() -> (ChatManager, ChatManager, Uuid) {
        let mut alice = ChatManager::new("alice", Some("Alice".into()));
        let mut bob = ChatManager::new("bob", None);

        let (session_id, request) = alice.initiate("bob").unwrap();
        assert_eq!(alice.state(session_id), Some(ChatSessionState::PendingAccept));

        let update = bob.handle_request(&request).unwrap();
        assert!(matches!(update, ChatUpdate::RequestReceived { peer_id, .. } if peer_id == "alice"));
        assert_eq!(bob.state(session_id), Some(ChatSessionState::PendingLocalAccept));

        let accept = bob.accept(session_id).unwrap();
        assert_eq!(bob.state(session_id), Some(ChatSessionState::Active));

        let update = alice.handle_accept(&accept).unwrap();
        assert!(matches!(update, ChatUpdate::Accepted(id) if id == session_id));
        assert_eq!(alice.state(session_id), Some(ChatSessionState::Active));

        (alice, bob, session_id)
    }

    #[test]
    fn test_full_conversation() {
        let (mut alice, mut bob, session_id) = establish();

        let payload = alice.send_message(session_id, "hello bob").unwrap();
        match bob.handle_message(&payload).unwrap() {
            ChatUpdate::MessageReceived { text, .. } => assert_eq!(text, "hello bob"),
            other => panic!("unexpected update {other:?}"),
        }

        let payload = bob.send_message(session_id, "hello alice").unwrap();
        match alice.handle_message(&payload).unwrap() {
            ChatUpdate::MessageReceived { text, .. } => assert_eq!(text, "hello alice"),
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[test]
    fn test_decline_path() {
        let mut alice = ChatManager::new("alice", None);
        let mut bob = ChatManager::new("bob", None);

        let (session_id, request) = alice.initiate("bob").unwrap();
        bob.handle_request(&request).unwrap();

        let decline = bob.decline(session_id).unwrap();
        assert_eq!(bob.state(session_id), Some(ChatSessionState::Ended));

        let update = alice.handle_decline(&decline).unwrap();
        assert!(matches!(update, ChatUpdate::Declined(id) if id == session_id));
        assert_eq!(alice.state(session_id), Some(ChatSessionState::Ended));
    }

    #[test]
    fn test_end_scrubs_keys() {
        let (mut alice, mut bob, session_id) = establish();
        let payload = alice.send_message(session_id, "before end").unwrap();
        bob.handle_message(&payload).unwrap();

        let end = alice.end(session_id).unwrap();
        assert_eq!(alice.state(session_id), Some(ChatSessionState::Ended));
        assert!(alice.sessions[&session_id]
            .ratchet
            .as_ref()
            .unwrap()
            .is_scrubbed());

        let update = bob.handle_end(&end).unwrap();
        assert!(matches!(update, ChatUpdate::Ended(id) if id == session_id));
        assert!(bob.sessions[&session_id]
            .ratchet
            .as_ref()
            .unwrap()
            .is_scrubbed());
    }

    #[test]
    fn test_message_in_wrong_state_is_rejected() {
        let mut alice = ChatManager::new("alice", None);
        let mut bob = ChatManager::new("bob", None);

        let (session_id, request) = alice.initiate("bob").unwrap();
        bob.handle_request(&request).unwrap();

        // Sending before activation
        assert!(matches!(
            alice.send_message(session_id, "too early"),
            Err(MeshError::InvalidState { .. })
        ));

        // Receiving a chat message while pending local accept
        let payload = ChatMessagePayload {
            session_id,
            dh_public: vec![0u8; 32],
            message_number: 0,
            previous_chain_length: 0,
            nonce: vec![0u8; 12],
            ciphertext: vec![1, 2, 3],
            tag: vec![0u8; 16],
        };
        assert!(matches!(
            bob.handle_message(&payload),
            Err(MeshError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_accept_requires_pending_local_accept() {
        let (mut alice, mut bob, session_id) = establish();
        assert!(matches!(
            bob.accept(session_id),
            Err(MeshError::InvalidState { .. })
        ));
        assert!(matches!(
            alice.accept(session_id),
            Err(MeshError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_unknown_session() {
        let mut manager = ChatManager::new("us", None);
        assert!(matches!(
            manager.send_message(Uuid::new_v4(), "hi"),
            Err(MeshError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let mut alice = ChatManager::new("alice", None);
        let mut bob = ChatManager::new("bob", None);
        let (_, request) = alice.initiate("bob").unwrap();
        bob.handle_request(&request).unwrap();
        assert!(bob.handle_request(&request).is_err());
    }

    #[test]
    fn test_failed_send_leaves_session_usable() {
        let (mut alice, mut bob, session_id) = establish();

        // A tampered incoming message fails but changes nothing
        let mut payload = alice.send_message(session_id, "original").unwrap();
        payload.ciphertext[0] ^= 0xFF;
        assert!(bob.handle_message(&payload).is_err());
        assert_eq!(bob.state(session_id), Some(ChatSessionState::Active));

        // The conversation continues
        let payload = alice.send_message(session_id, "retry").unwrap();
        match bob.handle_message(&payload).unwrap() {
            ChatUpdate::MessageReceived { text, .. } => assert_eq!(text, "retry"),
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[test]
    fn test_cleanup_expires_pending_requests() {
        let mut alice = ChatManager::new("alice", None);
        let (session_id, _) = alice.initiate("bob").unwrap();

        // Fresh request survives
        assert!(alice.cleanup().is_empty());

        alice.sessions.get_mut(&session_id).unwrap().created_at =
            Instant::now() - Duration::from_secs(180);
        assert_eq!(alice.cleanup(), vec![session_id]);
        assert_eq!(alice.state(session_id), Some(ChatSessionState::Ended));
    }

    #[test]
    fn test_cleanup_ends_idle_sessions() {
        let (mut alice, _bob, session_id) = establish();

        alice.sessions.get_mut(&session_id).unwrap().last_activity =
            Instant::now() - Duration::from_secs(2000);
        assert_eq!(alice.cleanup(), vec![session_id]);
        assert!(alice.sessions[&session_id]
            .ratchet
            .as_ref()
            .unwrap()
            .is_scrubbed());
    }

    #[test]
    fn test_handle_envelope_routing() {
        let mut alice = ChatManager::new("alice", None);
        let mut bob = ChatManager::new("bob", None);

        let (session_id, request) = alice.initiate("bob").unwrap();
        let envelope = MeshMessage::direct(
            MessageType::ChatRequest,
            "alice",
            request.encode().unwrap(),
        )
        .unwrap();
        assert!(matches!(
            bob.handle_envelope(&envelope).unwrap(),
            ChatUpdate::RequestReceived { .. }
        ));

        let accept = bob.accept(session_id).unwrap();
        let envelope =
            MeshMessage::direct(MessageType::ChatAccept, "bob", accept.encode().unwrap()).unwrap();
        assert!(matches!(
            alice.handle_envelope(&envelope).unwrap(),
            ChatUpdate::Accepted(_)
        ));

        let message = alice.send_message(session_id, "via envelope").unwrap();
        let envelope =
            MeshMessage::direct(MessageType::ChatMessage, "alice", message.encode().unwrap())
                .unwrap();
        assert!(matches!(
            bob.handle_envelope(&envelope).unwrap(),
            ChatUpdate::MessageReceived { text, .. } if text == "via envelope"
        ));

        // Non-chat envelopes are refused
        let envelope = MeshMessage::direct(MessageType::Heartbeat, "alice", vec![]).unwrap();
        assert!(bob.handle_envelope(&envelope).is_err());
    }

    #[test]
    fn test_active_sessions_listing() {
        let (alice, _bob, session_id) = establish();
        assert_eq!(alice.active_sessions(), vec![session_id]);
        assert_eq!(alice.peer_of(session_id), Some("bob"));
    }
}

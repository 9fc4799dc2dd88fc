//! # Shroud Mesh - Message Model Module
//!
//! Typed envelopes and payloads for the mesh wire format.
//!
//! Envelopes are self-describing JSON with stable field order: binary
//! fields travel base64-encoded, dates are ISO-8601 UTC, and the message
//! type is a bare `u8`. Both peers produce byte-identical encodings for
//! identical records. An encoded envelope never exceeds 4,096 bytes.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use shroud_crypto::primitives::{
    AEAD_NONCE_SIZE, AEAD_TAG_SIZE, MLKEM_CIPHERTEXT_SIZE, MLKEM_PUBLIC_KEY_SIZE,
};
use shroud_crypto::ratchet::{HandshakeBundle, HandshakeResponse, RatchetMessage};
use shroud_crypto::scanner::StealthCandidate;
use shroud_crypto::{encode_memo, StealthOutput};

use crate::peer::PeerCapabilities;
use crate::{MeshError, Result};

/// Maximum hop count an envelope may carry.
pub const MAX_TTL: u8 = 10;

/// Maximum serialized envelope size in bytes.
pub const MAX_ENVELOPE_SIZE: usize = 4096;

/// Default TTL for acknowledgments.
pub const ACK_TTL: u8 = 3;

/// TTL for direct-peer-only traffic (discovery, meta-address exchange,
/// chat control).
pub const DIRECT_TTL: u8 = 1;

/// Base64 (de)serialization for binary wire fields.
mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Base64 (de)serialization for optional binary wire fields.
mod b64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD
                .decode(text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Every message kind the mesh carries, as a stable `u8` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    /// A stealth payment payload; the only type intermediate nodes relay.
    StealthPayment,
    /// Receipt acknowledgment for a stored payment.
    Acknowledgment,
    /// Peer announcement with capabilities.
    Discovery,
    /// Liveness beacon; refreshes the peer table entry of the origin.
    Heartbeat,
    /// Ask connected peers for their meta-address.
    MetaAddressRequest,
    /// Answer to a meta-address request.
    MetaAddressResponse,
    /// Open a chat session (carries the initiator handshake bundle).
    ChatRequest,
    /// Accept a chat session (carries the responder handshake material).
    ChatAccept,
    /// Decline a chat session.
    ChatDecline,
    /// An encrypted ratchet message.
    ChatMessage,
    /// Close a chat session.
    ChatEnd,
}

impl MessageType {
    /// The TTL newly built envelopes of this type carry. Payments use the
    /// node-configured default; everything except payments and acks is
    /// direct-peer only.
    pub fn default_ttl(self, payment_ttl: u8) -> u8 {
        match self {
            Self::StealthPayment => payment_ttl,
            Self::Acknowledgment => ACK_TTL,
            _ => DIRECT_TTL,
        }
    }

    /// Whether intermediate nodes re-emit envelopes of this type.
    pub fn is_relayable(self) -> bool {
        matches!(self, Self::StealthPayment)
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::StealthPayment => 1,
            MessageType::Acknowledgment => 2,
            MessageType::Discovery => 3,
            MessageType::Heartbeat => 4,
            MessageType::MetaAddressRequest => 5,
            MessageType::MetaAddressResponse => 6,
            MessageType::ChatRequest => 7,
            MessageType::ChatAccept => 8,
            MessageType::ChatDecline => 9,
            MessageType::ChatMessage => 10,
            MessageType::ChatEnd => 11,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::StealthPayment,
            2 => Self::Acknowledgment,
            3 => Self::Discovery,
            4 => Self::Heartbeat,
            5 => Self::MetaAddressRequest,
            6 => Self::MetaAddressResponse,
            7 => Self::ChatRequest,
            8 => Self::ChatAccept,
            9 => Self::ChatDecline,
            10 => Self::ChatMessage,
            11 => Self::ChatEnd,
            other => return Err(format!("unknown message type {other}")),
        })
    }
}

/// The mesh envelope: what actually travels between peers.
///
/// The 128-bit `id` is the dedup key; `ttl` bounds flooding; `created_at`
/// bounds store-and-forward age.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshMessage {
    /// Unique envelope id (dedup key).
    pub id: Uuid,
    /// The payload kind.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Remaining hop budget; `1` means deliver but do not forward.
    pub ttl: u8,
    /// Peer id of the envelope's creator.
    pub origin_peer_id: String,
    /// Creation time, ISO-8601 UTC on the wire.
    pub created_at: DateTime<Utc>,
    /// Type-specific payload bytes.
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    /// Optional origin signature over the payload.
    #[serde(with = "b64_opt", default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
}

impl MeshMessage {
    /// Build a new envelope with a fresh id.
    ///
    /// # Errors
    /// `InvalidEnvelope` if `ttl` is zero or above [`MAX_TTL`].
    pub fn new(
        message_type: MessageType,
        ttl: u8,
        origin_peer_id: &str,
        payload: Vec<u8>,
    ) -> Result<Self> {
        if ttl == 0 || ttl > MAX_TTL {
            return Err(MeshError::InvalidEnvelope(format!(
                "ttl {ttl} outside 1..={MAX_TTL}"
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            message_type,
            ttl,
            origin_peer_id: origin_peer_id.to_owned(),
            created_at: Utc::now(),
            payload,
            signature: None,
        })
    }

    /// Build a direct-peer-only envelope (TTL 1).
    pub fn direct(message_type: MessageType, origin_peer_id: &str, payload: Vec<u8>) -> Result<Self> {
        Self::new(message_type, DIRECT_TTL, origin_peer_id, payload)
    }

    /// Build a payment envelope with the given hop budget.
    pub fn payment(origin_peer_id: &str, payload: &StealthPaymentPayload, ttl: u8) -> Result<Self> {
        payload.validate()?;
        Self::new(MessageType::StealthPayment, ttl, origin_peer_id, payload.encode()?)
    }

    /// Build an acknowledgment for a received payment envelope.
    pub fn acknowledgment(origin_peer_id: &str, message_id: Uuid) -> Result<Self> {
        let payload = AcknowledgmentPayload { message_id };
        Self::new(MessageType::Acknowledgment, ACK_TTL, origin_peer_id, payload.encode()?)
    }

    /// Serialize for the transport.
    ///
    /// # Errors
    /// `PayloadTooLarge` when the encoding exceeds [`MAX_ENVELOPE_SIZE`];
    /// nothing is sent and no state changes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| MeshError::InvalidEnvelope(format!("encode: {e}")))?;
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(MeshError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_ENVELOPE_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Deserialize an envelope from transport bytes.
    ///
    /// # Errors
    /// `PayloadTooLarge` for oversized frames; `InvalidEnvelope` for
    /// malformed JSON or a TTL outside `1..=MAX_TTL`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(MeshError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_ENVELOPE_SIZE,
            });
        }
        let message: Self = serde_json::from_slice(bytes)
            .map_err(|e| MeshError::InvalidEnvelope(format!("decode: {e}")))?;
        if message.ttl == 0 || message.ttl > MAX_TTL {
            return Err(MeshError::InvalidEnvelope(format!(
                "ttl {} outside 1..={MAX_TTL}",
                message.ttl
            )));
        }
        Ok(message)
    }

    /// A copy with the hop budget decremented, or `None` when this
    /// envelope must not travel further.
    pub fn forwarded(&self) -> Option<Self> {
        if self.ttl <= 1 {
            return None;
        }
        let mut copy = self.clone();
        copy.ttl -= 1;
        Some(copy)
    }

    /// Seconds since this envelope was created (zero for future dates).
    pub fn age_seconds(&self) -> u64 {
        (Utc::now() - self.created_at).num_seconds().max(0) as u64
    }

    /// Sign the payload with a raw ed25519 scalar (e.g. a spending key).
    pub fn sign(&mut self, scalar: &[u8; 32], public: &[u8; 32]) -> Result<()> {
        let signature = shroud_crypto::sign_with_scalar(scalar, public, &self.payload)?;
        self.signature = Some(signature.to_vec());
        Ok(())
    }

    /// Verify the optional origin signature over the payload.
    ///
    /// Unsigned envelopes verify as `false`; the mesh accepts them either
    /// way, this is for callers that pin an origin key.
    pub fn verify_signature(&self, origin_public: &[u8; 32]) -> bool {
        match self.signature {
            Some(ref signature) => shroud_crypto::verify(origin_public, &self.payload, signature),
            None => false,
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| MeshError::InvalidPayload(format!("encode: {e}")))
}

fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| MeshError::InvalidPayload(format!("decode: {e}")))
}

fn expect_len(field: &str, bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() != expected {
        return Err(MeshError::InvalidPayload(format!(
            "{field}: expected {expected} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

fn array_32(field: &str, bytes: &[u8]) -> Result<[u8; 32]> {
    expect_len(field, bytes, 32)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Which settlement flow a payment payload uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ProtocolVersion {
    /// Sender settles on the ledger themselves.
    V1,
    /// Pre-signed transaction travels with the payload (durable nonce).
    V2,
}

impl From<ProtocolVersion> for u8 {
    fn from(value: ProtocolVersion) -> Self {
        match value {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(format!("unknown protocol version {other}")),
        }
    }
}

/// The stealth payment record carried inside payment envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StealthPaymentPayload {
    /// One-time destination address (base58).
    pub stealth_address: String,
    /// Sender's ephemeral X25519 public key `R` (32 bytes).
    #[serde(with = "b64")]
    pub ephemeral_public_key: Vec<u8>,
    /// ML-KEM-768 ciphertext (1,088 bytes), hybrid payments only.
    #[serde(with = "b64_opt", default, skip_serializing_if = "Option::is_none")]
    pub mlkem_ciphertext: Option<Vec<u8>>,
    /// Amount in base units.
    pub amount: u64,
    /// Token mint for non-native transfers.
    pub token_mint: Option<String>,
    /// View tag for scanner pre-filtering.
    pub view_tag: u8,
    /// Free-form sender memo.
    pub memo: Option<String>,
    /// Settlement flow.
    pub protocol_version: ProtocolVersion,
    /// Pre-signed ledger transaction; present iff `protocol_version == V2`.
    #[serde(with = "b64_opt", default, skip_serializing_if = "Option::is_none")]
    pub pre_signed_transaction: Option<Vec<u8>>,
    /// Durable nonce account backing the pre-signed transaction; carried
    /// opaquely for the settlement collaborator.
    pub nonce_account_address: Option<String>,
    /// When the transaction was pre-signed.
    pub pre_signed_at: Option<DateTime<Utc>>,
}

impl StealthPaymentPayload {
    /// Build a v1 (sender-settles) payload from a derived stealth output.
    pub fn new_v1(
        output: &StealthOutput,
        amount: u64,
        token_mint: Option<String>,
        memo: Option<String>,
    ) -> Self {
        Self {
            stealth_address: output.stealth_address.clone(),
            ephemeral_public_key: output.ephemeral_public_key.to_vec(),
            mlkem_ciphertext: output.mlkem_ciphertext.map(|ct| ct.to_vec()),
            amount,
            token_mint,
            view_tag: output.view_tag,
            memo,
            protocol_version: ProtocolVersion::V1,
            pre_signed_transaction: None,
            nonce_account_address: None,
            pre_signed_at: None,
        }
    }

    /// Build a v2 payload carrying a pre-signed transaction.
    pub fn new_v2(
        output: &StealthOutput,
        amount: u64,
        token_mint: Option<String>,
        memo: Option<String>,
        pre_signed_transaction: Vec<u8>,
        nonce_account_address: String,
    ) -> Self {
        let mut payload = Self::new_v1(output, amount, token_mint, memo);
        payload.protocol_version = ProtocolVersion::V2;
        payload.pre_signed_transaction = Some(pre_signed_transaction);
        payload.nonce_account_address = Some(nonce_account_address);
        payload.pre_signed_at = Some(Utc::now());
        payload
    }

    /// Check the payload invariants: field lengths, and the pre-signed
    /// transaction present exactly when the version is v2.
    pub fn validate(&self) -> Result<()> {
        expect_len("ephemeral_public_key", &self.ephemeral_public_key, 32)?;
        if let Some(ref ct) = self.mlkem_ciphertext {
            expect_len("mlkem_ciphertext", ct, MLKEM_CIPHERTEXT_SIZE)?;
        }
        match (self.protocol_version, self.pre_signed_transaction.is_some()) {
            (ProtocolVersion::V1, false) | (ProtocolVersion::V2, true) => Ok(()),
            (ProtocolVersion::V1, true) => Err(MeshError::InvalidPayload(
                "v1 payload must not carry a pre-signed transaction".into(),
            )),
            (ProtocolVersion::V2, false) => Err(MeshError::InvalidPayload(
                "v2 payload requires a pre-signed transaction".into(),
            )),
        }
    }

    /// Serialize to payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        to_json(self)
    }

    /// Deserialize and validate payload bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let payload: Self = from_json(bytes)?;
        payload.validate()?;
        Ok(payload)
    }

    /// The ledger memo the settlement collaborator publishes alongside the
    /// transaction: `R` alone, or `R ‖ ct` for hybrid payments.
    pub fn ledger_memo(&self) -> Result<Vec<u8>> {
        let ephemeral = array_32("ephemeral_public_key", &self.ephemeral_public_key)?;
        Ok(encode_memo(&ephemeral, self.mlkem_ciphertext.as_deref()))
    }

    /// View this payload as a scanner candidate.
    pub fn as_candidate(&self) -> Result<StealthCandidate> {
        Ok(StealthCandidate {
            destination_address: self.stealth_address.clone(),
            ephemeral_public_key: array_32("ephemeral_public_key", &self.ephemeral_public_key)?,
            mlkem_ciphertext: self.mlkem_ciphertext.clone(),
            view_tag: Some(self.view_tag),
        })
    }
}

/// Acknowledgment of a stored payment envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgmentPayload {
    /// Id of the acknowledged envelope.
    pub message_id: Uuid,
}

impl AcknowledgmentPayload {
    /// Serialize to payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_json(self)
    }

    /// Deserialize payload bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_json(bytes)
    }
}

/// Peer announcement carried by discovery envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    /// The announcing peer's id.
    pub peer_id: String,
    /// Human-readable name, if the peer advertises one.
    pub name: Option<String>,
    /// Advertised capabilities.
    pub capabilities: PeerCapabilities,
}

impl DiscoveryPayload {
    /// Serialize to payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_json(self)
    }

    /// Deserialize payload bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_json(bytes)
    }
}

/// Ask a peer for its meta-address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaAddressRequestPayload {
    /// Who is asking.
    pub requester_peer_id: String,
    /// Display name of the requester.
    pub requester_name: Option<String>,
    /// Prefer the hybrid meta-address when the responder owns one.
    pub prefer_hybrid: bool,
}

impl MetaAddressRequestPayload {
    /// Serialize to payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_json(self)
    }

    /// Deserialize payload bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_json(bytes)
    }
}

/// Answer to a meta-address request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaAddressResponsePayload {
    /// Who is answering.
    pub responder_peer_id: String,
    /// Display name of the responder.
    pub responder_name: Option<String>,
    /// The base58 meta-address.
    pub meta_address: String,
    /// Whether it is the hybrid form.
    pub is_hybrid: bool,
}

impl MetaAddressResponsePayload {
    /// Serialize to payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_json(self)
    }

    /// Deserialize payload bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_json(bytes)
    }
}

/// Chat session request carrying the initiator's handshake bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequestPayload {
    /// Session id chosen by the initiator.
    pub session_id: Uuid,
    /// The initiator's peer id.
    pub requester_peer_id: String,
    /// The initiator's display name.
    pub requester_name: Option<String>,
    /// Fresh X25519 public key (32 bytes).
    #[serde(with = "b64")]
    pub dh_public: Vec<u8>,
    /// Fresh ML-KEM-768 encapsulation key (1,184 bytes).
    #[serde(with = "b64")]
    pub mlkem_public: Vec<u8>,
}

impl ChatRequestPayload {
    /// Build from the initiator's handshake bundle.
    pub fn from_bundle(
        session_id: Uuid,
        requester_peer_id: &str,
        requester_name: Option<String>,
        bundle: &HandshakeBundle,
    ) -> Self {
        Self {
            session_id,
            requester_peer_id: requester_peer_id.to_owned(),
            requester_name,
            dh_public: bundle.dh_public.to_vec(),
            mlkem_public: bundle.mlkem_public.to_vec(),
        }
    }

    /// Reconstruct the handshake bundle, validating field lengths.
    pub fn to_bundle(&self) -> Result<HandshakeBundle> {
        expect_len("mlkem_public", &self.mlkem_public, MLKEM_PUBLIC_KEY_SIZE)?;
        let mut mlkem_public = [0u8; MLKEM_PUBLIC_KEY_SIZE];
        mlkem_public.copy_from_slice(&self.mlkem_public);
        Ok(HandshakeBundle {
            dh_public: array_32("dh_public", &self.dh_public)?,
            mlkem_public,
        })
    }

    /// Serialize to payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_json(self)
    }

    /// Deserialize payload bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_json(bytes)
    }
}

/// Chat acceptance carrying the responder's handshake material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatAcceptPayload {
    /// The accepted session.
    pub session_id: Uuid,
    /// The responder's peer id.
    pub responder_peer_id: String,
    /// The responder's X25519 public key (32 bytes).
    #[serde(with = "b64")]
    pub dh_public: Vec<u8>,
    /// ML-KEM ciphertext encapsulated to the initiator (1,088 bytes).
    #[serde(with = "b64")]
    pub mlkem_ciphertext: Vec<u8>,
}

impl ChatAcceptPayload {
    /// Build from the responder's handshake response.
    pub fn from_response(session_id: Uuid, responder_peer_id: &str, response: &HandshakeResponse) -> Self {
        Self {
            session_id,
            responder_peer_id: responder_peer_id.to_owned(),
            dh_public: response.dh_public.to_vec(),
            mlkem_ciphertext: response.mlkem_ciphertext.to_vec(),
        }
    }

    /// Reconstruct the handshake response, validating field lengths.
    pub fn to_response(&self) -> Result<HandshakeResponse> {
        expect_len("mlkem_ciphertext", &self.mlkem_ciphertext, MLKEM_CIPHERTEXT_SIZE)?;
        let mut mlkem_ciphertext = [0u8; MLKEM_CIPHERTEXT_SIZE];
        mlkem_ciphertext.copy_from_slice(&self.mlkem_ciphertext);
        Ok(HandshakeResponse {
            dh_public: array_32("dh_public", &self.dh_public)?,
            mlkem_ciphertext,
        })
    }

    /// Serialize to payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_json(self)
    }

    /// Deserialize payload bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_json(bytes)
    }
}

/// Chat decline notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatDeclinePayload {
    /// The declined session.
    pub session_id: Uuid,
    /// The declining peer's id.
    pub responder_peer_id: String,
}

impl ChatDeclinePayload {
    /// Serialize to payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_json(self)
    }

    /// Deserialize payload bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_json(bytes)
    }
}

/// One encrypted chat message on the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    /// The session this message belongs to.
    pub session_id: Uuid,
    /// The sender's current DH ratchet public key (32 bytes).
    #[serde(with = "b64")]
    pub dh_public: Vec<u8>,
    /// Message number within the sender's current chain.
    pub message_number: u32,
    /// Length of the sender's previous sending chain.
    pub previous_chain_length: u32,
    /// AES-GCM nonce (12 bytes).
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    /// Ciphertext without the tag.
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// AES-GCM authentication tag (16 bytes).
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
}

impl ChatMessagePayload {
    /// Wrap a ratchet message for the wire.
    pub fn from_ratchet_message(session_id: Uuid, message: &RatchetMessage) -> Self {
        Self {
            session_id,
            dh_public: message.dh_public.to_vec(),
            message_number: message.message_number,
            previous_chain_length: message.previous_chain_length,
            nonce: message.nonce.to_vec(),
            ciphertext: message.ciphertext.clone(),
            tag: message.tag.to_vec(),
        }
    }

    /// Reconstruct the ratchet message, validating field lengths.
    pub fn to_ratchet_message(&self) -> Result<RatchetMessage> {
        expect_len("nonce", &self.nonce, AEAD_NONCE_SIZE)?;
        expect_len("tag", &self.tag, AEAD_TAG_SIZE)?;
        let mut nonce = [0u8; AEAD_NONCE_SIZE];
        nonce.copy_from_slice(&self.nonce);
        let mut tag = [0u8; AEAD_TAG_SIZE];
        tag.copy_from_slice(&self.tag);
        Ok(RatchetMessage {
            dh_public: array_32("dh_public", &self.dh_public)?,
            message_number: self.message_number,
            previous_chain_length: self.previous_chain_length,
            nonce,
            ciphertext: self.ciphertext.clone(),
            tag,
        })
    }

    /// Serialize to payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_json(self)
    }

    /// Deserialize payload bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_json(bytes)
    }
}

/// Chat session close notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEndPayload {
    /// The session being closed.
    pub session_id: Uuid,
}

impl ChatEndPayload {
    /// Serialize to payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_json(self)
    }

    /// Deserialize payload bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_json(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_output() -> StealthOutput {
        let identity = shroud_crypto::StealthIdentity::generate(false).unwrap();
        shroud_crypto::derive_stealth_output(&identity.meta_address()).unwrap()
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = MeshMessage::new(MessageType::Heartbeat, 1, "peer-a", vec![]).unwrap();
        let bytes = envelope.encode().unwrap();
        let decoded = MeshMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_envelope_dates_are_iso8601() {
        let envelope = MeshMessage::new(MessageType::Heartbeat, 1, "peer-a", vec![]).unwrap();
        let text = String::from_utf8(envelope.encode().unwrap()).unwrap();
        // RFC 3339 timestamp with explicit UTC
        assert!(text.contains("created_at"));
        assert!(text.contains('T'));
    }

    #[test]
    fn test_envelope_type_is_numeric_on_wire() {
        let envelope = MeshMessage::new(MessageType::ChatEnd, 1, "peer-a", vec![]).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["type"], serde_json::json!(11));
    }

    #[test]
    fn test_ttl_bounds_on_new_and_decode() {
        assert!(MeshMessage::new(MessageType::Heartbeat, 0, "p", vec![]).is_err());
        assert!(MeshMessage::new(MessageType::Heartbeat, MAX_TTL + 1, "p", vec![]).is_err());

        let mut envelope = MeshMessage::new(MessageType::Heartbeat, 2, "p", vec![]).unwrap();
        envelope.ttl = 0;
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert!(MeshMessage::decode(&bytes).is_err());

        envelope.ttl = MAX_TTL + 1;
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert!(MeshMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_forwarded_decrements_ttl() {
        let envelope = MeshMessage::new(MessageType::StealthPayment, 5, "p", vec![]).unwrap();
        let forwarded = envelope.forwarded().unwrap();
        assert_eq!(forwarded.ttl, 4);
        assert_eq!(forwarded.id, envelope.id);

        let last_hop = MeshMessage::new(MessageType::StealthPayment, 1, "p", vec![]).unwrap();
        assert!(last_hop.forwarded().is_none());
    }

    #[test]
    fn test_oversized_envelope_rejected() {
        let envelope =
            MeshMessage::new(MessageType::StealthPayment, 5, "p", vec![0u8; MAX_ENVELOPE_SIZE])
                .unwrap();
        assert!(matches!(
            envelope.encode(),
            Err(MeshError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_default_ttls() {
        assert_eq!(MessageType::StealthPayment.default_ttl(5), 5);
        assert_eq!(MessageType::Acknowledgment.default_ttl(5), ACK_TTL);
        assert_eq!(MessageType::MetaAddressRequest.default_ttl(5), DIRECT_TTL);
        assert_eq!(MessageType::ChatMessage.default_ttl(5), DIRECT_TTL);
        assert!(MessageType::StealthPayment.is_relayable());
        assert!(!MessageType::Acknowledgment.is_relayable());
    }

    #[test]
    fn test_message_type_u8_mapping() {
        for value in 1u8..=11 {
            let message_type = MessageType::try_from(value).unwrap();
            assert_eq!(u8::from(message_type), value);
        }
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(12).is_err());
    }

    #[test]
    fn test_payment_payload_roundtrip_v1() {
        let payload = StealthPaymentPayload::new_v1(&sample_output(), 5_000, None, Some("hi".into()));
        let decoded = StealthPaymentPayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.protocol_version, ProtocolVersion::V1);
    }

    #[test]
    fn test_payment_payload_v2_invariant() {
        let output = sample_output();
        let v2 = StealthPaymentPayload::new_v2(
            &output,
            1_000,
            None,
            None,
            vec![0xAA; 64],
            "NonceAccount1111".into(),
        );
        assert!(v2.validate().is_ok());

        // v1 must not carry a pre-signed transaction
        let mut broken = StealthPaymentPayload::new_v1(&output, 1_000, None, None);
        broken.pre_signed_transaction = Some(vec![1, 2, 3]);
        assert!(broken.validate().is_err());

        // v2 must carry one
        let mut broken = v2.clone();
        broken.pre_signed_transaction = None;
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_payment_payload_rejects_bad_lengths() {
        let mut payload = StealthPaymentPayload::new_v1(&sample_output(), 1, None, None);
        payload.ephemeral_public_key = vec![0u8; 31];
        assert!(payload.validate().is_err());

        let mut payload = StealthPaymentPayload::new_v1(&sample_output(), 1, None, None);
        payload.mlkem_ciphertext = Some(vec![0u8; 100]);
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_payment_ledger_memo_matches_scanner_format() {
        let payload = StealthPaymentPayload::new_v1(&sample_output(), 1, None, None);
        let memo = payload.ledger_memo().unwrap();
        let (ephemeral, ciphertext) = shroud_crypto::parse_memo(&memo).unwrap();
        assert_eq!(ephemeral.to_vec(), payload.ephemeral_public_key);
        assert!(ciphertext.is_none());
    }

    #[test]
    fn test_chat_message_payload_roundtrip() {
        let message = RatchetMessage {
            dh_public: [7u8; 32],
            message_number: 42,
            previous_chain_length: 40,
            nonce: [9u8; AEAD_NONCE_SIZE],
            ciphertext: vec![1, 2, 3, 4],
            tag: [5u8; AEAD_TAG_SIZE],
        };
        let session_id = Uuid::new_v4();
        let payload = ChatMessagePayload::from_ratchet_message(session_id, &message);
        let decoded = ChatMessagePayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded.to_ratchet_message().unwrap(), message);
    }

    #[test]
    fn test_chat_request_bundle_validation() {
        let payload = ChatRequestPayload {
            session_id: Uuid::new_v4(),
            requester_peer_id: "peer-a".into(),
            requester_name: None,
            dh_public: vec![0u8; 32],
            mlkem_public: vec![0u8; 100], // wrong length
        };
        assert!(payload.to_bundle().is_err());
    }

    #[test]
    fn test_envelope_signature_roundtrip() {
        use shroud_crypto::primitives::{random_array, reduce32, scalar_mult_base_noclamp};

        let scalar = reduce32(&random_array::<32>());
        let public = scalar_mult_base_noclamp(&scalar).compress().to_bytes();

        let mut envelope =
            MeshMessage::new(MessageType::Discovery, 1, "us", b"announce".to_vec()).unwrap();
        assert!(!envelope.verify_signature(&public));

        envelope.sign(&scalar.to_bytes(), &public).unwrap();
        assert!(envelope.verify_signature(&public));

        // Signature survives the wire
        let decoded = MeshMessage::decode(&envelope.encode().unwrap()).unwrap();
        assert!(decoded.verify_signature(&public));

        // A different origin key fails
        let other = scalar_mult_base_noclamp(&reduce32(&random_array::<32>()))
            .compress()
            .to_bytes();
        assert!(!decoded.verify_signature(&other));
    }

    #[test]
    fn test_acknowledgment_roundtrip() {
        let payload = AcknowledgmentPayload {
            message_id: Uuid::new_v4(),
        };
        let decoded = AcknowledgmentPayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }
}

//! # Shroud Crypto - Hybrid Double Ratchet Module
//!
//! End-to-end encrypted chat sessions with forward secrecy,
//! post-compromise security, and quantum resistance.
//!
//! Key agreement combines X25519 with ML-KEM-768: the initiator offers
//! `(R_dh, k_pk)`, the responder returns `(R'_dh, ct)`, and both sides
//! derive a root key and two chain keys from the hybrid secret. The
//! initiator sends on chain A and receives on chain B; **the responder
//! swaps** — encoding the swap as named values is deliberate, since a
//! mixed-up assignment fails every AEAD from the first message on.
//!
//! Per message, chain keys evolve by HMAC with domain-separated labels;
//! across turns, a DH ratchet step replaces the local keypair and derives
//! fresh chains from the new shared secret. Out-of-order delivery is
//! absorbed by a bounded table of skipped message keys.

use std::time::Instant;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::primitives::{
    aead_decrypt, aead_encrypt, hkdf_sha256, hmac_sha256, mlkem_decapsulate, mlkem_encapsulate,
    mlkem_keypair, random_array, sha256, x25519, x25519_keypair, AEAD_NONCE_SIZE, AEAD_TAG_SIZE,
    MLKEM_CIPHERTEXT_SIZE, MLKEM_PUBLIC_KEY_SIZE, MLKEM_SECRET_KEY_SIZE,
};
use crate::{CryptoError, Result};

/// HKDF salt for the session root derivation.
const HANDSHAKE_SALT: &[u8] = b"MeshChat_Salt";

/// HKDF info for the session root derivation.
const ROOT_INFO: &[u8] = b"MeshChat_RootKey";

/// HKDF info for per-step chain derivations.
const CHAIN_INFO: &[u8] = b"MeshChat_ChainKey";

/// HMAC label producing a message key from a chain key.
const MESSAGE_KEY_LABEL: u8 = 0x01;

/// HMAC label advancing a chain key.
const CHAIN_KEY_LABEL: u8 = 0x02;

/// Maximum number of stored skipped message keys.
pub const MAX_SKIPPED_KEYS: usize = 100;

/// The initiator's public handshake material: `(R_dh, k_pk)`.
#[derive(Clone)]
pub struct HandshakeBundle {
    /// Fresh X25519 public key.
    pub dh_public: [u8; 32],
    /// Fresh ML-KEM-768 encapsulation key.
    pub mlkem_public: [u8; MLKEM_PUBLIC_KEY_SIZE],
}

/// The responder's handshake material: `(R'_dh, ct)`.
#[derive(Clone)]
pub struct HandshakeResponse {
    /// The responder's X25519 public key.
    pub dh_public: [u8; 32],
    /// ML-KEM-768 ciphertext encapsulated to the initiator's `k_pk`.
    pub mlkem_ciphertext: [u8; MLKEM_CIPHERTEXT_SIZE],
}

/// Initiator half of the hybrid key agreement.
///
/// Holds the ephemeral secrets between sending a chat request and
/// receiving the acceptance.
pub struct HandshakeInitiator {
    dh_secret: StaticSecret,
    dh_public: [u8; 32],
    mlkem_public: [u8; MLKEM_PUBLIC_KEY_SIZE],
    mlkem_secret: [u8; MLKEM_SECRET_KEY_SIZE],
}

impl HandshakeInitiator {
    /// Generate fresh X25519 and ML-KEM-768 keypairs for a new session.
    pub fn new() -> Result<Self> {
        let (dh_secret, dh_public) = x25519_keypair();
        let (mlkem_public, mlkem_secret) = mlkem_keypair()?;
        Ok(Self {
            dh_secret,
            dh_public,
            mlkem_public,
            mlkem_secret,
        })
    }

    /// The public material to place in the chat request.
    pub fn public_bundle(&self) -> HandshakeBundle {
        HandshakeBundle {
            dh_public: self.dh_public,
            mlkem_public: self.mlkem_public,
        }
    }

    /// Complete the agreement with the responder's acceptance.
    ///
    /// Derives `SHA-256(X25519(r, R'_dh) ‖ Decaps(ct))` and the session
    /// chains; the initiator sends on chain A.
    pub fn complete(self, session_id: &str, response: &HandshakeResponse) -> Result<RatchetState> {
        let classical = x25519(&self.dh_secret, &response.dh_public);
        let post_quantum = mlkem_decapsulate(&self.mlkem_secret, &response.mlkem_ciphertext)?;
        let hybrid_secret = sha256(&[&classical, &post_quantum]);

        Ok(RatchetState::from_handshake(
            session_id,
            true,
            self.dh_secret,
            response.dh_public,
            self.mlkem_secret,
            None,
            &hybrid_secret,
        ))
    }
}

/// Responder half of the hybrid key agreement.
///
/// Computes `X = X25519(r', R_dh)` and encapsulates to the initiator's
/// `k_pk`, returning the established session and the acceptance material.
/// The responder receives on chain A and sends on chain B.
pub fn respond(session_id: &str, bundle: &HandshakeBundle) -> Result<(RatchetState, HandshakeResponse)> {
    let (dh_secret, dh_public) = x25519_keypair();
    let classical = x25519(&dh_secret, &bundle.dh_public);
    let (mlkem_ciphertext, post_quantum) = mlkem_encapsulate(&bundle.mlkem_public)?;
    let hybrid_secret = sha256(&[&classical, &post_quantum]);

    // The responder keeps its own KEM pair alongside the peer's public key
    let (_, mlkem_secret) = mlkem_keypair()?;

    let state = RatchetState::from_handshake(
        session_id,
        false,
        dh_secret,
        bundle.dh_public,
        mlkem_secret,
        Some(bundle.mlkem_public),
        &hybrid_secret,
    );

    Ok((
        state,
        HandshakeResponse {
            dh_public,
            mlkem_ciphertext,
        },
    ))
}

/// One encrypted chat message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    /// The sender's current DH ratchet public key.
    pub dh_public: [u8; 32],
    /// Message number within the sender's current chain.
    pub message_number: u32,
    /// Length of the sender's previous sending chain.
    pub previous_chain_length: u32,
    /// Random AES-GCM nonce.
    pub nonce: [u8; AEAD_NONCE_SIZE],
    /// AES-256-GCM ciphertext (tag carried separately).
    pub ciphertext: Vec<u8>,
    /// AES-GCM authentication tag.
    pub tag: [u8; AEAD_TAG_SIZE],
}

/// A stored message key for out-of-order decryption.
#[derive(Clone)]
struct SkippedKey {
    dh_public: [u8; 32],
    message_number: u32,
    message_key: [u8; 32],
}

impl Drop for SkippedKey {
    fn drop(&mut self) {
        self.message_key.zeroize();
    }
}

/// The per-session double ratchet state. Single writer: the owning chat
/// session.
#[derive(Clone)]
pub struct RatchetState {
    dh_secret: StaticSecret,
    remote_dh_public: [u8; 32],
    mlkem_secret: [u8; MLKEM_SECRET_KEY_SIZE],
    remote_mlkem_public: Option<[u8; MLKEM_PUBLIC_KEY_SIZE]>,
    root_key: [u8; 32],
    send_chain_key: Option<[u8; 32]>,
    recv_chain_key: Option<[u8; 32]>,
    send_n: u32,
    recv_n: u32,
    prev_chain_len: u32,
    session_id: String,
    is_initiator: bool,
    created_at: Instant,
    last_activity: Instant,
    skipped: Vec<SkippedKey>,
    pending_send_rotation: bool,
}

impl RatchetState {
    fn from_handshake(
        session_id: &str,
        is_initiator: bool,
        dh_secret: StaticSecret,
        remote_dh_public: [u8; 32],
        mlkem_secret: [u8; MLKEM_SECRET_KEY_SIZE],
        remote_mlkem_public: Option<[u8; MLKEM_PUBLIC_KEY_SIZE]>,
        hybrid_secret: &[u8; 32],
    ) -> Self {
        let mut okm = [0u8; 96];
        hkdf_sha256(hybrid_secret, HANDSHAKE_SALT, ROOT_INFO, &mut okm);

        let mut root_key = [0u8; 32];
        let mut chain_a = [0u8; 32];
        let mut chain_b = [0u8; 32];
        root_key.copy_from_slice(&okm[..32]);
        chain_a.copy_from_slice(&okm[32..64]);
        chain_b.copy_from_slice(&okm[64..]);
        okm.zeroize();

        // Initiator: send = A, recv = B. The responder swaps.
        let (send_chain_key, recv_chain_key) = if is_initiator {
            (chain_a, chain_b)
        } else {
            (chain_b, chain_a)
        };

        let now = Instant::now();
        Self {
            dh_secret,
            remote_dh_public,
            mlkem_secret,
            remote_mlkem_public,
            root_key,
            send_chain_key: Some(send_chain_key),
            recv_chain_key: Some(recv_chain_key),
            send_n: 0,
            recv_n: 0,
            prev_chain_len: 0,
            session_id: session_id.to_owned(),
            is_initiator,
            created_at: now,
            last_activity: now,
            skipped: Vec::new(),
            // The handshake keys are known to both sides, so the DH ratchet
            // needs a first fresh key to start turning; the responder
            // rotates on its first send.
            pending_send_rotation: !is_initiator,
        }
    }

    /// The session identifier this ratchet belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether this side initiated the session.
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// The current local DH ratchet public key.
    pub fn dh_public(&self) -> [u8; 32] {
        X25519PublicKey::from(&self.dh_secret).to_bytes()
    }

    /// Number of stored skipped message keys.
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// The peer's ML-KEM encapsulation key, when it was learned during
    /// the handshake (responder side only).
    pub fn remote_mlkem_public(&self) -> Option<&[u8; MLKEM_PUBLIC_KEY_SIZE]> {
        self.remote_mlkem_public.as_ref()
    }

    /// When this session was established.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Last encrypt/decrypt activity.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Encrypt a message, advancing the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage> {
        if self.send_chain_key.is_none() {
            return Err(CryptoError::MissingChainKey);
        }
        if self.pending_send_rotation {
            self.rotate_send_chain();
        }

        let chain_key = self.send_chain_key.ok_or(CryptoError::MissingChainKey)?;
        let mut message_key = hmac_sha256(&chain_key, &[MESSAGE_KEY_LABEL]);
        self.send_chain_key = Some(hmac_sha256(&chain_key, &[CHAIN_KEY_LABEL]));

        let nonce = random_array::<AEAD_NONCE_SIZE>();
        let sealed = aead_encrypt(&message_key, &nonce, plaintext)?;
        message_key.zeroize();

        let split = sealed.len() - AEAD_TAG_SIZE;
        let mut tag = [0u8; AEAD_TAG_SIZE];
        tag.copy_from_slice(&sealed[split..]);

        let message = RatchetMessage {
            dh_public: self.dh_public(),
            message_number: self.send_n,
            previous_chain_length: self.prev_chain_len,
            nonce,
            ciphertext: sealed[..split].to_vec(),
            tag,
        };

        self.send_n += 1;
        self.last_activity = Instant::now();
        Ok(message)
    }

    /// Decrypt an incoming message.
    ///
    /// Handles skipped-key hits, DH ratchet steps on a new remote key, and
    /// chain advancement. Runs against a working copy and commits only on
    /// success, so a failed decryption leaves the session state untouched.
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>> {
        let mut working = self.clone();
        let plaintext = working.decrypt_inner(message)?;
        *self = working;
        Ok(plaintext)
    }

    /// Erase all secret material. The state refuses further use.
    pub fn scrub(&mut self) {
        self.root_key.zeroize();
        if let Some(mut key) = self.send_chain_key.take() {
            key.zeroize();
        }
        if let Some(mut key) = self.recv_chain_key.take() {
            key.zeroize();
        }
        self.mlkem_secret.zeroize();
        self.remote_mlkem_public = None;
        self.dh_secret = StaticSecret::from([0u8; 32]);
        self.remote_dh_public = [0u8; 32];
        self.skipped.clear();
        self.pending_send_rotation = false;
    }

    /// Whether all secret material has been erased.
    pub fn is_scrubbed(&self) -> bool {
        self.root_key == [0u8; 32]
            && self.send_chain_key.is_none()
            && self.recv_chain_key.is_none()
            && self.skipped.is_empty()
            && self.mlkem_secret.iter().all(|&b| b == 0)
    }

    // === Private methods ===

    fn decrypt_inner(&mut self, message: &RatchetMessage) -> Result<Vec<u8>> {
        self.last_activity = Instant::now();

        if let Some(mut message_key) = self.take_skipped(&message.dh_public, message.message_number)
        {
            let plaintext = open_sealed(&message_key, message);
            message_key.zeroize();
            return plaintext;
        }

        if message.dh_public != self.remote_dh_public {
            // Close out the old receive chain before stepping
            self.store_skipped_until(message.previous_chain_length)?;
            self.dh_ratchet(&message.dh_public);
        }

        if message.message_number < self.recv_n {
            // Already consumed and no stored key: replay or hopeless loss
            return Err(CryptoError::MessageKeyNotFound);
        }
        self.store_skipped_until(message.message_number)?;

        let chain_key = self.recv_chain_key.ok_or(CryptoError::MissingChainKey)?;
        let mut message_key = hmac_sha256(&chain_key, &[MESSAGE_KEY_LABEL]);
        self.recv_chain_key = Some(hmac_sha256(&chain_key, &[CHAIN_KEY_LABEL]));
        self.recv_n = message.message_number + 1;

        let plaintext = open_sealed(&message_key, message);
        message_key.zeroize();
        plaintext
    }

    /// DH ratchet step on a new remote key: derive the receive chain with
    /// the current local keypair, then replace the local keypair and derive
    /// the send chain, so the next outgoing message carries the new key.
    fn dh_ratchet(&mut self, new_remote: &[u8; 32]) {
        let recv_secret = x25519(&self.dh_secret, new_remote);
        let (root_key, recv_chain) = kdf_root(&self.root_key, &recv_secret);
        self.root_key = root_key;
        self.recv_chain_key = Some(recv_chain);
        self.recv_n = 0;
        self.remote_dh_public = *new_remote;

        self.prev_chain_len = self.send_n;
        self.dh_secret = StaticSecret::random_from_rng(OsRng);
        let send_secret = x25519(&self.dh_secret, new_remote);
        let (root_key, send_chain) = kdf_root(&self.root_key, &send_secret);
        self.root_key = root_key;
        self.send_chain_key = Some(send_chain);
        self.send_n = 0;
        self.pending_send_rotation = false;
    }

    /// Send-half rotation used to bootstrap the DH ratchet on the responder
    /// side (both handshake keys are known to both parties, so the first
    /// fresh key has to come from somewhere).
    fn rotate_send_chain(&mut self) {
        self.prev_chain_len = self.send_n;
        self.dh_secret = StaticSecret::random_from_rng(OsRng);
        let send_secret = x25519(&self.dh_secret, &self.remote_dh_public);
        let (root_key, send_chain) = kdf_root(&self.root_key, &send_secret);
        self.root_key = root_key;
        self.send_chain_key = Some(send_chain);
        self.send_n = 0;
        self.pending_send_rotation = false;
    }

    /// Advance the receive chain up to (not including) `until`, storing a
    /// key for every skipped message number.
    fn store_skipped_until(&mut self, until: u32) -> Result<()> {
        if until <= self.recv_n {
            return Ok(());
        }
        if (until - self.recv_n) as usize > MAX_SKIPPED_KEYS {
            return Err(CryptoError::TooManySkipped);
        }
        let Some(mut chain_key) = self.recv_chain_key else {
            return Ok(());
        };
        while self.recv_n < until {
            let message_key = hmac_sha256(&chain_key, &[MESSAGE_KEY_LABEL]);
            self.insert_skipped(self.remote_dh_public, self.recv_n, message_key);
            let next = hmac_sha256(&chain_key, &[CHAIN_KEY_LABEL]);
            chain_key.zeroize();
            chain_key = next;
            self.recv_n += 1;
        }
        self.recv_chain_key = Some(chain_key);
        Ok(())
    }

    fn insert_skipped(&mut self, dh_public: [u8; 32], message_number: u32, message_key: [u8; 32]) {
        if self.skipped.len() >= MAX_SKIPPED_KEYS {
            self.skipped.remove(0);
        }
        self.skipped.push(SkippedKey {
            dh_public,
            message_number,
            message_key,
        });
    }

    fn take_skipped(&mut self, dh_public: &[u8; 32], message_number: u32) -> Option<[u8; 32]> {
        let index = self
            .skipped
            .iter()
            .position(|s| s.dh_public == *dh_public && s.message_number == message_number)?;
        Some(self.skipped.remove(index).message_key)
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.scrub();
    }
}

fn kdf_root(root_key: &[u8; 32], dh_secret: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut okm = [0u8; 64];
    hkdf_sha256(dh_secret, root_key, CHAIN_INFO, &mut okm);

    let mut new_root = [0u8; 32];
    let mut chain = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();
    (new_root, chain)
}

fn open_sealed(message_key: &[u8; 32], message: &RatchetMessage) -> Result<Vec<u8>> {
    let mut sealed = Vec::with_capacity(message.ciphertext.len() + AEAD_TAG_SIZE);
    sealed.extend_from_slice(&message.ciphertext);
    sealed.extend_from_slice(&message.tag);
    aead_decrypt(message_key, &message.nonce, &sealed)
}

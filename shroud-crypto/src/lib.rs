//! # Shroud Crypto
//!
//! Cryptographic core for Project Shroud: unlinkable value transfers that
//! settle on an ed25519-based ledger, with the transfer payload carried over
//! a short-range mesh while both endpoints are offline.
//!
//! The crate combines:
//! - **Stealth addresses** — one-time destinations derived per payment,
//!   unlinkable to the receiver's long-term meta-address without the
//!   viewing key
//! - **X25519 + ML-KEM-768** hybrid shared secrets (classical and
//!   post-quantum modes)
//! - **Raw-scalar ed25519 signing** for recovered spending keys, which are
//!   bare scalars rather than seed-expanded keys
//! - **Hybrid Double Ratchet** sessions for end-to-end encrypted chat with
//!   forward secrecy and post-compromise security
//!
//! ## Safety
//!
//! This crate forbids all unsafe code to maximize auditability and security.
//!
//! ## Example
//!
//! ```rust,ignore
//! use shroud_crypto::{StealthIdentity, derive_stealth_output, scan_transaction};
//!
//! // Receiver publishes a meta-address
//! let identity = StealthIdentity::generate(true)?;
//! let meta = identity.meta_address();
//!
//! // Sender derives a one-time destination
//! let output = derive_stealth_output(&meta)?;
//!
//! // Receiver detects the payment and recovers the spending key
//! let candidate = output.as_candidate();
//! let payment = scan_transaction(&identity, &candidate)?.expect("ours");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod derive;
pub mod identity;
pub mod primitives;
pub mod ratchet;
pub mod scanner;
pub mod signer;

pub use derive::{derive_stealth_output, verify_stealth_output, StealthOutput};
pub use identity::{MetaAddress, MlKemKeypair, StealthIdentity};
pub use ratchet::{
    respond, HandshakeBundle, HandshakeInitiator, HandshakeResponse, RatchetMessage, RatchetState,
};
pub use scanner::{
    encode_memo, parse_memo, scan_batch, scan_transaction, DetectedStealthPayment,
    StealthCandidate,
};
pub use signer::{sign_with_scalar, verify};

use thiserror::Error;

/// Errors that can occur during Shroud cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A compressed point failed to decompress onto the edwards curve.
    #[error("Invalid curve point")]
    InvalidPoint,

    /// A scalar was not canonical (not in `[0, L)`).
    #[error("Invalid scalar")]
    InvalidScalar,

    /// An input had the wrong length.
    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// The length the operation requires.
        expected: usize,
        /// The length that was supplied.
        actual: usize,
    },

    /// A meta-address failed to decode or had an unknown length.
    #[error("Invalid meta-address: {0}")]
    InvalidMetaAddress(String),

    /// A base58 ledger address failed to decode to 32 bytes.
    #[error("Invalid address encoding")]
    InvalidAddress,

    /// A ledger memo was neither 32 (classical) nor 1120 (hybrid) bytes.
    #[error("Invalid memo length: {0}")]
    InvalidMemoLength(usize),

    /// Stealth point addition produced no usable destination.
    #[error("Point addition failed")]
    PointAdditionFailed,

    /// A hybrid operation was requested without a post-quantum key.
    #[error("Missing post-quantum key")]
    MissingPostQuantumKey,

    /// KEM encapsulation failed.
    #[error("KEM encapsulation failed")]
    EncapsulationFailed,

    /// KEM decapsulation failed (wrong key or tampered ciphertext).
    #[error("KEM decapsulation failed")]
    DecapsulationFailed,

    /// A restored secret key failed its integrity round-trip.
    #[error("Key restore failed integrity check")]
    KeyRestoreFailed,

    /// AEAD encryption failed.
    #[error("Encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication error).
    #[error("Decryption failed: authentication error")]
    DecryptionFailed,

    /// A ratchet operation needed a chain key that is not established.
    #[error("Missing chain key")]
    MissingChainKey,

    /// An incoming message skipped further ahead than the skipped-key cap.
    #[error("Too many skipped messages")]
    TooManySkipped,

    /// An old message arrived with no stored key (replay or loss).
    #[error("No stored key for message")]
    MessageKeyNotFound,
}

/// Result type for Shroud crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

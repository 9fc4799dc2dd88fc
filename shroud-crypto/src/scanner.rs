//! # Shroud Crypto - Stealth Scanner Module
//!
//! Receiver-side detection of incoming stealth payments and recovery of
//! their one-time spending keys.
//!
//! The scanner inspects `(destination, R[, ct])` triples pulled from ledger
//! transactions. A one-byte view tag filters out ~255/256 of foreign
//! candidates before the point arithmetic; on a match the spending scalar
//! is `m + h mod L`, with `h` the **same** reduced scalar used on the
//! point side — any mismatch between the two sides silently loses the
//! payment, so both come from a single reduction here.

use subtle::ConstantTimeEq;

use crate::identity::StealthIdentity;
use crate::primitives::{
    decompress_point, reduce32, scalar_mult_base_noclamp, sha256, MLKEM_CIPHERTEXT_SIZE,
};
use crate::{CryptoError, Result};

/// Byte length of a classical ledger memo (`R` only).
pub const MEMO_CLASSICAL_SIZE: usize = 32;

/// Byte length of a hybrid ledger memo (`R ‖ ct`).
pub const MEMO_HYBRID_SIZE: usize = 32 + MLKEM_CIPHERTEXT_SIZE;

/// One candidate transaction as seen on the ledger.
#[derive(Debug, Clone)]
pub struct StealthCandidate {
    /// The transaction's destination address (base58 of a 32-byte point).
    pub destination_address: String,
    /// The ephemeral public key `R` carried in the memo.
    pub ephemeral_public_key: [u8; 32],
    /// ML-KEM ciphertext from the memo, for hybrid payments.
    pub mlkem_ciphertext: Option<Vec<u8>>,
    /// View tag supplied alongside, enabling the quick filter.
    pub view_tag: Option<u8>,
}

/// A payment confirmed to belong to the scanning identity.
#[derive(Debug, Clone)]
pub struct DetectedStealthPayment {
    /// Base58 one-time destination.
    pub stealth_address: String,
    /// The destination point.
    pub stealth_public_key: [u8; 32],
    /// The sender's ephemeral key `R`.
    pub ephemeral_public_key: [u8; 32],
    /// The recomputed view tag.
    pub view_tag: u8,
    /// ML-KEM ciphertext, for hybrid payments.
    pub mlkem_ciphertext: Option<Vec<u8>>,
    /// The recovered one-time spending key `m + h mod L`; signs for the
    /// stealth address via the raw-scalar signer.
    pub spending_private_key: [u8; 32],
}

/// Scan a single candidate transaction.
///
/// Hybrid processing is chosen by the presence of both a ciphertext on the
/// candidate and a post-quantum key on the identity; a hybrid candidate
/// scanned by a classical-only identity is simply not ours.
///
/// Returns `Ok(None)` for candidates addressed to someone else, including
/// view-tag mismatches (the quick filter: no point arithmetic is spent on
/// them).
pub fn scan_transaction(
    identity: &StealthIdentity,
    candidate: &StealthCandidate,
) -> Result<Option<DetectedStealthPayment>> {
    let shared_secret = match candidate.mlkem_ciphertext {
        Some(ref ciphertext) => {
            if !identity.has_post_quantum() {
                return Ok(None);
            }
            identity.compute_hybrid_shared_secret(&candidate.ephemeral_public_key, ciphertext)?
        }
        None => identity.compute_shared_secret(&candidate.ephemeral_public_key),
    };

    let tweak_hash = sha256(&[&shared_secret]);
    if let Some(tag) = candidate.view_tag {
        if tag != tweak_hash[0] {
            return Ok(None);
        }
    }

    let tweak = reduce32(&tweak_hash);
    let meta = identity.meta_address();
    let spending_point = decompress_point(&meta.spending_public)?;
    let stealth_public_key = (spending_point + scalar_mult_base_noclamp(&tweak))
        .compress()
        .to_bytes();

    let destination = decode_address(&candidate.destination_address)?;
    if !bool::from(stealth_public_key.ct_eq(&destination)) {
        return Ok(None);
    }

    let spending_private_key = identity.derive_stealth_spending_key(&tweak).to_bytes();

    Ok(Some(DetectedStealthPayment {
        stealth_address: candidate.destination_address.clone(),
        stealth_public_key,
        ephemeral_public_key: candidate.ephemeral_public_key,
        view_tag: tweak_hash[0],
        mlkem_ciphertext: candidate.mlkem_ciphertext.clone(),
        spending_private_key,
    }))
}

/// Scan a batch of candidates, optionally applying the view-tag filter.
///
/// With the filter off, every candidate gets the full recomputation even
/// when it carries a tag — useful when tags from untrusted relays should
/// not gate detection.
pub fn scan_batch(
    identity: &StealthIdentity,
    candidates: &[StealthCandidate],
    use_view_tag_filter: bool,
) -> Result<Vec<DetectedStealthPayment>> {
    let mut detected = Vec::new();
    for candidate in candidates {
        let effective = if use_view_tag_filter {
            candidate.clone()
        } else {
            StealthCandidate {
                view_tag: None,
                ..candidate.clone()
            }
        };
        if let Some(payment) = scan_transaction(identity, &effective)? {
            detected.push(payment);
        }
    }
    Ok(detected)
}

/// Build the ledger memo carrying `R` (and `ct` when hybrid).
pub fn encode_memo(ephemeral_public_key: &[u8; 32], mlkem_ciphertext: Option<&[u8]>) -> Vec<u8> {
    let mut memo = Vec::with_capacity(match mlkem_ciphertext {
        Some(_) => MEMO_HYBRID_SIZE,
        None => MEMO_CLASSICAL_SIZE,
    });
    memo.extend_from_slice(ephemeral_public_key);
    if let Some(ciphertext) = mlkem_ciphertext {
        memo.extend_from_slice(ciphertext);
    }
    memo
}

/// Parse a ledger memo into `R` and the optional ML-KEM ciphertext.
///
/// # Errors
/// `InvalidMemoLength` for any length other than exactly 32 (classical)
/// or 1,120 (hybrid) bytes.
pub fn parse_memo(memo: &[u8]) -> Result<([u8; 32], Option<Vec<u8>>)> {
    match memo.len() {
        MEMO_CLASSICAL_SIZE => {
            let mut ephemeral = [0u8; 32];
            ephemeral.copy_from_slice(memo);
            Ok((ephemeral, None))
        }
        MEMO_HYBRID_SIZE => {
            let mut ephemeral = [0u8; 32];
            ephemeral.copy_from_slice(&memo[..32]);
            Ok((ephemeral, Some(memo[32..].to_vec())))
        }
        n => Err(CryptoError::InvalidMemoLength(n)),
    }
}

fn decode_address(address: &str) -> Result<[u8; 32]> {
    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|_| CryptoError::InvalidAddress)?;
    decoded.try_into().map_err(|_| CryptoError::InvalidAddress)
}

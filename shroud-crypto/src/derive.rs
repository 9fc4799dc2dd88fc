//! # Shroud Crypto - Stealth Derivation Module
//!
//! Sender-side generation of one-time payment destinations.
//!
//! Each payment gets a fresh X25519 ephemeral pair; the shared secret with
//! the receiver's viewing key (optionally mixed with an ML-KEM
//! encapsulation in hybrid mode) is hashed and reduced to a scalar tweak
//! `h`, and the destination is the point `P = M + h·G`. The receiver finds
//! the payment from `R` (and `ct`) alone.

use crate::identity::{MetaAddress, StealthIdentity};
use crate::primitives::{
    decompress_point, reduce32, scalar_mult_base_noclamp, sha256, x25519, x25519_keypair,
    MLKEM_CIPHERTEXT_SIZE,
};
use crate::scanner::StealthCandidate;
use crate::{CryptoError, Result};

/// A sender-derived one-time stealth destination.
#[derive(Debug, Clone)]
pub struct StealthOutput {
    /// Base58 of the one-time destination point; published as the payment
    /// destination on the ledger.
    pub stealth_address: String,
    /// The one-time destination point `P = M + h·G` itself.
    pub stealth_public_key: [u8; 32],
    /// The sender's per-payment X25519 public key `R`, transmitted
    /// out-of-band (in practice inside the mesh payload).
    pub ephemeral_public_key: [u8; 32],
    /// First byte of `SHA-256(S)`; lets scanners skip non-matching
    /// candidates without the full point recomputation.
    pub view_tag: u8,
    /// ML-KEM-768 ciphertext, present iff the meta-address was hybrid.
    pub mlkem_ciphertext: Option<[u8; MLKEM_CIPHERTEXT_SIZE]>,
}

impl StealthOutput {
    /// Whether this output was derived against a hybrid meta-address.
    pub fn is_hybrid(&self) -> bool {
        self.mlkem_ciphertext.is_some()
    }

    /// View this output as a scanner candidate (what the receiver sees on
    /// the ledger: destination, `R`, `ct`, view tag).
    pub fn as_candidate(&self) -> StealthCandidate {
        StealthCandidate {
            destination_address: self.stealth_address.clone(),
            ephemeral_public_key: self.ephemeral_public_key,
            mlkem_ciphertext: self.mlkem_ciphertext.map(|ct| ct.to_vec()),
            view_tag: Some(self.view_tag),
        }
    }
}

/// Derive a fresh one-time stealth destination for `meta`.
///
/// Hybrid mode is chosen by the meta-address: when it carries an ML-KEM
/// key, the shared secret is `SHA-256(X25519(r, V) ‖ Encaps(k_pk).ss)` and
/// the output carries the encapsulation ciphertext.
///
/// # Errors
/// `PointAdditionFailed` if the spending key does not yield a usable
/// destination point. A failed derivation aborts this single payment and
/// poisons nothing.
pub fn derive_stealth_output(meta: &MetaAddress) -> Result<StealthOutput> {
    let spending_point =
        decompress_point(&meta.spending_public).map_err(|_| CryptoError::PointAdditionFailed)?;

    let (ephemeral, ephemeral_public_key) = x25519_keypair();
    let classical = x25519(&ephemeral, &meta.viewing_public);

    let (shared_secret, mlkem_ciphertext) = match meta.mlkem_public {
        Some(ref kem_public) => {
            let (ciphertext, post_quantum) = crate::primitives::mlkem_encapsulate(kem_public)?;
            (sha256(&[&classical, &post_quantum]), Some(ciphertext))
        }
        None => (classical, None),
    };

    let tweak_hash = sha256(&[&shared_secret]);
    let view_tag = tweak_hash[0];
    // The same reduced scalar feeds both the point-side multiplication here
    // and the receiver's scalar-side addition.
    let tweak = reduce32(&tweak_hash);

    let stealth_point = spending_point + scalar_mult_base_noclamp(&tweak);
    let stealth_public_key = stealth_point.compress().to_bytes();

    Ok(StealthOutput {
        stealth_address: bs58::encode(stealth_public_key).into_string(),
        stealth_public_key,
        ephemeral_public_key,
        view_tag,
        mlkem_ciphertext,
    })
}

/// Recompute a derivation from the receiver's side and check it matches.
///
/// Symmetric verification used by tests: the receiver's viewing key must
/// reproduce the same shared secret, tweak, and destination the sender
/// derived.
pub fn verify_stealth_output(identity: &StealthIdentity, output: &StealthOutput) -> Result<bool> {
    let shared_secret = match output.mlkem_ciphertext {
        Some(ref ciphertext) => {
            identity.compute_hybrid_shared_secret(&output.ephemeral_public_key, ciphertext)?
        }
        None => identity.compute_shared_secret(&output.ephemeral_public_key),
    };

    let tweak_hash = sha256(&[&shared_secret]);
    if tweak_hash[0] != output.view_tag {
        return Ok(false);
    }

    let tweak = reduce32(&tweak_hash);
    let meta = identity.meta_address();
    let spending_point = decompress_point(&meta.spending_public)?;
    let expected = (spending_point + scalar_mult_base_noclamp(&tweak))
        .compress()
        .to_bytes();

    Ok(expected == output.stealth_public_key)
}

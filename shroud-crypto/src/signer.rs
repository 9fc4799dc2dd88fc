//! # Shroud Crypto - Raw-Scalar Signer Module
//!
//! Deterministic ed25519 signing from a bare scalar.
//!
//! Spending keys recovered by the stealth scanner are raw scalars
//! `p ∈ [0, L)` produced by scalar addition mod `L` — there is no seed to
//! expand, so seed-based signers cannot use them. This signer derives the
//! nonce from the scalar itself and produces signatures that verify under
//! the standard ed25519 equation.

use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::primitives::{reduce64, scalar_mult_base_noclamp, sha512};
use crate::{CryptoError, Result};

/// Size of an ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Sign `message` with a raw ed25519 scalar.
///
/// The caller supplies the 32-byte public key `A`, which MUST equal
/// `scalar·G`; it is bound into the challenge hash but never re-derived
/// here. Signing is deterministic:
///
/// 1. `r = SHA-512(scalar ‖ message) mod L`
/// 2. `R = r·G` (no clamping)
/// 3. `k = SHA-512(R ‖ A ‖ message) mod L`
/// 4. `s = r + k·scalar mod L`
///
/// # Errors
/// `InvalidScalar` if `scalar` is not canonical (not in `[0, L)`).
pub fn sign_with_scalar(
    scalar: &[u8; 32],
    public: &[u8; 32],
    message: &[u8],
) -> Result<[u8; SIGNATURE_SIZE]> {
    let p = Option::<Scalar>::from(Scalar::from_canonical_bytes(*scalar))
        .ok_or(CryptoError::InvalidScalar)?;

    let r = reduce64(&sha512(&[scalar, message]));
    let big_r = scalar_mult_base_noclamp(&r).compress().to_bytes();

    let k = reduce64(&sha512(&[&big_r, public, message]));
    let s = r + k * p;

    let mut signature = [0u8; SIGNATURE_SIZE];
    signature[..32].copy_from_slice(&big_r);
    signature[32..].copy_from_slice(&s.to_bytes());
    Ok(signature)
}

/// Verify an ed25519 signature against a 32-byte public key.
///
/// Thin wrapper over the standard verifier; exists so callers (and tests)
/// check raw-scalar signatures through the same equation every ledger
/// validator uses.
pub fn verify(public: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    if signature.len() != SIGNATURE_SIZE {
        return false;
    }
    let Ok(key) = VerifyingKey::from_bytes(public) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

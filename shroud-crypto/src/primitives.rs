//! # Shroud Crypto - Primitives Module
//!
//! The curve, KEM, and symmetric primitives every other module builds on:
//! ed25519 point/scalar arithmetic, X25519 ECDH, ML-KEM-768, SHA-256/512,
//! HKDF-SHA256, HMAC-SHA256, and AES-256-GCM.
//!
//! All operations validate their inputs and return a structured
//! [`CryptoError`] instead of panicking or producing undefined output.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::{clamp_integer, Scalar};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::{CryptoError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Size of an ML-KEM-768 public (encapsulation) key in bytes.
pub const MLKEM_PUBLIC_KEY_SIZE: usize = pqc_kyber::KYBER_PUBLICKEYBYTES;

/// Size of an ML-KEM-768 secret (decapsulation) key in bytes.
pub const MLKEM_SECRET_KEY_SIZE: usize = pqc_kyber::KYBER_SECRETKEYBYTES;

/// Size of an ML-KEM-768 ciphertext in bytes.
pub const MLKEM_CIPHERTEXT_SIZE: usize = pqc_kyber::KYBER_CIPHERTEXTBYTES;

/// Size of an ML-KEM shared secret in bytes.
pub const MLKEM_SHARED_SECRET_SIZE: usize = pqc_kyber::KYBER_SSBYTES;

/// Size of the AES-256-GCM nonce in bytes.
pub const AEAD_NONCE_SIZE: usize = 12;

/// Size of the AES-256-GCM authentication tag in bytes.
pub const AEAD_TAG_SIZE: usize = 16;

/// Byte offset of the encapsulation key embedded in an ML-KEM-768 secret
/// key (FIPS 203 decapsulation-key layout: `s ‖ ek ‖ H(ek) ‖ z`).
const MLKEM_EMBEDDED_PK_OFFSET: usize = 1152;

// === Randomness ===

/// Fill a caller-sized buffer with cryptographically secure random bytes.
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Return `N` cryptographically secure random bytes.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

// === Hashing and key derivation ===

/// SHA-256 of the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// SHA-512 of the concatenation of `parts`.
///
/// Genuine SHA-512 is required here: the raw-scalar signer's nonce and
/// challenge hashes must match the standard ed25519 verify equation.
pub fn sha512(parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// HKDF-SHA256 expand into a caller-sized output buffer.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], okm: &mut [u8]) {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, okm)
        .expect("HKDF-SHA256 output length within bounds");
}

/// HMAC-SHA256 of `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

// === ed25519 scalars ===

/// Interpret `bytes` as a canonical scalar in `[0, L)`.
pub fn canonical_scalar(bytes: &[u8; 32]) -> Result<Scalar> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes)).ok_or(CryptoError::InvalidScalar)
}

/// Reduce a 32-byte value mod `L`.
pub fn reduce32(bytes: &[u8; 32]) -> Scalar {
    Scalar::from_bytes_mod_order(*bytes)
}

/// Reduce a 64-byte value mod `L`.
pub fn reduce64(bytes: &[u8; 64]) -> Scalar {
    Scalar::from_bytes_mod_order_wide(bytes)
}

/// `a + b mod L` over raw 32-byte scalars.
pub fn scalar_add(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    (reduce32(a) + reduce32(b)).to_bytes()
}

/// `a · b mod L` over raw 32-byte scalars.
pub fn scalar_mul(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    (reduce32(a) * reduce32(b)).to_bytes()
}

// === ed25519 points ===

/// Whether `bytes` decompress to a point on the edwards curve.
pub fn is_on_curve(bytes: &[u8; 32]) -> bool {
    CompressedEdwardsY(*bytes).decompress().is_some()
}

/// Decompress a 32-byte compressed edwards point.
pub fn decompress_point(bytes: &[u8; 32]) -> Result<EdwardsPoint> {
    CompressedEdwardsY(*bytes)
        .decompress()
        .ok_or(CryptoError::InvalidPoint)
}

/// Add two compressed edwards points: `P + Q`.
pub fn point_add(p: &[u8; 32], q: &[u8; 32]) -> Result<[u8; 32]> {
    let p = decompress_point(p)?;
    let q = decompress_point(q)?;
    Ok((p + q).compress().to_bytes())
}

/// Base-point multiplication with RFC 7748 clamping applied first.
pub fn scalar_mult_base(bytes: &[u8; 32]) -> [u8; 32] {
    // Reducing the clamped integer mod L yields the same point, since the
    // basepoint has order L.
    let scalar = Scalar::from_bytes_mod_order(clamp_integer(*bytes));
    EdwardsPoint::mul_base(&scalar).compress().to_bytes()
}

/// Base-point multiplication of a raw scalar, no clamping.
pub fn scalar_mult_base_noclamp(scalar: &Scalar) -> EdwardsPoint {
    EdwardsPoint::mul_base(scalar)
}

// === X25519 ===

/// Generate a fresh X25519 keypair.
pub fn x25519_keypair() -> (StaticSecret, [u8; 32]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519PublicKey::from(&secret).to_bytes();
    (secret, public)
}

/// X25519 ECDH between a local secret and a remote 32-byte public key.
pub fn x25519(secret: &StaticSecret, public: &[u8; 32]) -> [u8; 32] {
    secret
        .diffie_hellman(&X25519PublicKey::from(*public))
        .to_bytes()
}

// === ML-KEM-768 ===

/// Generate an ML-KEM-768 keypair as raw byte arrays.
pub fn mlkem_keypair() -> Result<([u8; MLKEM_PUBLIC_KEY_SIZE], [u8; MLKEM_SECRET_KEY_SIZE])> {
    let keys = pqc_kyber::keypair(&mut OsRng).map_err(|_| CryptoError::EncapsulationFailed)?;
    Ok((keys.public, keys.secret))
}

/// Encapsulate to an ML-KEM-768 public key.
///
/// Returns the 1088-byte ciphertext and the 32-byte shared secret.
pub fn mlkem_encapsulate(
    public: &[u8],
) -> Result<([u8; MLKEM_CIPHERTEXT_SIZE], [u8; MLKEM_SHARED_SECRET_SIZE])> {
    if public.len() != MLKEM_PUBLIC_KEY_SIZE {
        return Err(CryptoError::InvalidLength {
            expected: MLKEM_PUBLIC_KEY_SIZE,
            actual: public.len(),
        });
    }
    pqc_kyber::encapsulate(public, &mut OsRng).map_err(|_| CryptoError::EncapsulationFailed)
}

/// Decapsulate an ML-KEM-768 ciphertext with a secret key.
pub fn mlkem_decapsulate(secret: &[u8], ciphertext: &[u8]) -> Result<[u8; MLKEM_SHARED_SECRET_SIZE]> {
    if secret.len() != MLKEM_SECRET_KEY_SIZE {
        return Err(CryptoError::InvalidLength {
            expected: MLKEM_SECRET_KEY_SIZE,
            actual: secret.len(),
        });
    }
    if ciphertext.len() != MLKEM_CIPHERTEXT_SIZE {
        return Err(CryptoError::InvalidLength {
            expected: MLKEM_CIPHERTEXT_SIZE,
            actual: ciphertext.len(),
        });
    }
    pqc_kyber::decapsulate(ciphertext, secret).map_err(|_| CryptoError::DecapsulationFailed)
}

/// Restore an ML-KEM-768 secret key from its serialized form.
///
/// The decapsulation key embeds its encapsulation key; the pair is
/// exercised with an encapsulate/decapsulate round-trip so a corrupted
/// blob fails here rather than producing garbage shared secrets later.
pub fn mlkem_restore_secret(bytes: &[u8]) -> Result<[u8; MLKEM_SECRET_KEY_SIZE]> {
    if bytes.len() != MLKEM_SECRET_KEY_SIZE {
        return Err(CryptoError::InvalidLength {
            expected: MLKEM_SECRET_KEY_SIZE,
            actual: bytes.len(),
        });
    }
    let embedded_pk = &bytes[MLKEM_EMBEDDED_PK_OFFSET..MLKEM_EMBEDDED_PK_OFFSET + MLKEM_PUBLIC_KEY_SIZE];
    let (ciphertext, expected) = mlkem_encapsulate(embedded_pk)?;
    let recovered = mlkem_decapsulate(bytes, &ciphertext)?;
    if bool::from(expected.ct_eq(&recovered)) {
        let mut out = [0u8; MLKEM_SECRET_KEY_SIZE];
        out.copy_from_slice(bytes);
        Ok(out)
    } else {
        Err(CryptoError::KeyRestoreFailed)
    }
}

/// Extract the public key embedded in an ML-KEM-768 secret key.
pub fn mlkem_public_from_secret(secret: &[u8; MLKEM_SECRET_KEY_SIZE]) -> [u8; MLKEM_PUBLIC_KEY_SIZE] {
    let mut out = [0u8; MLKEM_PUBLIC_KEY_SIZE];
    out.copy_from_slice(&secret[MLKEM_EMBEDDED_PK_OFFSET..MLKEM_EMBEDDED_PK_OFFSET + MLKEM_PUBLIC_KEY_SIZE]);
    out
}

// === AEAD ===

/// AES-256-GCM encryption: returns `ciphertext ‖ tag`.
pub fn aead_encrypt(key: &[u8; 32], nonce: &[u8; AEAD_NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("AES-256-GCM takes a 32-byte key");
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// AES-256-GCM decryption of `ciphertext ‖ tag`.
pub fn aead_decrypt(key: &[u8; 32], nonce: &[u8; AEAD_NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < AEAD_TAG_SIZE {
        return Err(CryptoError::InvalidLength {
            expected: AEAD_TAG_SIZE,
            actual: ciphertext.len(),
        });
    }
    let cipher = Aes256Gcm::new_from_slice(key).expect("AES-256-GCM takes a 32-byte key");
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

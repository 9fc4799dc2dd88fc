//! # Shroud Crypto - Stealth Identity Module
//!
//! A receiver's long-term identity and its public meta-address.
//!
//! The identity is three key pairs: a spending pair `(m, M)` where `m` is a
//! **raw scalar** on ed25519 (spending-key recovery needs scalar addition
//! mod `L`, so no seed expansion), a viewing pair `(v, V)` on Curve25519
//! for ECDH, and an optional ML-KEM-768 pair for hybrid mode.
//!
//! The meta-address is the base58 encoding of `M ‖ V` (64 bytes, classical)
//! or `M ‖ V ‖ k_pk` (1,248 bytes, hybrid); length alone discriminates the
//! two forms.

use curve25519_dalek::scalar::Scalar;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::primitives::{
    canonical_scalar, is_on_curve, mlkem_decapsulate, mlkem_keypair, mlkem_public_from_secret,
    mlkem_restore_secret, random_array, reduce64, scalar_mult_base_noclamp, sha256, x25519,
    MLKEM_PUBLIC_KEY_SIZE, MLKEM_SECRET_KEY_SIZE, MLKEM_SHARED_SECRET_SIZE,
};
use crate::{CryptoError, Result};

/// Byte length of a classical meta-address (`M ‖ V`).
pub const META_ADDRESS_CLASSICAL_SIZE: usize = 64;

/// Byte length of a hybrid meta-address (`M ‖ V ‖ k_pk`).
pub const META_ADDRESS_HYBRID_SIZE: usize = 64 + MLKEM_PUBLIC_KEY_SIZE;

/// An ML-KEM-768 keypair held by a stealth identity.
///
/// The public key is raw bytes; the secret key only enters through the
/// integrity-checked [`mlkem_restore_secret`] path.
#[derive(Clone)]
pub struct MlKemKeypair {
    /// Raw 1,184-byte encapsulation key.
    pub public: [u8; MLKEM_PUBLIC_KEY_SIZE],
    secret: [u8; MLKEM_SECRET_KEY_SIZE],
}

impl MlKemKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Result<Self> {
        let (public, secret) = mlkem_keypair()?;
        Ok(Self { public, secret })
    }

    /// Restore from a serialized secret key, verifying integrity.
    pub fn restore(secret_bytes: &[u8]) -> Result<Self> {
        let secret = mlkem_restore_secret(secret_bytes)?;
        Ok(Self {
            public: mlkem_public_from_secret(&secret),
            secret,
        })
    }

    /// The serialized secret key, for the external key store.
    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret
    }
}

impl Drop for MlKemKeypair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// A receiver's long-term public identity: `M ‖ V` or `M ‖ V ‖ k_pk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaAddress {
    /// Spending public key `M` (compressed edwards point).
    pub spending_public: [u8; 32],
    /// Viewing public key `V` (X25519 point).
    pub viewing_public: [u8; 32],
    /// ML-KEM-768 encapsulation key, present iff hybrid.
    pub mlkem_public: Option<[u8; MLKEM_PUBLIC_KEY_SIZE]>,
}

impl MetaAddress {
    /// Whether this meta-address carries a post-quantum key.
    pub fn is_hybrid(&self) -> bool {
        self.mlkem_public.is_some()
    }

    /// Base58-encode the meta-address for out-of-band exchange.
    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(match self.mlkem_public {
            Some(_) => META_ADDRESS_HYBRID_SIZE,
            None => META_ADDRESS_CLASSICAL_SIZE,
        });
        bytes.extend_from_slice(&self.spending_public);
        bytes.extend_from_slice(&self.viewing_public);
        if let Some(ref pk) = self.mlkem_public {
            bytes.extend_from_slice(pk);
        }
        bs58::encode(bytes).into_string()
    }

    /// Parse a base58 meta-address.
    ///
    /// # Errors
    /// `InvalidMetaAddress` on a decode failure, a length other than 64 or
    /// 1,248 bytes, or a spending key that is not an edwards curve point.
    pub fn parse(encoded: &str) -> Result<Self> {
        let decoded = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| CryptoError::InvalidMetaAddress(format!("base58 decode: {e}")))?;

        let mlkem_public = match decoded.len() {
            META_ADDRESS_CLASSICAL_SIZE => None,
            META_ADDRESS_HYBRID_SIZE => {
                let mut pk = [0u8; MLKEM_PUBLIC_KEY_SIZE];
                pk.copy_from_slice(&decoded[64..]);
                Some(pk)
            }
            n => {
                return Err(CryptoError::InvalidMetaAddress(format!(
                    "unexpected length {n}, want {META_ADDRESS_CLASSICAL_SIZE} or {META_ADDRESS_HYBRID_SIZE}"
                )))
            }
        };

        let mut spending_public = [0u8; 32];
        spending_public.copy_from_slice(&decoded[..32]);
        if !is_on_curve(&spending_public) {
            return Err(CryptoError::InvalidMetaAddress(
                "spending key is not a curve point".into(),
            ));
        }

        let mut viewing_public = [0u8; 32];
        viewing_public.copy_from_slice(&decoded[32..64]);

        Ok(Self {
            spending_public,
            viewing_public,
            mlkem_public,
        })
    }
}

/// A receiver's full stealth identity, including private material.
pub struct StealthIdentity {
    spending: Scalar,
    spending_public: [u8; 32],
    viewing: StaticSecret,
    viewing_public: [u8; 32],
    mlkem: Option<MlKemKeypair>,
}

impl StealthIdentity {
    /// Generate a fresh identity.
    ///
    /// The spending scalar is drawn uniformly from `[0, L)` by wide
    /// reduction of 64 random bytes, so it can later absorb a scalar
    /// addition without bias.
    pub fn generate(with_post_quantum: bool) -> Result<Self> {
        let spending = reduce64(&random_array::<64>());
        let spending_public = scalar_mult_base_noclamp(&spending).compress().to_bytes();

        let viewing = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let viewing_public = X25519PublicKey::from(&viewing).to_bytes();

        let mlkem = if with_post_quantum {
            Some(MlKemKeypair::generate()?)
        } else {
            None
        };

        Ok(Self {
            spending,
            spending_public,
            viewing,
            viewing_public,
            mlkem,
        })
    }

    /// Restore an identity from key-store blobs.
    ///
    /// # Errors
    /// `InvalidScalar` if the spending key is not canonical;
    /// `KeyRestoreFailed` if the ML-KEM secret fails its integrity check.
    pub fn restore(
        spending_key: &[u8; 32],
        viewing_key: &[u8; 32],
        mlkem_secret: Option<&[u8]>,
    ) -> Result<Self> {
        let spending = canonical_scalar(spending_key)?;
        let spending_public = scalar_mult_base_noclamp(&spending).compress().to_bytes();

        let viewing = StaticSecret::from(*viewing_key);
        let viewing_public = X25519PublicKey::from(&viewing).to_bytes();

        let mlkem = match mlkem_secret {
            Some(bytes) => Some(MlKemKeypair::restore(bytes)?),
            None => None,
        };

        Ok(Self {
            spending,
            spending_public,
            viewing,
            viewing_public,
            mlkem,
        })
    }

    /// The public meta-address for this identity.
    pub fn meta_address(&self) -> MetaAddress {
        MetaAddress {
            spending_public: self.spending_public,
            viewing_public: self.viewing_public,
            mlkem_public: self.mlkem.as_ref().map(|kp| kp.public),
        }
    }

    /// Whether this identity can decapsulate hybrid payments.
    pub fn has_post_quantum(&self) -> bool {
        self.mlkem.is_some()
    }

    /// The spending public key `M`.
    pub fn spending_public(&self) -> &[u8; 32] {
        &self.spending_public
    }

    /// The classical shared secret `X25519(v, R)` for an ephemeral key `R`.
    pub fn compute_shared_secret(&self, ephemeral_public: &[u8; 32]) -> [u8; 32] {
        x25519(&self.viewing, ephemeral_public)
    }

    /// Decapsulate an ML-KEM ciphertext addressed to this identity.
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<[u8; MLKEM_SHARED_SECRET_SIZE]> {
        let keypair = self.mlkem.as_ref().ok_or(CryptoError::MissingPostQuantumKey)?;
        mlkem_decapsulate(&keypair.secret, ciphertext)
    }

    /// The hybrid shared secret `SHA-256(X25519(v, R) ‖ Decaps(k_sk, ct))`.
    pub fn compute_hybrid_shared_secret(
        &self,
        ephemeral_public: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<[u8; 32]> {
        let classical = self.compute_shared_secret(ephemeral_public);
        let post_quantum = self.decapsulate(ciphertext)?;
        Ok(sha256(&[&classical, &post_quantum]))
    }

    /// Recover a one-time spending key: `m + h mod L`.
    ///
    /// `h` must already be reduced to `[0, L)` — the same reduced value
    /// used on the point side of the derivation.
    pub fn derive_stealth_spending_key(&self, tweak: &Scalar) -> Scalar {
        self.spending + tweak
    }

    /// Serialized spending key for the external key store.
    pub fn export_spending_key(&self) -> [u8; 32] {
        self.spending.to_bytes()
    }

    /// Serialized viewing key for the external key store.
    pub fn export_viewing_key(&self) -> [u8; 32] {
        self.viewing.to_bytes()
    }

    /// Serialized ML-KEM secret for the external key store, if hybrid.
    pub fn export_mlkem_secret(&self) -> Option<&[u8]> {
        self.mlkem.as_ref().map(|kp| kp.secret_bytes())
    }
}

impl Drop for StealthIdentity {
    fn drop(&mut self) {
        self.spending.zeroize();
        // viewing is a StaticSecret and zeroizes itself; the ML-KEM secret
        // zeroizes in MlKemKeypair::drop
    }
}

//! Cryptographic provider.
//!
//! All randomness flows through [`CryptoProvider`] so that a session can be
//! driven by OS entropy in production and replayed from a fixed seed in tests.
//! AEAD and key agreement live in the submodules and are stateless.

pub mod aead;
pub mod ecdh;

use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use thiserror::Error;
use zeroize::Zeroizing;

pub use aead::{open, seal, IV_LEN, TAG_LEN};
pub use ecdh::EphemeralKeyPair;

// =============================================================================
// ERRORS
// =============================================================================

/// Low-level cryptographic failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// AES key is neither 128 nor 256 bits.
    #[error("unsupported AES key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// Sealed buffer cannot hold an IV and a tag.
    #[error("sealed buffer too short: {0} bytes")]
    SealedTooShort(usize),

    /// GCM tag did not verify.
    #[error("authentication tag mismatch")]
    AuthenticationFailed,

    /// Peer public key is not a valid P-256 point.
    #[error("invalid P-256 public key")]
    InvalidPublicKey,

    /// Secret scalar is zero or not below the group order.
    #[error("invalid P-256 secret scalar")]
    InvalidSecretKey,
}

// =============================================================================
// PROVIDER
// =============================================================================

/// Source of randomness for keys, nonces and IVs.
pub trait CryptoProvider: Send {
    /// Fill `dest` with random bytes.
    fn fill_bytes(&mut self, dest: &mut [u8]);

    /// Fresh ephemeral P-256 key pair.
    fn generate_keypair(&mut self) -> EphemeralKeyPair {
        loop {
            let mut candidate = Zeroizing::new([0u8; 32]);
            self.fill_bytes(candidate.as_mut());
            // Out-of-range scalars are vanishingly rare; draw again.
            if let Ok(pair) = EphemeralKeyPair::from_secret_bytes(candidate.as_ref()) {
                return pair;
            }
        }
    }

    /// Fresh GCM IV.
    fn random_iv(&mut self) -> [u8; IV_LEN] {
        let mut iv = [0u8; IV_LEN];
        self.fill_bytes(&mut iv);
        iv
    }

    /// Seal under a fresh IV.
    fn seal(&mut self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let iv = self.random_iv();
        aead::seal(key, &iv, plaintext)
    }
}

/// Operating-system entropy.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsCrypto;

impl CryptoProvider for OsCrypto {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }
}

/// Reproducible provider for tests and simulations.
///
/// Given the same seed, every key pair, nonce and IV drawn from it is
/// identical across runs.
#[derive(Debug, Clone)]
pub struct SeededCrypto {
    rng: StdRng,
}

impl SeededCrypto {
    /// Create a provider from a 64-bit seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl CryptoProvider for SeededCrypto {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }
}

//! Ephemeral P-256 key agreement for oblivious-transfer rounds.
//!
//! Public keys travel as SEC1 hex. The client always sends the compressed
//! form; peers may answer in either form. The round key is
//! `SHA-256(compressed(shared point))`.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{AffinePoint, PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::CryptoError;

/// Round key length (AES-256).
pub const ROUND_KEY_LEN: usize = 32;

/// Single-use key pair. The secret scalar is wiped when dropped.
pub struct EphemeralKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Build from a 32-byte big-endian scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    /// Compressed SEC1 encoding (33 bytes).
    pub fn public_key_sec1(&self) -> Vec<u8> {
        self.public.to_encoded_point(true).as_bytes().to_vec()
    }

    /// Compressed SEC1 encoding as lowercase hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_sec1())
    }

    /// Derive the symmetric key shared with `peer_sec1`.
    pub fn derive_round_key(
        &self,
        peer_sec1: &[u8],
    ) -> Result<Zeroizing<[u8; ROUND_KEY_LEN]>, CryptoError> {
        let peer =
            PublicKey::from_sec1_bytes(peer_sec1).map_err(|_| CryptoError::InvalidPublicKey)?;
        let shared = AffinePoint::from(peer.to_projective() * *self.secret.to_nonzero_scalar());
        let encoded = Zeroizing::new(shared.to_encoded_point(true).as_bytes().to_vec());

        let mut key = Zeroizing::new([0u8; ROUND_KEY_LEN]);
        key.copy_from_slice(&Sha256::digest(encoded.as_slice()));
        Ok(key)
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(byte: u8) -> EphemeralKeyPair {
        EphemeralKeyPair::from_secret_bytes(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let alice = pair(1);
        let bob = pair(2);
        let k1 = alice.derive_round_key(&bob.public_key_sec1()).unwrap();
        let k2 = bob.derive_round_key(&alice.public_key_sec1()).unwrap();
        assert_eq!(*k1, *k2);
    }

    #[test]
    fn test_public_key_is_compressed() {
        let key = pair(3).public_key_sec1();
        assert_eq!(key.len(), 33);
        assert!(key[0] == 0x02 || key[0] == 0x03);
    }

    #[test]
    fn test_accepts_uncompressed_peer() {
        let alice = pair(4);
        let bob = pair(5);
        let uncompressed = bob.public.to_encoded_point(false);
        assert_eq!(uncompressed.as_bytes().len(), 65);

        let k1 = alice.derive_round_key(uncompressed.as_bytes()).unwrap();
        let k2 = alice.derive_round_key(&bob.public_key_sec1()).unwrap();
        assert_eq!(*k1, *k2);
    }

    #[test]
    fn test_rejects_invalid_point() {
        let alice = pair(6);
        assert_eq!(
            alice.derive_round_key(&[0x05; 33]).err(),
            Some(CryptoError::InvalidPublicKey)
        );
    }

    #[test]
    fn test_rejects_zero_scalar() {
        assert!(matches!(
            EphemeralKeyPair::from_secret_bytes(&[0u8; 32]),
            Err(CryptoError::InvalidSecretKey)
        ));
    }
}

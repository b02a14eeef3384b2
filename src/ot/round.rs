//! Single OT round.
//!
//! The client publishes an ephemeral public key; the seller answers with two
//! public keys and two sealed seeds. Only the branch matching the chosen bit
//! is opened. Branch selection is a byte-wise constant-time select over
//! equal-length inputs, so the unchosen branch is never parsed and the work
//! done does not depend on the bit.

use subtle::{Choice, ConditionallySelectable};
use zeroize::Zeroizing;

use super::OtError;
use crate::crypto::{self, CryptoError, CryptoProvider, EphemeralKeyPair};

/// Decoded challenge for one round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundChallenge {
    /// Round index.
    pub round: usize,
    /// Seller public keys for branch 0 and 1 (SEC1).
    pub public_keys: [Vec<u8>; 2],
    /// Sealed seeds for branch 0 and 1.
    pub sealed_seeds: [Vec<u8>; 2],
}

impl RoundChallenge {
    /// Decode hex fields from the wire.
    pub fn from_hex(
        round: usize,
        public_keys: [&str; 2],
        sealed_seeds: [&str; 2],
    ) -> Result<Self, OtError> {
        let decode = |s: &str| {
            hex::decode(s).map_err(|e| OtError::MalformedChallenge {
                round,
                detail: e.to_string(),
            })
        };
        Ok(Self {
            round,
            public_keys: [decode(public_keys[0])?, decode(public_keys[1])?],
            sealed_seeds: [decode(sealed_seeds[0])?, decode(sealed_seeds[1])?],
        })
    }
}

/// Per-round client state. Lives from round start until the seed is
/// recovered; the key pair is dropped (and wiped) as soon as it is used.
pub struct OtRoundState {
    index: usize,
    chosen_bit: u8,
    keypair: Option<EphemeralKeyPair>,
    recovered_seed: Option<Zeroizing<Vec<u8>>>,
}

impl std::fmt::Debug for OtRoundState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtRoundState")
            .field("index", &self.index)
            .field("keypair", &self.keypair.is_some())
            .field("complete", &self.is_complete())
            .finish_non_exhaustive()
    }
}

impl OtRoundState {
    /// Start a round: draw the ephemeral key pair.
    pub fn start(index: usize, chosen_bit: u8, crypto: &mut dyn CryptoProvider) -> Self {
        Self {
            index,
            chosen_bit,
            keypair: Some(crypto.generate_keypair()),
            recovered_seed: None,
        }
    }

    /// Round index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Compressed public key hex, while the key pair is alive.
    pub fn public_key_hex(&self) -> Option<String> {
        self.keypair.as_ref().map(EphemeralKeyPair::public_key_hex)
    }

    /// Whether the seed has been recovered.
    pub fn is_complete(&self) -> bool {
        self.recovered_seed.is_some()
    }

    /// Open the chosen branch and keep its seed.
    pub fn complete(&mut self, challenge: &RoundChallenge) -> Result<(), OtError> {
        let round = self.index;
        let keypair = self
            .keypair
            .take()
            .ok_or(OtError::RoundAlreadyComplete { round })?;

        let peer = select_branch(&challenge.public_keys, self.chosen_bit)
            .ok_or(OtError::AsymmetricChallenge { round })?;
        let sealed = select_branch(&challenge.sealed_seeds, self.chosen_bit)
            .ok_or(OtError::AsymmetricChallenge { round })?;

        let key = keypair
            .derive_round_key(&peer)
            .map_err(|source| OtError::BadServerKey { round, source })?;
        drop(keypair);

        let seed = crypto::open(key.as_ref(), &sealed).map_err(|source| match source {
            CryptoError::AuthenticationFailed => OtError::SeedDecrypt { round, source },
            other => OtError::MalformedChallenge {
                round,
                detail: other.to_string(),
            },
        })?;

        self.recovered_seed = Some(Zeroizing::new(seed));
        Ok(())
    }

    /// Hand the seed over for combination. Leaves nothing behind.
    pub fn take_seed(&mut self) -> Option<Zeroizing<Vec<u8>>> {
        self.recovered_seed.take()
    }
}

/// Select `pair[bit]` without branching on `bit`.
///
/// Returns `None` when the two branches differ in length.
pub fn select_branch(pair: &[Vec<u8>; 2], bit: u8) -> Option<Vec<u8>> {
    let (zero, one) = (&pair[0], &pair[1]);
    if zero.len() != one.len() {
        return None;
    }
    let choice = Choice::from(bit & 1);
    Some(
        zero.iter()
            .zip(one.iter())
            .map(|(a, b)| u8::conditional_select(a, b, choice))
            .collect(),
    )
}

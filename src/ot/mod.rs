//! Oblivious Transfer Client
//!
//! Retrieves one item's key material out of `N` without revealing which:
//! `k = ceil(log2 N)` independent 1-of-2 rounds, one per bit of the leaf
//! index (least significant first). Each round yields one seed; the XOR of
//! all seeds is the session master key, which opens exactly one entry of the
//! seller's key bundle.
//!
//! ## Round lifecycle
//!
//! ```text
//! start_round(r) ──► public key ──► complete_round(r) ──► seed
//!       │                                   │
//!       └── key pair generated              └── key pair wiped
//!
//! finish() ──► XOR(seeds) ──► MasterKey   (round states dropped)
//! ```

pub mod round;

use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::{CryptoError, CryptoProvider};

pub use round::{select_branch, OtRoundState, RoundChallenge};

/// Seed and master key length.
pub const MASTER_KEY_LEN: usize = 32;

// =============================================================================
// ERRORS
// =============================================================================

/// Oblivious-transfer failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    /// Catalog too small to run any round.
    #[error("catalog of {0} items cannot be transferred obliviously")]
    UnsupportedCatalogSize(usize),

    /// Chosen index is not a catalog position.
    #[error("leaf index {leaf_index} outside catalog of {num_items}")]
    ChoiceOutOfRange {
        /// Chosen index.
        leaf_index: usize,
        /// Catalog size.
        num_items: usize,
    },

    /// Round started or answered out of sequence.
    #[error("round {got} out of order, expected {expected}")]
    RoundOutOfOrder {
        /// Round the client is waiting for.
        expected: usize,
        /// Round named by the seller.
        got: usize,
    },

    /// Round has already consumed its key pair.
    #[error("round {round} already completed")]
    RoundAlreadyComplete {
        /// Round index.
        round: usize,
    },

    /// Branches of a challenge differ in length.
    #[error("round {round}: challenge branches differ in shape")]
    AsymmetricChallenge {
        /// Round index.
        round: usize,
    },

    /// Challenge fields could not be decoded.
    #[error("round {round}: malformed challenge: {detail}")]
    MalformedChallenge {
        /// Round index.
        round: usize,
        /// Decoder message.
        detail: String,
    },

    /// Seller public key is not a curve point.
    #[error("round {round}: {source}")]
    BadServerKey {
        /// Round index.
        round: usize,
        /// Underlying failure.
        source: CryptoError,
    },

    /// Chosen seed failed authentication.
    #[error("round {round}: seed decryption failed: {source}")]
    SeedDecrypt {
        /// Round index.
        round: usize,
        /// Underlying failure.
        source: CryptoError,
    },

    /// Recovered seed has the wrong length.
    #[error("seed from round {round} is {len} bytes, expected {expected}")]
    SeedLengthMismatch {
        /// Round index.
        round: usize,
        /// Actual length.
        len: usize,
        /// Required length.
        expected: usize,
    },

    /// No seeds to combine.
    #[error("no seeds to combine")]
    EmptySeedSet,

    /// Master key requested before every round finished.
    #[error("{completed} of {total} rounds completed")]
    Incomplete {
        /// Rounds with a recovered seed.
        completed: usize,
        /// Rounds required.
        total: usize,
    },
}

// =============================================================================
// CHOICE BITS
// =============================================================================

/// Number of rounds for a catalog of `num_items`: `ceil(log2 num_items)`.
pub fn round_count(num_items: usize) -> Result<usize, OtError> {
    if num_items < 2 {
        return Err(OtError::UnsupportedCatalogSize(num_items));
    }
    Ok((usize::BITS - (num_items - 1).leading_zeros()) as usize)
}

/// Binary decomposition of `leaf_index`, least significant bit first.
pub fn choice_bits(leaf_index: usize, num_items: usize) -> Result<Vec<u8>, OtError> {
    let rounds = round_count(num_items)?;
    if leaf_index >= num_items {
        return Err(OtError::ChoiceOutOfRange {
            leaf_index,
            num_items,
        });
    }
    Ok((0..rounds).map(|r| ((leaf_index >> r) & 1) as u8).collect())
}

// =============================================================================
// MASTER KEY
// =============================================================================

/// XOR of all round seeds. Wiped on drop.
pub struct MasterKey(Zeroizing<Vec<u8>>);

impl MasterKey {
    /// Key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterKey(<{} bytes>)", self.0.len())
    }
}

/// XOR equal-length seeds together.
///
/// Every seed is checked before any byte is combined, so a bad seed never
/// yields a partial key.
pub fn xor_combine<S: AsRef<[u8]>>(seeds: &[S], expected_len: usize) -> Result<MasterKey, OtError> {
    if seeds.is_empty() {
        return Err(OtError::EmptySeedSet);
    }
    for (round, seed) in seeds.iter().enumerate() {
        let len = seed.as_ref().len();
        if len != expected_len {
            return Err(OtError::SeedLengthMismatch {
                round,
                len,
                expected: expected_len,
            });
        }
    }

    let mut key = Zeroizing::new(vec![0u8; expected_len]);
    for seed in seeds {
        for (out, byte) in key.iter_mut().zip(seed.as_ref()) {
            *out ^= byte;
        }
    }
    Ok(MasterKey(key))
}

// =============================================================================
// CLIENT
// =============================================================================

/// Drives the `k` rounds for one chosen leaf.
pub struct OtClient {
    bits: Vec<u8>,
    rounds: Vec<OtRoundState>,
}

impl std::fmt::Debug for OtClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtClient")
            .field("rounds", &self.round_count())
            .field("completed", &self.completed_rounds())
            .finish_non_exhaustive()
    }
}

impl OtClient {
    /// Prepare rounds for `leaf_index` in a catalog of `num_items`.
    pub fn new(leaf_index: usize, num_items: usize) -> Result<Self, OtError> {
        let bits = choice_bits(leaf_index, num_items)?;
        Ok(Self {
            rounds: Vec::with_capacity(bits.len()),
            bits,
        })
    }

    /// Total number of rounds.
    pub fn round_count(&self) -> usize {
        self.bits.len()
    }

    /// Rounds with a recovered seed.
    pub fn completed_rounds(&self) -> usize {
        self.rounds.iter().filter(|r| r.is_complete()).count()
    }

    /// All seeds recovered.
    pub fn is_complete(&self) -> bool {
        self.completed_rounds() == self.round_count()
    }

    /// Begin round `round` and return the public key to send.
    ///
    /// Rounds must start in order and only after the previous one finished.
    pub fn start_round(
        &mut self,
        round: usize,
        crypto: &mut dyn CryptoProvider,
    ) -> Result<String, OtError> {
        let expected = self.rounds.len();
        let previous_done = self.rounds.last().map_or(true, OtRoundState::is_complete);
        if round != expected || round >= self.round_count() || !previous_done {
            return Err(OtError::RoundOutOfOrder { expected, got: round });
        }

        let state = OtRoundState::start(round, self.bits[round], crypto);
        let public = state
            .public_key_hex()
            .ok_or(OtError::RoundAlreadyComplete { round })?;
        self.rounds.push(state);

        #[cfg(feature = "debug-tracing")]
        debug!(round, public = %public, "OT round started");
        #[cfg(not(feature = "debug-tracing"))]
        debug!(round, "OT round started");

        Ok(public)
    }

    /// Answer the current round's challenge.
    pub fn complete_round(&mut self, challenge: &RoundChallenge) -> Result<(), OtError> {
        let current = self.rounds.len().checked_sub(1);
        let state = match (current, self.rounds.last_mut()) {
            (Some(index), Some(state)) if index == challenge.round => state,
            _ => {
                return Err(OtError::RoundOutOfOrder {
                    expected: current.unwrap_or(0),
                    got: challenge.round,
                })
            }
        };
        state.complete(challenge)?;
        debug!(round = challenge.round, "OT round complete");
        Ok(())
    }

    /// Combine the seeds into the master key. Consumes every round state.
    pub fn finish(mut self) -> Result<MasterKey, OtError> {
        let total = self.round_count();
        let completed = self.completed_rounds();
        if completed != total {
            return Err(OtError::Incomplete { completed, total });
        }

        let mut seeds = Vec::with_capacity(total);
        for state in self.rounds.iter_mut() {
            match state.take_seed() {
                Some(seed) => seeds.push(seed),
                None => return Err(OtError::Incomplete { completed, total }),
            }
        }
        self.rounds.clear();

        xor_combine(&seeds, MASTER_KEY_LEN)
    }
}

// =============================================================================
// TESTS
// =============================================================================

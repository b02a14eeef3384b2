//! Membership Witness
//!
//! Assembles the circuit input for "I know an opening of this commitment to
//! an item in the catalog with this root and this price". Every check the
//! circuit would make is repeated here first so that a doomed proof is never
//! sent to the proving engine.

use serde::{Deserialize, Serialize};

use super::commitment::{encode_item_id, Commitment, CommitmentError, PurchaseSecret};
use super::merkle::{CatalogLeaf, MembershipProof};
use crate::core::{CircuitHasher, FieldElement};

// =============================================================================
// ERRORS
// =============================================================================

/// Failure before or during proof generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    /// Stored secret is for a different item than the catalog leaf.
    ItemMismatch {
        /// Item in the secret.
        secret: String,
        /// Item at the chosen leaf.
        catalog: String,
    },
    /// Catalog price differs from the price committed to.
    PriceMismatch {
        /// Price in the secret.
        committed: u64,
        /// Price currently listed.
        listed: u64,
    },
    /// Opening does not reproduce the commitment sent with the order.
    CommitmentMismatch {
        /// Commitment on record.
        expected: Commitment,
        /// Commitment recomputed from the opening.
        recomputed: Commitment,
    },
    /// Path was built against a different catalog snapshot.
    StaleRoot {
        /// Root of the current catalog.
        current: FieldElement,
        /// Root the path folds to.
        path: FieldElement,
    },
    /// Encoding or hashing failed.
    Commitment(CommitmentError),
    /// Proving engine failed.
    Generation(String),
}

impl std::fmt::Display for ProofError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ItemMismatch { secret, catalog } => {
                write!(f, "secret is for item {}, catalog leaf is {}", secret, catalog)
            }
            Self::PriceMismatch { committed, listed } => {
                write!(f, "committed price {} differs from listed price {}", committed, listed)
            }
            Self::CommitmentMismatch { expected, recomputed } => {
                write!(f, "commitment mismatch: expected {}, recomputed {}", expected, recomputed)
            }
            Self::StaleRoot { current, path } => {
                write!(f, "stale catalog root: current {}, path folds to {}", current, path)
            }
            Self::Commitment(e) => write!(f, "{}", e),
            Self::Generation(msg) => write!(f, "proof generation failed: {}", msg),
        }
    }
}

impl std::error::Error for ProofError {}

impl From<CommitmentError> for ProofError {
    fn from(e: CommitmentError) -> Self {
        Self::Commitment(e)
    }
}

// =============================================================================
// WITNESS
// =============================================================================

/// Circuit input. Field names follow the circuit's signal names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    // Private inputs
    /// Encoded item id.
    pub book_id: FieldElement,
    /// Commitment nonce.
    pub nonce: FieldElement,
    /// Sibling per level.
    pub merkle_proof: Vec<FieldElement>,
    /// Side bit per level.
    pub merkle_path_indices: Vec<u8>,

    // Public inputs
    /// Catalog root.
    pub merkle_root: FieldElement,
    /// Price in minor units.
    pub price: FieldElement,
    /// Purchase commitment.
    pub commitment: Commitment,
}

impl Witness {
    /// Public inputs in decimal form: root, price, commitment.
    pub fn public_inputs(&self) -> [String; 3] {
        [
            self.merkle_root.to_decimal(),
            self.price.to_decimal(),
            self.commitment.to_decimal(),
        ]
    }
}

/// Check the opening and path, then assemble the witness.
///
/// `expected` is the commitment that was sent with the order; `root` is the
/// root of the catalog snapshot this session is using.
pub fn build_witness(
    leaf: &CatalogLeaf,
    secret: &PurchaseSecret,
    path: &MembershipProof,
    root: &FieldElement,
    expected: &Commitment,
    hasher: &mut CircuitHasher,
) -> Result<Witness, ProofError> {
    if secret.item_id != leaf.item_id {
        return Err(ProofError::ItemMismatch {
            secret: secret.item_id.clone(),
            catalog: leaf.item_id.clone(),
        });
    }
    if secret.price_minor_units != leaf.price_minor_units {
        return Err(ProofError::PriceMismatch {
            committed: secret.price_minor_units,
            listed: leaf.price_minor_units,
        });
    }

    let recomputed = secret.recompute(hasher)?;
    if recomputed != *expected {
        return Err(ProofError::CommitmentMismatch {
            expected: *expected,
            recomputed,
        });
    }

    let folded = path.compute_root(&leaf.hash(hasher)?, hasher)?;
    if path.root != *root || folded != *root {
        return Err(ProofError::StaleRoot {
            current: *root,
            path: folded,
        });
    }

    Ok(Witness {
        book_id: encode_item_id(&leaf.item_id)?,
        nonce: secret.nonce()?,
        merkle_proof: path.path_elements.clone(),
        merkle_path_indices: path.path_indices.clone(),
        merkle_root: *root,
        price: FieldElement::from_u64(leaf.price_minor_units),
        commitment: recomputed,
    })
}

// =============================================================================
// TESTS
// =============================================================================

//! Purchase Commitment
//!
//! Binds a purchase to one catalog item without revealing which:
//! `commitment = Poseidon(itemId, nonce, price)`. The commitment is sent to
//! the seller at order time; the nonce stays on this device until the
//! purchase completes or is abandoned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::core::{CircuitHasher, FieldElement, FieldError, HashError};
use crate::crypto::CryptoProvider;

/// Nonce width. 31 bytes always fits below the BN254 modulus.
pub const NONCE_BYTES: usize = 31;

// =============================================================================
// ERRORS
// =============================================================================

/// Commitment and catalog-tree errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitmentError {
    /// Catalog item id has no field encoding.
    #[error("catalog item {item_id:?} cannot be encoded: {source}")]
    CatalogEncoding {
        /// Offending identifier.
        item_id: String,
        /// Underlying encoding failure.
        source: FieldError,
    },

    /// Catalog does not fit in the fixed-depth tree.
    #[error("catalog has {items} items but the tree holds at most {capacity}")]
    CatalogTooLarge {
        /// Catalog length.
        items: usize,
        /// `2^depth`.
        capacity: usize,
    },

    /// Leaf index outside `[0, 2^depth)`.
    #[error("leaf index {index} outside tree capacity {capacity}")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// `2^depth`.
        capacity: usize,
    },

    /// Tree depth the circuit cannot be built for.
    #[error("unsupported tree depth {0}")]
    UnsupportedDepth(usize),

    /// Stored nonce is not a field element.
    #[error("stored nonce is malformed: {0}")]
    InvalidNonce(FieldError),

    /// Poseidon failure.
    #[error(transparent)]
    Hash(#[from] HashError),
}

// =============================================================================
// COMMITMENT
// =============================================================================

/// Poseidon commitment to `(itemId, nonce, price)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Commitment(pub FieldElement);

impl Commitment {
    /// Decimal form used on the wire.
    pub fn to_decimal(&self) -> String {
        self.0.to_decimal()
    }
}

impl std::fmt::Display for Commitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Encode a catalog identifier, tagging failures with the id.
pub fn encode_item_id(item_id: &str) -> Result<FieldElement, CommitmentError> {
    FieldElement::from_identifier(item_id).map_err(|source| CommitmentError::CatalogEncoding {
        item_id: item_id.to_string(),
        source,
    })
}

/// `Poseidon(encode(itemId), nonce, price)`.
pub fn compute_commitment(
    hasher: &mut CircuitHasher,
    item_id: &str,
    nonce: &FieldElement,
    price_minor_units: u64,
) -> Result<Commitment, CommitmentError> {
    let item = encode_item_id(item_id)?;
    let price = FieldElement::from_u64(price_minor_units);
    Ok(Commitment(hasher.hash3(&item, nonce, &price)?))
}

/// Draw a fresh 31-byte nonce.
pub fn generate_nonce(crypto: &mut dyn CryptoProvider) -> FieldElement {
    let mut bytes = Zeroizing::new([0u8; NONCE_BYTES]);
    crypto.fill_bytes(bytes.as_mut());
    FieldElement::from_be_bytes(bytes.as_ref())
}

// =============================================================================
// PURCHASE SECRET
// =============================================================================

/// Locally persisted opening of a commitment.
///
/// The nonce is wiped from memory when the secret is dropped and never
/// appears in `Debug` output.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseSecret {
    /// Catalog identifier of the purchased item.
    #[serde(alias = "bookId")]
    #[zeroize(skip)]
    pub item_id: String,

    /// Decimal nonce.
    nonce: String,

    /// Price at order time, in minor currency units.
    #[serde(alias = "priceInCents")]
    #[zeroize(skip)]
    pub price_minor_units: u64,

    /// Commitment that was sent with the order.
    #[zeroize(skip)]
    pub commitment: Commitment,

    /// When the secret was created.
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

impl PurchaseSecret {
    /// Create a fresh secret for an item: draws a nonce and commits.
    pub fn generate(
        hasher: &mut CircuitHasher,
        crypto: &mut dyn CryptoProvider,
        item_id: &str,
        price_minor_units: u64,
    ) -> Result<Self, CommitmentError> {
        let nonce = generate_nonce(crypto);
        let commitment = compute_commitment(hasher, item_id, &nonce, price_minor_units)?;
        Ok(Self {
            item_id: item_id.to_string(),
            nonce: nonce.to_decimal(),
            price_minor_units,
            commitment,
            created_at: Utc::now(),
        })
    }

    /// Parsed nonce.
    pub fn nonce(&self) -> Result<FieldElement, CommitmentError> {
        FieldElement::from_decimal(&self.nonce).map_err(CommitmentError::InvalidNonce)
    }

    /// Recompute the commitment from the stored opening.
    pub fn recompute(&self, hasher: &mut CircuitHasher) -> Result<Commitment, CommitmentError> {
        compute_commitment(hasher, &self.item_id, &self.nonce()?, self.price_minor_units)
    }
}

impl std::fmt::Debug for PurchaseSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurchaseSecret")
            .field("item_id", &self.item_id)
            .field("nonce", &"<redacted>")
            .field("price_minor_units", &self.price_minor_units)
            .field("commitment", &self.commitment)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

//! Catalog Merkle Tree
//!
//! Fixed-depth binary Poseidon tree over the seller's catalog. Leaf `i` is
//! `H(encode(itemId_i), price_i)`; empty slots hold the zero leaf and
//! `zeros[l] = H(zeros[l-1], zeros[l-1])`. The depth must match the
//! membership circuit.

use serde::{Deserialize, Serialize};

use super::commitment::{encode_item_id, CommitmentError};
use crate::core::{CircuitHasher, FieldElement};

/// Depth the deployed membership circuit is compiled for.
pub const TREE_LEVELS: usize = 8;

/// Deepest tree we will build. Capacity beyond this is not a catalog.
pub const MAX_TREE_LEVELS: usize = 24;

// =============================================================================
// LEAVES
// =============================================================================

/// One catalog entry as the tree sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogLeaf {
    /// Item identifier (decimal or UUID).
    pub item_id: String,
    /// Price in minor currency units.
    pub price_minor_units: u64,
}

impl CatalogLeaf {
    /// Create a leaf.
    pub fn new(item_id: impl Into<String>, price_minor_units: u64) -> Self {
        Self {
            item_id: item_id.into(),
            price_minor_units,
        }
    }

    /// `H(encode(itemId), price)`.
    pub fn hash(&self, hasher: &mut CircuitHasher) -> Result<FieldElement, CommitmentError> {
        let item = encode_item_id(&self.item_id)?;
        Ok(hasher.hash2(&item, &FieldElement::from_u64(self.price_minor_units))?)
    }
}

// =============================================================================
// TREE
// =============================================================================

/// Fully materialised catalog tree.
///
/// Only occupied nodes are stored per level; anything to the right of them
/// is the zero subtree of that height.
#[derive(Clone, Debug)]
pub struct CatalogTree {
    depth: usize,
    /// Occupied nodes, leaves at index 0, root level at `depth`.
    levels: Vec<Vec<FieldElement>>,
    /// Root of an all-empty subtree per height.
    zeros: Vec<FieldElement>,
}

impl CatalogTree {
    /// Hash every catalog entry and build all levels.
    pub fn build(
        leaves: &[CatalogLeaf],
        depth: usize,
        hasher: &mut CircuitHasher,
    ) -> Result<Self, CommitmentError> {
        if depth == 0 || depth > MAX_TREE_LEVELS {
            return Err(CommitmentError::UnsupportedDepth(depth));
        }
        let capacity = 1usize << depth;
        if leaves.len() > capacity {
            return Err(CommitmentError::CatalogTooLarge {
                items: leaves.len(),
                capacity,
            });
        }

        let mut zeros = Vec::with_capacity(depth + 1);
        zeros.push(FieldElement::zero());
        for level in 1..=depth {
            let below = zeros[level - 1];
            zeros.push(hasher.hash2(&below, &below)?);
        }

        let mut current = leaves
            .iter()
            .map(|leaf| leaf.hash(hasher))
            .collect::<Result<Vec<_>, _>>()?;

        let mut levels = Vec::with_capacity(depth + 1);
        for level in 0..depth {
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let right = pair.get(1).copied().unwrap_or(zeros[level]);
                next.push(hasher.hash2(&pair[0], &right)?);
            }
            levels.push(current);
            current = next;
        }
        levels.push(current);

        Ok(Self { depth, levels, zeros })
    }

    /// Tree depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of occupied leaves.
    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// `2^depth`.
    pub fn capacity(&self) -> usize {
        1usize << self.depth
    }

    /// Root commitment of the catalog.
    pub fn root(&self) -> FieldElement {
        self.node(self.depth, 0)
    }

    fn node(&self, level: usize, index: usize) -> FieldElement {
        self.levels[level]
            .get(index)
            .copied()
            .unwrap_or(self.zeros[level])
    }

    /// Authentication path for `leaf_index`.
    ///
    /// Any slot below capacity has a path, including empty ones.
    pub fn prove_membership(&self, leaf_index: usize) -> Result<MembershipProof, CommitmentError> {
        if leaf_index >= self.capacity() {
            return Err(CommitmentError::IndexOutOfRange {
                index: leaf_index,
                capacity: self.capacity(),
            });
        }

        let mut path_elements = Vec::with_capacity(self.depth);
        let mut path_indices = Vec::with_capacity(self.depth);
        let mut index = leaf_index;
        for level in 0..self.depth {
            path_elements.push(self.node(level, index ^ 1));
            path_indices.push((index % 2) as u8);
            index /= 2;
        }

        Ok(MembershipProof {
            root: self.root(),
            path_elements,
            path_indices,
        })
    }
}

// =============================================================================
// PROOF
// =============================================================================

/// Merkle authentication path in circuit layout.
///
/// `path_indices[l] == 0` means the running node is the left child at
/// level `l`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipProof {
    /// Root the path was generated against.
    pub root: FieldElement,
    /// Sibling per level, leaf level first.
    pub path_elements: Vec<FieldElement>,
    /// Side bit per level, leaf level first.
    pub path_indices: Vec<u8>,
}

impl MembershipProof {
    /// Fold `leaf` up the path.
    pub fn compute_root(
        &self,
        leaf: &FieldElement,
        hasher: &mut CircuitHasher,
    ) -> Result<FieldElement, CommitmentError> {
        let mut current = *leaf;
        for (sibling, side) in self.path_elements.iter().zip(&self.path_indices) {
            current = if *side == 0 {
                hasher.hash2(&current, sibling)?
            } else {
                hasher.hash2(sibling, &current)?
            };
        }
        Ok(current)
    }

    /// True if `leaf` folds to the embedded root.
    pub fn verify(
        &self,
        leaf: &FieldElement,
        hasher: &mut CircuitHasher,
    ) -> Result<bool, CommitmentError> {
        Ok(self.path_elements.len() == self.path_indices.len()
            && self.compute_root(leaf, hasher)? == self.root)
    }
}

// =============================================================================
// TESTS
// =============================================================================

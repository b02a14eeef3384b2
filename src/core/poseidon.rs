//! Circuit-compatible Poseidon hashing.
//!
//! Uses the circom parameterisation over BN254 so that leaves, nodes and
//! commitments computed here match what the membership circuit recomputes.

use ark_bn254::Fr;
use light_poseidon::{Poseidon, PoseidonHasher};
use thiserror::Error;

use super::field::FieldElement;

/// Poseidon failure. Only reachable with an unsupported arity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("poseidon hash failed: {0}")]
pub struct HashError(pub String);

/// Holds initialised Poseidon instances for the two arities the circuit uses.
///
/// Building the round constants is the expensive part, so one hasher is
/// created per tree/commitment computation and reused for every call.
pub struct CircuitHasher {
    pair: Poseidon<Fr>,
    triple: Poseidon<Fr>,
}

impl CircuitHasher {
    /// Load circom parameters for widths 3 and 4 (2 and 3 inputs).
    pub fn new() -> Result<Self, HashError> {
        let pair = Poseidon::<Fr>::new_circom(2).map_err(|e| HashError(e.to_string()))?;
        let triple = Poseidon::<Fr>::new_circom(3).map_err(|e| HashError(e.to_string()))?;
        Ok(Self { pair, triple })
    }

    /// `H(left, right)`: Merkle nodes and catalog leaves.
    pub fn hash2(
        &mut self,
        left: &FieldElement,
        right: &FieldElement,
    ) -> Result<FieldElement, HashError> {
        self.pair
            .hash(&[left.inner(), right.inner()])
            .map(FieldElement::from)
            .map_err(|e| HashError(e.to_string()))
    }

    /// `H(a, b, c)`: purchase commitments.
    pub fn hash3(
        &mut self,
        a: &FieldElement,
        b: &FieldElement,
        c: &FieldElement,
    ) -> Result<FieldElement, HashError> {
        self.triple
            .hash(&[a.inner(), b.inner(), c.inner()])
            .map(FieldElement::from)
            .map_err(|e| HashError(e.to_string()))
    }
}

impl std::fmt::Debug for CircuitHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CircuitHasher")
    }
}

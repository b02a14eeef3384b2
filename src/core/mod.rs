//! Core circuit primitives.
//!
//! Field encoding and Poseidon hashing shared by the commitment engine and
//! the catalog tree. Everything here is pure and deterministic.

pub mod field;
pub mod poseidon;

pub use field::{FieldElement, FieldError};
pub use poseidon::{CircuitHasher, HashError};

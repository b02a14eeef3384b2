//! Membership Proof System
//!
//! Proves that a purchase commitment opens to some catalog item without
//! revealing which one:
//! - Poseidon commitment to `(itemId, nonce, price)`
//! - Fixed-depth Poseidon tree over the catalog
//! - Witness assembly with local pre-checks
//! - Proof generation through an external engine
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PROOF SYSTEM                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  commitment.rs  - Commitment, nonce, persisted secret       │
//! │  merkle.rs      - Catalog tree and authentication paths     │
//! │  witness.rs     - Circuit input with pre-checks             │
//! │  prover.rs      - Proving engine and coordinator            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod commitment;
pub mod merkle;
pub mod prover;
pub mod witness;

// Re-export key types
pub use commitment::{
    compute_commitment, encode_item_id, generate_nonce, Commitment, CommitmentError,
    PurchaseSecret, NONCE_BYTES,
};
pub use merkle::{CatalogLeaf, CatalogTree, MembershipProof, MAX_TREE_LEVELS, TREE_LEVELS};
pub use prover::{ProofBundle, ProofCoordinator, ProvingEngine, SnarkjsProver};
pub use witness::{build_witness, ProofError, Witness};

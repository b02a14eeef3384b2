//! # Oblivious Purchase Client
//!
//! Buys one item from a seller's catalog without telling the seller which
//! item was bought. The buyer proves in zero knowledge that its payment
//! commitment opens to some catalog entry, then fetches that entry's content
//! key through a k-round 1-of-2 oblivious transfer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  OBLIVIOUS PURCHASE CLIENT                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Circuit primitives                       │
//! │  ├── field.rs    - BN254 scalar field encoding              │
//! │  └── poseidon.rs - Circom-compatible Poseidon               │
//! │                                                             │
//! │  crypto/         - Randomness, AES-GCM, P-256 ECDH          │
//! │                                                             │
//! │  proof/          - Membership proof                         │
//! │  ├── commitment.rs - Commitment and purchase secret         │
//! │  ├── merkle.rs   - Catalog tree                             │
//! │  ├── witness.rs  - Circuit input                            │
//! │  └── prover.rs   - Proving engine and coordinator           │
//! │                                                             │
//! │  ot/             - k-round oblivious transfer               │
//! │  retrieval.rs    - Key unwrap and asset decryption          │
//! │  store.rs        - Purchase secret persistence              │
//! │  market.rs       - Catalog, orders, checkout                │
//! │                                                             │
//! │  network/        - Purchase channel                         │
//! │  ├── protocol.rs - Message types                            │
//! │  ├── channel.rs  - WebSocket and in-memory transports       │
//! │  ├── session.rs  - Purchase state machine                   │
//! │  └── client.rs   - Session driver and CLI client            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## What the seller learns
//!
//! The order carries only a commitment and a price. The proof reveals the
//! catalog root, the price and the commitment. Each OT round reveals an
//! ephemeral public key. None of these depend on which leaf was chosen.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod crypto;
pub mod market;
pub mod network;
pub mod ot;
pub mod proof;
pub mod retrieval;
pub mod store;

// Re-export commonly used types
pub use config::{ClientConfig, ConfigError};
pub use core::{CircuitHasher, FieldElement};
pub use market::OrderId;
pub use network::{
    run_session, FailureReason, PurchaseClient, PurchaseSession, SessionFailure, SessionPhase,
};
pub use ot::{MasterKey, OtClient};
pub use proof::{CatalogLeaf, CatalogTree, Commitment, PurchaseSecret, TREE_LEVELS};
pub use retrieval::PlaintextAsset;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Protocol Messages
//!
//! Wire format for the purchase channel. Every frame is a JSON text message
//! tagged by `"type"`; messages with a body carry it under `"payload"`.

use serde::{Deserialize, Serialize};

use crate::proof::ProofBundle;

// =============================================================================
// CLIENT -> SELLER MESSAGES
// =============================================================================

/// Messages sent from the buyer to the seller.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Open the session with the buyer's credential.
    Init {
        /// Session credential (JWT).
        token: String,
    },

    /// Membership proof.
    ZkpProve {
        /// Proof and public signals.
        payload: ProofBundle,
    },

    /// Ready for OT rounds.
    OtAckStart,

    /// Ephemeral public key for a round.
    OtRoundResponse {
        /// Round and key.
        payload: RoundResponse,
    },

    /// Every round answered.
    OtRoundsComplete,

    /// Ask for the delivery locator of the chosen item.
    RequestSignedUrl {
        /// Chosen leaf.
        payload: SignedUrlRequest,
    },

    /// Asset decrypted.
    DownloadReady,
}

/// Client key for one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResponse {
    /// Round index.
    pub round: usize,
    /// Compressed SEC1 public key, hex.
    pub client_public_key: String,
}

/// Delivery request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlRequest {
    /// Leaf index of the purchased item.
    pub book_index: usize,
}

impl ClientMessage {
    /// Wire name, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "INIT",
            Self::ZkpProve { .. } => "ZKP_PROVE",
            Self::OtAckStart => "OT_ACK_START",
            Self::OtRoundResponse { .. } => "OT_ROUND_RESPONSE",
            Self::OtRoundsComplete => "OT_ROUNDS_COMPLETE",
            Self::RequestSignedUrl { .. } => "REQUEST_SIGNED_URL",
            Self::DownloadReady => "DOWNLOAD_READY",
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl std::fmt::Debug for ClientMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init { .. } => f.write_str("Init { token: <redacted> }"),
            Self::ZkpProve { payload } => f
                .debug_struct("ZkpProve")
                .field("public_signals", &payload.public_signals)
                .finish_non_exhaustive(),
            Self::OtRoundResponse { payload } => {
                f.debug_tuple("OtRoundResponse").field(payload).finish()
            }
            Self::RequestSignedUrl { payload } => {
                f.debug_tuple("RequestSignedUrl").field(payload).finish()
            }
            other => f.write_str(other.kind()),
        }
    }
}

// =============================================================================
// SELLER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from the seller to the buyer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Seller is ready to verify a proof.
    ZkpReady,

    /// Proof accepted; OT begins.
    OtStart {
        /// Catalog size.
        payload: OtStart,
    },

    /// Begin a round.
    OtRoundStart {
        /// Round index.
        payload: RoundStart,
    },

    /// Two keys and two sealed seeds for a round.
    OtRoundChallenge {
        /// Challenge body.
        payload: RoundChallengePayload,
    },

    /// Sealed content keys for every item.
    OtDeliver {
        /// Key bundle.
        payload: Deliver,
    },

    /// Where to fetch the sealed asset.
    SignedUrl {
        /// Delivery locator.
        payload: SignedUrl,
    },
}

/// Catalog size announced by the seller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtStart {
    /// Number of catalog items.
    #[serde(alias = "numItems")]
    pub num_books: usize,
}

/// Round index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStart {
    /// Round index.
    pub round: usize,
}

/// Round challenge, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundChallengePayload {
    /// Round index.
    pub round: usize,
    /// Seller public key for branch 0.
    #[serde(alias = "pubKey0")]
    pub g0: String,
    /// Seller public key for branch 1.
    #[serde(alias = "pubKey1")]
    pub g1: String,
    /// Sealed seed for branch 0.
    #[serde(alias = "cipher0")]
    pub e0: String,
    /// Sealed seed for branch 1.
    #[serde(alias = "cipher1")]
    pub e1: String,
}

/// Hex-encoded key bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deliver {
    /// One sealed content key per item.
    #[serde(alias = "encryptedKeyBundle")]
    pub encrypted_secrets: Vec<String>,
}

/// Delivery locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrl {
    /// URL of the sealed asset.
    #[serde(alias = "deliveryLocator")]
    pub signed_url: String,
}

impl ServerMessage {
    /// Wire name, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ZkpReady => "ZKP_READY",
            Self::OtStart { .. } => "OT_START",
            Self::OtRoundStart { .. } => "OT_ROUND_START",
            Self::OtRoundChallenge { .. } => "OT_ROUND_CHALLENGE",
            Self::OtDeliver { .. } => "OT_DELIVER",
            Self::SignedUrl { .. } => "SIGNED_URL",
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// TESTS
// =============================================================================

//! Purchase Session
//!
//! State machine for one order, from the credential handshake to the
//! decrypted asset. Each inbound message is matched against the current
//! phase; anything the phase does not expect fails the session. A failed
//! session drops all derived key material and records the phase and reason.
//!
//! ```text
//! Init ─► AwaitingProofTrigger ─► ProofSubmitted ─► AwaitingOtTrigger
//!   ─► OtRound(0..k) ─► OtComplete ─► AwaitingKeyBundle ─► KeyUnwrapped
//!   ─► AwaitingDelivery ─► Decrypting ─► Done
//!
//! any ─► Failed(reason)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use zeroize::Zeroizing;

use super::channel::ChannelError;
use super::credential::{precheck_credential, CredentialError};
use super::protocol::{
    ClientMessage, Deliver, OtStart, RoundChallengePayload, RoundResponse, ServerMessage,
    SignedUrl, SignedUrlRequest,
};
use crate::core::CircuitHasher;
use crate::crypto::CryptoProvider;
use crate::market::OrderId;
use crate::ot::{MasterKey, OtClient, OtError, RoundChallenge};
use crate::proof::{
    build_witness, CatalogLeaf, CatalogTree, CommitmentError, ProofCoordinator, ProofError,
    PurchaseSecret, Witness, TREE_LEVELS,
};
use crate::retrieval::{
    retrieve_and_decrypt, unwrap_content_key, ContentKey, Downloader, EncryptedKeyBundle,
    PlaintextAsset, RetrievalError,
};
use crate::store::{SecretStore, StoreError};

// =============================================================================
// PHASES
// =============================================================================

/// Progress within one OT round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStep {
    /// Waiting for `OT_ROUND_START`.
    AwaitingStart,
    /// Public key sent, waiting for `OT_ROUND_CHALLENGE`.
    AwaitingChallenge,
}

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Nothing sent yet.
    Init,
    /// Credential sent, waiting for `ZKP_READY`.
    AwaitingProofTrigger,
    /// Proof handed to the channel.
    ProofSubmitted,
    /// Waiting for `OT_START`.
    AwaitingOtTrigger,
    /// Inside round `round`.
    OtRound {
        /// Round index.
        round: usize,
        /// Step within the round.
        step: RoundStep,
    },
    /// Every seed recovered.
    OtComplete,
    /// Waiting for `OT_DELIVER`.
    AwaitingKeyBundle,
    /// Content key recovered.
    KeyUnwrapped,
    /// Waiting for `SIGNED_URL`.
    AwaitingDelivery,
    /// Fetching and opening the asset.
    Decrypting,
    /// Asset available.
    Done,
    /// Session abandoned.
    Failed(FailureReason),
}

impl SessionPhase {
    /// `Done` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OtRound { round, step } => write!(f, "OtRound({}, {:?})", round, step),
            Self::Failed(reason) => write!(f, "Failed({})", reason),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Why a session failed. Each reason has its own close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Catalog item has no field encoding.
    CatalogEncoding,
    /// Leaf index outside the tree or catalog.
    IndexOutOfRange,
    /// Stored opening does not match the order's commitment.
    CommitmentMismatch,
    /// Proving engine failed.
    ProofGeneration,
    /// A sealed value failed authentication.
    AeadFailure,
    /// Recovered seeds have the wrong length.
    SeedLengthMismatch,
    /// Message not valid in the current phase.
    UnexpectedMessage,
    /// Asset fetch failed.
    Download,
    /// Asset did not open under the content key.
    ContentDecrypt,
    /// Session deadline passed.
    Timeout,
    /// Seller's catalog size differs from ours.
    CatalogSizeMismatch,
    /// Frame is not a protocol message.
    MalformedMessage,
    /// Channel was opened for another order.
    ChannelMismatch,
    /// Channel went away.
    ChannelClosed,
    /// Secret could not be loaded or erased.
    SecretStore,
    /// Credential rejected locally.
    CredentialRejected,
}

impl FailureReason {
    /// Generic client-error close code.
    pub const GENERIC_CLOSE_CODE: u16 = 4000;

    /// Close code sent when failing with this reason.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::CatalogEncoding => 4001,
            Self::IndexOutOfRange => 4002,
            Self::CommitmentMismatch => 4003,
            Self::ProofGeneration => 4004,
            Self::AeadFailure => 4005,
            Self::SeedLengthMismatch => 4006,
            Self::UnexpectedMessage => 4007,
            Self::Download => 4008,
            Self::ContentDecrypt => 4009,
            Self::Timeout => 4010,
            Self::CatalogSizeMismatch => 4011,
            Self::MalformedMessage => 4012,
            Self::ChannelMismatch => 4013,
            Self::ChannelClosed => 4014,
            Self::SecretStore => 4015,
            Self::CredentialRejected => 4016,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Anything that ends a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Commitment or tree failure.
    #[error(transparent)]
    Commitment(#[from] CommitmentError),

    /// Witness or proof failure.
    #[error(transparent)]
    Proof(#[from] ProofError),

    /// OT failure.
    #[error(transparent)]
    Ot(#[from] OtError),

    /// Unwrap or delivery failure.
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    /// Secret storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Credential rejected before connecting.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Transport failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Message does not fit the phase.
    #[error("unexpected {message} in phase {phase}")]
    UnexpectedMessage {
        /// Phase when it arrived.
        phase: SessionPhase,
        /// Wire name.
        message: &'static str,
    },

    /// Seller announced a different catalog size.
    #[error("seller announced {announced} items, local catalog has {local}")]
    CatalogSizeMismatch {
        /// `numBooks` from the seller.
        announced: usize,
        /// Local catalog length.
        local: usize,
    },

    /// Channel opened for another order.
    #[error("channel is for order {channel}, session is for {session}")]
    ChannelMismatch {
        /// Session's order.
        session: OrderId,
        /// Channel's order.
        channel: OrderId,
    },

    /// Purchased item is no longer listed.
    #[error("item {0} is not in the catalog")]
    ItemNotInCatalog(String),

    /// Frame could not be parsed.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Deadline passed.
    #[error("session timed out after {0:?}")]
    Timeout(Duration),

    /// Session already ended.
    #[error("session already ended in {0}")]
    Terminated(SessionPhase),
}

impl SessionError {
    /// Taxonomy reason for this error.
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Commitment(e) => commitment_reason(e),
            Self::Proof(e) => match e {
                ProofError::ItemMismatch { .. }
                | ProofError::PriceMismatch { .. }
                | ProofError::CommitmentMismatch { .. } => FailureReason::CommitmentMismatch,
                ProofError::StaleRoot { .. } | ProofError::Generation(_) => {
                    FailureReason::ProofGeneration
                }
                ProofError::Commitment(inner) => commitment_reason(inner),
            },
            Self::Ot(e) => match e {
                OtError::SeedDecrypt { .. } => FailureReason::AeadFailure,
                OtError::SeedLengthMismatch { .. } | OtError::EmptySeedSet => {
                    FailureReason::SeedLengthMismatch
                }
                OtError::RoundOutOfOrder { .. }
                | OtError::RoundAlreadyComplete { .. }
                | OtError::Incomplete { .. } => FailureReason::UnexpectedMessage,
                OtError::AsymmetricChallenge { .. }
                | OtError::MalformedChallenge { .. }
                | OtError::BadServerKey { .. } => FailureReason::MalformedMessage,
                OtError::UnsupportedCatalogSize(_) => FailureReason::CatalogSizeMismatch,
                OtError::ChoiceOutOfRange { .. } => FailureReason::IndexOutOfRange,
            },
            Self::Retrieval(e) => match e {
                RetrievalError::KeyUnwrap(_) => FailureReason::AeadFailure,
                RetrievalError::BundleIndexOutOfRange { .. }
                | RetrievalError::BundleEncoding { .. } => FailureReason::MalformedMessage,
                RetrievalError::Download(_) => FailureReason::Download,
                RetrievalError::ContentDecrypt(_) => FailureReason::ContentDecrypt,
            },
            Self::Store(_) => FailureReason::SecretStore,
            Self::Credential(_) => FailureReason::CredentialRejected,
            Self::Channel(ChannelError::Encode(_)) => FailureReason::MalformedMessage,
            Self::Channel(_) => FailureReason::ChannelClosed,
            Self::UnexpectedMessage { .. } | Self::Terminated(_) => {
                FailureReason::UnexpectedMessage
            }
            Self::CatalogSizeMismatch { .. } => FailureReason::CatalogSizeMismatch,
            Self::ChannelMismatch { .. } => FailureReason::ChannelMismatch,
            Self::ItemNotInCatalog(_) => FailureReason::IndexOutOfRange,
            Self::Malformed(_) => FailureReason::MalformedMessage,
            Self::Timeout(_) => FailureReason::Timeout,
        }
    }
}

fn commitment_reason(e: &CommitmentError) -> FailureReason {
    match e {
        CommitmentError::CatalogTooLarge { .. } | CommitmentError::IndexOutOfRange { .. } => {
            FailureReason::IndexOutOfRange
        }
        CommitmentError::CatalogEncoding { .. }
        | CommitmentError::UnsupportedDepth(_)
        | CommitmentError::InvalidNonce(_)
        | CommitmentError::Hash(_) => FailureReason::CatalogEncoding,
    }
}

/// Terminal failure as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("purchase failed in {phase} ({reason}): {message}")]
pub struct SessionFailure {
    /// Phase the session was in when it failed.
    pub phase: SessionPhase,
    /// Taxonomy reason.
    pub reason: FailureReason,
    /// Human-readable description.
    pub message: String,
}

// =============================================================================
// CONFIGURATION & CONTEXT
// =============================================================================

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Depth of the catalog tree; must match the circuit.
    pub tree_levels: usize,
    /// Deadline for the whole session.
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tree_levels: TREE_LEVELS,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Collaborators a session works with.
pub struct SessionContext {
    /// Catalog snapshot, in the seller's canonical order.
    pub catalog: Vec<CatalogLeaf>,
    /// Proof generation.
    pub prover: ProofCoordinator,
    /// Asset fetcher.
    pub downloader: Arc<dyn Downloader>,
    /// Purchase secret storage.
    pub secrets: Arc<dyn SecretStore>,
    /// Randomness for OT key pairs.
    pub crypto: Box<dyn CryptoProvider>,
}

/// Snapshot published on every phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    /// New phase.
    pub phase: SessionPhase,
    /// OT rounds finished so far.
    pub rounds_completed: usize,
    /// OT rounds in this session (zero until `OT_START`).
    pub rounds_total: usize,
}

// =============================================================================
// SESSION
// =============================================================================

/// One purchase, driven message by message.
pub struct PurchaseSession {
    order_id: OrderId,
    credential: Zeroizing<String>,
    config: SessionConfig,
    ctx: SessionContext,
    secret: PurchaseSecret,
    leaf_index: usize,
    phase: SessionPhase,
    ot: Option<OtClient>,
    rounds_completed: usize,
    rounds_total: usize,
    master_key: Option<MasterKey>,
    content_key: Option<ContentKey>,
    asset: Option<PlaintextAsset>,
    failure: Option<SessionFailure>,
    progress: Option<watch::Sender<ProgressEvent>>,
}

impl PurchaseSession {
    /// Prepare a session for `order_id`.
    ///
    /// Fails before any network traffic if the credential is unusable, the
    /// secret is missing, or the purchased item is no longer listed.
    pub fn new(
        order_id: OrderId,
        credential: impl Into<String>,
        config: SessionConfig,
        ctx: SessionContext,
    ) -> Result<Self, SessionError> {
        let credential = Zeroizing::new(credential.into());
        precheck_credential(&credential)?;

        let secret = ctx.secrets.load(&order_id)?;
        let leaf_index = ctx
            .catalog
            .iter()
            .position(|leaf| leaf.item_id == secret.item_id)
            .ok_or_else(|| SessionError::ItemNotInCatalog(secret.item_id.clone()))?;

        debug!(order = %order_id, items = ctx.catalog.len(), "Session prepared");
        Ok(Self {
            order_id,
            credential,
            config,
            ctx,
            secret,
            leaf_index,
            phase: SessionPhase::Init,
            ot: None,
            rounds_completed: 0,
            rounds_total: 0,
            master_key: None,
            content_key: None,
            asset: None,
            failure: None,
            progress: None,
        })
    }

    /// Order this session is for.
    pub fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Failure details once the session is `Failed`.
    pub fn failure(&self) -> Option<&SessionFailure> {
        self.failure.as_ref()
    }

    /// Take the decrypted asset once the session is `Done`.
    pub fn take_asset(&mut self) -> Option<PlaintextAsset> {
        self.asset.take()
    }

    /// Subscribe to phase changes.
    pub fn progress(&mut self) -> watch::Receiver<ProgressEvent> {
        let event = self.progress_event();
        self.progress
            .get_or_insert_with(|| watch::channel(event).0)
            .subscribe()
    }

    fn progress_event(&self) -> ProgressEvent {
        ProgressEvent {
            phase: self.phase,
            rounds_completed: self.rounds_completed,
            rounds_total: self.rounds_total,
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        debug!(from = %self.phase, to = %phase, "Phase change");
        self.phase = phase;
        if let Some(tx) = &self.progress {
            tx.send_replace(self.progress_event());
        }
    }

    /// Bind the session to a channel and produce `INIT`.
    pub fn open(&mut self, channel_order: &OrderId) -> Result<ClientMessage, SessionError> {
        let result = self.try_open(channel_order);
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    fn try_open(&mut self, channel_order: &OrderId) -> Result<ClientMessage, SessionError> {
        if self.phase != SessionPhase::Init {
            return Err(SessionError::Terminated(self.phase));
        }
        if *channel_order != self.order_id {
            return Err(SessionError::ChannelMismatch {
                session: self.order_id.clone(),
                channel: channel_order.clone(),
            });
        }
        self.set_phase(SessionPhase::AwaitingProofTrigger);
        Ok(ClientMessage::Init {
            token: self.credential.to_string(),
        })
    }

    /// Process one inbound message and return the replies to send.
    pub async fn handle(
        &mut self,
        message: ServerMessage,
    ) -> Result<Vec<ClientMessage>, SessionError> {
        if self.phase.is_terminal() {
            return Err(SessionError::Terminated(self.phase));
        }
        let result = self.dispatch(message).await;
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    async fn dispatch(
        &mut self,
        message: ServerMessage,
    ) -> Result<Vec<ClientMessage>, SessionError> {
        use RoundStep::{AwaitingChallenge, AwaitingStart};
        use SessionPhase as P;

        match (self.phase, message) {
            (P::AwaitingProofTrigger, ServerMessage::ZkpReady) => self.on_zkp_ready().await,
            (P::AwaitingOtTrigger, ServerMessage::OtStart { payload }) => self.on_ot_start(payload),
            (P::OtRound { round, step: AwaitingStart }, ServerMessage::OtRoundStart { payload })
                if payload.round == round =>
            {
                self.on_round_start(round)
            }
            (
                P::OtRound { round, step: AwaitingChallenge },
                ServerMessage::OtRoundChallenge { payload },
            ) if payload.round == round => self.on_round_challenge(payload),
            (P::AwaitingKeyBundle, ServerMessage::OtDeliver { payload }) => {
                self.on_deliver(payload)
            }
            (P::AwaitingDelivery, ServerMessage::SignedUrl { payload }) => {
                self.on_signed_url(payload).await
            }
            (phase, message) => Err(SessionError::UnexpectedMessage {
                phase,
                message: message.kind(),
            }),
        }
    }

    /// Move to `Failed`, dropping every derived secret. Idempotent.
    pub fn fail(&mut self, err: &SessionError) -> FailureReason {
        if let SessionPhase::Failed(reason) = self.phase {
            return reason;
        }
        let reason = err.reason();
        error!(order = %self.order_id, phase = %self.phase, %reason, "Purchase failed: {}", err);

        self.ot = None;
        self.master_key = None;
        self.content_key = None;
        self.failure = Some(SessionFailure {
            phase: self.phase,
            reason,
            message: err.to_string(),
        });
        self.set_phase(SessionPhase::Failed(reason));
        reason
    }

    // -------------------------------------------------------------------------
    // Handlers
    // -------------------------------------------------------------------------

    fn prepare_witness(&self) -> Result<Witness, SessionError> {
        let mut hasher = CircuitHasher::new().map_err(CommitmentError::from)?;
        let tree = CatalogTree::build(&self.ctx.catalog, self.config.tree_levels, &mut hasher)?;
        let path = tree.prove_membership(self.leaf_index)?;
        let leaf = self
            .ctx
            .catalog
            .get(self.leaf_index)
            .ok_or_else(|| SessionError::ItemNotInCatalog(self.secret.item_id.clone()))?;

        Ok(build_witness(
            leaf,
            &self.secret,
            &path,
            &tree.root(),
            &self.secret.commitment,
            &mut hasher,
        )?)
    }

    #[instrument(skip(self), fields(order = %self.order_id))]
    async fn on_zkp_ready(&mut self) -> Result<Vec<ClientMessage>, SessionError> {
        let witness = self.prepare_witness()?;
        let bundle = self.ctx.prover.request_proof(witness).await?;

        self.set_phase(SessionPhase::ProofSubmitted);
        info!("Membership proof submitted");
        self.set_phase(SessionPhase::AwaitingOtTrigger);
        Ok(vec![ClientMessage::ZkpProve { payload: bundle }])
    }

    fn on_ot_start(&mut self, payload: OtStart) -> Result<Vec<ClientMessage>, SessionError> {
        let local = self.ctx.catalog.len();
        if payload.num_books != local {
            return Err(SessionError::CatalogSizeMismatch {
                announced: payload.num_books,
                local,
            });
        }

        let ot = OtClient::new(self.leaf_index, payload.num_books)?;
        self.rounds_total = ot.round_count();
        self.ot = Some(ot);
        info!(rounds = self.rounds_total, "Oblivious transfer started");

        self.set_phase(SessionPhase::OtRound {
            round: 0,
            step: RoundStep::AwaitingStart,
        });
        Ok(vec![ClientMessage::OtAckStart])
    }

    fn on_round_start(&mut self, round: usize) -> Result<Vec<ClientMessage>, SessionError> {
        let ot = self.ot.as_mut().ok_or(SessionError::UnexpectedMessage {
            phase: self.phase,
            message: "OT_ROUND_START",
        })?;
        let client_public_key = ot.start_round(round, self.ctx.crypto.as_mut())?;

        self.set_phase(SessionPhase::OtRound {
            round,
            step: RoundStep::AwaitingChallenge,
        });
        Ok(vec![ClientMessage::OtRoundResponse {
            payload: RoundResponse {
                round,
                client_public_key,
            },
        }])
    }

    fn on_round_challenge(
        &mut self,
        payload: RoundChallengePayload,
    ) -> Result<Vec<ClientMessage>, SessionError> {
        let challenge = RoundChallenge::from_hex(
            payload.round,
            [&payload.g0, &payload.g1],
            [&payload.e0, &payload.e1],
        )?;

        let ot = self.ot.as_mut().ok_or(SessionError::UnexpectedMessage {
            phase: self.phase,
            message: "OT_ROUND_CHALLENGE",
        })?;
        ot.complete_round(&challenge)?;
        self.rounds_completed = ot.completed_rounds();

        if !ot.is_complete() {
            self.set_phase(SessionPhase::OtRound {
                round: payload.round + 1,
                step: RoundStep::AwaitingStart,
            });
            return Ok(Vec::new());
        }

        let finished = self.ot.take().ok_or(OtError::Incomplete {
            completed: 0,
            total: self.rounds_total,
        })?;
        self.master_key = Some(finished.finish()?);
        self.set_phase(SessionPhase::OtComplete);
        info!("All OT rounds complete");

        self.set_phase(SessionPhase::AwaitingKeyBundle);
        Ok(vec![ClientMessage::OtRoundsComplete])
    }

    fn on_deliver(&mut self, payload: Deliver) -> Result<Vec<ClientMessage>, SessionError> {
        let bundle = EncryptedKeyBundle::from_hex(&payload.encrypted_secrets)?;
        let master = self.master_key.take().ok_or(SessionError::UnexpectedMessage {
            phase: self.phase,
            message: "OT_DELIVER",
        })?;
        let content_key = unwrap_content_key(&master, &bundle, self.leaf_index)?;
        drop(master);

        self.content_key = Some(content_key);
        self.set_phase(SessionPhase::KeyUnwrapped);

        self.set_phase(SessionPhase::AwaitingDelivery);
        Ok(vec![ClientMessage::RequestSignedUrl {
            payload: SignedUrlRequest {
                book_index: self.leaf_index,
            },
        }])
    }

    async fn on_signed_url(
        &mut self,
        payload: SignedUrl,
    ) -> Result<Vec<ClientMessage>, SessionError> {
        let key = self.content_key.take().ok_or(SessionError::UnexpectedMessage {
            phase: self.phase,
            message: "SIGNED_URL",
        })?;
        self.set_phase(SessionPhase::Decrypting);

        let downloader = Arc::clone(&self.ctx.downloader);
        let asset = retrieve_and_decrypt(downloader.as_ref(), &payload.signed_url, key).await?;

        // The asset is already in hand; a stale secret file is not worth failing over.
        if let Err(e) = self.ctx.secrets.erase(&self.order_id) {
            warn!(order = %self.order_id, error = %e, "Could not erase purchase secret");
        }

        self.asset = Some(asset);
        self.set_phase(SessionPhase::Done);
        info!(order = %self.order_id, "Purchase complete");
        Ok(vec![ClientMessage::DownloadReady])
    }
}

impl fmt::Debug for PurchaseSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PurchaseSession")
            .field("order_id", &self.order_id)
            .field("phase", &self.phase)
            .field("leaf_index", &self.leaf_index)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SeededCrypto;
    use crate::network::protocol::RoundStart;
    use crate::proof::{ProofBundle, ProvingEngine};
    use crate::store::MemorySecretStore;
    use futures_util::future::BoxFuture;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProver(AtomicUsize);

    impl ProvingEngine for CountingProver {
        fn full_prove(&self, witness: &Witness) -> Result<ProofBundle, ProofError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ProofBundle {
                proof: serde_json::json!({}),
                public_signals: witness.public_inputs().to_vec(),
            })
        }
    }

    struct NoDownloads;

    impl Downloader for NoDownloads {
        fn fetch<'a>(&'a self, _: &'a str) -> BoxFuture<'a, Result<Vec<u8>, RetrievalError>> {
            Box::pin(async { Err(RetrievalError::Download("offline".into())) })
        }
    }

    fn credential() -> String {
        encode(
            &Header::default(),
            &serde_json::json!({ "sub": "buyer", "exp": 4_000_000_000u64 }),
            &EncodingKey::from_secret(b"k"),
        )
        .unwrap()
    }

    fn catalog() -> Vec<CatalogLeaf> {
        (1..=4).map(|i| CatalogLeaf::new(i.to_string(), i * 100)).collect()
    }

    fn session_with(
        secret: PurchaseSecret,
        prover: Arc<CountingProver>,
    ) -> (PurchaseSession, Arc<MemorySecretStore>) {
        let order = OrderId::parse("order-9").unwrap();
        let store = Arc::new(MemorySecretStore::new());
        store.save(&order, &secret).unwrap();
        let ctx = SessionContext {
            catalog: catalog(),
            prover: ProofCoordinator::new(prover),
            downloader: Arc::new(NoDownloads),
            secrets: store.clone(),
            crypto: Box::new(SeededCrypto::new(1)),
        };
        let config = SessionConfig {
            tree_levels: 2,
            ..Default::default()
        };
        (PurchaseSession::new(order, credential(), config, ctx).unwrap(), store)
    }

    fn secret_for(item: &str, price: u64) -> PurchaseSecret {
        let mut hasher = CircuitHasher::new().unwrap();
        let mut crypto = SeededCrypto::new(2);
        PurchaseSecret::generate(&mut hasher, &mut crypto, item, price).unwrap()
    }

    fn prover() -> Arc<CountingProver> {
        Arc::new(CountingProver(AtomicUsize::new(0)))
    }

    #[tokio::test]
    async fn test_happy_path_up_to_ot() {
        let (mut session, _) = session_with(secret_for("3", 300), prover());
        let order = session.order_id().clone();

        assert!(matches!(session.open(&order).unwrap(), ClientMessage::Init { .. }));
        let replies = session.handle(ServerMessage::ZkpReady).await.unwrap();
        assert!(matches!(replies[0], ClientMessage::ZkpProve { .. }));
        assert_eq!(session.phase(), SessionPhase::AwaitingOtTrigger);

        let replies = session
            .handle(ServerMessage::OtStart { payload: OtStart { num_books: 4 } })
            .await
            .unwrap();
        assert_eq!(replies, vec![ClientMessage::OtAckStart]);

        let replies = session
            .handle(ServerMessage::OtRoundStart { payload: RoundStart { round: 0 } })
            .await
            .unwrap();
        match &replies[0] {
            ClientMessage::OtRoundResponse { payload } => {
                assert_eq!(payload.round, 0);
                assert_eq!(payload.client_public_key.len(), 66);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            session.phase(),
            SessionPhase::OtRound { round: 0, step: RoundStep::AwaitingChallenge }
        );
    }

    #[tokio::test]
    async fn test_challenge_before_ack_is_unexpected() {
        let (mut session, _) = session_with(secret_for("1", 100), prover());
        let order = session.order_id().clone();
        session.open(&order).unwrap();

        let err = session
            .handle(ServerMessage::OtRoundChallenge {
                payload: RoundChallengePayload {
                    round: 0,
                    g0: String::new(),
                    g1: String::new(),
                    e0: String::new(),
                    e1: String::new(),
                },
            })
            .await
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::UnexpectedMessage);
        assert_eq!(session.phase(), SessionPhase::Failed(FailureReason::UnexpectedMessage));
        assert_eq!(
            session.failure().unwrap().phase,
            SessionPhase::AwaitingProofTrigger
        );
    }

    #[tokio::test]
    async fn test_commitment_mismatch_never_reaches_prover() {
        let mut secret = secret_for("2", 200);
        secret.commitment = crate::proof::Commitment(crate::core::FieldElement::from_u64(1));

        let counting = prover();
        let (mut session, _) = session_with(secret, counting.clone());
        let order = session.order_id().clone();
        session.open(&order).unwrap();

        let err = session.handle(ServerMessage::ZkpReady).await.unwrap_err();
        assert_eq!(err.reason(), FailureReason::CommitmentMismatch);
        assert_eq!(err.reason().close_code(), 4003);
        assert_eq!(counting.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_catalog_size_mismatch() {
        let (mut session, _) = session_with(secret_for("1", 100), prover());
        let order = session.order_id().clone();
        session.open(&order).unwrap();
        session.handle(ServerMessage::ZkpReady).await.unwrap();

        let err = session
            .handle(ServerMessage::OtStart { payload: OtStart { num_books: 5 } })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::CatalogSizeMismatch { announced: 5, local: 4 }));
    }

    #[tokio::test]
    async fn test_wrong_round_number_is_unexpected() {
        let (mut session, _) = session_with(secret_for("1", 100), prover());
        let order = session.order_id().clone();
        session.open(&order).unwrap();
        session.handle(ServerMessage::ZkpReady).await.unwrap();
        session
            .handle(ServerMessage::OtStart { payload: OtStart { num_books: 4 } })
            .await
            .unwrap();

        let err = session
            .handle(ServerMessage::OtRoundStart { payload: RoundStart { round: 1 } })
            .await
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::UnexpectedMessage);
    }

    #[tokio::test]
    async fn test_channel_mismatch() {
        let (mut session, _) = session_with(secret_for("1", 100), prover());
        let other = OrderId::parse("order-10").unwrap();
        let err = session.open(&other).unwrap_err();
        assert_eq!(err.reason(), FailureReason::ChannelMismatch);
        assert!(session.phase().is_terminal());
    }

    #[tokio::test]
    async fn test_terminal_session_rejects_messages() {
        let (mut session, _) = session_with(secret_for("1", 100), prover());
        let other = OrderId::parse("order-10").unwrap();
        let _ = session.open(&other);
        let reason = session.phase();

        assert!(matches!(
            session.handle(ServerMessage::ZkpReady).await,
            Err(SessionError::Terminated(_))
        ));
        assert_eq!(session.phase(), reason);
    }

    #[tokio::test]
    async fn test_progress_events() {
        let (mut session, _) = session_with(secret_for("1", 100), prover());
        let rx = session.progress();
        let order = session.order_id().clone();
        session.open(&order).unwrap();
        assert_eq!(rx.borrow().phase, SessionPhase::AwaitingProofTrigger);
    }

    #[test]
    fn test_missing_secret_fails_before_connecting() {
        let ctx = SessionContext {
            catalog: catalog(),
            prover: ProofCoordinator::new(prover()),
            downloader: Arc::new(NoDownloads),
            secrets: Arc::new(MemorySecretStore::new()),
            crypto: Box::new(SeededCrypto::new(1)),
        };
        let err = PurchaseSession::new(
            OrderId::parse("nope").unwrap(),
            credential(),
            SessionConfig::default(),
            ctx,
        )
        .unwrap_err();
        assert_eq!(err.reason(), FailureReason::SecretStore);
    }

    #[test]
    fn test_expired_credential_rejected() {
        let order = OrderId::parse("order-9").unwrap();
        let store = Arc::new(MemorySecretStore::new());
        store.save(&order, &secret_for("1", 100)).unwrap();
        let ctx = SessionContext {
            catalog: catalog(),
            prover: ProofCoordinator::new(prover()),
            downloader: Arc::new(NoDownloads),
            secrets: store,
            crypto: Box::new(SeededCrypto::new(1)),
        };
        let expired = encode(
            &Header::default(),
            &serde_json::json!({ "sub": "buyer", "exp": 10 }),
            &EncodingKey::from_secret(b"k"),
        )
        .unwrap();
        let err = PurchaseSession::new(order, expired, SessionConfig::default(), ctx).unwrap_err();
        assert_eq!(err.reason(), FailureReason::CredentialRejected);
        assert_eq!(err.reason().close_code(), 4016);
    }

    #[test]
    fn test_close_codes_are_distinct() {
        use std::collections::HashSet;
        let reasons = [
            FailureReason::CatalogEncoding,
            FailureReason::IndexOutOfRange,
            FailureReason::CommitmentMismatch,
            FailureReason::ProofGeneration,
            FailureReason::AeadFailure,
            FailureReason::SeedLengthMismatch,
            FailureReason::UnexpectedMessage,
            FailureReason::Download,
            FailureReason::ContentDecrypt,
            FailureReason::Timeout,
            FailureReason::CatalogSizeMismatch,
            FailureReason::MalformedMessage,
            FailureReason::ChannelMismatch,
            FailureReason::ChannelClosed,
            FailureReason::SecretStore,
            FailureReason::CredentialRejected,
        ];
        let codes: HashSet<u16> = reasons.iter().map(FailureReason::close_code).collect();
        assert_eq!(codes.len(), reasons.len());
        assert!(!codes.contains(&FailureReason::GENERIC_CLOSE_CODE));
    }
}

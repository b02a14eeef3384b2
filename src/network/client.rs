//! Purchase Client
//!
//! `run_session` pumps one channel through a [`PurchaseSession`]: it sends
//! `INIT`, then handles one inbound message at a time, racing each step
//! against the session deadline and the channel's closed flag. On failure
//! it closes the channel with the reason's close code.
//!
//! [`PurchaseClient`] wires the HTTP collaborators, the secret store and the
//! prover together for the CLI.

use std::sync::Arc;

use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tracing::{info, instrument, warn};

use super::channel::{wait_closed, Channel, ChannelError, Inbound, WsChannel, CLOSE_NORMAL};
use super::session::{
    FailureReason, PurchaseSession, SessionContext, SessionError, SessionFailure, SessionPhase,
};
use crate::config::{ClientConfig, ConfigError};
use crate::crypto::OsCrypto;
use crate::market::{
    prepare_purchase, CatalogSource, HttpCatalog, HttpOrderApi, MarketError, OrderId,
};
use crate::proof::{ProofCoordinator, ProvingEngine, SnarkjsProver};
use crate::retrieval::{Downloader, HttpDownloader, PlaintextAsset};
use crate::store::{FileSecretStore, SecretStore, StoreError};

// =============================================================================
// DRIVER
// =============================================================================

/// Run `session` over `channel` to completion.
///
/// Returns the decrypted asset, or the failure the session ended with. The
/// channel is closed either way.
#[instrument(skip_all, fields(order = %session.order_id()))]
pub async fn run_session(
    session: &mut PurchaseSession,
    channel: &mut dyn Channel,
) -> Result<PlaintextAsset, SessionFailure> {
    match drive(session, channel).await {
        Ok(()) => {
            channel.close(CLOSE_NORMAL, "purchase complete".to_string()).await;
            session.take_asset().ok_or_else(|| SessionFailure {
                phase: session.phase(),
                reason: FailureReason::UnexpectedMessage,
                message: "session finished without an asset".to_string(),
            })
        }
        Err(err) => {
            let reason = session.fail(&err);
            channel.close(reason.close_code(), reason.to_string()).await;
            Err(session.failure().cloned().unwrap_or_else(|| SessionFailure {
                phase: session.phase(),
                reason,
                message: err.to_string(),
            }))
        }
    }
}

async fn drive(
    session: &mut PurchaseSession,
    channel: &mut dyn Channel,
) -> Result<(), SessionError> {
    let timeout = session.config().timeout;
    let deadline = Instant::now() + timeout;
    let mut closed = channel.closed();

    let channel_order = channel.order_id().clone();
    let init = session.open(&channel_order)?;
    channel.send(init).await?;

    while session.phase() != SessionPhase::Done {
        let inbound = tokio::select! {
            biased;
            _ = sleep_until(deadline) => return Err(SessionError::Timeout(timeout)),
            frame = channel.recv() => frame,
            _ = wait_closed(&mut closed) => return Err(ChannelError::Closed.into()),
        };

        let message = match inbound {
            Some(Inbound::Message(message)) => message,
            Some(Inbound::Malformed(detail)) => return Err(SessionError::Malformed(detail)),
            None => return Err(ChannelError::Closed.into()),
        };

        let replies = tokio::select! {
            biased;
            _ = sleep_until(deadline) => return Err(SessionError::Timeout(timeout)),
            _ = wait_closed(&mut closed) => return Err(ChannelError::Closed.into()),
            replies = session.handle(message) => replies?,
        };

        for reply in replies {
            if let Err(e) = channel.send(reply).await {
                if session.phase() == SessionPhase::Done {
                    warn!("Could not acknowledge delivery: {}", e);
                    break;
                }
                return Err(e.into());
            }
        }
    }
    Ok(())
}

// =============================================================================
// CLIENT
// =============================================================================

/// Top-level client failure.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Bad or incomplete configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Catalog or order failure.
    #[error(transparent)]
    Market(#[from] MarketError),

    /// Session could not start.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Session ran and failed.
    #[error(transparent)]
    Failed(#[from] SessionFailure),

    /// Secret storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Checkout, retrieval and abandonment against one marketplace.
pub struct PurchaseClient {
    config: ClientConfig,
    http: reqwest::Client,
    secrets: Arc<dyn SecretStore>,
    prover: Arc<dyn ProvingEngine>,
    downloader: Arc<dyn Downloader>,
}

impl PurchaseClient {
    /// Client with file-backed secrets, `snarkjs` proving and HTTP delivery.
    pub fn new(config: ClientConfig) -> Self {
        let http = reqwest::Client::new();
        Self {
            secrets: Arc::new(FileSecretStore::new(&config.secret_dir)),
            prover: Arc::new(SnarkjsProver::new(
                &config.snarkjs,
                &config.circuit_wasm,
                &config.circuit_zkey,
            )),
            downloader: Arc::new(HttpDownloader::new(http.clone())),
            http,
            config,
        }
    }

    /// Replace the proving engine.
    pub fn with_prover(mut self, prover: Arc<dyn ProvingEngine>) -> Self {
        self.prover = prover;
        self
    }

    /// Replace the secret store.
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Commit to `item_id`, place the order and store the secret.
    #[instrument(skip(self))]
    pub async fn checkout(&self, item_id: &str) -> Result<OrderId, ClientError> {
        let token = self.config.require_token()?;
        let catalog = HttpCatalog::new(self.http.clone(), &self.config.api_url)
            .fetch_catalog()
            .await?;
        let orders = HttpOrderApi::new(self.http.clone(), &self.config.api_url, token);
        let mut crypto = OsCrypto;

        Ok(prepare_purchase(&catalog, item_id, &orders, self.secrets.as_ref(), &mut crypto).await?)
    }

    /// Run the purchase protocol for a placed order.
    #[instrument(skip(self))]
    pub async fn retrieve(&self, order_id: OrderId) -> Result<PlaintextAsset, ClientError> {
        let token = self.config.require_token()?;
        let catalog = HttpCatalog::new(self.http.clone(), &self.config.api_url)
            .fetch_catalog()
            .await?;

        let ctx = SessionContext {
            catalog,
            prover: ProofCoordinator::new(Arc::clone(&self.prover)),
            downloader: Arc::clone(&self.downloader),
            secrets: Arc::clone(&self.secrets),
            crypto: Box::new(OsCrypto),
        };
        let mut session =
            PurchaseSession::new(order_id.clone(), token, self.config.session(), ctx)?;

        let mut channel = WsChannel::connect(&self.config.ws_url, order_id)
            .await
            .map_err(SessionError::from)?;
        let asset = run_session(&mut session, &mut channel).await?;

        info!(bytes = asset.as_bytes().len(), "Asset retrieved");
        Ok(asset)
    }

    /// Forget an order: erase its secret.
    pub fn abandon(&self, order_id: &OrderId) -> Result<(), ClientError> {
        self.secrets.erase(order_id)?;
        info!(order = %order_id, "Order abandoned");
        Ok(())
    }
}

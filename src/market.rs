//! Seller marketplace collaborators.
//!
//! Catalog listing, order creation and checkout. Checkout runs before the
//! purchase protocol: it commits to the chosen item, registers the order with
//! only the commitment and price, and stores the opening locally.

use std::fmt;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument};

use crate::core::CircuitHasher;
use crate::crypto::CryptoProvider;
use crate::proof::{CatalogLeaf, Commitment, CommitmentError, PurchaseSecret};
use crate::store::{SecretStore, StoreError};

// =============================================================================
// ORDER ID
// =============================================================================

/// Seller-assigned order identifier.
///
/// Restricted to URL- and filename-safe characters since it is embedded in
/// the channel path and the secret file name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderId(String);

impl OrderId {
    /// Validate an order id.
    pub fn parse(raw: &str) -> Result<Self, MarketError> {
        let valid = !raw.is_empty()
            && raw.len() <= 128
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(MarketError::InvalidOrderId(raw.to_string()))
        }
    }

    /// Borrow the id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for OrderId {
    type Error = MarketError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OrderId> for String {
    fn from(id: OrderId) -> Self {
        id.0
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Catalog, order or checkout failure.
#[derive(Debug, Error)]
pub enum MarketError {
    /// Order id contains characters outside `[A-Za-z0-9_-]`.
    #[error("invalid order id {0:?}")]
    InvalidOrderId(String),

    /// Catalog entry lacks a usable id or price.
    #[error("catalog entry {index} is malformed: {detail}")]
    MalformedCatalog {
        /// Entry position.
        index: usize,
        /// What is wrong.
        detail: String,
    },

    /// Item is not listed.
    #[error("item {0} is not in the catalog")]
    ItemNotListed(String),

    /// HTTP failure talking to the seller.
    #[error("seller API: {0}")]
    Http(String),

    /// Order response had no order id.
    #[error("order response carries no order id")]
    MissingOrderId,

    /// Commitment could not be formed.
    #[error(transparent)]
    Commitment(#[from] CommitmentError),

    /// Secret could not be persisted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<reqwest::Error> for MarketError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

// =============================================================================
// CATALOG
// =============================================================================

/// Source of the seller's current catalog, in canonical order.
pub trait CatalogSource: Send + Sync {
    /// Fetch every listed item.
    fn fetch_catalog(&self) -> BoxFuture<'_, Result<Vec<CatalogLeaf>, MarketError>>;
}

/// Convert listing JSON into tree leaves.
///
/// Accepts `id` as string or integer and the price as integer
/// `price_cents`/`priceInCents` or decimal `price` in major units.
pub fn parse_catalog(entries: &[Value]) -> Result<Vec<CatalogLeaf>, MarketError> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let malformed = |detail: &str| MarketError::MalformedCatalog {
                index,
                detail: detail.to_string(),
            };

            let id = match entry.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) if n.is_u64() => n.to_string(),
                _ => return Err(malformed("missing or non-integer id")),
            };

            let cents = entry
                .get("price_cents")
                .or_else(|| entry.get("priceInCents"))
                .and_then(Value::as_u64);
            let price = match cents {
                Some(cents) => cents,
                None => {
                    let major = entry
                        .get("price")
                        .and_then(Value::as_f64)
                        .ok_or_else(|| malformed("missing price"))?;
                    if !major.is_finite() || major < 0.0 {
                        return Err(malformed("negative or non-finite price"));
                    }
                    (major * 100.0).round() as u64
                }
            };

            Ok(CatalogLeaf::new(id, price))
        })
        .collect()
}

/// `GET {api}/books`.
#[derive(Clone, Debug)]
pub struct HttpCatalog {
    client: reqwest::Client,
    api_url: String,
}

impl HttpCatalog {
    /// Catalog at `api_url`.
    pub fn new(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }
}

impl CatalogSource for HttpCatalog {
    fn fetch_catalog(&self) -> BoxFuture<'_, Result<Vec<CatalogLeaf>, MarketError>> {
        Box::pin(async move {
            let url = format!("{}/books", self.api_url.trim_end_matches('/'));
            let entries: Vec<Value> = self
                .client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            let leaves = parse_catalog(&entries)?;
            info!(items = leaves.len(), "Catalog fetched");
            Ok(leaves)
        })
    }
}

// =============================================================================
// ORDERS
// =============================================================================

/// Registers an order against a commitment.
pub trait OrderApi: Send + Sync {
    /// Create an order; returns the seller's order id.
    fn create_order<'a>(
        &'a self,
        commitment: &'a Commitment,
        price_minor_units: u64,
    ) -> BoxFuture<'a, Result<OrderId, MarketError>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderRequest {
    commitment_hash: String,
    price_in_cents: u64,
}

/// Extract the order id from an order response.
pub fn parse_order_response(body: &Value) -> Result<OrderId, MarketError> {
    ["id", "purchaseId", "orderId"]
        .iter()
        .find_map(|key| match body.get(*key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .ok_or(MarketError::MissingOrderId)
        .and_then(|raw| OrderId::parse(&raw))
}

/// `POST {api}/api/orders` with a bearer credential.
#[derive(Clone, Debug)]
pub struct HttpOrderApi {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl HttpOrderApi {
    /// Order endpoint at `api_url`, authenticated with `token`.
    pub fn new(
        client: reqwest::Client,
        api_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            token: token.into(),
        }
    }
}

impl OrderApi for HttpOrderApi {
    fn create_order<'a>(
        &'a self,
        commitment: &'a Commitment,
        price_minor_units: u64,
    ) -> BoxFuture<'a, Result<OrderId, MarketError>> {
        Box::pin(async move {
            let url = format!("{}/api/orders", self.api_url.trim_end_matches('/'));
            let body: Value = self
                .client
                .post(&url)
                .bearer_auth(&self.token)
                .json(&CreateOrderRequest {
                    commitment_hash: commitment.to_decimal(),
                    price_in_cents: price_minor_units,
                })
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            parse_order_response(&body)
        })
    }
}

// =============================================================================
// CHECKOUT
// =============================================================================

/// Commit to `item_id`, register the order and persist the opening.
///
/// Only the commitment and price leave this device. The secret is saved
/// under the returned order id.
#[instrument(skip(catalog, orders, secrets, crypto))]
pub async fn prepare_purchase(
    catalog: &[CatalogLeaf],
    item_id: &str,
    orders: &dyn OrderApi,
    secrets: &dyn SecretStore,
    crypto: &mut dyn CryptoProvider,
) -> Result<OrderId, MarketError> {
    let leaf = catalog
        .iter()
        .find(|leaf| leaf.item_id == item_id)
        .ok_or_else(|| MarketError::ItemNotListed(item_id.to_string()))?;

    let mut hasher = CircuitHasher::new().map_err(CommitmentError::from)?;
    let secret =
        PurchaseSecret::generate(&mut hasher, crypto, &leaf.item_id, leaf.price_minor_units)?;

    let order_id = orders
        .create_order(&secret.commitment, secret.price_minor_units)
        .await?;
    secrets.save(&order_id, &secret)?;

    info!(order = %order_id, "Order placed");
    Ok(order_id)
}

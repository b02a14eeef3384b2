//! Key unwrap and content retrieval.
//!
//! The seller's key bundle has one sealed content key per catalog entry, all
//! sealed under per-entry master keys. Only the entry at the chosen leaf
//! opens under this session's master key. The content key then opens the
//! downloaded asset, after which it is wiped.

use futures_util::future::BoxFuture;
use tracing::{info, instrument};
use zeroize::Zeroizing;

use crate::crypto::{self, CryptoError};
use crate::ot::MasterKey;

// =============================================================================
// ERRORS
// =============================================================================

/// Failure while unwrapping or fetching content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetrievalError {
    /// Bundle has no entry at the chosen leaf.
    #[error("key bundle has {len} entries, no entry {index}")]
    BundleIndexOutOfRange {
        /// Chosen leaf.
        index: usize,
        /// Bundle length.
        len: usize,
    },

    /// Bundle entry is not hex.
    #[error("key bundle entry {index} is not hex")]
    BundleEncoding {
        /// Entry index.
        index: usize,
    },

    /// Master key did not open the chosen bundle entry.
    #[error("content key unwrap failed: {0}")]
    KeyUnwrap(CryptoError),

    /// Delivery fetch failed.
    #[error("download failed: {0}")]
    Download(String),

    /// Downloaded asset did not authenticate under the content key.
    #[error("content decryption failed: {0}")]
    ContentDecrypt(CryptoError),
}

// =============================================================================
// TYPES
// =============================================================================

/// Sealed content keys, indexed by catalog position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedKeyBundle(Vec<Vec<u8>>);

impl EncryptedKeyBundle {
    /// Wrap raw sealed entries.
    pub fn new(entries: Vec<Vec<u8>>) -> Self {
        Self(entries)
    }

    /// Decode hex entries from the wire.
    pub fn from_hex<S: AsRef<str>>(entries: &[S]) -> Result<Self, RetrievalError> {
        entries
            .iter()
            .enumerate()
            .map(|(index, e)| {
                hex::decode(e.as_ref()).map_err(|_| RetrievalError::BundleEncoding { index })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the bundle has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-item symmetric key. Single use; wiped on drop.
pub struct ContentKey(Zeroizing<Vec<u8>>);

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentKey(<{} bytes>)", self.0.len())
    }
}

/// Decrypted asset.
#[derive(Clone, PartialEq, Eq)]
pub struct PlaintextAsset(Vec<u8>);

impl PlaintextAsset {
    /// Asset bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl std::fmt::Debug for PlaintextAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PlaintextAsset({} bytes)", self.0.len())
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Open the bundle entry at `leaf_index` with the master key.
pub fn unwrap_content_key(
    master: &MasterKey,
    bundle: &EncryptedKeyBundle,
    leaf_index: usize,
) -> Result<ContentKey, RetrievalError> {
    let entry = bundle
        .0
        .get(leaf_index)
        .ok_or(RetrievalError::BundleIndexOutOfRange {
            index: leaf_index,
            len: bundle.len(),
        })?;
    let key = crypto::open(master.as_bytes(), entry).map_err(RetrievalError::KeyUnwrap)?;
    Ok(ContentKey(Zeroizing::new(key)))
}

/// Fetches sealed assets from a delivery locator.
pub trait Downloader: Send + Sync {
    /// Fetch the raw bytes behind `locator`.
    fn fetch<'a>(&'a self, locator: &'a str) -> BoxFuture<'a, Result<Vec<u8>, RetrievalError>>;
}

/// Download the asset and open it. The content key is consumed.
#[instrument(skip_all)]
pub async fn retrieve_and_decrypt(
    downloader: &dyn Downloader,
    locator: &str,
    key: ContentKey,
) -> Result<PlaintextAsset, RetrievalError> {
    let sealed = downloader.fetch(locator).await?;
    let plaintext = crypto::open(&key.0, &sealed).map_err(RetrievalError::ContentDecrypt)?;
    drop(key);
    info!(bytes = plaintext.len(), "Asset decrypted");
    Ok(PlaintextAsset(plaintext))
}

/// Plain HTTPS GET against the delivery locator.
#[derive(Clone, Debug, Default)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    /// Use an existing client.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Downloader for HttpDownloader {
    fn fetch<'a>(&'a self, locator: &'a str) -> BoxFuture<'a, Result<Vec<u8>, RetrievalError>> {
        Box::pin(async move {
            let response = self
                .client
                .get(locator)
                .send()
                .await
                .map_err(|e| RetrievalError::Download(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(RetrievalError::Download(format!("HTTP {}", status)));
            }
            let body = response
                .bytes()
                .await
                .map_err(|e| RetrievalError::Download(e.to_string()))?;
            Ok(body.to_vec())
        })
    }
}

//! Client Configuration
//!
//! Read from `PURCHASE_*` environment variables; the CLI overrides
//! individual fields afterwards.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::network::SessionConfig;
use crate::proof::{MAX_TREE_LEVELS, TREE_LEVELS};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Variable present but not parseable.
    #[error("{name} is not a valid value: {value:?}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },
    /// Tree depth outside what the circuit supports.
    #[error("tree depth {0} outside 1..={max}", max = MAX_TREE_LEVELS)]
    TreeLevels(usize),
    /// Required value missing.
    #[error("{0} is not set")]
    Missing(&'static str),
}

/// Everything the client needs to reach the seller and prove locally.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Marketplace HTTP API base.
    pub api_url: String,
    /// Purchase channel WebSocket base.
    pub ws_url: String,
    /// Session credential (JWT).
    pub token: Option<String>,
    /// Directory holding purchase secrets.
    pub secret_dir: PathBuf,
    /// Compiled circuit.
    pub circuit_wasm: PathBuf,
    /// Proving key.
    pub circuit_zkey: PathBuf,
    /// `snarkjs` executable.
    pub snarkjs: PathBuf,
    /// Session deadline.
    pub session_timeout: Duration,
    /// Catalog tree depth.
    pub tree_levels: usize,
    /// Where retrieved assets are written.
    pub output_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000".to_string(),
            ws_url: "ws://localhost:3000".to_string(),
            token: None,
            secret_dir: PathBuf::from(".purchase-secrets"),
            circuit_wasm: PathBuf::from("circuits/book_purchase.wasm"),
            circuit_zkey: PathBuf::from("circuits/circuit_final.zkey"),
            snarkjs: PathBuf::from("snarkjs"),
            session_timeout: Duration::from_secs(300),
            tree_levels: TREE_LEVELS,
            output_dir: PathBuf::from("."),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(None),
    }
}

impl ClientConfig {
    /// Load from environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            api_url: std::env::var("PURCHASE_API_URL").unwrap_or(defaults.api_url),
            ws_url: std::env::var("PURCHASE_WS_URL").unwrap_or(defaults.ws_url),
            token: std::env::var("PURCHASE_TOKEN").ok().filter(|t| !t.is_empty()),
            secret_dir: std::env::var("PURCHASE_SECRET_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.secret_dir),
            circuit_wasm: std::env::var("PURCHASE_CIRCUIT_WASM")
                .map(PathBuf::from)
                .unwrap_or(defaults.circuit_wasm),
            circuit_zkey: std::env::var("PURCHASE_CIRCUIT_ZKEY")
                .map(PathBuf::from)
                .unwrap_or(defaults.circuit_zkey),
            snarkjs: std::env::var("PURCHASE_SNARKJS")
                .map(PathBuf::from)
                .unwrap_or(defaults.snarkjs),
            session_timeout: parse_var::<u64>("PURCHASE_SESSION_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_timeout),
            tree_levels: parse_var("PURCHASE_TREE_LEVELS")?.unwrap_or(defaults.tree_levels),
            output_dir: std::env::var("PURCHASE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check values that cannot be expressed in the types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tree_levels == 0 || self.tree_levels > MAX_TREE_LEVELS {
            return Err(ConfigError::TreeLevels(self.tree_levels));
        }
        Ok(())
    }

    /// Credential, or an error naming the variable to set.
    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.token.as_deref().ok_or(ConfigError::Missing("PURCHASE_TOKEN"))
    }

    /// Per-session settings derived from this config.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            tree_levels: self.tree_levels,
            timeout: self.session_timeout,
        }
    }
}

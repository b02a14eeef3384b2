//! Proof Coordination
//!
//! The proving engine is an external collaborator: it takes a witness plus
//! circuit artifacts and returns an opaque Groth16 proof with its public
//! signals. Proving is CPU-bound, so the coordinator runs it on the
//! blocking pool and never stalls the session's channel I/O.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::witness::{ProofError, Witness};

/// Opaque proof and the public signals it commits to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofBundle {
    /// Engine-specific proof object, forwarded verbatim.
    pub proof: serde_json::Value,
    /// Public signals in decimal.
    pub public_signals: Vec<String>,
}

/// External proving engine.
pub trait ProvingEngine: Send + Sync {
    /// Produce a proof for `witness`. Blocking.
    fn full_prove(&self, witness: &Witness) -> Result<ProofBundle, ProofError>;
}

// =============================================================================
// COORDINATOR
// =============================================================================

/// Runs the engine off the async executor and checks its output.
#[derive(Clone)]
pub struct ProofCoordinator {
    engine: Arc<dyn ProvingEngine>,
}

impl ProofCoordinator {
    /// Wrap an engine.
    pub fn new(engine: Arc<dyn ProvingEngine>) -> Self {
        Self { engine }
    }

    /// Generate a proof for a witness that already passed local checks.
    ///
    /// Fails with [`ProofError::Generation`] if the engine fails or if the
    /// returned public signals do not carry the witness's root, price and
    /// commitment.
    #[instrument(skip_all)]
    pub async fn request_proof(&self, witness: Witness) -> Result<ProofBundle, ProofError> {
        let engine = Arc::clone(&self.engine);
        let expected = witness.public_inputs();

        let bundle = tokio::task::spawn_blocking(move || engine.full_prove(&witness))
            .await
            .map_err(|e| ProofError::Generation(format!("prover task aborted: {}", e)))??;

        for input in &expected {
            if !bundle.public_signals.contains(input) {
                return Err(ProofError::Generation(format!(
                    "public signals do not include {}",
                    input
                )));
            }
        }

        info!(signals = bundle.public_signals.len(), "Proof generated");
        Ok(bundle)
    }
}

impl std::fmt::Debug for ProofCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProofCoordinator")
    }
}

// =============================================================================
// SNARKJS ENGINE
// =============================================================================

/// Shells out to `snarkjs groth16 fullprove` in a scratch directory.
#[derive(Clone, Debug)]
pub struct SnarkjsProver {
    /// `snarkjs` executable.
    pub binary: PathBuf,
    /// Compiled circuit (`.wasm`).
    pub wasm: PathBuf,
    /// Proving key (`.zkey`).
    pub zkey: PathBuf,
}

impl SnarkjsProver {
    /// Create an engine for the given artifacts.
    pub fn new(
        binary: impl Into<PathBuf>,
        wasm: impl Into<PathBuf>,
        zkey: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: binary.into(),
            wasm: wasm.into(),
            zkey: zkey.into(),
        }
    }
}

fn generation<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> ProofError {
    move |e| ProofError::Generation(format!("{}: {}", context, e))
}

impl ProvingEngine for SnarkjsProver {
    fn full_prove(&self, witness: &Witness) -> Result<ProofBundle, ProofError> {
        let scratch = tempfile::tempdir().map_err(generation("scratch dir"))?;
        let input = scratch.path().join("input.json");
        let proof = scratch.path().join("proof.json");
        let public = scratch.path().join("public.json");

        let body = serde_json::to_vec(witness).map_err(generation("witness encoding"))?;
        std::fs::write(&input, body).map_err(generation("witness write"))?;

        debug!(binary = %self.binary.display(), "Running snarkjs fullprove");
        let output = Command::new(&self.binary)
            .args(["groth16", "fullprove"])
            .arg(&input)
            .arg(&self.wasm)
            .arg(&self.zkey)
            .arg(&proof)
            .arg(&public)
            .output()
            .map_err(generation("spawn"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProofError::Generation(format!(
                "snarkjs exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let proof: serde_json::Value = serde_json::from_slice(
            &std::fs::read(&proof).map_err(generation("proof read"))?,
        )
        .map_err(generation("proof decode"))?;
        let public_signals: Vec<String> = serde_json::from_slice(
            &std::fs::read(&public).map_err(generation("public signals read"))?,
        )
        .map_err(generation("public signals decode"))?;

        Ok(ProofBundle { proof, public_signals })
    }
}

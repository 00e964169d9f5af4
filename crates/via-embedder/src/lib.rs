#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! **via-embedder** – Embedding capability for Vector Incident Atlas.
//!
//! The crate is intentionally minimal and pluggable:
//! * [`Embedder`] abstracts any text → dense-vector backend.
//! * [`HashEmbedder`] is the deterministic reference implementation.
//! * [`BoundedEmbedder`] wraps any embedder as the process singleton with a
//!   bounded request budget; overflow is rejected with `EMBEDDER_BUSY`
//!   instead of queueing without limit.
//!
//! The promotion path treats a busy embedder as retryable; the ingest path
//! treats it as fatal for the batch.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use via_types::ViaError;

/// Encode text into a dense vector of the requested dimension.
///
/// Implementations must preserve semantic closeness: similar inputs map to
/// nearby vectors under cosine distance. Nothing else is assumed.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text` into a `dim`-dimensional vector.
    async fn embed(&self, text: &str, dim: usize) -> Result<Vec<f32>>;
}

//─────────────────────────────
//  Deterministic reference embedder
//─────────────────────────────

/// Feature-hashing embedder: word unigrams and bigrams hashed into signed
/// buckets, L2-normalized.
///
/// Deterministic across restarts and machines, needs no model weights, and
/// keeps messages sharing most of their words close under cosine — which is
/// what the forensic index requires of `EMBEDDER_BACKEND=hash:`.
#[derive(Debug, Clone, Default)]
pub struct HashEmbedder;

impl HashEmbedder {
    /// Create the reference embedder.
    pub fn new() -> Self {
        Self
    }

    fn embed_sync(text: &str, dim: usize) -> Vec<f32> {
        let mut acc = vec![0.0f32; dim.max(1)];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        for token in &tokens {
            Self::bump(&mut acc, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let feature = format!("{}\x1f{}", pair[0], pair[1]);
            Self::bump(&mut acc, feature.as_bytes(), 0.5);
        }

        let norm: f32 = acc.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut acc {
                *v /= norm;
            }
        }
        acc
    }

    fn bump(acc: &mut [f32], feature: &[u8], weight: f32) {
        let digest = blake3::hash(feature);
        let bytes = digest.as_bytes();
        let mut idx_bytes = [0u8; 8];
        idx_bytes.copy_from_slice(&bytes[..8]);
        let idx = (u64::from_le_bytes(idx_bytes) % acc.len() as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        acc[idx] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str, dim: usize) -> Result<Vec<f32>> {
        Ok(Self::embed_sync(text, dim))
    }
}

//─────────────────────────────
//  Bounded singleton wrapper
//─────────────────────────────

/// Process-singleton embedder with a bounded request budget.
///
/// At most `max_inflight` embeddings run at once; further requests are
/// rejected immediately with [`ViaError::EmbedderBusy`] rather than queued,
/// so callers decide their own retry policy.
pub struct BoundedEmbedder {
    inner: Arc<dyn Embedder>,
    permits: Arc<Semaphore>,
}

impl BoundedEmbedder {
    /// Wrap `inner` with a budget of `max_inflight` concurrent requests.
    pub fn new(inner: Arc<dyn Embedder>, max_inflight: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_inflight.max(1))),
        }
    }

    /// Embed `text`, or fail fast with [`ViaError::EmbedderBusy`] when the
    /// budget is exhausted.
    pub async fn embed(&self, text: &str, dim: usize) -> Result<Vec<f32>, ViaError> {
        let _permit = self.permits.try_acquire().map_err(|_| {
            debug!("embedder budget exhausted, rejecting request");
            ViaError::EmbedderBusy
        })?;
        self.inner
            .embed(text, dim)
            .await
            .map_err(|e| ViaError::BackendUnavailable(format!("embedder failed: {e}")))
    }
}

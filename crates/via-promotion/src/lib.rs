#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **via-promotion** – Promotion pipeline for Vector Incident Atlas.
//!
//! Lifts anomalous rhythm classes out of Tier-1 into permanent Tier-2
//! incident records: a 384-D embedding of the representative message, a
//! BM25 sparse vector against the current IDF snapshot, and an idempotent
//! upsert into the day's forensic partition. Failures retry with backoff
//! inside a bounded budget; when the budget runs out the pipeline flags
//! itself degraded and Tier-1 keeps serving.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use via_control::ControlRegistry;
use via_embedder::BoundedEmbedder;
use via_encoder::{bm25_sparse, IdfSnapshot};
use via_forensic::{ForensicStore, TIER2_DENSE_DIM};
use via_tier1::Anomaly;
use via_types::{now_ts, IncidentRecord, RhythmHash, ViaError};

/// Shared, copy-on-write handle to the collection-wide IDF snapshot.
pub type SharedIdf = Arc<RwLock<Arc<IdfSnapshot>>>;

/// Build a fresh [`SharedIdf`] starting from the empty snapshot.
pub fn shared_idf() -> SharedIdf {
    Arc::new(RwLock::new(Arc::new(IdfSnapshot::empty())))
}

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Retry policy of the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PromotionConfig {
    /// Total time spent retrying one class before declaring degradation.
    pub retry_budget: Duration,
    /// First backoff step; doubles per attempt, with jitter.
    pub base_backoff: Duration,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            retry_budget: Duration::from_secs(60),
            base_backoff: Duration::from_millis(250),
        }
    }
}

//─────────────────────────────
//  Pipeline
//─────────────────────────────

/// Turns scored anomalies into Tier-2 incident records.
pub struct PromotionPipeline {
    forensic: Arc<ForensicStore>,
    embedder: Arc<BoundedEmbedder>,
    control: Arc<ControlRegistry>,
    idf: SharedIdf,
    config: PromotionConfig,
    degraded: AtomicBool,
}

impl PromotionPipeline {
    /// Assemble the pipeline.
    pub fn new(
        forensic: Arc<ForensicStore>,
        embedder: Arc<BoundedEmbedder>,
        control: Arc<ControlRegistry>,
        idf: SharedIdf,
        config: PromotionConfig,
    ) -> Self {
        Self {
            forensic,
            embedder,
            control,
            idf,
            config,
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether the last promotion round exhausted its retry budget.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Promote anomalies as of now. Returns the hashes that landed.
    pub async fn promote(&self, anomalies: &[Anomaly]) -> Vec<RhythmHash> {
        self.promote_at(anomalies, now_ts()).await
    }

    /// Promote anomalies with an explicit promotion epoch.
    ///
    /// A failing class flags degradation and is skipped; the rest of the
    /// round proceeds. Patched classes never promote, whatever the caller
    /// passed in.
    pub async fn promote_at(&self, anomalies: &[Anomaly], promoted_at: i64) -> Vec<RhythmHash> {
        let mut promoted = Vec::with_capacity(anomalies.len());
        let mut any_failed = false;
        let active = self.control.active_set().await;

        for anomaly in anomalies {
            if active.is_patched(anomaly.rhythm_hash) {
                debug!(rhythm_hash = anomaly.rhythm_hash, "patched class skipped at promotion");
                continue;
            }
            match self.promote_one(anomaly, promoted_at).await {
                Ok(()) => promoted.push(anomaly.rhythm_hash),
                Err(e) => {
                    any_failed = true;
                    error!(
                        rhythm_hash = anomaly.rhythm_hash,
                        code = ViaError::PromotionDegraded(String::new()).code(),
                        error = %e,
                        "promotion retry budget exhausted"
                    );
                }
            }
        }

        self.degraded.store(any_failed, Ordering::SeqCst);
        if !promoted.is_empty() {
            info!(promoted = promoted.len(), "promotion round complete");
        }
        promoted
    }

    /// Promote a single class, retrying transient failures with backoff
    /// until the budget lapses.
    async fn promote_one(&self, anomaly: &Anomaly, promoted_at: i64) -> Result<(), ViaError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            match self.try_promote(anomaly, promoted_at).await {
                Ok(()) => return Ok(()),
                Err(e) if started.elapsed() < self.config.retry_budget => {
                    let backoff = self.config.base_backoff * 2u32.pow(attempt.min(8));
                    let jitter =
                        Duration::from_millis(rand::thread_rng().gen_range(0..50));
                    warn!(
                        rhythm_hash = anomaly.rhythm_hash,
                        attempt,
                        error = %e,
                        "promotion attempt failed, backing off"
                    );
                    tokio::time::sleep(backoff + jitter).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_promote(&self, anomaly: &Anomaly, promoted_at: i64) -> Result<(), ViaError> {
        let message = &anomaly.representative.message;
        let dense = self.embedder.embed(message, TIER2_DENSE_DIM).await?;
        let idf = self.idf.read().await.clone();
        let sparse = bm25_sparse(message, &idf);

        // Merge with a record promoted earlier the same day so repeated
        // analyses widen the incident instead of rewriting it.
        let existing = self
            .forensic
            .get_incident(anomaly.rhythm_hash, promoted_at)
            .await
            .map_err(|e| ViaError::BackendUnavailable(e.to_string()))?;

        let record = match existing {
            Some(prior) => IncidentRecord {
                first_seen_ts: prior.first_seen_ts.min(anomaly.first_ts),
                last_seen_ts: prior.last_seen_ts.max(anomaly.last_ts),
                count: prior.count.max(anomaly.count),
                promoted_at,
                promoted_score: anomaly.score,
                ..prior
            },
            None => IncidentRecord {
                rhythm_hash: anomaly.rhythm_hash,
                service: anomaly.representative.service.clone(),
                level: anomaly.representative.level,
                representative_message: message.clone(),
                first_seen_ts: anomaly.first_ts,
                last_seen_ts: anomaly.last_ts,
                count: anomaly.count,
                promoted_at,
                promoted_score: anomaly.score,
            },
        };

        self.forensic
            .put_incident(&record, dense, sparse)
            .await
            .map_err(|e| ViaError::BackendUnavailable(e.to_string()))?;

        self.control
            .bump_prevalence(anomaly.rhythm_hash, promoted_at)
            .await
            .map_err(|e| ViaError::BackendUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use via_embedder::HashEmbedder;
    use via_store_core::Filter;
    use via_store_memory::MemoryVectorBackend;
    use via_types::{Level, LogEvent, PointId};

    fn anomaly(hash: RhythmHash, message: &str, count: u64, last_ts: i64) -> Anomaly {
        Anomaly {
            rhythm_hash: hash,
            representative: LogEvent {
                ts: last_ts,
                service: "auth".into(),
                level: Level::Error,
                message: message.into(),
                attributes: HashMap::new(),
            },
            representative_id: PointId::from_u128(hash as u128),
            score: 0.93,
            novelty: 0.9,
            frequency: 1.0,
            count,
            first_ts: last_ts - 60,
            last_ts,
        }
    }

    async fn pipeline() -> (PromotionPipeline, Arc<ForensicStore>, Arc<ControlRegistry>) {
        let backend = Arc::new(MemoryVectorBackend::new());
        let forensic = Arc::new(ForensicStore::new(backend, 30));
        let embedder = Arc::new(BoundedEmbedder::new(Arc::new(HashEmbedder::new()), 4));
        let control = Arc::new(ControlRegistry::in_memory().await.unwrap());
        let pipeline = PromotionPipeline::new(
            forensic.clone(),
            embedder,
            control.clone(),
            shared_idf(),
            PromotionConfig {
                retry_budget: Duration::from_millis(200),
                base_backoff: Duration::from_millis(10),
            },
        );
        (pipeline, forensic, control)
    }

    // 2026-08-01T12:00:00Z
    const NOON: i64 = 1_785_585_600;

    #[tokio::test]
    async fn promotes_into_the_days_partition() {
        let (pipeline, forensic, control) = pipeline().await;
        let promoted = pipeline
            .promote_at(&[anomaly(42, "assertion failed at /src/io.c:42", 30, NOON - 10)], NOON)
            .await;
        assert_eq!(promoted, vec![42]);
        assert!(!pipeline.is_degraded());

        let record = forensic.get_incident(42, NOON).await.unwrap().unwrap();
        assert_eq!(record.count, 30);
        assert!(record.representative_message.contains("assertion failed"));
        assert!(control.prevalence(42, NOON).await.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn repeated_promotion_merges_not_duplicates() {
        let (pipeline, forensic, _) = pipeline().await;
        pipeline
            .promote_at(&[anomaly(42, "assertion failed at /src/io.c:42", 30, NOON - 10)], NOON)
            .await;
        pipeline
            .promote_at(
                &[anomaly(42, "assertion failed at /src/io.c:77", 45, NOON + 300)],
                NOON + 600,
            )
            .await;

        let record = forensic.get_incident(42, NOON).await.unwrap().unwrap();
        assert_eq!(record.count, 45);
        assert_eq!(record.first_seen_ts, NOON - 70);
        assert_eq!(record.last_seen_ts, NOON + 300);
        let collection = via_forensic::collection_for_ts(NOON);
        assert_eq!(
            forensic
                .backend()
                .count(&collection, &Filter::all())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn patched_classes_never_promote() {
        let (pipeline, forensic, control) = pipeline().await;
        control.patch(42, "benign", "op-1").await.unwrap();

        let promoted = pipeline
            .promote_at(&[anomaly(42, "assertion failed at /src/io.c:42", 30, NOON)], NOON)
            .await;
        assert!(promoted.is_empty());
        assert!(forensic.get_incident(42, NOON).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_flag_degradation() {
        let backend = Arc::new(MemoryVectorBackend::new());
        let forensic = Arc::new(ForensicStore::new(backend.clone(), 30));
        let control = Arc::new(ControlRegistry::in_memory().await.unwrap());

        struct NeverEmbeds;
        #[async_trait::async_trait]
        impl via_embedder::Embedder for NeverEmbeds {
            async fn embed(&self, _text: &str, _dim: usize) -> anyhow::Result<Vec<f32>> {
                anyhow::bail!("model host unreachable")
            }
        }

        let pipeline = PromotionPipeline::new(
            forensic.clone(),
            Arc::new(BoundedEmbedder::new(Arc::new(NeverEmbeds), 4)),
            control,
            shared_idf(),
            PromotionConfig {
                retry_budget: Duration::from_millis(50),
                base_backoff: Duration::from_millis(5),
            },
        );

        let promoted = pipeline
            .promote_at(&[anomaly(42, "assertion failed at /src/io.c:42", 30, NOON)], NOON)
            .await;
        assert!(promoted.is_empty());
        assert!(pipeline.is_degraded());

        // Tier-2 stayed untouched; Tier-1 would keep serving.
        assert!(forensic.get_incident(42, NOON).await.unwrap().is_none());
    }
}

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **via-runtime** – Composition root for Vector Incident Atlas.
//!
//! Wires the two tiers, the control loop, and the federated query layer
//! into one [`Runtime`], and owns the background maintenance tasks: the
//! eviction/retention sweeper, the 5-second active-set refresher, the daily
//! IDF snapshot rebuild, and the single promotion worker. The HTTP daemon
//! is a thin shell over this crate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use via_control::{ControlRegistry, RegressionCase, RegressionRecorder, MAX_SNAPSHOT_EVENTS};
use via_embedder::{BoundedEmbedder, HashEmbedder};
use via_encoder::IdfSnapshot;
use via_federation::{ClustersResult, FederatedQuery, TriageResult};
use via_forensic::ForensicStore;
use via_ingest::{IngestConfig, IngestCoordinator, IngestReport};
use via_promotion::{shared_idf, PromotionConfig, PromotionPipeline, SharedIdf};
use via_store_core::{Condition, Filter, VectorBackend};
use via_store_memory::MemoryVectorBackend;
use via_tier1::{Anomaly, MonitorConfig, Tier1Index, Tier1Monitor};
use via_types::{now_ts, LogEvent, PointId, RhythmHash, ViaError};

mod config;

pub use config::Config;

/// How many concurrent embeddings the singleton allows.
const EMBEDDER_BUDGET: usize = 8;

/// Cadence of the eviction and retention sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Cadence of the active-set refresh timer.
const ACTIVE_SET_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence of the IDF snapshot rebuild.
const IDF_INTERVAL: Duration = Duration::from_secs(86_400);

/// Documents the IDF rebuild will read at most.
const IDF_CORPUS_CAP: usize = 50_000;

//─────────────────────────────
//  Startup errors
//─────────────────────────────

/// Failures the daemon maps onto its exit codes.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// Invalid configuration; exit code 1.
    #[error("configuration error: {0}")]
    Config(String),
    /// Vector backend unreachable at startup; exit code 2.
    #[error("vector backend unreachable: {0}")]
    BackendUnreachable(String),
    /// Anything else fatal during startup; exit code 3.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

//─────────────────────────────
//  Query-facing types
//─────────────────────────────

/// Payload filters accepted by the analysis endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryFilters {
    /// Restrict to one service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Restrict to any of these levels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<Vec<String>>,
}

impl QueryFilters {
    /// Lower into the backend filter algebra.
    pub fn to_filter(&self) -> Filter {
        let mut filter = Filter::all();
        if let Some(service) = &self.service {
            filter = filter.with(Condition::MatchKeyword {
                key: "service".into(),
                value: service.clone(),
            });
        }
        if let Some(levels) = &self.level {
            filter = filter.with(Condition::MatchAny {
                key: "level".into(),
                values: levels.clone(),
            });
        }
        filter
    }
}

/// Snapshot served by `/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// False only when a subsystem is degraded.
    pub ok: bool,
    /// Live Tier-1 point count.
    pub tier1_points: u64,
    /// Number of forensic partitions.
    pub tier2_collections: usize,
    /// Whether the last promotion round exhausted its retries.
    pub promotion_degraded: bool,
}

type PromotionJob = (Vec<Anomaly>, i64, oneshot::Sender<Vec<RhythmHash>>);

//─────────────────────────────
//  Runtime
//─────────────────────────────

/// A fully wired engine instance.
pub struct Runtime {
    config: Config,
    control: Arc<ControlRegistry>,
    regression: Arc<RegressionRecorder>,
    tier1: Arc<Tier1Index>,
    monitor: Arc<Tier1Monitor>,
    ingest: Arc<IngestCoordinator>,
    forensic: Arc<ForensicStore>,
    promotion: Arc<PromotionPipeline>,
    federation: FederatedQuery,
    idf: SharedIdf,
    promotion_tx: mpsc::Sender<PromotionJob>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Build and start an engine from configuration.
    ///
    /// Selects the vector backend from `VECTOR_BACKEND_URL`; only the
    /// embedded `memory:` engine is compiled in, so any other scheme is a
    /// startup failure. Background tasks begin immediately.
    pub async fn start(config: Config) -> Result<Self, StartupError> {
        config.validate()?;
        let backend = open_backend(&config.vector_backend_url)?;
        let embedder = open_embedder(&config.embedder_backend)?;
        Self::start_with_backend(config, backend, embedder).await
    }

    /// Start against an explicit backend, for tests and embedding.
    pub async fn start_with_backend(
        config: Config,
        backend: Arc<dyn VectorBackend>,
        embedder: Arc<BoundedEmbedder>,
    ) -> Result<Self, StartupError> {
        if let Some(dir) = config.control_store_path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("creating state directory {}", dir.display()))?;
            }
        }

        let control = Arc::new(
            ControlRegistry::open(&config.control_store_path)
                .await
                .context("opening control registry")?,
        );
        let regression = Arc::new(RegressionRecorder::new(&config.regression_log_path));

        let tier1 = Arc::new(
            Tier1Index::bootstrap(backend.clone(), config.t1_window_sec, config.t1_max_points)
                .await
                .map_err(|e| StartupError::BackendUnreachable(e.to_string()))?,
        );
        let monitor = Arc::new(Tier1Monitor::new(
            tier1.clone(),
            control.clone(),
            MonitorConfig {
                alpha: config.anomaly_alpha,
                threshold: config.anomaly_threshold,
                ..MonitorConfig::default()
            },
        ));
        let ingest = Arc::new(IngestCoordinator::new(tier1.clone(), IngestConfig::default()));

        let forensic = Arc::new(ForensicStore::new(backend, config.t2_retention_days));
        let idf = shared_idf();
        let promotion = Arc::new(PromotionPipeline::new(
            forensic.clone(),
            embedder,
            control.clone(),
            idf.clone(),
            PromotionConfig::default(),
        ));
        let federation = FederatedQuery::new(forensic.clone(), config.query_timeout);

        let (promotion_tx, promotion_rx) = mpsc::channel(32);
        let mut runtime = Self {
            config,
            control,
            regression,
            tier1,
            monitor,
            ingest,
            forensic,
            promotion,
            federation,
            idf,
            promotion_tx,
            tasks: Vec::new(),
        };
        runtime.spawn_background(promotion_rx);
        info!("runtime started");
        Ok(runtime)
    }

    fn spawn_background(&mut self, mut promotion_rx: mpsc::Receiver<PromotionJob>) {
        // Single promotion worker: analyses enqueue, the worker serializes.
        let pipeline = self.promotion.clone();
        let monitor = self.monitor.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some((anomalies, promoted_at, reply)) = promotion_rx.recv().await {
                let promoted = pipeline.promote_at(&anomalies, promoted_at).await;
                for hash in &promoted {
                    monitor.mark_promoted(*hash);
                }
                let _ = reply.send(promoted);
            }
        }));

        // Eviction and retention sweeper.
        let tier1 = self.tier1.clone();
        let forensic = self.forensic.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = now_ts();
                if let Err(e) = tier1.evict(now).await {
                    warn!(error = %e, "tier-1 eviction sweep failed");
                }
                if let Err(e) = forensic.retention_sweep(now).await {
                    warn!(error = %e, "retention sweep failed");
                }
            }
        }));

        // Active-set refresh timer.
        let control = self.control.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ACTIVE_SET_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = control.refresh().await {
                    warn!(error = %e, "active-set refresh failed");
                }
            }
        }));

        // Daily IDF snapshot rebuild.
        let forensic = self.forensic.clone();
        let idf = self.idf.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDF_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match forensic.representative_corpus(IDF_CORPUS_CAP).await {
                    Ok(corpus) => {
                        let snapshot =
                            IdfSnapshot::from_corpus(corpus.iter().map(String::as_str));
                        *idf.write().await = Arc::new(snapshot);
                        debug!(documents = corpus.len(), "idf snapshot refreshed");
                    }
                    Err(e) => warn!(error = %e, "idf corpus scan failed"),
                }
            }
        }));
    }

    //─────────────────────────────
    //  Public operations
    //─────────────────────────────

    /// Ingest a batch of events.
    pub async fn ingest(&self, events: Vec<LogEvent>) -> Result<IngestReport, ViaError> {
        self.ingest.ingest_batch(events).await
    }

    /// Run a Tier-1 rhythm analysis and promote the survivors.
    ///
    /// Returns the reported anomalies plus the hashes the promotion worker
    /// landed in Tier-2.
    pub async fn rhythm_anomalies(
        &self,
        window_sec: i64,
        top_k: usize,
        threshold: Option<f64>,
    ) -> Result<(Vec<Anomaly>, Vec<RhythmHash>), ViaError> {
        let anomalies = self
            .monitor
            .rhythm_anomalies(window_sec, top_k, threshold)
            .await
            .map_err(|e| ViaError::BackendUnavailable(e.to_string()))?;
        if anomalies.is_empty() {
            return Ok((anomalies, Vec::new()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.promotion_tx
            .send((anomalies.clone(), now_ts(), reply_tx))
            .await
            .map_err(|_| ViaError::InvariantViolation("promotion worker gone".into()))?;
        let promoted = reply_rx
            .await
            .map_err(|_| ViaError::InvariantViolation("promotion worker dropped reply".into()))?;
        Ok((anomalies, promoted))
    }

    /// Federated cluster query over Tier-2.
    pub async fn clusters(
        &self,
        start_ts: i64,
        end_ts: i64,
        filters: &QueryFilters,
        limit: usize,
    ) -> Result<ClustersResult, ViaError> {
        self.federation
            .clusters(start_ts, end_ts, filters.to_filter(), limit)
            .await
            .map_err(|e| ViaError::BackendUnavailable(e.to_string()))
    }

    /// Federated triage query over Tier-2.
    pub async fn triage(
        &self,
        start_ts: i64,
        end_ts: i64,
        positive: Vec<PointId>,
        negative: Vec<PointId>,
        filters: &QueryFilters,
        limit: usize,
    ) -> Result<TriageResult, ViaError> {
        self.federation
            .triage(start_ts, end_ts, positive, negative, filters.to_filter(), limit)
            .await
    }

    /// Suppress a rhythm class; returns the effective expiry epoch.
    pub async fn suppress(
        &self,
        hash: RhythmHash,
        ttl_sec: i64,
        reason: &str,
        operator_id: &str,
    ) -> Result<i64, ViaError> {
        self.control
            .suppress(hash, ttl_sec, reason, operator_id)
            .await
            .map_err(|e| ViaError::BackendUnavailable(e.to_string()))
    }

    /// Patch a rhythm class; the first patch snapshots a regression case.
    pub async fn patch(
        &self,
        hash: RhythmHash,
        reason: &str,
        operator_id: &str,
    ) -> Result<(), ViaError> {
        let snapshot = self
            .tier1
            .snapshot_events(hash, MAX_SNAPSHOT_EVENTS)
            .await
            .map_err(|e| ViaError::BackendUnavailable(e.to_string()))?;

        let newly_patched = self
            .control
            .patch(hash, reason, operator_id)
            .await
            .map_err(|e| ViaError::BackendUnavailable(e.to_string()))?;

        if newly_patched {
            self.regression
                .record(RegressionCase {
                    rhythm_hash: hash,
                    events: snapshot,
                    patched_at: now_ts(),
                    operator_id: operator_id.to_string(),
                })
                .await
                .map_err(|e| ViaError::BackendUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Remove the verdict on a rhythm class; returns whether one existed.
    pub async fn lift(&self, hash: RhythmHash) -> Result<bool, ViaError> {
        self.control
            .lift(hash)
            .await
            .map_err(|e| ViaError::BackendUnavailable(e.to_string()))
    }

    /// Health snapshot for `/health` and the load balancer.
    pub async fn health(&self) -> Health {
        let tier1_points = self.tier1.count().await.unwrap_or(0);
        let tier2_collections = self.forensic.partition_count().await.unwrap_or(0);
        let promotion_degraded = self.promotion.is_degraded();
        Health {
            ok: !promotion_degraded,
            tier1_points,
            tier2_collections,
            promotion_degraded,
        }
    }

    /// Engine configuration in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The regression recorder, for replay tooling.
    pub fn regression(&self) -> Arc<RegressionRecorder> {
        self.regression.clone()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

//─────────────────────────────
//  Backend selection
//─────────────────────────────

fn open_backend(url: &str) -> Result<Arc<dyn VectorBackend>, StartupError> {
    match url.trim() {
        "" | "memory:" => Ok(Arc::new(MemoryVectorBackend::new())),
        other => Err(StartupError::BackendUnreachable(format!(
            "no driver for `{other}` is compiled in"
        ))),
    }
}

fn open_embedder(selector: &str) -> Result<Arc<BoundedEmbedder>, StartupError> {
    match selector.trim() {
        "" | "hash:" => Ok(Arc::new(BoundedEmbedder::new(
            Arc::new(HashEmbedder::new()),
            EMBEDDER_BUDGET,
        ))),
        other => Err(StartupError::Config(format!(
            "unknown EMBEDDER_BACKEND `{other}`"
        ))),
    }
}

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **via-ingest** – Ingest coordinator for Vector Incident Atlas.
//!
//! Accepts event batches, drops malformed events, suppresses re-ingests
//! through a shard-striped LRU backed by a Tier-1 existence check, and
//! upserts the remainder in bounded sub-batches with retry. When the
//! in-flight upsert count crosses the high-water mark the coordinator
//! rejects the batch with `OVERLOADED` and expects the caller to throttle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use via_tier1::{tier1_point, Tier1Index};
use via_types::{LogEvent, PointId, ViaError};

mod dedup;
pub mod schema;

pub use dedup::ShardedLru;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Tunables of the ingest path.
#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    /// Ids remembered by the dedup cache.
    pub dedup_capacity: usize,
    /// Maximum events per Tier-1 upsert.
    pub chunk_size: usize,
    /// Upsert attempts per chunk before giving up on it.
    pub max_attempts: u32,
    /// In-flight batches beyond which ingest sheds load.
    pub inflight_high_water: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 100_000,
            chunk_size: 256,
            max_attempts: 3,
            inflight_high_water: 64,
        }
    }
}

/// Outcome of one `ingest_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Events upserted into Tier-1.
    pub accepted: u64,
    /// Events dropped as exact re-ingests.
    pub deduped: u64,
    /// Events dropped as malformed or undeliverable.
    pub parse_failed: u64,
}

//─────────────────────────────
//  Coordinator
//─────────────────────────────

/// Serializes one batch at a time into Tier-1, in input order.
pub struct IngestCoordinator {
    index: Arc<Tier1Index>,
    dedup: ShardedLru,
    config: IngestConfig,
    inflight: AtomicUsize,
}

struct InflightGuard<'a>(&'a AtomicUsize);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl IngestCoordinator {
    /// Coordinator writing into `index`.
    pub fn new(index: Arc<Tier1Index>, config: IngestConfig) -> Self {
        Self {
            index,
            dedup: ShardedLru::new(config.dedup_capacity),
            config,
            inflight: AtomicUsize::new(0),
        }
    }

    /// Ingest a batch of events, preserving their order within the batch.
    ///
    /// Malformed events are counted and skipped; an undeliverable sub-batch
    /// is counted in `parse_failed` after retries without failing the call.
    /// The only hard error is [`ViaError::Overloaded`].
    pub async fn ingest_batch(&self, events: Vec<LogEvent>) -> Result<IngestReport, ViaError> {
        if self.inflight.fetch_add(1, Ordering::SeqCst) >= self.config.inflight_high_water {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            warn!("ingest high-water mark reached, shedding batch");
            return Err(ViaError::Overloaded);
        }
        let _guard = InflightGuard(&self.inflight);

        let mut report = IngestReport::default();
        let mut batch_seen: HashSet<PointId> = HashSet::with_capacity(events.len());
        let mut fresh: Vec<(PointId, LogEvent)> = Vec::with_capacity(events.len());

        for event in events {
            match via_encoder::encode(&event) {
                Ok(_) => {
                    let id = event.point_id();
                    if self.dedup.contains(&id) || !batch_seen.insert(id) {
                        report.deduped += 1;
                    } else {
                        fresh.push((id, event));
                    }
                }
                Err(e) => {
                    debug!(error = %e, "event dropped at validation");
                    report.parse_failed += 1;
                }
            }
        }

        // Cache misses may still be replayed tails already sitting in
        // Tier-1; a cheap existence probe avoids re-upserting them.
        let mut to_upsert: Vec<(PointId, LogEvent)> = Vec::with_capacity(fresh.len());
        for chunk in fresh.chunks(self.config.chunk_size) {
            let ids: Vec<PointId> = chunk.iter().map(|(id, _)| *id).collect();
            let existing = self
                .index
                .existing_ids(&ids)
                .await
                .map_err(|e| ViaError::BackendUnavailable(e.to_string()))?;
            for (id, event) in chunk {
                if existing.contains(id) {
                    report.deduped += 1;
                    self.dedup.insert(*id);
                } else {
                    to_upsert.push((*id, event.clone()));
                }
            }
        }

        for chunk in to_upsert.chunks(self.config.chunk_size) {
            match self.upsert_chunk(chunk).await {
                Ok(()) => {
                    report.accepted += chunk.len() as u64;
                    // Only delivered ids enter the dedup cache.
                    for (id, _) in chunk {
                        self.dedup.insert(*id);
                    }
                }
                Err(e) => {
                    warn!(error = %e, events = chunk.len(), "sub-batch undeliverable, counted as failed");
                    report.parse_failed += chunk.len() as u64;
                }
            }
        }

        debug!(
            accepted = report.accepted,
            deduped = report.deduped,
            parse_failed = report.parse_failed,
            "batch ingested"
        );
        Ok(report)
    }

    /// Upsert one sub-batch with exponential backoff and jitter.
    async fn upsert_chunk(&self, events: &[(PointId, LogEvent)]) -> Result<(), ViaError> {
        let mut points = Vec::with_capacity(events.len());
        for (_, event) in events {
            let encoded = via_encoder::encode(event)?;
            points.push(tier1_point(event, &encoded));
        }

        let mut last_error = None;
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let base = Duration::from_millis(50) * 2u32.pow(attempt - 1);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..25));
                tokio::time::sleep(base + jitter).await;
            }
            match self.index.upsert(points.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => last_error = Some(e),
            }
        }
        Err(ViaError::BackendUnavailable(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "upsert failed".into()),
        ))
    }
}

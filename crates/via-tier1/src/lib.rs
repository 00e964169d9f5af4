#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **via-tier1** – Tier-1 rhythm monitor for Vector Incident Atlas.
//!
//! Tier-1 is the ephemeral half of the engine: every ingested event becomes
//! a cheap 64-D point in a sliding-window collection that this crate owns
//! exclusively. [`Tier1Index`] handles collection lifecycle, windowed
//! reads, and eviction; [`Tier1Monitor`] aggregates the window into
//! rhythm-anomaly reports and tracks each class through its state machine.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use via_encoder::{Encoded, TIER1_DIM};
use via_store_core::{
    CollectionSpec, Condition, Distance, Filter, NamedVectors, PayloadIndex, PointRecord,
    VectorBackend,
};
use via_types::{LogEvent, PointId, RhythmHash, Tier1Payload, ViaError};

mod monitor;

pub use monitor::{Anomaly, MonitorConfig, RhythmState, Tier1Monitor};

/// Name of the Tier-1 collection; recreated on every process start.
pub const TIER1_COLLECTION: &str = "tier1_rhythm";

/// Extra seconds a point may outlive the window before the sweeper runs.
pub const EVICTION_GRACE_SEC: i64 = 60;

const SCROLL_PAGE: usize = 1024;

/// Build the Tier-1 point for an encoded event.
pub fn tier1_point(event: &LogEvent, encoded: &Encoded) -> PointRecord {
    let payload = Tier1Payload {
        ts: event.ts,
        service: event.service.clone(),
        level: event.level,
        rhythm_hash: encoded.rhythm_hash,
        message: event.message.clone(),
    };
    PointRecord {
        id: event.point_id(),
        vectors: NamedVectors {
            dense: Some(encoded.dense.clone()),
            sparse: None,
        },
        payload: payload.to_payload(),
    }
}

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionStats {
    /// Points dropped because they aged out of the window.
    pub expired: u64,
    /// Points dropped to honor the hard count cap, oldest first.
    pub overflow: u64,
}

//─────────────────────────────
//  Index
//─────────────────────────────

/// Exclusive owner of the Tier-1 collection.
///
/// Writers are the ingest workers and the sweeper; analysis reads take a
/// snapshot of the backend's view via scroll. Nothing else may touch the
/// collection.
pub struct Tier1Index {
    backend: Arc<dyn VectorBackend>,
    window_sec: i64,
    max_points: u64,
}

impl Tier1Index {
    /// Recreate the Tier-1 collection and return its owner.
    ///
    /// Tier-1 has no retention story across restarts; whatever a previous
    /// process left behind is dropped.
    pub async fn bootstrap(
        backend: Arc<dyn VectorBackend>,
        window_sec: i64,
        max_points: u64,
    ) -> Result<Self> {
        backend.drop_collection(TIER1_COLLECTION).await?;
        backend
            .create_collection(
                TIER1_COLLECTION,
                &CollectionSpec {
                    dense_dim: TIER1_DIM,
                    distance: Distance::Cosine,
                    on_disk: false,
                    quantization: None,
                    with_sparse: false,
                    payload_indexes: vec![
                        PayloadIndex::integer("ts"),
                        PayloadIndex::integer("rhythm_hash"),
                        PayloadIndex::keyword("service"),
                    ],
                },
            )
            .await?;
        info!(window_sec, max_points, "tier-1 collection recreated");
        Ok(Self {
            backend,
            window_sec,
            max_points,
        })
    }

    /// Sliding-window length in seconds.
    pub fn window_sec(&self) -> i64 {
        self.window_sec
    }

    /// Upsert a batch of points.
    pub async fn upsert(&self, points: Vec<PointRecord>) -> Result<()> {
        self.backend.upsert(TIER1_COLLECTION, points).await
    }

    /// Which of the given ids already exist in the collection.
    pub async fn existing_ids(&self, ids: &[PointId]) -> Result<HashSet<PointId>> {
        let found = self.backend.retrieve(TIER1_COLLECTION, ids).await?;
        Ok(found.into_iter().map(|p| p.id).collect())
    }

    /// Live point count.
    pub async fn count(&self) -> Result<u64> {
        self.backend.count(TIER1_COLLECTION, &Filter::all()).await
    }

    /// All live payloads in `[start_ts, end_ts]` whose rhythm hash is not in
    /// `excluded`, as `(id, payload)` pairs.
    pub async fn scroll_window(
        &self,
        start_ts: i64,
        end_ts: i64,
        excluded: &HashSet<RhythmHash>,
    ) -> Result<Vec<(PointId, Tier1Payload)>> {
        let mut filter = Filter::all().with(Condition::Range {
            key: "ts".into(),
            gte: Some(start_ts),
            lte: Some(end_ts),
        });
        if !excluded.is_empty() {
            filter = filter.with(Condition::NotIn {
                key: "rhythm_hash".into(),
                values: excluded.clone(),
            });
        }

        let mut out = Vec::new();
        let mut offset = None;
        loop {
            let page = self
                .backend
                .scroll(TIER1_COLLECTION, &filter, offset, SCROLL_PAGE)
                .await?;
            for point in page.points {
                let payload = Tier1Payload::from_payload(&point.payload)
                    .map_err(|e| anyhow::anyhow!(e))?;
                out.push((point.id, payload));
            }
            match page.next_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        Ok(out)
    }

    /// Most recent events of one rhythm class, newest first, up to `limit`.
    ///
    /// Used by the regression recorder to snapshot a class at patch time.
    pub async fn snapshot_events(&self, hash: RhythmHash, limit: usize) -> Result<Vec<LogEvent>> {
        let filter = Filter::all().with(Condition::MatchUnsigned {
            key: "rhythm_hash".into(),
            value: hash,
        });
        let mut payloads = Vec::new();
        let mut offset = None;
        loop {
            let page = self
                .backend
                .scroll(TIER1_COLLECTION, &filter, offset, SCROLL_PAGE)
                .await?;
            for point in page.points {
                payloads.push(Tier1Payload::from_payload(&point.payload)
                    .map_err(|e| anyhow::anyhow!(e))?);
            }
            match page.next_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        payloads.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(payloads.iter().take(limit).map(|p| p.to_event()).collect())
    }

    /// Drop aged-out points, then enforce the hard cap oldest-first.
    pub async fn evict(&self, now: i64) -> Result<EvictionStats> {
        let cutoff = now - self.window_sec;
        let expired = self
            .backend
            .delete_by_filter(
                TIER1_COLLECTION,
                &Filter::all().with(Condition::Range {
                    key: "ts".into(),
                    gte: None,
                    lte: Some(cutoff),
                }),
            )
            .await?;

        let mut overflow = 0;
        let live = self.count().await?;
        if live > self.max_points {
            let surplus = (live - self.max_points) as usize;
            let mut stamped: Vec<(i64, PointId)> = Vec::with_capacity(live as usize);
            let mut offset = None;
            loop {
                let page = self
                    .backend
                    .scroll(TIER1_COLLECTION, &Filter::all(), offset, SCROLL_PAGE)
                    .await?;
                for point in page.points {
                    let ts = via_store_core::payload_i64(&point.payload, "ts").ok_or_else(|| {
                        anyhow::anyhow!(ViaError::InvariantViolation(
                            "tier-1 point without ts".into()
                        ))
                    })?;
                    stamped.push((ts, point.id));
                }
                match page.next_offset {
                    Some(next) => offset = Some(next),
                    None => break,
                }
            }
            stamped.sort();
            let doomed: Vec<PointId> = stamped.iter().take(surplus).map(|(_, id)| *id).collect();
            self.backend.delete(TIER1_COLLECTION, &doomed).await?;
            overflow = doomed.len() as u64;
        }

        if expired > 0 || overflow > 0 {
            debug!(expired, overflow, "tier-1 eviction sweep");
        }
        Ok(EvictionStats { expired, overflow })
    }
}

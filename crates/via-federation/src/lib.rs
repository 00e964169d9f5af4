#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **via-federation** – Federated query layer for Vector Incident Atlas.
//!
//! Triage and cluster queries fan out across every Tier-2 partition whose
//! UTC day overlaps the requested range, in parallel, each under the query
//! deadline. A partition that misses its deadline contributes nothing and
//! is named in `warnings[]`; the request itself always completes. Nothing
//! is ever silently truncated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, warn};

use via_forensic::ForensicStore;
use via_store_core::{
    Condition, Filter, GroupedSearchRequest, OrderBy, RecommendRequest, ScoredPoint, DENSE_VECTOR,
};
use via_types::{IncidentRecord, PointId, RhythmHash, ViaError};

/// Result of a cluster query.
#[derive(Debug, Clone, Default)]
pub struct ClustersResult {
    /// One incident per rhythm class, newest promotion first.
    pub incidents: Vec<IncidentRecord>,
    /// Partitions that degraded, by collection name.
    pub warnings: Vec<String>,
}

/// One triage hit with its similarity score.
#[derive(Debug, Clone)]
pub struct TriageHit {
    /// The matched incident.
    pub incident: IncidentRecord,
    /// `mean_cos(positives) − mean_cos(negatives)` as returned by the
    /// owning partition.
    pub score: f32,
}

/// Result of a triage query.
#[derive(Debug, Clone, Default)]
pub struct TriageResult {
    /// Hits ordered by non-increasing score.
    pub hits: Vec<TriageHit>,
    /// Partitions that degraded, by collection name.
    pub warnings: Vec<String>,
}

//─────────────────────────────
//  Query layer
//─────────────────────────────

/// Fans queries out across forensic partitions and merges the survivors.
pub struct FederatedQuery {
    forensic: Arc<ForensicStore>,
    timeout: Duration,
}

impl FederatedQuery {
    /// Query layer over `forensic` with the given per-request deadline.
    pub fn new(forensic: Arc<ForensicStore>, timeout: Duration) -> Self {
        Self { forensic, timeout }
    }

    /// Anomaly clusters promoted within `[start_ts, end_ts]`.
    ///
    /// Each overlapping partition contributes its best record per rhythm
    /// class; duplicates across partitions keep the larger `count`. Results
    /// sort by `promoted_at` descending, at most `limit` of them.
    pub async fn clusters(
        &self,
        start_ts: i64,
        end_ts: i64,
        filter: Filter,
        limit: usize,
    ) -> Result<ClustersResult> {
        let partitions = self.forensic.partitions_overlapping(start_ts, end_ts).await?;
        if partitions.is_empty() || limit == 0 {
            return Ok(ClustersResult::default());
        }
        let per_partition = (limit / partitions.len()).max(1);

        let filter = filter.with(Condition::Range {
            key: "promoted_at".into(),
            gte: Some(start_ts),
            lte: Some(end_ts),
        });

        let backend = self.forensic.backend();
        let queries = partitions.iter().map(|partition| {
            let backend = backend.clone();
            let filter = filter.clone();
            let partition = partition.clone();
            async move {
                let request = GroupedSearchRequest {
                    filter,
                    group_by: "rhythm_hash".into(),
                    group_size: 1,
                    limit: per_partition,
                    order_by: Some(OrderBy {
                        field: "promoted_at".into(),
                        descending: true,
                    }),
                };
                let outcome =
                    tokio::time::timeout(self.timeout, backend.search_grouped(&partition, request))
                        .await;
                (partition, outcome)
            }
        });

        let mut warnings = Vec::new();
        let mut best: HashMap<RhythmHash, IncidentRecord> = HashMap::new();
        for (partition, outcome) in join_all(queries).await {
            let groups = match outcome {
                Ok(Ok(groups)) => groups,
                Ok(Err(e)) => {
                    warn!(partition = %partition, error = %e, "partition failed, degrading");
                    warnings.push(partition);
                    continue;
                }
                Err(_) => {
                    warn!(
                        partition = %partition,
                        code = ViaError::PartitionTimeout(String::new()).code(),
                        "partition missed its deadline, degrading"
                    );
                    warnings.push(partition);
                    continue;
                }
            };
            for group in groups {
                for hit in group.hits {
                    let Ok(record) = IncidentRecord::from_payload(&hit.payload) else {
                        continue;
                    };
                    match best.get(&record.rhythm_hash) {
                        Some(prior) if prior.count >= record.count => {}
                        _ => {
                            best.insert(record.rhythm_hash, record);
                        }
                    }
                }
            }
        }

        let mut incidents: Vec<IncidentRecord> = best.into_values().collect();
        incidents.sort_by(|a, b| {
            b.promoted_at
                .cmp(&a.promoted_at)
                .then(a.rhythm_hash.cmp(&b.rhythm_hash))
        });
        incidents.truncate(limit);

        debug!(
            partitions = partitions.len(),
            incidents = incidents.len(),
            degraded = warnings.len(),
            "cluster query merged"
        );
        Ok(ClustersResult {
            incidents,
            warnings,
        })
    }

    /// Recommendation-driven triage across partitions.
    ///
    /// Every overlapping partition answers a recommend query against its
    /// `dense` slot; partition results are interleaved round-robin, then
    /// globally re-ranked by the returned scores. Requires at least one
    /// positive example.
    pub async fn triage(
        &self,
        start_ts: i64,
        end_ts: i64,
        positive: Vec<PointId>,
        negative: Vec<PointId>,
        filter: Filter,
        limit: usize,
    ) -> Result<TriageResult, ViaError> {
        if positive.is_empty() {
            return Err(ViaError::BadRequest(
                "triage requires at least one positive example".into(),
            ));
        }

        let partitions = self
            .forensic
            .partitions_overlapping(start_ts, end_ts)
            .await
            .map_err(|e| ViaError::BackendUnavailable(e.to_string()))?;
        if partitions.is_empty() || limit == 0 {
            return Ok(TriageResult::default());
        }

        let backend = self.forensic.backend();
        let queries = partitions.iter().map(|partition| {
            let backend = backend.clone();
            let partition = partition.clone();
            let request = RecommendRequest {
                positive: positive.clone(),
                negative: negative.clone(),
                using_vector: DENSE_VECTOR.into(),
                filter: filter.clone(),
                limit,
            };
            async move {
                let outcome =
                    tokio::time::timeout(self.timeout, backend.recommend(&partition, request))
                        .await;
                (partition, outcome)
            }
        });

        let mut warnings = Vec::new();
        let mut per_partition: Vec<Vec<ScoredPoint>> = Vec::new();
        for (partition, outcome) in join_all(queries).await {
            match outcome {
                Ok(Ok(hits)) => per_partition.push(hits),
                Ok(Err(e)) => {
                    warn!(partition = %partition, error = %e, "partition failed, degrading");
                    warnings.push(partition);
                }
                Err(_) => {
                    warn!(
                        partition = %partition,
                        code = ViaError::PartitionTimeout(String::new()).code(),
                        "partition missed its deadline, degrading"
                    );
                    warnings.push(partition);
                }
            }
        }

        // Round-robin interleave, then a global re-rank on the partition
        // scores; interleaving keeps slow-but-successful partitions
        // represented when scores tie.
        let mut interleaved = Vec::new();
        let mut cursor = 0;
        loop {
            let mut took_any = false;
            for hits in &per_partition {
                if let Some(hit) = hits.get(cursor) {
                    interleaved.push(hit.clone());
                    took_any = true;
                }
            }
            if !took_any {
                break;
            }
            cursor += 1;
        }

        let mut hits: Vec<TriageHit> = interleaved
            .into_iter()
            .filter_map(|hit| {
                IncidentRecord::from_payload(&hit.payload)
                    .ok()
                    .map(|incident| TriageHit {
                        incident,
                        score: hit.score,
                    })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);

        Ok(TriageResult { hits, warnings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use via_embedder::{Embedder, HashEmbedder};
    use via_store_memory::MemoryVectorBackend;
    use via_types::{Level, SparseVector};

    // 2026-08-01T12:00:00Z and the noon before it.
    const TODAY_NOON: i64 = 1_785_585_600;
    const YESTERDAY_NOON: i64 = TODAY_NOON - 86_400;

    fn incident(hash: RhythmHash, promoted_at: i64, count: u64, message: &str) -> IncidentRecord {
        IncidentRecord {
            rhythm_hash: hash,
            service: "auth".into(),
            level: Level::Error,
            representative_message: message.into(),
            first_seen_ts: promoted_at - 600,
            last_seen_ts: promoted_at - 1,
            count,
            promoted_at,
            promoted_score: 0.9,
        }
    }

    async fn seed(
        forensic: &ForensicStore,
        record: IncidentRecord,
    ) -> via_types::PointId {
        let dense = HashEmbedder::new()
            .embed(&record.representative_message, via_forensic::TIER2_DENSE_DIM)
            .await
            .unwrap();
        let id = IncidentRecord::incident_id(
            record.rhythm_hash,
            &via_types::utc_day(record.promoted_at),
        );
        forensic
            .put_incident(&record, dense, SparseVector::default())
            .await
            .unwrap();
        id
    }

    fn setup() -> (Arc<MemoryVectorBackend>, Arc<ForensicStore>, FederatedQuery) {
        let backend = Arc::new(MemoryVectorBackend::new());
        let forensic = Arc::new(ForensicStore::new(backend.clone(), 30));
        let federation = FederatedQuery::new(forensic.clone(), Duration::from_millis(100));
        (backend, forensic, federation)
    }

    #[tokio::test]
    async fn clusters_span_day_boundaries_and_dedupe() {
        let (_, forensic, federation) = setup();
        seed(&forensic, incident(1, YESTERDAY_NOON, 30, "assertion failed at /src/io.c:42")).await;
        seed(&forensic, incident(1, TODAY_NOON, 45, "assertion failed at /src/io.c:77")).await;
        seed(&forensic, incident(2, TODAY_NOON, 5, "disk quota exceeded for user 7")).await;

        let result = federation
            .clusters(YESTERDAY_NOON, TODAY_NOON, Filter::all(), 100)
            .await
            .unwrap();

        assert!(result.warnings.is_empty());
        assert_eq!(result.incidents.len(), 2, "one record per rhythm class");
        // The duplicated class keeps the larger count and sorts newest first.
        assert_eq!(result.incidents[0].rhythm_hash, 1);
        assert_eq!(result.incidents[0].count, 45);
        assert!(result.incidents[0].promoted_at >= result.incidents[1].promoted_at);
    }

    #[tokio::test]
    async fn clusters_respect_payload_filters() {
        let (_, forensic, federation) = setup();
        seed(&forensic, incident(1, TODAY_NOON, 30, "assertion failed at /src/io.c:42")).await;
        let mut other = incident(2, TODAY_NOON, 5, "disk quota exceeded for user 7");
        other.service = "billing".into();
        seed(&forensic, other).await;

        let filter = Filter::all().with(Condition::MatchKeyword {
            key: "service".into(),
            value: "billing".into(),
        });
        let result = federation
            .clusters(TODAY_NOON - 3600, TODAY_NOON + 3600, filter, 100)
            .await
            .unwrap();
        assert_eq!(result.incidents.len(), 1);
        assert_eq!(result.incidents[0].rhythm_hash, 2);
    }

    #[tokio::test]
    async fn empty_range_returns_nothing() {
        let (_, _, federation) = setup();
        let result = federation
            .clusters(0, 1_000, Filter::all(), 100)
            .await
            .unwrap();
        assert!(result.incidents.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn slow_partition_degrades_with_a_warning() {
        let (backend, forensic, federation) = setup();
        seed(&forensic, incident(1, YESTERDAY_NOON, 30, "assertion failed at /src/io.c:42")).await;
        let positive =
            seed(&forensic, incident(2, TODAY_NOON, 9, "assertion failed at /src/net.c:8")).await;
        seed(&forensic, incident(3, TODAY_NOON, 4, "assertion failed at /src/fs.c:1")).await;

        let slow = via_forensic::collection_for_ts(YESTERDAY_NOON);
        backend.inject_latency(&slow, Duration::from_millis(400));

        let result = federation
            .triage(
                YESTERDAY_NOON,
                TODAY_NOON,
                vec![positive],
                Vec::new(),
                Filter::all(),
                10,
            )
            .await
            .unwrap();

        assert_eq!(result.warnings, vec![slow]);
        assert!(!result.hits.is_empty(), "healthy partition still answers");
        assert!(result.hits.iter().all(|h| h.incident.promoted_at == TODAY_NOON));
    }

    #[tokio::test]
    async fn triage_orders_by_non_increasing_score() {
        let (_, forensic, federation) = setup();
        let positive =
            seed(&forensic, incident(1, TODAY_NOON, 9, "assertion failed at /src/io.c:42")).await;
        seed(&forensic, incident(2, TODAY_NOON, 9, "assertion failed at /src/io.c:77")).await;
        seed(&forensic, incident(3, TODAY_NOON, 9, "cache warmed in 250 ms")).await;
        seed(&forensic, incident(4, YESTERDAY_NOON, 9, "assertion failed at /src/net.c:8")).await;

        let result = federation
            .triage(
                YESTERDAY_NOON,
                TODAY_NOON,
                vec![positive],
                Vec::new(),
                Filter::all(),
                10,
            )
            .await
            .unwrap();

        assert!(result.hits.len() >= 3);
        assert!(result
            .hits
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
        // The structurally-similar assertion messages outrank the cache line.
        assert_ne!(result.hits[0].incident.rhythm_hash, 3);
    }

    #[tokio::test]
    async fn triage_without_positives_is_a_bad_request() {
        let (_, _, federation) = setup();
        let err = federation
            .triage(0, i64::MAX, Vec::new(), Vec::new(), Filter::all(), 10)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }
}

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **via-store-memory** – In-memory vector-backend driver for Vector
//! Incident Atlas.
//!
//! A complete reference implementation of the [`VectorBackend`] contract
//! backed by ordered in-process maps. It is the embedded engine behind
//! `VECTOR_BACKEND_URL=memory:` and the workhorse of the test suite, which
//! can additionally inject per-collection latency to exercise the
//! degradation paths of the federated query layer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

use via_store_core::{
    CollectionSpec, Filter, GroupedSearchRequest, PointGroup, PointRecord, RecommendRequest,
    ScoredPoint, ScrollPage, VectorBackend,
};
use via_types::PointId;

//─────────────────────────────
//  Collections
//─────────────────────────────

struct MemoryCollection {
    spec: CollectionSpec,
    points: RwLock<BTreeMap<PointId, PointRecord>>,
}

impl MemoryCollection {
    fn new(spec: CollectionSpec) -> Self {
        Self {
            spec,
            points: RwLock::new(BTreeMap::new()),
        }
    }
}

/// An in-memory, non-persistent vector engine.
///
/// Collections are ordered maps keyed by point id, which gives scroll its
/// stable pagination order. All data is lost when the process terminates —
/// exactly what Tier-1 wants, and good enough for Tier-2 in tests and demos.
#[derive(Clone, Default)]
pub struct MemoryVectorBackend {
    collections: Arc<DashMap<String, Arc<MemoryCollection>>>,
    latency: Arc<DashMap<String, Duration>>,
}

impl MemoryVectorBackend {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject an artificial delay before reads of one collection.
    ///
    /// Test support for the federation degradation paths; a collection
    /// slowed beyond its query deadline must surface in `warnings[]`
    /// rather than abort the request.
    pub fn inject_latency(&self, collection: &str, delay: Duration) {
        self.latency.insert(collection.to_string(), delay);
    }

    /// Remove an injected delay.
    pub fn clear_latency(&self, collection: &str) {
        self.latency.remove(collection);
    }

    fn get(&self, name: &str) -> Result<Arc<MemoryCollection>> {
        match self.collections.get(name) {
            Some(entry) => Ok(entry.value().clone()),
            None => bail!("collection `{name}` does not exist"),
        }
    }

    async fn stall(&self, name: &str) {
        let delay = self.latency.get(name).map(|d| *d.value());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Mean cosine of `vector` against the resolved examples; an empty example
/// side contributes zero, per the recommend contract.
fn mean_cosine(vector: &[f32], examples: &[Vec<f32>]) -> f32 {
    if examples.is_empty() {
        return 0.0;
    }
    examples.iter().map(|e| cosine(vector, e)).sum::<f32>() / examples.len() as f32
}

#[async_trait]
impl VectorBackend for MemoryVectorBackend {
    async fn create_collection(&self, name: &str, spec: &CollectionSpec) -> Result<()> {
        if let Some(existing) = self.collections.get(name) {
            if existing.spec != *spec {
                bail!("collection `{name}` already exists with a different layout");
            }
            return Ok(());
        }
        self.collections
            .insert(name.to_string(), Arc::new(MemoryCollection::new(spec.clone())));
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.collections.contains_key(name))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        self.collections.remove(name);
        self.latency.remove(name);
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<PointRecord>) -> Result<()> {
        let col = self.get(collection)?;
        for point in &points {
            if let Some(dense) = &point.vectors.dense {
                if dense.len() != col.spec.dense_dim {
                    bail!(
                        "dense vector of {} has dimension {}, collection `{collection}` expects {}",
                        point.id,
                        dense.len(),
                        col.spec.dense_dim
                    );
                }
            }
        }
        let mut map = col.points.write().await;
        for point in points {
            map.insert(point.id, point);
        }
        Ok(())
    }

    async fn retrieve(&self, collection: &str, ids: &[PointId]) -> Result<Vec<PointRecord>> {
        self.stall(collection).await;
        let col = self.get(collection)?;
        let map = col.points.read().await;
        Ok(ids.iter().filter_map(|id| map.get(id).cloned()).collect())
    }

    async fn delete(&self, collection: &str, ids: &[PointId]) -> Result<()> {
        let col = self.get(collection)?;
        let mut map = col.points.write().await;
        for id in ids {
            map.remove(id);
        }
        Ok(())
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let col = self.get(collection)?;
        let mut map = col.points.write().await;
        let doomed: Vec<PointId> = map
            .iter()
            .filter(|(_, p)| filter.matches(&p.payload))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            map.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.stall(collection).await;
        let col = self.get(collection)?;
        let map = col.points.read().await;
        Ok(map.values().filter(|p| filter.matches(&p.payload)).count() as u64)
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: &Filter,
        offset: Option<PointId>,
        limit: usize,
    ) -> Result<ScrollPage> {
        self.stall(collection).await;
        let col = self.get(collection)?;
        let map = col.points.read().await;

        let mut points = Vec::with_capacity(limit.min(1024));
        let mut next_offset = None;
        let range = match offset {
            Some(start) => map.range(start..),
            None => map.range(..),
        };
        for (id, point) in range {
            if !filter.matches(&point.payload) {
                continue;
            }
            if points.len() == limit {
                next_offset = Some(*id);
                break;
            }
            points.push(point.clone());
        }
        Ok(ScrollPage {
            points,
            next_offset,
        })
    }

    async fn search_grouped(
        &self,
        collection: &str,
        request: GroupedSearchRequest,
    ) -> Result<Vec<PointGroup>> {
        self.stall(collection).await;
        let col = self.get(collection)?;
        let map = col.points.read().await;

        // Group matching points by the grouping field's JSON value.
        let mut groups: BTreeMap<String, PointGroup> = BTreeMap::new();
        for point in map.values() {
            if !filter_matches(&request.filter, point) {
                continue;
            }
            let key_value = point
                .payload
                .get(&request.group_by)
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let bucket = groups
                .entry(key_value.to_string())
                .or_insert_with(|| PointGroup {
                    group_key: key_value,
                    hits: Vec::new(),
                });
            bucket.hits.push(ScoredPoint {
                id: point.id,
                score: 0.0,
                payload: point.payload.clone(),
            });
        }

        let order = |group: &PointGroup| -> i64 {
            request
                .order_by
                .as_ref()
                .and_then(|ob| {
                    group
                        .hits
                        .iter()
                        .filter_map(|h| via_store_core::payload_i64(&h.payload, &ob.field))
                        .max()
                })
                .unwrap_or(0)
        };

        let mut result: Vec<PointGroup> = groups.into_values().collect();
        for group in &mut result {
            if let Some(ob) = &request.order_by {
                group.hits.sort_by_key(|h| {
                    let v = via_store_core::payload_i64(&h.payload, &ob.field).unwrap_or(0);
                    if ob.descending {
                        -v
                    } else {
                        v
                    }
                });
            }
            group.hits.truncate(request.group_size.max(1));
        }
        match request.order_by.as_ref().map(|ob| ob.descending) {
            Some(true) => result.sort_by_key(|g| -order(g)),
            Some(false) => result.sort_by_key(order),
            None => {}
        }
        result.truncate(request.limit);
        Ok(result)
    }

    async fn recommend(
        &self,
        collection: &str,
        request: RecommendRequest,
    ) -> Result<Vec<ScoredPoint>> {
        self.stall(collection).await;
        let col = self.get(collection)?;
        let map = col.points.read().await;

        let resolve = |ids: &[PointId]| -> Vec<Vec<f32>> {
            ids.iter()
                .filter_map(|id| map.get(id))
                .filter_map(|p| p.vectors.dense.clone())
                .collect()
        };
        let positives = resolve(&request.positive);
        let negatives = resolve(&request.negative);

        let mut hits: Vec<ScoredPoint> = map
            .values()
            .filter(|p| filter_matches(&request.filter, p))
            .filter(|p| {
                !request.positive.contains(&p.id) && !request.negative.contains(&p.id)
            })
            .filter_map(|p| {
                let dense = p.vectors.dense.as_ref()?;
                let score = mean_cosine(dense, &positives) - mean_cosine(dense, &negatives);
                Some(ScoredPoint {
                    id: p.id,
                    score,
                    payload: p.payload.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        hits.truncate(request.limit);
        Ok(hits)
    }
}

fn filter_matches(filter: &Filter, point: &PointRecord) -> bool {
    filter.matches(&point.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use via_store_core::{
        Condition, Distance, OrderBy, Payload, PayloadIndex, DENSE_VECTOR,
    };
    use via_types::SparseVector;

    fn spec(dim: usize) -> CollectionSpec {
        CollectionSpec {
            dense_dim: dim,
            distance: Distance::Cosine,
            on_disk: false,
            quantization: None,
            with_sparse: true,
            payload_indexes: vec![PayloadIndex::keyword("service")],
        }
    }

    fn point(id: u128, dense: Vec<f32>, service: &str, count: i64) -> PointRecord {
        let mut payload = Payload::new();
        payload.insert("service".into(), json!(service));
        payload.insert("count".into(), json!(count));
        payload.insert("rhythm_hash".into(), json!(id as u64));
        PointRecord {
            id: PointId::from_u128(id),
            vectors: via_store_core::NamedVectors {
                dense: Some(dense),
                sparse: Some(SparseVector::default()),
            },
            payload,
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_but_layout_conflicts_fail() {
        let backend = MemoryVectorBackend::new();
        backend.create_collection("c", &spec(4)).await.unwrap();
        backend.create_collection("c", &spec(4)).await.unwrap();
        assert!(backend.create_collection("c", &spec(8)).await.is_err());
    }

    #[tokio::test]
    async fn upsert_enforces_declared_dimension() {
        let backend = MemoryVectorBackend::new();
        backend.create_collection("c", &spec(4)).await.unwrap();
        let bad = point(1, vec![0.0; 3], "auth", 1);
        assert!(backend.upsert("c", vec![bad]).await.is_err());
    }

    #[tokio::test]
    async fn scroll_pages_in_id_order() {
        let backend = MemoryVectorBackend::new();
        backend.create_collection("c", &spec(2)).await.unwrap();
        let points: Vec<PointRecord> =
            (1..=5u128).map(|i| point(i, vec![1.0, 0.0], "auth", i as i64)).collect();
        backend.upsert("c", points).await.unwrap();

        let first = backend
            .scroll("c", &Filter::all(), None, 2)
            .await
            .unwrap();
        assert_eq!(first.points.len(), 2);
        let next = first.next_offset.expect("more pages");
        let second = backend.scroll("c", &Filter::all(), Some(next), 10).await.unwrap();
        assert_eq!(second.points.len(), 3);
        assert!(second.next_offset.is_none());
    }

    #[tokio::test]
    async fn grouped_search_keeps_best_hit_per_group() {
        let backend = MemoryVectorBackend::new();
        backend.create_collection("c", &spec(2)).await.unwrap();
        let mut a = point(1, vec![1.0, 0.0], "auth", 3);
        a.payload.insert("promoted_at".into(), json!(100));
        let mut b = point(2, vec![1.0, 0.0], "auth", 9);
        b.payload.insert("promoted_at".into(), json!(200));
        let mut c = point(3, vec![1.0, 0.0], "billing", 1);
        c.payload.insert("promoted_at".into(), json!(300));
        backend.upsert("c", vec![a, b, c]).await.unwrap();

        let groups = backend
            .search_grouped(
                "c",
                GroupedSearchRequest {
                    filter: Filter::all(),
                    group_by: "service".into(),
                    group_size: 1,
                    limit: 10,
                    order_by: Some(OrderBy {
                        field: "promoted_at".into(),
                        descending: true,
                    }),
                },
            )
            .await
            .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group_key, json!("billing"));
        assert_eq!(groups[1].hits.len(), 1);
        assert_eq!(
            via_store_core::payload_i64(&groups[1].hits[0].payload, "promoted_at"),
            Some(200)
        );
    }

    #[tokio::test]
    async fn recommend_prefers_positive_neighborhood() {
        let backend = MemoryVectorBackend::new();
        backend.create_collection("c", &spec(2)).await.unwrap();
        backend
            .upsert(
                "c",
                vec![
                    point(1, vec![1.0, 0.0], "auth", 1),
                    point(2, vec![0.9, 0.1], "auth", 1),
                    point(3, vec![0.0, 1.0], "auth", 1),
                ],
            )
            .await
            .unwrap();

        let hits = backend
            .recommend(
                "c",
                RecommendRequest {
                    positive: vec![PointId::from_u128(1)],
                    negative: vec![PointId::from_u128(3)],
                    using_vector: DENSE_VECTOR.into(),
                    filter: Filter::all(),
                    limit: 10,
                },
            )
            .await
            .unwrap();
        // Examples are excluded; the near-positive point wins.
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, PointId::from_u128(2));
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn filters_apply_to_reads_and_deletes() {
        let backend = MemoryVectorBackend::new();
        backend.create_collection("c", &spec(2)).await.unwrap();
        backend
            .upsert(
                "c",
                vec![
                    point(1, vec![1.0, 0.0], "auth", 1),
                    point(2, vec![1.0, 0.0], "billing", 1),
                ],
            )
            .await
            .unwrap();

        let auth_only = Filter::all().with(Condition::MatchKeyword {
            key: "service".into(),
            value: "auth".into(),
        });
        assert_eq!(backend.count("c", &auth_only).await.unwrap(), 1);
        assert_eq!(backend.delete_by_filter("c", &auth_only).await.unwrap(), 1);
        assert_eq!(backend.count("c", &Filter::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn injected_latency_delays_reads() {
        let backend = MemoryVectorBackend::new();
        backend.create_collection("c", &spec(2)).await.unwrap();
        backend.inject_latency("c", Duration::from_millis(80));

        let started = std::time::Instant::now();
        backend.count("c", &Filter::all()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));

        backend.clear_latency("c");
        let started = std::time::Instant::now();
        backend.count("c", &Filter::all()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}

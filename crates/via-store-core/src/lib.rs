#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **via-store-core** – Vector-backend abstraction for Vector Incident Atlas.
//!
//! This crate defines the contract against the opaque vector engine: named
//! dense+sparse vectors, quantization and payload-index declarations,
//! filtered scroll, grouped search, and recommendation queries. It provides
//! no concrete engine; drivers implement [`VectorBackend`] in separate
//! crates that depend on this abstraction.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use via_types::{PointId, SparseVector};

/// Name of the dense vector slot on Tier-2 points.
pub const DENSE_VECTOR: &str = "dense";

/// Name of the sparse vector slot on Tier-2 points.
pub const SPARSE_VECTOR: &str = "sparse";

//─────────────────────────────
//  Payloads and points
//─────────────────────────────

/// Flat JSON payload attached to a point.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Read an integer payload field.
pub fn payload_i64(payload: &Payload, key: &str) -> Option<i64> {
    payload.get(key).and_then(|v| v.as_i64())
}

/// Read an unsigned payload field (rhythm hashes occupy the full u64 range).
pub fn payload_u64(payload: &Payload, key: &str) -> Option<u64> {
    payload.get(key).and_then(|v| v.as_u64())
}

/// Read a string payload field.
pub fn payload_str<'a>(payload: &'a Payload, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(|v| v.as_str())
}

/// Vectors carried by a point, addressed by slot name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedVectors {
    /// Dense embedding, when present.
    pub dense: Option<Vec<f32>>,
    /// Sparse term vector, when present.
    pub sparse: Option<SparseVector>,
}

/// One point as written to or read from a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    /// Point identity.
    pub id: PointId,
    /// Named vectors.
    pub vectors: NamedVectors,
    /// Flat payload.
    pub payload: Payload,
}

//─────────────────────────────
//  Collection layout
//─────────────────────────────

/// Distance function for dense search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distance {
    /// Cosine similarity over normalized vectors.
    Cosine,
    /// Raw dot product.
    Dot,
}

/// Vector quantization applied at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quantization {
    /// Scalar INT8 quantization of dense vectors.
    ScalarInt8,
}

/// Payload index kinds a collection can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadIndexKind {
    /// Exact-match keyword index.
    Keyword,
    /// Range-capable integer index.
    Integer,
}

/// One declared payload index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadIndex {
    /// Payload field the index covers.
    pub field: String,
    /// Index kind.
    pub kind: PayloadIndexKind,
}

impl PayloadIndex {
    /// Keyword index on `field`.
    pub fn keyword(field: &str) -> Self {
        Self {
            field: field.into(),
            kind: PayloadIndexKind::Keyword,
        }
    }

    /// Integer index on `field`.
    pub fn integer(field: &str) -> Self {
        Self {
            field: field.into(),
            kind: PayloadIndexKind::Integer,
        }
    }
}

/// Full layout of a collection at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// Dimensionality of the dense slot.
    pub dense_dim: usize,
    /// Distance function of the dense slot.
    pub distance: Distance,
    /// Whether dense vectors live on disk rather than in RAM.
    pub on_disk: bool,
    /// Optional at-rest quantization of the dense slot.
    pub quantization: Option<Quantization>,
    /// Whether the collection carries a sparse slot.
    pub with_sparse: bool,
    /// Declared payload indexes.
    pub payload_indexes: Vec<PayloadIndex>,
}

//─────────────────────────────
//  Filters
//─────────────────────────────

/// A single payload predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// String field equals `value`.
    MatchKeyword {
        /// Payload field.
        key: String,
        /// Required value.
        value: String,
    },
    /// String field equals one of `values`.
    MatchAny {
        /// Payload field.
        key: String,
        /// Accepted values.
        values: Vec<String>,
    },
    /// Integer field equals `value`.
    MatchInteger {
        /// Payload field.
        key: String,
        /// Required value.
        value: i64,
    },
    /// Unsigned field equals `value` (rhythm hashes span the full u64 range).
    MatchUnsigned {
        /// Payload field.
        key: String,
        /// Required value.
        value: u64,
    },
    /// Integer field within the inclusive range.
    Range {
        /// Payload field.
        key: String,
        /// Lower bound, inclusive.
        gte: Option<i64>,
        /// Upper bound, inclusive.
        lte: Option<i64>,
    },
    /// Unsigned field NOT in the given set (control-set exclusion).
    NotIn {
        /// Payload field.
        key: String,
        /// Excluded values.
        values: HashSet<u64>,
    },
}

impl Condition {
    /// Evaluate the predicate against a payload.
    pub fn matches(&self, payload: &Payload) -> bool {
        match self {
            Condition::MatchKeyword { key, value } => {
                payload_str(payload, key) == Some(value.as_str())
            }
            Condition::MatchAny { key, values } => payload_str(payload, key)
                .map(|s| values.iter().any(|v| v == s))
                .unwrap_or(false),
            Condition::MatchInteger { key, value } => payload_i64(payload, key) == Some(*value),
            Condition::MatchUnsigned { key, value } => payload_u64(payload, key) == Some(*value),
            Condition::Range { key, gte, lte } => match payload_i64(payload, key) {
                Some(v) => gte.map_or(true, |lo| v >= lo) && lte.map_or(true, |hi| v <= hi),
                None => false,
            },
            Condition::NotIn { key, values } => match payload_u64(payload, key) {
                Some(v) => !values.contains(&v),
                None => true,
            },
        }
    }
}

/// Conjunction of payload predicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// All conditions must hold.
    pub must: Vec<Condition>,
}

impl Filter {
    /// The empty filter, matching every point.
    pub fn all() -> Self {
        Self::default()
    }

    /// Append a condition, builder style.
    pub fn with(mut self, condition: Condition) -> Self {
        self.must.push(condition);
        self
    }

    /// Evaluate the conjunction against a payload.
    pub fn matches(&self, payload: &Payload) -> bool {
        self.must.iter().all(|c| c.matches(payload))
    }
}

//─────────────────────────────
//  Query requests and results
//─────────────────────────────

/// One page of a filtered scroll.
#[derive(Debug, Clone, Default)]
pub struct ScrollPage {
    /// Points on this page, id-ordered.
    pub points: Vec<PointRecord>,
    /// Cursor for the next page; `None` when exhausted.
    pub next_offset: Option<PointId>,
}

/// A scored search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    /// Point identity.
    pub id: PointId,
    /// Similarity score; larger is closer.
    pub score: f32,
    /// Point payload.
    pub payload: Payload,
}

/// A group of hits sharing one `group_by` value.
#[derive(Debug, Clone, PartialEq)]
pub struct PointGroup {
    /// Shared value of the grouping field.
    pub group_key: serde_json::Value,
    /// Best hits of the group, at most `group_size` of them.
    pub hits: Vec<ScoredPoint>,
}

/// Ordering for grouped enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Integer payload field to order groups by.
    pub field: String,
    /// Descending when true.
    pub descending: bool,
}

/// Grouped search over a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedSearchRequest {
    /// Payload filter applied before grouping.
    pub filter: Filter,
    /// Payload field whose value partitions the hits.
    pub group_by: String,
    /// Maximum hits retained per group.
    pub group_size: usize,
    /// Maximum number of groups returned.
    pub limit: usize,
    /// Group ordering; defaults to the grouping field's best hit.
    pub order_by: Option<OrderBy>,
}

/// Recommendation query against a named dense slot.
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendRequest {
    /// Example points the results should resemble.
    pub positive: Vec<PointId>,
    /// Example points the results should avoid.
    pub negative: Vec<PointId>,
    /// Vector slot to search, e.g. [`DENSE_VECTOR`].
    pub using_vector: String,
    /// Payload filter applied to candidates.
    pub filter: Filter,
    /// Maximum hits returned.
    pub limit: usize,
}

//─────────────────────────────
//  Backend trait
//─────────────────────────────

/// The opaque vector engine contract.
///
/// All operations are asynchronous and cancellable; callers wrap them in
/// deadlines. Implementations must be safe for concurrent use.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Create a collection with the given layout. Creating an existing
    /// collection with the same layout is a no-op.
    async fn create_collection(&self, name: &str, spec: &CollectionSpec) -> Result<()>;

    /// Whether a collection exists.
    async fn collection_exists(&self, name: &str) -> Result<bool>;

    /// Names of all collections.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Drop a collection and everything in it. Unknown names are a no-op.
    async fn drop_collection(&self, name: &str) -> Result<()>;

    /// Insert or replace points by id.
    async fn upsert(&self, collection: &str, points: Vec<PointRecord>) -> Result<()>;

    /// Fetch points by id; unknown ids are silently absent from the result.
    async fn retrieve(&self, collection: &str, ids: &[PointId]) -> Result<Vec<PointRecord>>;

    /// Delete points by id.
    async fn delete(&self, collection: &str, ids: &[PointId]) -> Result<()>;

    /// Delete every point matching the filter; returns how many went away.
    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Count points matching the filter.
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Page through points matching the filter in id order.
    async fn scroll(
        &self,
        collection: &str,
        filter: &Filter,
        offset: Option<PointId>,
        limit: usize,
    ) -> Result<ScrollPage>;

    /// Grouped enumeration: best `group_size` hits per `group_by` value.
    async fn search_grouped(
        &self,
        collection: &str,
        request: GroupedSearchRequest,
    ) -> Result<Vec<PointGroup>>;

    /// Recommend points similar to `positive` and unlike `negative`
    /// examples. Scores are `mean_cos(positive) − mean_cos(negative)`;
    /// example ids missing from the collection contribute zero.
    async fn recommend(
        &self,
        collection: &str,
        request: RecommendRequest,
    ) -> Result<Vec<ScoredPoint>>;
}

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **via-forensic** – Tier-2 forensic store for Vector Incident Atlas.
//!
//! A thin façade over the vector backend that owns everything Tier-2:
//! the `forensic_YYYY_MM_DD` naming convention, the hybrid dense+sparse
//! collection layout with its quantization and payload indexes, lazy
//! creation on first write, retention drops, and the daily IDF corpus scan.
//! Collections are never mutated after their day closes, except by the
//! retention sweep.

use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{debug, info};

use via_store_core::{
    CollectionSpec, Distance, Filter, NamedVectors, PayloadIndex, PointRecord, Quantization,
    VectorBackend,
};
use via_types::{utc_day, IncidentRecord, SparseVector};

/// Prefix of every Tier-2 collection name.
pub const COLLECTION_PREFIX: &str = "forensic_";

/// Dimensionality of the Tier-2 dense embedding.
pub const TIER2_DENSE_DIM: usize = 384;

const SCROLL_PAGE: usize = 512;

/// The hybrid layout every forensic partition is created with.
pub fn collection_spec() -> CollectionSpec {
    CollectionSpec {
        dense_dim: TIER2_DENSE_DIM,
        distance: Distance::Cosine,
        on_disk: true,
        quantization: Some(Quantization::ScalarInt8),
        with_sparse: true,
        payload_indexes: vec![
            PayloadIndex::keyword("service"),
            PayloadIndex::integer("rhythm_hash"),
            PayloadIndex::integer("promoted_at"),
            PayloadIndex::integer("first_seen_ts"),
            PayloadIndex::integer("last_seen_ts"),
        ],
    }
}

/// Collection name for the UTC day of `ts`.
pub fn collection_for_ts(ts: i64) -> String {
    format!("{COLLECTION_PREFIX}{}", utc_day(ts))
}

/// Parse a collection name back into its UTC day.
pub fn day_of_collection(name: &str) -> Option<NaiveDate> {
    let day = name.strip_prefix(COLLECTION_PREFIX)?;
    NaiveDate::parse_from_str(day, "%Y_%m_%d").ok()
}

/// Inclusive epoch-second bounds of a collection's day.
fn day_bounds(date: NaiveDate) -> (i64, i64) {
    let start = date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp()).unwrap_or(0);
    (start, start + 86_399)
}

//─────────────────────────────
//  Store façade
//─────────────────────────────

/// Owner of the Tier-2 partitions.
pub struct ForensicStore {
    backend: Arc<dyn VectorBackend>,
    retention_days: i64,
}

impl ForensicStore {
    /// Façade over `backend`, dropping partitions older than
    /// `retention_days`.
    pub fn new(backend: Arc<dyn VectorBackend>, retention_days: i64) -> Self {
        Self {
            backend,
            retention_days,
        }
    }

    /// The underlying engine, for the federated query layer.
    pub fn backend(&self) -> Arc<dyn VectorBackend> {
        self.backend.clone()
    }

    /// Create the partition for `name` lazily with the canonical layout.
    pub async fn ensure_collection(&self, name: &str) -> Result<()> {
        if !self.backend.collection_exists(name).await? {
            self.backend.create_collection(name, &collection_spec()).await?;
            info!(collection = name, "forensic partition created");
        }
        Ok(())
    }

    /// Upsert one incident record into its day's partition.
    pub async fn put_incident(
        &self,
        record: &IncidentRecord,
        dense: Vec<f32>,
        sparse: SparseVector,
    ) -> Result<()> {
        let collection = collection_for_ts(record.promoted_at);
        self.ensure_collection(&collection).await?;
        let point = PointRecord {
            id: IncidentRecord::incident_id(record.rhythm_hash, &utc_day(record.promoted_at)),
            vectors: NamedVectors {
                dense: Some(dense),
                sparse: Some(sparse),
            },
            payload: record.to_payload(),
        };
        self.backend.upsert(&collection, vec![point]).await
    }

    /// Fetch the incident of `(rhythm_hash, day-of-promoted_at)` if present.
    pub async fn get_incident(
        &self,
        rhythm_hash: u64,
        promoted_at: i64,
    ) -> Result<Option<IncidentRecord>> {
        let collection = collection_for_ts(promoted_at);
        if !self.backend.collection_exists(&collection).await? {
            return Ok(None);
        }
        let id = IncidentRecord::incident_id(rhythm_hash, &utc_day(promoted_at));
        let points = self.backend.retrieve(&collection, &[id]).await?;
        match points.into_iter().next() {
            Some(point) => Ok(Some(
                IncidentRecord::from_payload(&point.payload).map_err(|e| anyhow::anyhow!(e))?,
            )),
            None => Ok(None),
        }
    }

    /// All existing partitions, oldest first.
    pub async fn partitions(&self) -> Result<Vec<String>> {
        Ok(self
            .backend
            .list_collections()
            .await?
            .into_iter()
            .filter(|name| day_of_collection(name).is_some())
            .collect())
    }

    /// Partitions whose day overlaps `[start_ts, end_ts]`.
    pub async fn partitions_overlapping(&self, start_ts: i64, end_ts: i64) -> Result<Vec<String>> {
        Ok(self
            .partitions()
            .await?
            .into_iter()
            .filter(|name| {
                day_of_collection(name)
                    .map(|date| {
                        let (day_start, day_end) = day_bounds(date);
                        day_start <= end_ts && day_end >= start_ts
                    })
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Number of live partitions.
    pub async fn partition_count(&self) -> Result<usize> {
        Ok(self.partitions().await?.len())
    }

    /// Drop partitions whose day closed more than the retention window ago.
    /// Returns the dropped names.
    pub async fn retention_sweep(&self, now: i64) -> Result<Vec<String>> {
        let cutoff = now - self.retention_days * 86_400;
        let mut dropped = Vec::new();
        for name in self.partitions().await? {
            let Some(date) = day_of_collection(&name) else {
                continue;
            };
            let (_, day_end) = day_bounds(date);
            if day_end < cutoff {
                self.backend.drop_collection(&name).await?;
                info!(collection = %name, "forensic partition dropped by retention");
                dropped.push(name);
            }
        }
        Ok(dropped)
    }

    /// Representative messages across all partitions, for the daily IDF
    /// snapshot rebuild; capped at `limit` documents.
    pub async fn representative_corpus(&self, limit: usize) -> Result<Vec<String>> {
        let mut corpus = Vec::new();
        'partitions: for name in self.partitions().await? {
            let mut offset = None;
            loop {
                let page = self
                    .backend
                    .scroll(&name, &Filter::all(), offset, SCROLL_PAGE)
                    .await?;
                for point in page.points {
                    if let Some(message) =
                        via_store_core::payload_str(&point.payload, "representative_message")
                    {
                        corpus.push(message.to_string());
                        if corpus.len() >= limit {
                            break 'partitions;
                        }
                    }
                }
                match page.next_offset {
                    Some(next) => offset = Some(next),
                    None => break,
                }
            }
        }
        debug!(documents = corpus.len(), "idf corpus scanned");
        Ok(corpus)
    }
}

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **via-types** – Shared primitive data structures for Vector Incident Atlas.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the log-event wire shape, the rhythm-hash and point-id math,
//! the Tier-2 incident record, control-loop records, and the error taxonomy.

use std::collections::{HashMap, HashSet};

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod error;
pub use error::ViaError;

//─────────────────────────────
//  Bounds
//─────────────────────────────

/// Maximum number of attribute entries accepted per event.
pub const MAX_ATTRIBUTES: usize = 32;

/// Maximum accepted message length in bytes to prevent memory exhaustion.
pub const MAX_MESSAGE_LEN: usize = 65_536;

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// 64-bit structural fingerprint of a rhythm class.
///
/// Derived from an event's level, service, and skeletonized message; stable
/// across restarts because it is computed from a keyed-nothing blake3 digest
/// rather than a randomized hasher.
pub type RhythmHash = u64;

/// Content-addressed 128-bit identifier of a Tier-1 point.
pub type PointId = Uuid;

/// Convert a rhythm hash to SQLite's signed integer representation.
pub fn hash_to_db(hash: RhythmHash) -> i64 {
    hash as i64
}

/// Inverse of [`hash_to_db`].
pub fn hash_from_db(raw: i64) -> RhythmHash {
    raw as u64
}

/// Current wall-clock time as a second-resolution epoch.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// UTC day of an epoch timestamp, formatted `YYYY_MM_DD`.
///
/// Timestamps before the epoch clamp to day zero; the engine never produces
/// them, but the formatter must not panic on hostile input.
pub fn utc_day(ts: i64) -> String {
    match Utc.timestamp_opt(ts.max(0), 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y_%m_%d").to_string(),
        _ => "1970_01_01".to_string(),
    }
}

//─────────────────────────────
//  Log events
//─────────────────────────────

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    /// Finest-grained diagnostic output.
    Trace,
    /// Developer diagnostics.
    Debug,
    /// Routine operational messages.
    Info,
    /// Something unexpected but recoverable.
    Warn,
    /// An operation failed.
    Error,
    /// The emitting process is about to die.
    Fatal,
}

impl Level {
    /// Canonical uppercase name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }
}

impl std::str::FromStr for Level {
    type Err = ViaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Level::Trace),
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "ERROR" => Ok(Level::Error),
            "FATAL" => Ok(Level::Fatal),
            other => Err(ViaError::BadEvent(format!("unknown level `{other}`"))),
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single log event as accepted on the ingest path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Second-resolution epoch timestamp.
    pub ts: i64,
    /// Short identifier of the emitting service.
    pub service: String,
    /// Severity.
    pub level: Level,
    /// Unicode message text.
    pub message: String,
    /// Bounded string attributes.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl LogEvent {
    /// Validate the event against the data-model bounds.
    ///
    /// Rejections surface as [`ViaError::BadEvent`]; the caller counts them
    /// in `parse_failed` and keeps going.
    pub fn validate(&self) -> Result<(), ViaError> {
        if self.ts <= 0 {
            return Err(ViaError::BadEvent(format!(
                "ts must be a positive epoch, got {}",
                self.ts
            )));
        }
        if self.message.is_empty() {
            return Err(ViaError::BadEvent("empty message".into()));
        }
        if self.message.len() > MAX_MESSAGE_LEN {
            return Err(ViaError::BadEvent(format!(
                "message too long: {} > {}",
                self.message.len(),
                MAX_MESSAGE_LEN
            )));
        }
        if self.service.is_empty() {
            return Err(ViaError::BadEvent("empty service".into()));
        }
        if self.attributes.len() > MAX_ATTRIBUTES {
            return Err(ViaError::BadEvent(format!(
                "too many attributes: {} > {}",
                self.attributes.len(),
                MAX_ATTRIBUTES
            )));
        }
        Ok(())
    }

    /// Content-addressed identity over `(ts, service, message)`.
    ///
    /// Identical re-ingests (restart replays, at-least-once senders) map to
    /// the same 128-bit id, which is what makes dedup and upsert idempotent.
    pub fn point_id(&self) -> PointId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.ts.to_le_bytes());
        hasher.update(self.service.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.message.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        Uuid::from_bytes(bytes)
    }
}

//─────────────────────────────
//  Sparse vectors
//─────────────────────────────

/// A BM25-style sparse vector: parallel term-index and weight arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    /// Hashed term indices, strictly ascending.
    pub indices: Vec<u32>,
    /// Per-term weights, parallel to `indices`.
    pub values: Vec<f32>,
}

impl SparseVector {
    /// True when the vector carries no terms.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

//─────────────────────────────
//  Tier-1 point payload
//─────────────────────────────

/// Payload stored alongside every Tier-1 point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier1Payload {
    /// Event timestamp.
    pub ts: i64,
    /// Emitting service.
    pub service: String,
    /// Severity.
    pub level: Level,
    /// Structural fingerprint of the event.
    pub rhythm_hash: RhythmHash,
    /// Original message text.
    pub message: String,
}

impl Tier1Payload {
    /// Serialize into a flat JSON payload map for the vector backend.
    pub fn to_payload(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    /// Rebuild from a backend payload map.
    pub fn from_payload(
        payload: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, ViaError> {
        serde_json::from_value(serde_json::Value::Object(payload.clone()))
            .map_err(|e| ViaError::BackendUnavailable(format!("malformed tier-1 payload: {e}")))
    }

    /// The event this payload was built from, attributes elided.
    pub fn to_event(&self) -> LogEvent {
        LogEvent {
            ts: self.ts,
            service: self.service.clone(),
            level: self.level,
            message: self.message.clone(),
            attributes: HashMap::new(),
        }
    }
}

//─────────────────────────────
//  Tier-2 incident records
//─────────────────────────────

/// One promoted incident: a unique `(rhythm_hash, UTC day)` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    /// Rhythm class this incident belongs to.
    pub rhythm_hash: RhythmHash,
    /// Service of the representative event.
    pub service: String,
    /// Severity of the representative event.
    pub level: Level,
    /// Most recent message of the class at promotion time.
    pub representative_message: String,
    /// Earliest sighting within the promoted window.
    pub first_seen_ts: i64,
    /// Latest sighting within the promoted window.
    pub last_seen_ts: i64,
    /// Number of events aggregated under the class.
    pub count: u64,
    /// Promotion wall-clock timestamp.
    pub promoted_at: i64,
    /// Anomaly score at promotion time.
    pub promoted_score: f64,
}

impl IncidentRecord {
    /// Stable Tier-2 point id for this record's `(rhythm_hash, UTC day)`.
    ///
    /// Re-promoting the same class on the same day lands on the same id,
    /// which is what makes promotion idempotent within a day.
    pub fn incident_id(rhythm_hash: RhythmHash, day: &str) -> PointId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&rhythm_hash.to_le_bytes());
        hasher.update(b"\x1f");
        hasher.update(day.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        Uuid::from_bytes(bytes)
    }

    /// Serialize into a flat JSON payload map for the vector backend.
    pub fn to_payload(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    /// Rebuild a record from a backend payload map.
    pub fn from_payload(
        payload: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, ViaError> {
        serde_json::from_value(serde_json::Value::Object(payload.clone()))
            .map_err(|e| ViaError::BackendUnavailable(format!("malformed incident payload: {e}")))
    }
}

//─────────────────────────────
//  Control records
//─────────────────────────────

/// Kind of an operator verdict on a rhythm class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    /// TTL-bounded: hide the class from anomaly output until expiry.
    Suppress,
    /// Permanent: the class is normal; it never surfaces or promotes again.
    Patch,
}

impl ControlKind {
    /// Canonical lowercase name as stored in the control table.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKind::Suppress => "suppress",
            ControlKind::Patch => "patch",
        }
    }
}

/// A persisted suppress/patch row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRecord {
    /// Rhythm class the verdict applies to.
    pub rhythm_hash: RhythmHash,
    /// Suppress or patch.
    pub kind: ControlKind,
    /// Row creation epoch.
    pub created_at: i64,
    /// Expiry epoch; `None` for patches.
    pub expires_at: Option<i64>,
    /// Operator-supplied free text.
    pub reason: String,
    /// Identity of the operator who issued the verdict.
    pub operator_id: String,
}

/// Snapshot of the currently active suppress/patch set.
///
/// Built by the control registry and swapped copy-on-write; readers clone an
/// `Arc` and never block a writer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveControls {
    /// Suppressed hashes with their expiry epochs.
    pub suppressed: HashMap<RhythmHash, i64>,
    /// Permanently patched hashes.
    pub patched: HashSet<RhythmHash>,
}

impl ActiveControls {
    /// True when the hash must be hidden from anomaly output at `now`.
    pub fn is_hidden(&self, hash: RhythmHash, now: i64) -> bool {
        if self.patched.contains(&hash) {
            return true;
        }
        matches!(self.suppressed.get(&hash), Some(expiry) if *expiry > now)
    }

    /// True when the hash is permanently patched.
    pub fn is_patched(&self, hash: RhythmHash) -> bool {
        self.patched.contains(&hash)
    }

    /// All hashes hidden at `now`, for backend-side filtering.
    pub fn hidden_at(&self, now: i64) -> HashSet<RhythmHash> {
        let mut hidden: HashSet<RhythmHash> = self.patched.iter().copied().collect();
        hidden.extend(
            self.suppressed
                .iter()
                .filter(|(_, expiry)| **expiry > now)
                .map(|(hash, _)| *hash),
        );
        hidden
    }
}

//─────────────────────────────
//  Schema records
//─────────────────────────────

/// Field roles a raw delimited log line can carry, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaField {
    /// Timestamp column, parsed with the record's `timestamp_format`.
    Timestamp,
    /// Service identifier column.
    Service,
    /// Severity column.
    Level,
    /// Message column; consumes the rest of the line.
    Message,
    /// Ignored column.
    Skip,
}

/// Per-source parsing recipe consulted by the ingestor for raw lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRecord {
    /// Characters that separate fields.
    pub delimiters: String,
    /// Column roles in order of appearance.
    pub field_order: Vec<SchemaField>,
    /// `chrono` format string for the timestamp column.
    pub timestamp_format: String,
}

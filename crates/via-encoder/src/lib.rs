#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **via-encoder** – Rhythm encoder for Vector Incident Atlas.
//!
//! Maps a raw log event to its structural *skeleton* (variable lexemes
//! replaced by class placeholders), a stable 64-bit rhythm hash, and a fast
//! 64-dimensional dense embedding of the skeleton. BM25 sparse vectors over
//! the original message live in [`bm25`] and are only produced on the
//! promotion path.
//!
//! Everything here is a pure function of its inputs: same event, same
//! configuration, same output — across process restarts.

use via_types::{LogEvent, RhythmHash, ViaError};

pub mod bm25;
mod dense;
mod skeleton;

pub use bm25::{bm25_sparse, IdfSnapshot};
pub use dense::dense_embed;
pub use skeleton::skeletonize;

/// Dimensionality of the cheap Tier-1 embedding.
pub const TIER1_DIM: usize = 64;

//─────────────────────────────
//  Encoding
//─────────────────────────────

/// Structural encoding of one log event.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    /// Stable 64-bit fingerprint of `level|service|skeleton`.
    pub rhythm_hash: RhythmHash,
    /// Token-class skeleton of the message.
    pub skeleton: String,
    /// 64-D dense embedding of the skeleton, L2-normalized.
    pub dense: Vec<f32>,
}

/// Encode an event into its rhythm representation.
///
/// Fails with [`ViaError::BadEvent`] for events that violate the data-model
/// bounds (empty message, non-positive timestamp). Never panics.
pub fn encode(event: &LogEvent) -> Result<Encoded, ViaError> {
    event.validate()?;
    let skeleton = skeletonize(&event.message);
    let rhythm_hash = rhythm_hash(event.level.as_str(), &event.service, &skeleton);
    let dense = dense_embed(&skeleton, TIER1_DIM);
    Ok(Encoded {
        rhythm_hash,
        skeleton,
        dense,
    })
}

/// Full encoder form: dense plus the BM25 sparse vector over the *original*
/// message, using the supplied collection-wide IDF snapshot.
pub fn encode_with_sparse(
    event: &LogEvent,
    idf: &IdfSnapshot,
) -> Result<(Encoded, via_types::SparseVector), ViaError> {
    let encoded = encode(event)?;
    let sparse = bm25_sparse(&event.message, idf);
    Ok((encoded, sparse))
}

/// Stable 64-bit fingerprint of `level|service|skeleton`.
///
/// Blake3 keyed by nothing, truncated to 64 bits: deterministic across
/// restarts and architectures, unlike the std randomized hasher.
pub fn rhythm_hash(level: &str, service: &str, skeleton: &str) -> RhythmHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(level.as_bytes());
    hasher.update(b"|");
    hasher.update(service.as_bytes());
    hasher.update(b"|");
    hasher.update(skeleton.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

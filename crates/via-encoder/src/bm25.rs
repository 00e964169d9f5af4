//! BM25 sparse vectors over original message tokens.
//!
//! Term weights follow the classic Okapi formulation against a
//! collection-wide IDF snapshot. The snapshot is rebuilt daily from Tier-2
//! representative messages and swapped copy-on-write by the runtime; this
//! module only reads it.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;

use via_types::SparseVector;

const K1: f32 = 1.2;
const B: f32 = 0.75;

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9_]+").unwrap());

/// Lowercased word tokens of a message, variables kept.
pub fn tokenize(message: &str) -> Vec<String> {
    WORD.find_iter(message)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Immutable document-frequency snapshot of the forensic corpus.
#[derive(Debug, Clone, Default)]
pub struct IdfSnapshot {
    doc_count: u64,
    avg_len: f32,
    df: HashMap<String, u64>,
}

impl IdfSnapshot {
    /// An empty snapshot; every term gets the cold-start IDF.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from a corpus of documents.
    pub fn from_corpus<'a>(docs: impl IntoIterator<Item = &'a str>) -> Self {
        let mut df: HashMap<String, u64> = HashMap::new();
        let mut doc_count = 0u64;
        let mut total_len = 0u64;
        for doc in docs {
            let tokens = tokenize(doc);
            total_len += tokens.len() as u64;
            doc_count += 1;
            let mut seen: Vec<&String> = Vec::new();
            for token in &tokens {
                if !seen.contains(&token) {
                    *df.entry(token.clone()).or_insert(0) += 1;
                    seen.push(token);
                }
            }
        }
        let avg_len = if doc_count == 0 {
            0.0
        } else {
            total_len as f32 / doc_count as f32
        };
        Self {
            doc_count,
            avg_len,
            df,
        }
    }

    /// Number of documents behind the snapshot.
    pub fn doc_count(&self) -> u64 {
        self.doc_count
    }

    /// Okapi IDF of a term; unseen terms get the maximum.
    pub fn idf(&self, term: &str) -> f32 {
        let df = self.df.get(term).copied().unwrap_or(0) as f32;
        let n = self.doc_count as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn avg_len_or(&self, fallback: f32) -> f32 {
        if self.avg_len > 0.0 {
            self.avg_len
        } else {
            fallback
        }
    }
}

/// Stable 32-bit index of a term in the sparse space.
fn term_index(term: &str) -> u32 {
    let digest = blake3::hash(term.as_bytes());
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&digest.as_bytes()[..4]);
    u32::from_le_bytes(bytes)
}

/// BM25 term vector of a message against the given snapshot.
///
/// Indices are ascending; colliding term indices merge by summing weights.
pub fn bm25_sparse(message: &str, idf: &IdfSnapshot) -> SparseVector {
    let tokens = tokenize(message);
    if tokens.is_empty() {
        return SparseVector::default();
    }
    let doc_len = tokens.len() as f32;
    let avg_len = idf.avg_len_or(doc_len);

    let mut tf: HashMap<&str, u32> = HashMap::new();
    for token in &tokens {
        *tf.entry(token.as_str()).or_insert(0) += 1;
    }

    let mut weights: BTreeMap<u32, f32> = BTreeMap::new();
    for (term, count) in tf {
        let tf = count as f32;
        let weight =
            idf.idf(term) * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * doc_len / avg_len));
        *weights.entry(term_index(term)).or_insert(0.0) += weight;
    }

    let (indices, values) = weights.into_iter().unzip();
    SparseVector { indices, values }
}

//! Fast deterministic dense embeddings via signed feature hashing.

/// Embed a skeleton into a `dim`-dimensional dense vector.
///
/// Token unigrams and order-preserving bigrams are hashed into buckets with
/// a blake3-derived index and sign, then the vector is L2-normalized.
/// Skeletons sharing most of their tokens land close under cosine distance,
/// which is all Tier-1 asks of its embedding. No model, no I/O, identical
/// output across restarts.
pub fn dense_embed(skeleton: &str, dim: usize) -> Vec<f32> {
    let mut acc = vec![0.0f32; dim.max(1)];
    let tokens: Vec<&str> = skeleton.split_whitespace().collect();

    for token in &tokens {
        bump(&mut acc, token.as_bytes(), 1.0);
    }
    for pair in tokens.windows(2) {
        let feature = format!("{}\x1f{}", pair[0], pair[1]);
        bump(&mut acc, feature.as_bytes(), 0.5);
    }

    let norm: f32 = acc.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut acc {
            *v /= norm;
        }
    }
    acc
}

fn bump(acc: &mut [f32], feature: &[u8], weight: f32) {
    let digest = blake3::hash(feature);
    let bytes = digest.as_bytes();
    let mut idx_bytes = [0u8; 8];
    idx_bytes.copy_from_slice(&bytes[..8]);
    let idx = (u64::from_le_bytes(idx_bytes) % acc.len() as u64) as usize;
    let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
    acc[idx] += sign * weight;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn deterministic_and_normalized() {
        let a = dense_embed("connection established from <ip>:<num>", 64);
        let b = dense_embed("connection established from <ip>:<num>", 64);
        assert_eq!(a, b);
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_skeletons_are_closer_than_unrelated_ones() {
        let base = dense_embed("connection established from <ip>:<num>", 64);
        let near = dense_embed("connection closed from <ip>:<num>", 64);
        let far = dense_embed("assertion failed at <path>:<num>", 64);
        assert!(cosine(&base, &near) > cosine(&base, &far));
    }

    #[test]
    fn empty_skeleton_is_the_zero_vector() {
        let v = dense_embed("", 64);
        assert_eq!(v.len(), 64);
        assert!(v.iter().all(|x| *x == 0.0));
    }
}

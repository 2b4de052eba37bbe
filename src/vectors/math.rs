//! Vector arithmetic shared by the attacher, consolidator, and retriever.
//!
//! All persisted vectors are `f32`; similarity math widens to `f64` so the
//! thresholds in [`crate::config`] compare cleanly.

/// Cosine similarity between two equal-length vectors.
///
/// Returns `None` when the dimensions differ. Callers decide what a
/// mismatch means (the attacher skips the candidate, DBSCAN pins the
/// distance to 1.0). A zero-norm operand yields `Some(0.0)`.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Scale a vector to unit L2 norm in place. Zero vectors are left alone.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f64 = v.iter().map(|x| f64::from(*x) * f64::from(*x)).sum();
    let norm = norm.sqrt();
    if norm == 0.0 {
        return;
    }
    for x in v.iter_mut() {
        *x = (f64::from(*x) / norm) as f32;
    }
}

/// Bring a vector to exactly `dim` components.
///
/// Longer vectors truncate; shorter vectors expand by cyclic repetition and
/// are re-normalized so the expansion does not inflate magnitude. Vectors
/// already at `dim` are returned unchanged.
#[must_use]
pub fn align_to_dim(v: &[f32], dim: usize) -> Vec<f32> {
    if v.len() == dim {
        return v.to_vec();
    }
    if v.is_empty() || dim == 0 {
        return vec![0.0; dim];
    }
    if v.len() > dim {
        return v[..dim].to_vec();
    }
    let mut out = Vec::with_capacity(dim);
    for i in 0..dim {
        out.push(v[i % v.len()]);
    }
    l2_normalize(&mut out);
    out
}

/// Arithmetic mean of a set of equal-length vectors.
///
/// Returns `None` for an empty set or mixed dimensions.
#[must_use]
pub fn mean_vector(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dim = first.len();
    if vectors.iter().any(|v| v.len() != dim) {
        return None;
    }
    let mut acc = vec![0.0f64; dim];
    for v in vectors {
        for (slot, x) in acc.iter_mut().zip(v.iter()) {
            *slot += f64::from(*x);
        }
    }
    let n = vectors.len() as f64;
    Some(acc.into_iter().map(|x| (x / n) as f32).collect())
}

/// Online weighted-average centroid update: `(c·n + v) / (n + 1)`.
///
/// `count` is the number of members already folded into `centroid`. The
/// result equals the arithmetic mean over all `count + 1` members, so
/// linking in any order converges to the same centroid.
#[must_use]
pub fn online_mean(centroid: &[f32], count: usize, v: &[f32]) -> Vec<f32> {
    debug_assert_eq!(centroid.len(), v.len());
    let n = count as f64;
    centroid
        .iter()
        .zip(v.iter())
        .map(|(c, x)| (((f64::from(*c) * n) + f64::from(*x)) / (n + 1.0)) as f32)
        .collect()
}

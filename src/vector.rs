//! Dense-vector primitives: normalisation, dot products, top-k selection.
//!
//! All functions operate on fixed-length `&[f32]` slices of
//! [`EMBEDDING_DIM`](crate::embedding::EMBEDDING_DIM) and avoid allocation
//! in hot paths. Stored and query vectors maintain the unit-L2 invariant,
//! so cosine similarity is a plain dot product.

/// Tolerance for the unit-norm invariant: `|‖v‖₂ − 1| < NORM_EPSILON`.
pub const NORM_EPSILON: f32 = 1e-5;

/// L2-normalise in place. Returns `false` for a zero vector, which is left
/// unchanged — callers must reject it.
pub fn l2_normalize_in_place(v: &mut [f32]) -> bool {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
        true
    } else {
        false
    }
}

/// Dot product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity. Under the unit-norm invariant this is just [`dot`];
/// the full form exists for diagnostics over vectors of unknown provenance.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot(a, b) / (norm_a * norm_b)
}

/// True when `v` satisfies the unit-norm invariant within [`NORM_EPSILON`].
pub fn is_unit(v: &[f32]) -> bool {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    (norm - 1.0).abs() < NORM_EPSILON
}

/// Select the `k` highest-scoring entries, non-increasing by score, ties
/// broken by ascending id so ranking is stable across runs.
pub fn top_k<I: Ord + Copy>(mut scored: Vec<(I, f32)>, k: usize) -> Vec<(I, f32)> {
    let k = k.min(scored.len());
    if k == 0 {
        return Vec::new();
    }
    // Partial selection: only the winning prefix needs full ordering.
    scored.select_nth_unstable_by(k - 1, |a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(k);
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_vector() {
        let mut v = vec![3.0, 4.0];
        assert!(l2_normalize_in_place(&mut v));
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert!(is_unit(&v));
    }

    #[test]
    fn normalize_flags_zero_vector() {
        let mut v = vec![0.0; 384];
        assert!(!l2_normalize_in_place(&mut v));
        assert_eq!(v, vec![0.0; 384]);
    }

    #[test]
    fn dot_of_unit_vectors_is_cosine() {
        let mut a = vec![1.0, 2.0, 3.0];
        let mut b = vec![2.0, 1.0, 0.5];
        l2_normalize_in_place(&mut a);
        l2_normalize_in_place(&mut b);
        assert!((dot(&a, &b) - cosine(&a, &b)).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn top_k_orders_by_score() {
        let scored = vec![(1u32, 0.2), (2, 0.9), (3, 0.5)];
        let top = top_k(scored, 2);
        assert_eq!(top, vec![(2, 0.9), (3, 0.5)]);
    }

    #[test]
    fn top_k_breaks_ties_by_ascending_id() {
        let scored = vec![(9u32, 0.5), (1, 0.5), (4, 0.5), (2, 0.7)];
        let top = top_k(scored, 3);
        assert_eq!(top, vec![(2, 0.7), (1, 0.5), (4, 0.5)]);
    }

    #[test]
    fn top_k_handles_short_input() {
        let scored = vec![(1u32, 0.3)];
        assert_eq!(top_k(scored, 5), vec![(1, 0.3)]);
        assert!(top_k(Vec::<(u32, f32)>::new(), 5).is_empty());
    }
}

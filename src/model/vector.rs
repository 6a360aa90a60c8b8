//! Embeddings, affect vectors and the shared EMA fold.

use serde::{Deserialize, Serialize};

/// Dense embedding attached to nodes, entity centroids and link topics.
pub type Embedding = Vec<f32>;

/// `new = α·sample + (1-α)·old`.
#[inline]
pub fn ema(old: f64, sample: f64, alpha: f64) -> f64 {
    alpha * sample + (1.0 - alpha) * old
}

/// Cosine similarity in [-1, 1]. Returns `None` for mismatched lengths or
/// zero-norm inputs, so callers can tell "orthogonal" from "unknown".
pub fn cosine(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= f64::EPSILON || nb <= f64::EPSILON {
        return None;
    }
    Some((dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0))
}

/// Element-wise mean of two embeddings of equal length.
pub fn midpoint(a: &[f32], b: &[f32]) -> Option<Embedding> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    Some(a.iter().zip(b).map(|(x, y)| (x + y) * 0.5).collect())
}

/// Fold `sample` into `current` with smoothing `alpha`. A missing or
/// mismatched current value is replaced by the sample.
pub fn ema_embedding(current: Option<&[f32]>, sample: &[f32], alpha: f64) -> Embedding {
    match current {
        Some(cur) if cur.len() == sample.len() => cur
            .iter()
            .zip(sample)
            .map(|(c, s)| (alpha as f32) * s + (1.0 - alpha as f32) * c)
            .collect(),
        _ => sample.to_vec(),
    }
}

/// Weighted mean of a set of embeddings. Entries whose length differs
/// from the first are skipped.
pub fn weighted_mean<'a>(items: impl IntoIterator<Item = (&'a [f32], f64)>) -> Option<Embedding> {
    let mut acc: Option<Vec<f64>> = None;
    let mut total = 0.0;
    for (emb, w) in items {
        if w <= 0.0 || emb.is_empty() {
            continue;
        }
        let sum = acc.get_or_insert_with(|| vec![0.0; emb.len()]);
        if sum.len() != emb.len() {
            continue;
        }
        for (s, x) in sum.iter_mut().zip(emb) {
            *s += w * (*x as f64);
        }
        total += w;
    }
    let sum = acc?;
    if total <= 0.0 {
        return None;
    }
    Some(sum.into_iter().map(|s| (s / total) as f32).collect())
}

/// Two-dimensional affect (valence, arousal).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affect {
    pub valence: f64,
    pub arousal: f64,
}

impl Affect {
    pub fn new(valence: f64, arousal: f64) -> Self {
        Self { valence, arousal }
    }

    /// Cosine similarity between two affect vectors; `None` if either is zero.
    pub fn tone(&self, other: &Affect) -> Option<f64> {
        let dot = self.valence * other.valence + self.arousal * other.arousal;
        let na = self.valence.hypot(self.arousal);
        let nb = other.valence.hypot(other.arousal);
        if na <= f64::EPSILON || nb <= f64::EPSILON {
            return None;
        }
        Some((dot / (na * nb)).clamp(-1.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_matches_definition() {
        assert!((ema(1.0, 0.0, 0.1) - 0.9).abs() < 1e-12);
        assert!((ema(0.0, 1.0, 0.1) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_handles_degenerate_input() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0]), None);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), None);
        let c = cosine(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(c.abs() < 1e-12);
        let c = cosine(&[1.0, 1.0], &[2.0, 2.0]).unwrap();
        assert!((c - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_mean_skips_zero_weights() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let m = weighted_mean([(&a[..], 3.0), (&b[..], 1.0), (&b[..], 0.0)]).unwrap();
        assert!((m[0] - 0.75).abs() < 1e-6);
        assert!((m[1] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_affect_tone() {
        let calm = Affect::new(1.0, 0.0);
        let opposite = Affect::new(-1.0, 0.0);
        assert!((calm.tone(&opposite).unwrap() + 1.0).abs() < 1e-12);
        assert_eq!(calm.tone(&Affect::new(0.0, 0.0)), None);
    }
}

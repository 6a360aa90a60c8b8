//! The seven hungers and the gate vector they produce.
//!
//! A gate vector is a fixed `[f64; 7]` indexed by [`Hunger`]. Once built
//! through [`GateVector::from_scores`] it is non-negative and sums to one.

use serde::{Deserialize, Serialize};

/// Number of hunger channels.
pub const HUNGER_COUNT: usize = 7;

/// Named index into a gate vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hunger {
    Coherence = 0,
    Identity = 1,
    Integration = 2,
    Competence = 3,
    Surprise = 4,
    Control = 5,
    Belonging = 6,
}

impl Hunger {
    pub const ALL: [Hunger; HUNGER_COUNT] = [
        Hunger::Coherence,
        Hunger::Identity,
        Hunger::Integration,
        Hunger::Competence,
        Hunger::Surprise,
        Hunger::Control,
        Hunger::Belonging,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Hunger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Hunger::Coherence => "coherence",
            Hunger::Identity => "identity",
            Hunger::Integration => "integration",
            Hunger::Competence => "competence",
            Hunger::Surprise => "surprise",
            Hunger::Control => "control",
            Hunger::Belonging => "belonging",
        };
        f.write_str(name)
    }
}

/// Seven-component gate vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateVector(pub [f64; HUNGER_COUNT]);

impl Default for GateVector {
    fn default() -> Self {
        Self([0.0; HUNGER_COUNT])
    }
}

impl GateVector {
    /// Uniform gates, `1/7` each.
    pub fn uniform() -> Self {
        Self([1.0 / HUNGER_COUNT as f64; HUNGER_COUNT])
    }

    /// Normalise raw, weighted hunger scores into gates. Negative or
    /// non-finite scores count as zero; an all-zero input yields uniform gates.
    pub fn from_scores(scores: [f64; HUNGER_COUNT], weights: &[f64; HUNGER_COUNT]) -> Self {
        let mut gates = [0.0; HUNGER_COUNT];
        let mut total = 0.0;
        for i in 0..HUNGER_COUNT {
            let s = scores[i] * weights[i];
            let s = if s.is_finite() && s > 0.0 { s } else { 0.0 };
            gates[i] = s;
            total += s;
        }
        if total <= f64::EPSILON {
            return Self::uniform();
        }
        for g in &mut gates {
            *g /= total;
        }
        Self(gates)
    }

    #[inline]
    pub fn get(&self, hunger: Hunger) -> f64 {
        self.0[hunger.index()]
    }

    pub fn sum(&self) -> f64 {
        self.0.iter().sum()
    }

    /// Largest component and its hunger. Ties resolve to the lower index.
    pub fn dominant(&self) -> (Hunger, f64) {
        let mut best = (Hunger::Coherence, self.0[0]);
        for h in Hunger::ALL.iter().skip(1) {
            let v = self.0[h.index()];
            if v > best.1 {
                best = (*h, v);
            }
        }
        best
    }

    /// True when every component is in [0, 1] and the sum is within `tol` of one.
    pub fn is_normalized(&self, tol: f64) -> bool {
        self.0.iter().all(|g| (0.0..=1.0).contains(g)) && (self.sum() - 1.0).abs() <= tol
    }

    /// Component-wise EMA fold. Convex combination keeps each component in
    /// [0, 1] when both inputs are.
    pub fn fold(&mut self, sample: &GateVector, alpha: f64) {
        for i in 0..HUNGER_COUNT {
            self.0[i] = alpha * sample.0[i] + (1.0 - alpha) * self.0[i];
        }
    }
}

impl std::ops::Index<Hunger> for GateVector {
    type Output = f64;
    fn index(&self, h: Hunger) -> &f64 {
        &self.0[h.index()]
    }
}

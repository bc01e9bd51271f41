//! Settlement scoring rules.
//!
//! Two strategies behind one interface, selected by event shape: a quadratic
//! rule for binary markets scored on a submitted probability, and an RMSE
//! rule for vector answers delivered through commit-reveal. Both return
//! rewards in [0, 1] so they aggregate across participants without
//! normalization.

use rand::{Rng, RngCore};
use std::f64::consts::{FRAC_2_PI, FRAC_PI_2};
use tracing::warn;

use crate::models::{AbsentPolicy, Resolution};

/// A participant's accepted answer, in the shape its event calls for.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmittedAnswer {
    /// P(Yes) for a binary market.
    Probability(f64),
    /// Numeric vector, with the commit-reveal verdict already attached.
    Vector { values: Vec<f64>, verified: bool },
}

/// Revealed ground truth for a settled event.
#[derive(Debug, Clone, PartialEq)]
pub enum GroundTruth {
    Binary(Resolution),
    Vector(Vec<f64>),
}

/// Maps an accepted answer and the revealed truth to a reward in [0, 1].
///
/// CPU-only; the rng is only touched by the absent-answer floor policy so
/// callers can seed it deterministically.
pub trait ScoringRule: Send + Sync {
    fn score(
        &self,
        answer: Option<&SubmittedAnswer>,
        truth: &GroundTruth,
        rng: &mut dyn RngCore,
    ) -> f64;
}

fn absent_reward(policy: AbsentPolicy, rng: &mut dyn RngCore) -> f64 {
    match policy {
        AbsentPolicy::Zero => 0.0,
        AbsentPolicy::RandomFloor => rng.gen_range(0.0..0.1),
    }
}

/// Strictly proper quadratic rule over a binary outcome: truth `Yes` pays
/// `p²`, truth `No` pays `(1-p)²`. Reporting the calibrated probability
/// maximizes expected reward.
pub struct QuadraticScorer {
    pub absent: AbsentPolicy,
}

impl ScoringRule for QuadraticScorer {
    fn score(
        &self,
        answer: Option<&SubmittedAnswer>,
        truth: &GroundTruth,
        rng: &mut dyn RngCore,
    ) -> f64 {
        let Some(answer) = answer else {
            return absent_reward(self.absent, rng);
        };
        let SubmittedAnswer::Probability(p) = answer else {
            warn!("vector answer submitted to a binary market, scoring as zero");
            return 0.0;
        };
        let GroundTruth::Binary(resolution) = truth else {
            warn!("binary scorer invoked with vector ground truth, scoring as zero");
            return 0.0;
        };

        let p = p.clamp(0.0, 1.0);
        match resolution {
            Resolution::Yes => p * p,
            Resolution::No => (1.0 - p) * (1.0 - p),
            Resolution::Unknown => {
                // Flagged settled upstream without a usable outcome. Data
                // inconsistency, not a crash.
                warn!("event settled with unknown resolution, scoring as zero");
                0.0
            }
        }
    }
}

/// Scores a numeric vector against a same-shape truth vector via a squashed
/// RMSE: `(atan(-scale * rmse) + π/2) · 2/π`, which is 1 at a perfect match
/// and decays toward 0 as the error grows. An answer that did not pass
/// commit-reveal verification pays nothing regardless of closeness.
pub struct RmseScorer {
    pub scale: f64,
}

impl Default for RmseScorer {
    fn default() -> Self {
        Self { scale: 1.0 }
    }
}

impl ScoringRule for RmseScorer {
    fn score(
        &self,
        answer: Option<&SubmittedAnswer>,
        truth: &GroundTruth,
        _rng: &mut dyn RngCore,
    ) -> f64 {
        let Some(SubmittedAnswer::Vector { values, verified }) = answer else {
            return 0.0;
        };
        if !verified {
            return 0.0;
        }
        let GroundTruth::Vector(expected) = truth else {
            warn!("vector scorer invoked with binary ground truth, scoring as zero");
            return 0.0;
        };
        if values.len() != expected.len() {
            warn!(
                submitted = values.len(),
                expected = expected.len(),
                "answer vector shape mismatch, scoring as zero"
            );
            return 0.0;
        }
        if expected.is_empty() {
            return 0.0;
        }

        let mse: f64 = values
            .iter()
            .zip(expected)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            / expected.len() as f64;
        let rmse = mse.sqrt();

        ((-self.scale * rmse).atan() + FRAC_PI_2) * FRAC_2_PI
    }
}

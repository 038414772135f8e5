//! Turns a reconstruction-error distribution into a single cutoff.
//!
//! Decision rule everywhere in the crate: `error >= threshold` is anomalous.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DetectorError, Result};
use crate::evaluation::ConfusionMatrix;

pub const MIN_ERROR_SAMPLES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMetric {
    F1,
    Accuracy,
    BalancedAccuracy,
}

impl OptimizationMetric {
    fn score(self, cm: &ConfusionMatrix) -> f64 {
        match self {
            OptimizationMetric::F1 => cm.f1(),
            OptimizationMetric::Accuracy => cm.accuracy(),
            OptimizationMetric::BalancedAccuracy => (cm.recall() + cm.specificity()) / 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ThresholdPolicy {
    /// Linear-interpolated quantile of the reference errors.
    Quantile { quantile: f64 },
    /// `mean + k * std` of the reference errors.
    MeanStd { k: f64 },
    /// Best cutoff against known labels. Candidates are the distinct observed
    /// errors, or `grid_points` evenly spaced values between min and max.
    LabeledOptimal {
        metric: OptimizationMetric,
        grid_points: Option<usize>,
    },
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        ThresholdPolicy::Quantile { quantile: 0.99 }
    }
}

impl ThresholdPolicy {
    pub fn requires_labels(&self) -> bool {
        matches!(self, ThresholdPolicy::LabeledOptimal { .. })
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            ThresholdPolicy::Quantile { quantile } => {
                if !(quantile > 0.0 && quantile < 1.0) {
                    return Err(DetectorError::invalid_config(format!(
                        "quantile must be in (0, 1), got {quantile}"
                    )));
                }
            }
            ThresholdPolicy::MeanStd { k } => {
                if !k.is_finite() {
                    return Err(DetectorError::invalid_config("k must be finite"));
                }
            }
            ThresholdPolicy::LabeledOptimal { grid_points, .. } => {
                if matches!(grid_points, Some(n) if n < 2) {
                    return Err(DetectorError::invalid_config("grid_points must be >= 2"));
                }
            }
        }
        Ok(())
    }
}

/// Which error distribution the unlabeled policies look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReference {
    Training,
    Evaluation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThresholdConfig {
    pub policy: ThresholdPolicy,
    pub reference: ErrorReference,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            policy: ThresholdPolicy::default(),
            reference: ErrorReference::Training,
        }
    }
}

/// `labels[i] == true` marks `errors[i]` as anomalous. Only the labeled policy
/// reads them.
pub fn select_threshold(
    errors: &[f32],
    labels: Option<&[bool]>,
    policy: &ThresholdPolicy,
) -> Result<f32> {
    policy.validate()?;
    if errors.len() < MIN_ERROR_SAMPLES {
        return Err(DetectorError::InsufficientData {
            required: MIN_ERROR_SAMPLES,
            actual: errors.len(),
        });
    }
    DetectorError::check_finite(errors, 0)?;

    let threshold = match *policy {
        ThresholdPolicy::Quantile { quantile: q } => {
            let mut sorted = errors.to_vec();
            sorted.sort_by(f32::total_cmp);
            quantile(&sorted, q)
        }
        ThresholdPolicy::MeanStd { k } => {
            let n = errors.len() as f64;
            let mean = errors.iter().map(|&e| e as f64).sum::<f64>() / n;
            let var = errors
                .iter()
                .map(|&e| (e as f64 - mean).powi(2))
                .sum::<f64>()
                / n;
            (mean + k * var.sqrt()) as f32
        }
        ThresholdPolicy::LabeledOptimal {
            metric,
            grid_points,
        } => {
            let labels = labels.ok_or_else(|| {
                DetectorError::invalid_config("labeled_optimal threshold needs labels")
            })?;
            if labels.len() != errors.len() {
                return Err(DetectorError::dimension_mismatch(
                    "threshold labels",
                    errors.len(),
                    labels.len(),
                ));
            }
            labeled_optimal(errors, labels, metric, grid_points)
        }
    };

    debug!(threshold, ?policy, "selected threshold");
    Ok(threshold)
}

/// Quantile of ascending `sorted` with linear interpolation between ranks.
pub fn quantile(sorted: &[f32], q: f64) -> f32 {
    if sorted.is_empty() {
        return f32::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    (sorted[lo] as f64 + (sorted[hi] as f64 - sorted[lo] as f64) * frac) as f32
}

fn labeled_optimal(
    errors: &[f32],
    labels: &[bool],
    metric: OptimizationMetric,
    grid_points: Option<usize>,
) -> f32 {
    let mut pairs: Vec<(f32, bool)> = errors.iter().copied().zip(labels.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let candidates: Vec<f32> = match grid_points {
        Some(n) => {
            let (min, max) = (pairs[0].0, pairs[pairs.len() - 1].0);
            (0..n)
                .map(|i| min + (max - min) * i as f32 / (n - 1) as f32)
                .collect()
        }
        None => {
            let mut distinct: Vec<f32> = pairs.iter().map(|p| p.0).collect();
            distinct.dedup();
            distinct
        }
    };

    let total_pos = labels.iter().filter(|&&l| l).count();
    let total_neg = labels.len() - total_pos;

    // Ascending sweep; `below` counts rows strictly under the candidate.
    let mut below = 0;
    let mut below_pos = 0;
    let mut best = (f64::NEG_INFINITY, candidates[0]);
    for &t in &candidates {
        while below < pairs.len() && pairs[below].0 < t {
            if pairs[below].1 {
                below_pos += 1;
            }
            below += 1;
        }
        let cm = ConfusionMatrix {
            true_positives: total_pos - below_pos,
            false_positives: total_neg - (below - below_pos),
            true_negatives: below - below_pos,
            false_negatives: below_pos,
        };
        let score = metric.score(&cm);
        // strict comparison keeps the smallest threshold on ties
        if score > best.0 {
            best = (score, t);
        }
    }
    best.1
}

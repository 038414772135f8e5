use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DetectorError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

impl ConfusionMatrix {
    /// Applies `score >= threshold` to every record.
    pub fn from_scores(scores: &[f32], threshold: f32, labels: &[bool]) -> Self {
        let mut cm = Self::default();
        for (&score, &is_anomaly) in scores.iter().zip(labels) {
            match (score >= threshold, is_anomaly) {
                (true, true) => cm.true_positives += 1,
                (true, false) => cm.false_positives += 1,
                (false, true) => cm.false_negatives += 1,
                (false, false) => cm.true_negatives += 1,
            }
        }
        cm
    }

    pub fn total(&self) -> usize {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn specificity(&self) -> f64 {
        ratio(self.true_negatives, self.true_negatives + self.false_positives)
    }

    pub fn f1(&self) -> f64 {
        let precision = self.precision();
        let recall = self.recall();
        if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub threshold: f32,
    pub false_positive_rate: f64,
    pub true_positive_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrPoint {
    pub threshold: f32,
    pub recall: f64,
    pub precision: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub threshold: f32,
    pub confusion: ConfusionMatrix,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    /// 0.5 when only one class is present.
    pub auc_roc: f64,
    pub average_precision: f64,
    pub roc_curve: Vec<RocPoint>,
    pub pr_curve: Vec<PrPoint>,
}

impl EvaluationReport {
    pub fn print_report(&self) {
        println!("\n=== Evaluation Metrics ===");
        println!("Threshold: {:.6}", self.threshold);
        println!(
            "Accuracy: {:.4} ({:.2}%)",
            self.accuracy,
            self.accuracy * 100.0
        );
        println!("Precision: {:.4}", self.precision);
        println!("Recall: {:.4}", self.recall);
        println!("F1-Score: {:.4}", self.f1_score);
        println!("AUC-ROC: {:.4}", self.auc_roc);
        println!("Average Precision: {:.4}", self.average_precision);
        println!("\nConfusion Matrix:");
        println!("  True Positives: {}", self.confusion.true_positives);
        println!("  True Negatives: {}", self.confusion.true_negatives);
        println!("  False Positives: {}", self.confusion.false_positives);
        println!("  False Negatives: {}", self.confusion.false_negatives);
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Scores `scores` against ground truth (`true` = anomalous) at `threshold`,
/// plus threshold-free ranking metrics.
pub fn evaluate(scores: &[f32], threshold: f32, labels: &[bool]) -> Result<EvaluationReport> {
    if scores.len() != labels.len() {
        return Err(DetectorError::dimension_mismatch(
            "evaluation labels",
            scores.len(),
            labels.len(),
        ));
    }
    DetectorError::check_finite(scores, 0)?;

    let confusion = ConfusionMatrix::from_scores(scores, threshold, labels);
    let roc_curve = roc_curve(scores, labels);
    let pr_curve = pr_curve(scores, labels);

    Ok(EvaluationReport {
        threshold,
        confusion,
        accuracy: confusion.accuracy(),
        precision: confusion.precision(),
        recall: confusion.recall(),
        f1_score: confusion.f1(),
        auc_roc: auc(&roc_curve),
        average_precision: average_precision(&pr_curve),
        roc_curve,
        pr_curve,
    })
}

/// Counts `(threshold, tp, fp)` when flagging every score `>= threshold`, for
/// each distinct score from highest to lowest.
fn sweep(scores: &[f32], labels: &[bool]) -> Vec<(f32, usize, usize)> {
    let mut ranked: Vec<(f32, bool)> = scores.iter().copied().zip(labels.iter().copied()).collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut out = Vec::new();
    let (mut tp, mut fp) = (0, 0);
    let mut i = 0;
    while i < ranked.len() {
        let score = ranked[i].0;
        while i < ranked.len() && ranked[i].0.total_cmp(&score).is_eq() {
            if ranked[i].1 {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        out.push((score, tp, fp));
    }
    out
}

/// ROC points from `(0, 0)` to `(1, 1)`. Empty when a class is missing.
pub fn roc_curve(scores: &[f32], labels: &[bool]) -> Vec<RocPoint> {
    let positives = labels.iter().filter(|&&l| l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Vec::new();
    }

    let mut curve = vec![RocPoint {
        threshold: f32::MAX,
        false_positive_rate: 0.0,
        true_positive_rate: 0.0,
    }];
    for (threshold, tp, fp) in sweep(scores, labels) {
        curve.push(RocPoint {
            threshold,
            false_positive_rate: fp as f64 / negatives as f64,
            true_positive_rate: tp as f64 / positives as f64,
        });
    }
    curve
}

/// Trapezoidal area under `curve`; 0.5 for an empty curve.
pub fn auc(curve: &[RocPoint]) -> f64 {
    if curve.len() < 2 {
        return 0.5;
    }
    curve
        .windows(2)
        .map(|w| {
            (w[1].false_positive_rate - w[0].false_positive_rate)
                * (w[1].true_positive_rate + w[0].true_positive_rate)
                / 2.0
        })
        .sum()
}

/// Precision/recall at each distinct score, most conservative threshold first.
/// Empty when there are no anomalous labels.
pub fn pr_curve(scores: &[f32], labels: &[bool]) -> Vec<PrPoint> {
    let positives = labels.iter().filter(|&&l| l).count();
    if positives == 0 {
        return Vec::new();
    }
    sweep(scores, labels)
        .into_iter()
        .map(|(threshold, tp, fp)| PrPoint {
            threshold,
            recall: tp as f64 / positives as f64,
            precision: tp as f64 / (tp + fp) as f64,
        })
        .collect()
}

/// Sum of precision weighted by recall increments.
pub fn average_precision(curve: &[PrPoint]) -> f64 {
    let mut prev_recall = 0.0;
    let mut ap = 0.0;
    for p in curve {
        ap += (p.recall - prev_recall) * p.precision;
        prev_recall = p.recall;
    }
    ap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_normal_gives_zero_metrics() {
        let scores = [0.1, 0.2, 0.3];
        let labels = [false, false, false];
        let report = evaluate(&scores, 1.0, &labels).unwrap();
        assert_eq!(report.confusion.true_negatives, 3);
        assert_eq!(report.precision, 0.0);
        assert_eq!(report.recall, 0.0);
        assert_eq!(report.f1_score, 0.0);
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.auc_roc, 0.5);
        assert!(report.roc_curve.is_empty());
    }

    #[test]
    fn perfect_separation() {
        let scores = [0.1, 0.2, 0.3, 0.8, 0.9];
        let labels = [false, false, false, true, true];
        let report = evaluate(&scores, 0.8, &labels).unwrap();
        assert_eq!(report.f1_score, 1.0);
        assert!((report.auc_roc - 1.0).abs() < 1e-12);
        assert!((report.average_precision - 1.0).abs() < 1e-12);
    }

    #[test]
    fn threshold_is_inclusive() {
        let cm = ConfusionMatrix::from_scores(&[0.5, 0.49], 0.5, &[true, true]);
        assert_eq!(cm.true_positives, 1);
        assert_eq!(cm.false_negatives, 1);
    }

    #[test]
    fn confusion_counts_and_metrics() {
        let scores = [0.9, 0.8, 0.7, 0.2, 0.1, 0.6];
        let labels = [true, false, true, false, false, true];
        let report = evaluate(&scores, 0.65, &labels).unwrap();
        let cm = report.confusion;
        assert_eq!(cm.true_positives, 2);
        assert_eq!(cm.false_positives, 1);
        assert_eq!(cm.true_negatives, 2);
        assert_eq!(cm.false_negatives, 1);
        assert!((report.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((report.recall - 2.0 / 3.0).abs() < 1e-12);
        assert!((report.f1_score - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn auc_of_reversed_scores_is_zero() {
        let report = evaluate(&[0.9, 0.1], 0.5, &[false, true]).unwrap();
        assert_eq!(report.auc_roc, 0.0);
    }

    #[test]
    fn tied_scores_give_half_credit() {
        let report = evaluate(&[0.5, 0.5], 0.5, &[true, false]).unwrap();
        assert_eq!(report.auc_roc, 0.5);
        assert_eq!(report.roc_curve.len(), 2);
    }

    #[test]
    fn roc_curve_is_monotone_and_ends_at_one() {
        let scores = [0.3, 0.1, 0.7, 0.4, 0.9, 0.2];
        let labels = [false, false, true, true, false, true];
        let curve = roc_curve(&scores, &labels);
        assert!(curve.windows(2).all(|w| {
            w[1].false_positive_rate >= w[0].false_positive_rate
                && w[1].true_positive_rate >= w[0].true_positive_rate
        }));
        let last = curve.last().unwrap();
        assert_eq!((last.false_positive_rate, last.true_positive_rate), (1.0, 1.0));
    }

    #[test]
    fn mismatched_lengths() {
        assert!(matches!(
            evaluate(&[0.1, 0.2], 0.5, &[true]),
            Err(DetectorError::DimensionMismatch { expected: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn non_finite_scores_are_rejected() {
        assert!(matches!(
            evaluate(&[f32::NAN, 0.1], 0.5, &[true, false]),
            Err(DetectorError::NonFiniteScore { row: 0, .. })
        ));
        assert!(matches!(
            evaluate(&[0.1, f32::INFINITY], 0.5, &[true, false]),
            Err(DetectorError::NonFiniteScore { row: 1, .. })
        ));
    }

    #[test]
    fn curves_terminate_on_nan_scores() {
        let curve = roc_curve(&[f32::NAN, f32::NAN, 0.2], &[true, false, false]);
        // start point, the NaN group, then 0.2
        assert_eq!(curve.len(), 3);
        assert_eq!(pr_curve(&[f32::NAN, 0.2], &[true, false]).len(), 2);
    }

    #[test]
    fn report_serializes() {
        let report = evaluate(&[0.1, 0.9], 0.5, &[false, true]).unwrap();
        let json = report.to_json().unwrap();
        assert_eq!(json["confusion"]["true_positives"], 1);
        assert_eq!(json["auc_roc"], 1.0);
    }
}

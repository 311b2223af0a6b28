//! Held-out evaluation metrics and the baseline comparison.

use serde::{Deserialize, Serialize};
use tracing::info;

const LOG_LOSS_EPS: f64 = 1e-15;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub logloss: f64,
    pub auc: f64,
    pub calibration: f64,
}

pub fn calculate_metrics(y_true: &[f64], y_pred: &[f64]) -> EvalMetrics {
    let metrics = EvalMetrics {
        logloss: log_loss(y_true, y_pred),
        auc: roc_auc(y_true, y_pred),
        calibration: calibration_score(y_true, y_pred),
    };
    info!(
        component = "evaluation",
        event = "evaluation.metrics",
        logloss = metrics.logloss,
        auc = metrics.auc,
        calibration = metrics.calibration
    );
    metrics
}

/// Mean binary cross-entropy with predictions clipped away from 0 and 1.
pub fn log_loss(y_true: &[f64], y_pred: &[f64]) -> f64 {
    if y_true.is_empty() || y_true.len() != y_pred.len() {
        return f64::NAN;
    }
    let total: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(y, p)| {
            let p = p.clamp(LOG_LOSS_EPS, 1.0 - LOG_LOSS_EPS);
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        })
        .sum();
    total / y_true.len() as f64
}

/// Rank-based ROC-AUC with average ranks over tied scores. NaN when the
/// labels are single-class.
pub fn roc_auc(y_true: &[f64], y_pred: &[f64]) -> f64 {
    if y_true.is_empty() || y_true.len() != y_pred.len() {
        return f64::NAN;
    }
    let positives = y_true.iter().filter(|y| **y > 0.5).count();
    let negatives = y_true.len() - positives;
    if positives == 0 || negatives == 0 {
        return f64::NAN;
    }

    let mut order: Vec<usize> = (0..y_pred.len()).collect();
    order.sort_by(|&a, &b| y_pred[a].total_cmp(&y_pred[b]));

    let mut ranks = vec![0.0; y_pred.len()];
    let mut pos = 0;
    while pos < order.len() {
        let mut end = pos;
        while end + 1 < order.len() && y_pred[order[end + 1]] == y_pred[order[pos]] {
            end += 1;
        }
        let average_rank = (pos + end) as f64 / 2.0 + 1.0;
        for &idx in &order[pos..=end] {
            ranks[idx] = average_rank;
        }
        pos = end + 1;
    }

    let positive_rank_sum: f64 = y_true
        .iter()
        .zip(&ranks)
        .filter(|(y, _)| **y > 0.5)
        .map(|(_, rank)| *rank)
        .sum();
    let positives = positives as f64;
    (positive_rank_sum - positives * (positives + 1.0) / 2.0) / (positives * negatives as f64)
}

/// Global calibration proxy Σ predicted / Σ true; 1 is perfectly
/// calibrated.
pub fn calibration_score(y_true: &[f64], y_pred: &[f64]) -> f64 {
    y_pred.iter().sum::<f64>() / y_true.iter().sum::<f64>()
}

/// The promotion comparison: the candidate must match or beat the
/// baseline on log-loss AND on calibration deviation. Ties pass both.
pub fn beats_baseline(y_pred: &[f64], y_baseline: &[f64], y_true: &[f64]) -> bool {
    let logloss = log_loss(y_true, y_pred);
    let logloss_baseline = log_loss(y_true, y_baseline);
    info!(
        component = "evaluation",
        event = "evaluation.compare.logloss",
        candidate = logloss,
        baseline = logloss_baseline
    );

    let calibration = calibration_score(y_true, y_pred);
    let calibration_baseline = calibration_score(y_true, y_baseline);
    info!(
        component = "evaluation",
        event = "evaluation.compare.calibration",
        candidate = calibration,
        baseline = calibration_baseline
    );

    logloss <= logloss_baseline
        && (calibration - 1.0).abs() <= (calibration_baseline - 1.0).abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_loss_of_confident_correct_predictions_is_small() {
        let loss = log_loss(&[1.0, 0.0], &[0.99, 0.01]);
        assert!(loss < 0.02);
    }

    #[test]
    fn log_loss_clips_hard_zero_and_one() {
        let loss = log_loss(&[1.0], &[0.0]);
        assert!(loss.is_finite());
        assert!(loss > 30.0);
    }

    #[test]
    fn auc_is_one_for_a_perfect_ranking() {
        let auc = roc_auc(&[0.0, 0.0, 1.0, 1.0], &[0.1, 0.2, 0.8, 0.9]);
        assert!((auc - 1.0).abs() < 1e-12);
    }

    #[test]
    fn auc_is_half_for_constant_scores() {
        let auc = roc_auc(&[0.0, 1.0, 0.0, 1.0], &[0.5, 0.5, 0.5, 0.5]);
        assert!((auc - 0.5).abs() < 1e-12);
    }

    #[test]
    fn auc_handles_partial_ties() {
        // Scores: one positive tied with one negative at 0.5.
        let auc = roc_auc(&[0.0, 1.0, 1.0], &[0.5, 0.5, 0.9]);
        assert!((auc - 0.75).abs() < 1e-12);
    }

    #[test]
    fn auc_is_nan_for_single_class_labels() {
        assert!(roc_auc(&[1.0, 1.0], &[0.1, 0.9]).is_nan());
    }

    #[test]
    fn calibration_is_one_when_sums_match() {
        let score = calibration_score(&[1.0, 0.0, 1.0], &[0.9, 0.2, 0.9]);
        assert!((score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn identical_prediction_vectors_pass_the_gate() {
        let y_true = vec![1.0, 0.0, 1.0, 0.0];
        let y_pred = vec![0.7, 0.2, 0.6, 0.4];
        assert!(beats_baseline(&y_pred, &y_pred.clone(), &y_true));
    }

    #[test]
    fn worse_logloss_fails_even_with_better_calibration() {
        let y_true = vec![1.0, 0.0];
        let baseline = vec![0.9, 0.1];
        // Anti-correlated candidate: terrible log-loss, perfect sum.
        let candidate = vec![0.1, 0.9];
        assert!(!beats_baseline(&candidate, &baseline, &y_true));
    }

    #[test]
    fn better_logloss_but_worse_calibration_fails() {
        let y_true = vec![1.0, 0.0];
        let baseline = vec![0.6, 0.4];
        // Lower log-loss, but the probability mass overshoots the click sum.
        let candidate = vec![0.9, 0.4];
        assert!(log_loss(&y_true, &candidate) < log_loss(&y_true, &baseline));
        assert!(!beats_baseline(&candidate, &baseline, &y_true));
    }

    #[test]
    fn strictly_better_candidate_passes() {
        let y_true = vec![1.0, 0.0, 1.0, 0.0];
        let baseline = vec![0.6, 0.4, 0.6, 0.4];
        let candidate = vec![0.8, 0.2, 0.8, 0.2];
        assert!(beats_baseline(&candidate, &baseline, &y_true));
    }

    #[test]
    fn metrics_bundle_reports_all_three() {
        let metrics = calculate_metrics(&[1.0, 0.0], &[0.8, 0.2]);
        assert!(metrics.logloss > 0.0);
        assert!((metrics.auc - 1.0).abs() < 1e-12);
        assert!(metrics.calibration > 0.0);
    }
}

//! Numeric helpers: distortion norms, detection metrics and percentiles.

use serde::{Deserialize, Serialize};

/// Norm-difference distortion between an original and an adversarial dense
/// feature vector. Each entry is `|‖x‖ₚ − ‖x′‖ₚ|`, so it is symmetric in its
/// arguments and never negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub l0: f64,
    pub l1: f64,
    pub l2: f64,
    pub linf: f64,
}

impl Distortion {
    pub fn between(original: &[f64], adversarial: &[f64]) -> Self {
        Self {
            l0: (l0_norm(original) - l0_norm(adversarial)).abs(),
            l1: (l1_norm(original) - l1_norm(adversarial)).abs(),
            l2: (l2_norm(original) - l2_norm(adversarial)).abs(),
            linf: (linf_norm(original) - linf_norm(adversarial)).abs(),
        }
    }
}

pub fn l0_norm(x: &[f64]) -> f64 {
    x.iter().filter(|v| **v != 0.0).count() as f64
}

pub fn l1_norm(x: &[f64]) -> f64 {
    x.iter().map(|v| v.abs()).sum()
}

pub fn l2_norm(x: &[f64]) -> f64 {
    x.iter().map(|v| v * v).sum::<f64>().sqrt()
}

pub fn linf_norm(x: &[f64]) -> f64 {
    x.iter().fold(0.0, |acc, v| acc.max(v.abs()))
}

/// Detection performance of the target model on its test split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub roc: f64,
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
}

impl ModelPerformance {
    /// Compute metrics from ground-truth labels (1 = malware), predicted labels
    /// and decision scores, all aligned by index.
    pub fn compute(y_true: &[u8], y_pred: &[u8], scores: &[f64]) -> Self {
        let mut tp = 0usize;
        let mut fp = 0usize;
        let mut fn_ = 0usize;
        for (t, p) in y_true.iter().zip(y_pred) {
            match (*t == 1, *p == 1) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (true, false) => fn_ += 1,
                (false, false) => {}
            }
        }
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            roc: roc_auc(y_true, scores),
            f1,
            precision,
            recall,
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Area under the ROC curve via the rank-sum statistic (ties get average ranks).
/// Returns 0.5 when only one class is present.
pub fn roc_auc(y_true: &[u8], scores: &[f64]) -> f64 {
    let mut order: Vec<usize> = (0..scores.len().min(y_true.len())).collect();
    order.sort_by(|a, b| scores[*a].total_cmp(&scores[*b]));

    let mut ranks = vec![0.0; order.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = avg_rank;
        }
        i = j + 1;
    }

    let positives = order.iter().filter(|i| y_true[**i] == 1).count();
    let negatives = order.len() - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }
    let rank_sum: f64 = order
        .iter()
        .filter(|i| y_true[**i] == 1)
        .map(|i| ranks[*i])
        .sum();
    let p = positives as f64;
    (rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64)
}

/// Percentile with linear interpolation between closest ranks (`q` in 0..=100).
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=100.0).contains(&q) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q / 100.0 * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

use std::collections::BTreeMap;

/// Metric names every evaluation reports, in one place so trainer output and
/// metadata never disagree on keys.
pub const METRIC_KEYS: [&str; 5] = ["accuracy", "precision", "recall", "f1", "roc_auc"];

/// Classification metrics for binary labels against up-probabilities at the
/// 0.5 threshold. Degenerate denominators score 0.0 rather than NaN.
pub fn evaluate(y_true: &[f64], proba_up: &[f64]) -> BTreeMap<String, f64> {
    let mut tp = 0.0f64;
    let mut fp = 0.0;
    let mut tn = 0.0;
    let mut fn_ = 0.0;
    for (&t, &p) in y_true.iter().zip(proba_up.iter()) {
        let predicted_up = p >= 0.5;
        let actual_up = t >= 0.5;
        match (predicted_up, actual_up) {
            (true, true) => tp += 1.0,
            (true, false) => fp += 1.0,
            (false, false) => tn += 1.0,
            (false, true) => fn_ += 1.0,
        }
    }
    let total = (tp + fp + tn + fn_).max(1.0);
    let accuracy = (tp + tn) / total;
    let precision = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
    let recall = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    let mut metrics = BTreeMap::new();
    metrics.insert("accuracy".to_string(), accuracy);
    metrics.insert("precision".to_string(), precision);
    metrics.insert("recall".to_string(), recall);
    metrics.insert("f1".to_string(), f1);
    metrics.insert("roc_auc".to_string(), roc_auc(y_true, proba_up));
    metrics
}

/// Rank-based (Mann-Whitney) AUC. Defined as 0.0 when the slice holds a
/// single class, matching the undefined-AUC convention of the trainer.
pub fn roc_auc(y_true: &[f64], proba_up: &[f64]) -> f64 {
    let n_pos = y_true.iter().filter(|&&t| t >= 0.5).count();
    let n_neg = y_true.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return 0.0;
    }

    let mut order: Vec<usize> = (0..y_true.len()).collect();
    order.sort_by(|&a, &b| {
        proba_up[a]
            .partial_cmp(&proba_up[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // average ranks over ties
    let mut ranks = vec![0.0; y_true.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && proba_up[order[j + 1]] == proba_up[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg_rank;
        }
        i = j + 1;
    }

    let rank_sum_pos: f64 = y_true
        .iter()
        .zip(ranks.iter())
        .filter(|(&t, _)| t >= 0.5)
        .map(|(_, &r)| r)
        .sum();
    let u = rank_sum_pos - (n_pos * (n_pos + 1)) as f64 / 2.0;
    u / (n_pos * n_neg) as f64
}

/// Arithmetic mean of each metric across folds.
pub fn average_metrics(folds: &[BTreeMap<String, f64>]) -> BTreeMap<String, f64> {
    let mut averaged = BTreeMap::new();
    if folds.is_empty() {
        return averaged;
    }
    for key in METRIC_KEYS {
        let sum: f64 = folds.iter().map(|m| m.get(key).copied().unwrap_or(0.0)).sum();
        averaged.insert(key.to_string(), sum / folds.len() as f64);
    }
    averaged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_classifier_scores_one() {
        let y = vec![0.0, 0.0, 1.0, 1.0];
        let p = vec![0.1, 0.2, 0.8, 0.9];
        let m = evaluate(&y, &p);
        assert_eq!(m["accuracy"], 1.0);
        assert_eq!(m["precision"], 1.0);
        assert_eq!(m["recall"], 1.0);
        assert_eq!(m["f1"], 1.0);
        assert_eq!(m["roc_auc"], 1.0);
    }

    #[test]
    fn test_single_class_auc_is_zero() {
        let y = vec![1.0, 1.0, 1.0];
        let p = vec![0.6, 0.7, 0.8];
        assert_eq!(roc_auc(&y, &p), 0.0);
    }

    #[test]
    fn test_auc_handles_ties() {
        let y = vec![0.0, 1.0, 0.0, 1.0];
        let p = vec![0.5, 0.5, 0.5, 0.5];
        assert!((roc_auc(&y, &p) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_average_covers_exactly_the_metric_keys() {
        let folds = vec![
            evaluate(&[0.0, 1.0], &[0.2, 0.8]),
            evaluate(&[1.0, 0.0], &[0.9, 0.1]),
        ];
        let avg = average_metrics(&folds);
        let keys: Vec<&str> = avg.keys().map(|k| k.as_str()).collect();
        let mut expected: Vec<&str> = METRIC_KEYS.to_vec();
        expected.sort_unstable();
        assert_eq!(keys, expected);
        assert_eq!(avg["accuracy"], 1.0);
    }
}

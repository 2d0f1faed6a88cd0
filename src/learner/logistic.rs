use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::{hyper_f64, hyper_usize, Hyperparameters};
use crate::errors::{QuantrsError, QuantrsResult};

/// Full-batch gradient-descent logistic regression. No randomness anywhere,
/// so refitting on identical data reproduces identical weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticLearner {
    learning_rate: f64,
    epochs: usize,
    l2: f64,
    weights: Vec<f64>,
    bias: f64,
    feature_names: Vec<String>,
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl LogisticLearner {
    pub fn new(params: &Hyperparameters) -> Self {
        Self {
            learning_rate: hyper_f64(params, "learning_rate", 0.1),
            epochs: hyper_usize(params, "epochs", 300),
            l2: hyper_f64(params, "l2", 0.001),
            weights: Vec::new(),
            bias: 0.0,
            feature_names: Vec::new(),
        }
    }

    pub fn fit(&mut self, x: &Array2<f64>, y: &[f64], feature_names: &[String]) -> QuantrsResult<()> {
        let n = x.nrows();
        let d = x.ncols();
        self.weights = vec![0.0; d];
        self.bias = 0.0;
        self.feature_names = feature_names.to_vec();

        let inv_n = 1.0 / n as f64;
        for _ in 0..self.epochs {
            let mut grad_w = vec![0.0; d];
            let mut grad_b = 0.0;
            for (i, row) in x.rows().into_iter().enumerate() {
                let z = self.bias
                    + row
                        .iter()
                        .zip(self.weights.iter())
                        .map(|(v, w)| v * w)
                        .sum::<f64>();
                let err = sigmoid(z) - y[i];
                for (j, v) in row.iter().enumerate() {
                    grad_w[j] += err * v;
                }
                grad_b += err;
            }
            for j in 0..d {
                let g = grad_w[j] * inv_n + self.l2 * self.weights[j];
                self.weights[j] -= self.learning_rate * g;
            }
            self.bias -= self.learning_rate * grad_b * inv_n;
        }
        Ok(())
    }

    pub fn predict_proba(&self, x: &Array2<f64>) -> QuantrsResult<Array2<f64>> {
        if self.weights.is_empty() {
            return Err(QuantrsError::general("logistic learner is not fitted"));
        }
        if x.ncols() != self.weights.len() {
            return Err(QuantrsError::general(format!(
                "logistic input has {} features, model expects {}",
                x.ncols(),
                self.weights.len()
            )));
        }
        let mut out = Array2::<f64>::zeros((x.nrows(), 2));
        for (i, row) in x.rows().into_iter().enumerate() {
            let z = self.bias
                + row
                    .iter()
                    .zip(self.weights.iter())
                    .map(|(v, w)| v * w)
                    .sum::<f64>();
            let p_up = sigmoid(z);
            out[(i, 0)] = 1.0 - p_up;
            out[(i, 1)] = p_up;
        }
        Ok(out)
    }

    /// Global importance: |weight| per feature, normalized to sum 1.
    pub fn feature_importance(&self) -> Vec<(String, f64)> {
        let total: f64 = self.weights.iter().map(|w| w.abs()).sum();
        let denom = if total > 0.0 { total } else { 1.0 };
        self.feature_names
            .iter()
            .zip(self.weights.iter())
            .map(|(name, w)| (name.clone(), w.abs() / denom))
            .collect()
    }

    /// Exact attribution for one scaled input row: |weight * value|.
    pub fn attribution(&self, row: &[f64]) -> Vec<(String, f64)> {
        let mut scored: Vec<(String, f64)> = self
            .feature_names
            .iter()
            .zip(self.weights.iter())
            .enumerate()
            .map(|(j, (name, w))| {
                let value = row.get(j).copied().unwrap_or(0.0);
                (name.clone(), (w * value).abs())
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }
}

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::logistic::LogisticLearner;
use super::{Hyperparameters, Learner};
use crate::errors::{QuantrsError, QuantrsResult};

/// Stacking ensemble: every base learner is fitted fully and independently
/// on the raw (X, y), then a logistic meta-learner is fitted on the
/// horizontally concatenated base probabilities (two columns per base).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleLearner {
    base: Vec<Learner>,
    meta: LogisticLearner,
    meta_feature_names: Vec<String>,
    fitted: bool,
}

impl EnsembleLearner {
    pub fn new(base: Vec<Learner>, params: &Hyperparameters) -> Self {
        Self {
            base,
            meta: LogisticLearner::new(params),
            meta_feature_names: Vec::new(),
            fitted: false,
        }
    }

    pub fn fit(&mut self, x: &Array2<f64>, y: &[f64], feature_names: &[String]) -> QuantrsResult<()> {
        if self.base.is_empty() {
            return Err(QuantrsError::general("ensemble has no base learners"));
        }
        for learner in self.base.iter_mut() {
            learner.fit(x, y, feature_names)?;
        }

        let meta_x = self.meta_features(x)?;
        self.meta_feature_names = (0..self.base.len())
            .flat_map(|i| [format!("base{}_p_down", i), format!("base{}_p_up", i)])
            .collect();
        self.meta.fit(&meta_x, y, &self.meta_feature_names)?;
        self.fitted = true;
        Ok(())
    }

    /// (rows, 2 * n_base) matrix of stacked base probabilities. Inference
    /// regenerates this from the current base learners every time.
    fn meta_features(&self, x: &Array2<f64>) -> QuantrsResult<Array2<f64>> {
        let n = x.nrows();
        let mut meta = Array2::<f64>::zeros((n, 2 * self.base.len()));
        for (b, learner) in self.base.iter().enumerate() {
            let proba = learner.predict_proba(x)?;
            for i in 0..n {
                meta[(i, 2 * b)] = proba[(i, 0)];
                meta[(i, 2 * b + 1)] = proba[(i, 1)];
            }
        }
        Ok(meta)
    }

    pub fn predict_proba(&self, x: &Array2<f64>) -> QuantrsResult<Array2<f64>> {
        if !self.fitted {
            return Err(QuantrsError::general("ensemble learner is not fitted"));
        }
        let meta_x = self.meta_features(x)?;
        self.meta.predict_proba(&meta_x)
    }

    /// Unweighted mean of base importances per feature name, outer-joined
    /// across bases; a base that never saw a feature contributes zero.
    pub fn feature_importance(&self) -> Vec<(String, f64)> {
        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        for learner in &self.base {
            for (name, score) in learner.feature_importance() {
                *sums.entry(name).or_insert(0.0) += score;
            }
        }
        let n = self.base.len().max(1) as f64;
        sums.into_iter().map(|(name, sum)| (name, sum / n)).collect()
    }
}

pub mod ensemble;
pub mod forest;
pub mod logistic;
pub mod metrics;
pub mod scaler;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ndarray::Array2;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::errors::{QuantrsError, QuantrsResult};
pub use ensemble::EnsembleLearner;
pub use forest::ForestLearner;
pub use logistic::LogisticLearner;
pub use scaler::StandardScaler;

/// Hyperparameter bag recorded verbatim into model metadata.
pub type Hyperparameters = BTreeMap<String, serde_json::Value>;

/// Defaults reported in metadata when the caller passes an empty bag.
pub static DEFAULT_HYPERPARAMETERS: Lazy<Hyperparameters> = Lazy::new(|| {
    let mut map = Hyperparameters::new();
    map.insert("learning_rate".into(), serde_json::json!(0.1));
    map.insert("epochs".into(), serde_json::json!(300));
    map.insert("l2".into(), serde_json::json!(0.001));
    map.insert("n_trees".into(), serde_json::json!(50));
    map.insert("max_depth".into(), serde_json::json!(4));
    map.insert("min_leaf".into(), serde_json::json!(5));
    map.insert("seed".into(), serde_json::json!(42));
    map
});

pub(crate) fn hyper_f64(params: &Hyperparameters, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .unwrap_or(default)
}

pub(crate) fn hyper_usize(params: &Hyperparameters, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(default)
}

/// The algorithms the lifecycle manager knows how to train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Logistic,
    Forest,
    Ensemble,
}

impl Algorithm {
    pub fn parse(name: &str) -> QuantrsResult<Self> {
        match name {
            "logistic" => Ok(Self::Logistic),
            "forest" => Ok(Self::Forest),
            "ensemble" => Ok(Self::Ensemble),
            other => Err(QuantrsError::general(format!(
                "unknown algorithm '{}', expected logistic/forest/ensemble",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logistic => "logistic",
            Self::Forest => "forest",
            Self::Ensemble => "ensemble",
        }
    }
}

/// Closed set of trainable binary classifiers. The ensemble is just another
/// variant holding a list of the others, nothing privileged about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Learner {
    Logistic(LogisticLearner),
    Forest(ForestLearner),
    Ensemble(EnsembleLearner),
}

impl Learner {
    /// Fresh, unfitted learner for the given algorithm. The ensemble variant
    /// stacks one logistic and one forest base learner under a logistic
    /// meta-learner.
    pub fn new(algorithm: Algorithm, params: &Hyperparameters) -> Self {
        match algorithm {
            Algorithm::Logistic => Self::Logistic(LogisticLearner::new(params)),
            Algorithm::Forest => Self::Forest(ForestLearner::new(params)),
            Algorithm::Ensemble => Self::Ensemble(EnsembleLearner::new(
                vec![
                    Self::Logistic(LogisticLearner::new(params)),
                    Self::Forest(ForestLearner::new(params)),
                ],
                params,
            )),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::Logistic(_) => Algorithm::Logistic,
            Self::Forest(_) => Algorithm::Forest,
            Self::Ensemble(_) => Algorithm::Ensemble,
        }
    }

    /// Fit on a (rows, features) matrix against binary labels (0.0 / 1.0).
    pub fn fit(
        &mut self,
        x: &Array2<f64>,
        y: &[f64],
        feature_names: &[String],
    ) -> QuantrsResult<()> {
        if x.nrows() != y.len() {
            return Err(QuantrsError::general(format!(
                "fit shape mismatch: {} rows vs {} labels",
                x.nrows(),
                y.len()
            )));
        }
        if x.nrows() == 0 {
            return Err(QuantrsError::general("fit called with zero rows"));
        }
        match self {
            Self::Logistic(inner) => inner.fit(x, y, feature_names),
            Self::Forest(inner) => inner.fit(x, y, feature_names),
            Self::Ensemble(inner) => inner.fit(x, y, feature_names),
        }
    }

    /// Per-class probabilities, shape (rows, 2): column 0 = down, 1 = up.
    pub fn predict_proba(&self, x: &Array2<f64>) -> QuantrsResult<Array2<f64>> {
        match self {
            Self::Logistic(inner) => inner.predict_proba(x),
            Self::Forest(inner) => inner.predict_proba(x),
            Self::Ensemble(inner) => inner.predict_proba(x),
        }
    }

    /// Hard labels at the 0.5 threshold.
    pub fn predict(&self, x: &Array2<f64>) -> QuantrsResult<Vec<f64>> {
        let proba = self.predict_proba(x)?;
        Ok(proba
            .rows()
            .into_iter()
            .map(|row| if row[1] >= 0.5 { 1.0 } else { 0.0 })
            .collect())
    }

    /// Ranked (feature, score) pairs, highest first.
    pub fn feature_importance(&self) -> Vec<(String, f64)> {
        let mut ranked = match self {
            Self::Logistic(inner) => inner.feature_importance(),
            Self::Forest(inner) => inner.feature_importance(),
            Self::Ensemble(inner) => inner.feature_importance(),
        };
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }

    /// Exact per-inference attribution where the variant supports it
    /// (logistic: |weight * value|). None means the caller should fall back
    /// to the global importances.
    pub fn attribution(&self, row: &[f64]) -> Option<Vec<(String, f64)>> {
        match self {
            Self::Logistic(inner) => Some(inner.attribution(row)),
            Self::Forest(_) | Self::Ensemble(_) => None,
        }
    }
}

/// The serialized, deployable output of a training run: fitted learner,
/// input normalization state, and the ordered feature schema it was
/// trained on. Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub learner: Learner,
    pub scaler: StandardScaler,
    pub feature_schema: Vec<String>,
}

impl ModelArtifact {
    pub fn save(&self, path: &Path) -> QuantrsResult<()> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| QuantrsError::parsing("model artifact", e.to_string()))?;
        fs::write(path, bytes).map_err(|e| QuantrsError::io("write artifact", e))?;
        Ok(())
    }

    pub fn load(path: &Path) -> QuantrsResult<Self> {
        let bytes = fs::read(path).map_err(|e| {
            QuantrsError::model_not_found(format!("{} ({})", path.display(), e))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| QuantrsError::corrupt_artifact(path.display().to_string(), e.to_string()))
    }

    /// Scale an aligned raw feature row and run one inference.
    /// Returns (p_down, p_up).
    pub fn predict_one(&self, aligned_row: &[f64]) -> QuantrsResult<(f64, f64)> {
        let scaled = self.scaler.transform_row(aligned_row);
        let x = Array2::from_shape_vec((1, scaled.len()), scaled)
            .map_err(|e| QuantrsError::general(format!("inference row shape: {}", e)))?;
        let proba = self.learner.predict_proba(&x)?;
        Ok((proba[(0, 0)], proba[(0, 1)]))
    }
}

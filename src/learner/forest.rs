use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{hyper_usize, Hyperparameters};
use crate::errors::{QuantrsError, QuantrsResult};

/// Bagged CART trees over bootstrap samples. All randomness flows from one
/// u64 seed, so the same (seed, data) pair always grows the same forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestLearner {
    n_trees: usize,
    max_depth: usize,
    min_leaf: usize,
    seed: u64,
    trees: Vec<TreeNode>,
    feature_names: Vec<String>,
    /// Accumulated impurity decrease per feature, normalized after fit.
    importance: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TreeNode {
    Leaf {
        p_up: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    fn probability(&self, row: &[f64]) -> f64 {
        match self {
            TreeNode::Leaf { p_up } => *p_up,
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                let value = row.get(*feature).copied().unwrap_or(0.0);
                if value <= *threshold {
                    left.probability(row)
                } else {
                    right.probability(row)
                }
            }
        }
    }
}

fn gini(p_up: f64) -> f64 {
    2.0 * p_up * (1.0 - p_up)
}

fn mean_label(x_y: &[(usize, f64)]) -> f64 {
    if x_y.is_empty() {
        return 0.0;
    }
    x_y.iter().map(|(_, y)| *y).sum::<f64>() / x_y.len() as f64
}

impl ForestLearner {
    pub fn new(params: &Hyperparameters) -> Self {
        Self {
            n_trees: hyper_usize(params, "n_trees", 50),
            max_depth: hyper_usize(params, "max_depth", 4),
            min_leaf: hyper_usize(params, "min_leaf", 5),
            seed: params
                .get("seed")
                .and_then(|v| v.as_u64())
                .unwrap_or(42),
            trees: Vec::new(),
            feature_names: Vec::new(),
            importance: Vec::new(),
        }
    }

    pub fn fit(&mut self, x: &Array2<f64>, y: &[f64], feature_names: &[String]) -> QuantrsResult<()> {
        let n = x.nrows();
        let d = x.ncols();
        self.feature_names = feature_names.to_vec();
        self.importance = vec![0.0; d];
        self.trees = Vec::with_capacity(self.n_trees);

        for t in 0..self.n_trees {
            // per-tree rng derived from the forest seed, independent of
            // iteration order elsewhere
            let mut rng = SmallRng::seed_from_u64(self.seed.wrapping_add(t as u64));
            let indices: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let tree = self.grow(x, y, &indices, 0, &mut rng);
            self.trees.push(tree);
        }

        let total: f64 = self.importance.iter().sum();
        if total > 0.0 {
            for v in self.importance.iter_mut() {
                *v /= total;
            }
        }
        Ok(())
    }

    fn grow(
        &mut self,
        x: &Array2<f64>,
        y: &[f64],
        indices: &[usize],
        depth: usize,
        rng: &mut SmallRng,
    ) -> TreeNode {
        let p_up = indices.iter().map(|&i| y[i]).sum::<f64>() / indices.len().max(1) as f64;
        if depth >= self.max_depth
            || indices.len() < 2 * self.min_leaf
            || p_up == 0.0
            || p_up == 1.0
        {
            return TreeNode::Leaf { p_up };
        }

        let d = x.ncols();
        // sqrt(d) feature subsample per split
        let mut n_candidates = (d as f64).sqrt().round() as usize;
        n_candidates = n_candidates.clamp(1, d);
        let mut candidate_features: Vec<usize> = Vec::with_capacity(n_candidates);
        while candidate_features.len() < n_candidates {
            let f = rng.gen_range(0..d);
            if !candidate_features.contains(&f) {
                candidate_features.push(f);
            }
        }

        let parent_impurity = gini(p_up);
        let mut best: Option<(usize, f64, f64)> = None; // (feature, threshold, gain)

        for &feature in &candidate_features {
            let mut pairs: Vec<(usize, f64)> = indices
                .iter()
                .map(|&i| (i, x[(i, feature)]))
                .collect();
            pairs.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            // up to 16 evenly spaced cut candidates along the sorted column
            let steps = pairs.len().min(16);
            for s in 1..steps {
                let cut = pairs.len() * s / steps;
                if cut < self.min_leaf || pairs.len() - cut < self.min_leaf {
                    continue;
                }
                let threshold = pairs[cut - 1].1;
                if (pairs[cut].1 - threshold).abs() < f64::EPSILON {
                    continue;
                }
                let left: Vec<(usize, f64)> = pairs[..cut]
                    .iter()
                    .map(|&(i, _)| (i, y[i]))
                    .collect();
                let right: Vec<(usize, f64)> = pairs[cut..]
                    .iter()
                    .map(|&(i, _)| (i, y[i]))
                    .collect();
                let wl = left.len() as f64 / pairs.len() as f64;
                let wr = 1.0 - wl;
                let child = wl * gini(mean_label(&left)) + wr * gini(mean_label(&right));
                let gain = parent_impurity - child;
                if gain > best.map(|(_, _, g)| g).unwrap_or(1e-9) {
                    best = Some((feature, threshold, gain));
                }
            }
        }

        let Some((feature, threshold, gain)) = best else {
            return TreeNode::Leaf { p_up };
        };

        self.importance[feature] += gain * indices.len() as f64;

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .copied()
            .partition(|&i| x[(i, feature)] <= threshold);
        let left = self.grow(x, y, &left_idx, depth + 1, rng);
        let right = self.grow(x, y, &right_idx, depth + 1, rng);
        TreeNode::Split {
            feature,
            threshold,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn predict_proba(&self, x: &Array2<f64>) -> QuantrsResult<Array2<f64>> {
        if self.trees.is_empty() {
            return Err(QuantrsError::general("forest learner is not fitted"));
        }
        let mut out = Array2::<f64>::zeros((x.nrows(), 2));
        for (i, row) in x.rows().into_iter().enumerate() {
            let row_vec: Vec<f64> = row.iter().copied().collect();
            let p_up = self
                .trees
                .iter()
                .map(|t| t.probability(&row_vec))
                .sum::<f64>()
                / self.trees.len() as f64;
            out[(i, 0)] = 1.0 - p_up;
            out[(i, 1)] = p_up;
        }
        Ok(out)
    }

    pub fn feature_importance(&self) -> Vec<(String, f64)> {
        self.feature_names
            .iter()
            .zip(self.importance.iter())
            .map(|(name, v)| (name.clone(), *v))
            .collect()
    }
}

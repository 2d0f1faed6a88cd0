use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Per-feature standardization state captured at training time and shipped
/// inside the artifact so serving scales inputs identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(x: &Array2<f64>) -> Self {
        let n = x.nrows().max(1) as f64;
        let d = x.ncols();
        let mut mean = vec![0.0; d];
        let mut std = vec![0.0; d];
        for row in x.rows() {
            for (j, v) in row.iter().enumerate() {
                mean[j] += v;
            }
        }
        for m in mean.iter_mut() {
            *m /= n;
        }
        for row in x.rows() {
            for (j, v) in row.iter().enumerate() {
                std[j] += (v - mean[j]).powi(2);
            }
        }
        for s in std.iter_mut() {
            *s = (*s / n).sqrt();
            // constant columns pass through unscaled
            if *s < 1e-12 {
                *s = 1.0;
            }
        }
        Self { mean, std }
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut out = x.clone();
        for mut row in out.rows_mut() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = (*v - self.mean[j]) / self.std[j];
            }
        }
        out
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(j, v)| {
                let m = self.mean.get(j).copied().unwrap_or(0.0);
                let s = self.std.get(j).copied().unwrap_or(1.0);
                (v - m) / s
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standardizes_to_zero_mean_unit_std() {
        let x = Array2::from_shape_vec((4, 1), vec![2.0, 4.0, 6.0, 8.0]).expect("shape");
        let scaler = StandardScaler::fit(&x);
        let scaled = scaler.transform(&x);
        let mean: f64 = scaled.column(0).iter().sum::<f64>() / 4.0;
        assert!(mean.abs() < 1e-9);
        let var: f64 = scaled.column(0).iter().map(|v| v * v).sum::<f64>() / 4.0;
        assert!((var - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_constant_column_is_untouched() {
        let x = Array2::from_shape_vec((3, 1), vec![5.0, 5.0, 5.0]).expect("shape");
        let scaler = StandardScaler::fit(&x);
        let scaled = scaler.transform(&x);
        for v in scaled.column(0).iter() {
            assert_eq!(*v, 0.0);
        }
    }

    #[test]
    fn test_row_and_matrix_transform_agree() {
        let x = Array2::from_shape_vec((3, 2), vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0])
            .expect("shape");
        let scaler = StandardScaler::fit(&x);
        let scaled = scaler.transform(&x);
        let row = scaler.transform_row(&[2.0, 20.0]);
        assert!((row[0] - scaled[(1, 0)]).abs() < 1e-12);
        assert!((row[1] - scaled[(1, 1)]).abs() < 1e-12);
    }
}

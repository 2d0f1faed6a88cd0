use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use ndarray::{s, Array2};
use tracing::{debug, error, info};

use crate::errors::{QuantrsError, QuantrsResult};
use crate::features::{build_supervised_set, FeatureProvider, SupervisedSet};
use crate::learner::metrics::{average_metrics, evaluate};
use crate::learner::{
    Algorithm, Hyperparameters, Learner, ModelArtifact, StandardScaler, DEFAULT_HYPERPARAMETERS,
};
use crate::registry::metadata::{ModelMetadata, ModelStatus};
use crate::registry::ModelRegistry;

/// Expanding-window splitter over a chronologically ordered index range.
/// Within every fold, all training indices precede all validation indices;
/// that ordering is what keeps future data out of the fit.
#[derive(Debug, Clone, Copy)]
pub struct WalkForwardSplitter {
    pub n_splits: usize,
}

impl WalkForwardSplitter {
    pub fn new(n_splits: usize) -> Self {
        Self { n_splits }
    }

    /// Fold boundaries over `len` samples. The index range is cut into
    /// `n_splits + 1` blocks; fold i trains on blocks 0..=i and validates
    /// on block i+1 (the last fold's validation absorbs the remainder).
    pub fn splits(&self, len: usize) -> QuantrsResult<Vec<(Range<usize>, Range<usize>)>> {
        let block = len / (self.n_splits + 1);
        if block == 0 {
            return Err(QuantrsError::general(format!(
                "{} samples cannot support {} walk-forward folds",
                len, self.n_splits
            )));
        }
        let mut folds = Vec::with_capacity(self.n_splits);
        for i in 0..self.n_splits {
            let train_end = block * (i + 1);
            let val_end = if i == self.n_splits - 1 {
                len
            } else {
                block * (i + 2)
            };
            folds.push((0..train_end, train_end..val_end));
        }
        Ok(folds)
    }
}

/// One completed CV fold. Transient; lives only inside a training report.
#[derive(Debug, Clone)]
pub struct TrainingFold {
    pub fold: usize,
    pub train_range: Range<usize>,
    pub val_range: Range<usize>,
    pub metrics: BTreeMap<String, f64>,
}

/// Everything a finished training run produced, before registration.
#[derive(Debug)]
pub struct TrainingReport {
    pub ticker: String,
    pub algorithm: Algorithm,
    pub artifact: ModelArtifact,
    pub fold_results: Vec<TrainingFold>,
    pub avg_validation_metrics: BTreeMap<String, f64>,
    pub train_metrics: BTreeMap<String, f64>,
    pub test_metrics: BTreeMap<String, f64>,
    pub n_train_samples: usize,
    pub data_start_date: NaiveDate,
    pub data_end_date: NaiveDate,
    pub training_duration_seconds: f64,
    pub hyperparameters: Hyperparameters,
}

/// Knobs of a training run; defaults mirror the `[training]` config section.
#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub n_splits: usize,
    pub test_size: f64,
    pub horizon_days: u32,
    pub lookback_days: u32,
    pub algorithm: Algorithm,
    pub hyperparameters: Hyperparameters,
    pub model_type: String,
    pub tags: Vec<String>,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            n_splits: 5,
            test_size: 0.2,
            horizon_days: 1,
            lookback_days: 504,
            algorithm: Algorithm::Forest,
            hyperparameters: Hyperparameters::new(),
            model_type: "direction".to_string(),
            tags: Vec::new(),
        }
    }
}

/// Synchronous walk-forward training pipeline. Cheap to clone; batch mode
/// runs one clone per ticker since runs share no mutable state.
#[derive(Clone)]
pub struct ModelTrainer {
    provider: Arc<dyn FeatureProvider>,
    settings: TrainerSettings,
    kill_switch: Arc<AtomicBool>,
}

impl ModelTrainer {
    pub fn new(provider: Arc<dyn FeatureProvider>, settings: TrainerSettings) -> Self {
        Self {
            provider,
            settings,
            kill_switch: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for the operational kill-switch; honored between CV folds.
    pub fn kill_switch(&self) -> Arc<AtomicBool> {
        self.kill_switch.clone()
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    /// Run the full pipeline for one ticker: chronological test split,
    /// walk-forward CV, final fit on all of train_val, one held-out test
    /// evaluation.
    pub fn train(&self, ticker: &str, as_of: NaiveDate) -> QuantrsResult<TrainingReport> {
        let started = Instant::now();
        info!(
            "🏋️ training {} ({}, {} folds)",
            ticker,
            self.settings.algorithm.as_str(),
            self.settings.n_splits
        );

        let set = build_supervised_set(
            self.provider.as_ref(),
            ticker,
            as_of,
            self.settings.lookback_days,
            self.settings.horizon_days,
        )?;
        let usable = set.len();
        if usable < self.settings.n_splits + 1 {
            return Err(QuantrsError::data(
                ticker,
                format!(
                    "{} usable rows, need at least {}",
                    usable,
                    self.settings.n_splits + 1
                ),
            ));
        }

        // test suffix is carved off first and touched exactly once, at the end
        let train_val_len =
            ((usable as f64) * (1.0 - self.settings.test_size)).floor() as usize;
        if train_val_len < self.settings.n_splits + 1 {
            return Err(QuantrsError::data(
                ticker,
                format!(
                    "{} train/val rows after the test split, need at least {}",
                    train_val_len,
                    self.settings.n_splits + 1
                ),
            ));
        }

        let x_raw = matrix_of(&set)?;
        // normalization state comes from train_val only
        let scaler = StandardScaler::fit(&x_raw.slice(s![..train_val_len, ..]).to_owned());
        let x = scaler.transform(&x_raw);
        let y = &set.labels;

        let splitter = WalkForwardSplitter::new(self.settings.n_splits);
        let mut fold_results = Vec::with_capacity(self.settings.n_splits);
        for (fold, (train_range, val_range)) in
            splitter.splits(train_val_len)?.into_iter().enumerate()
        {
            if self.kill_switch.load(Ordering::SeqCst) {
                return Err(QuantrsError::Interrupted {
                    ticker: ticker.to_string(),
                    fold,
                });
            }
            let mut learner =
                Learner::new(self.settings.algorithm, &self.settings.hyperparameters);
            learner.fit(
                &x.slice(s![train_range.clone(), ..]).to_owned(),
                &y[train_range.clone()],
                &set.feature_names,
            )?;
            let proba = learner.predict_proba(&x.slice(s![val_range.clone(), ..]).to_owned())?;
            let proba_up: Vec<f64> = proba.column(1).iter().copied().collect();
            let metrics = evaluate(&y[val_range.clone()], &proba_up);
            debug!(
                "fold {} [{}..{}|{}..{}]: accuracy {:.3}",
                fold,
                train_range.start,
                train_range.end,
                val_range.start,
                val_range.end,
                metrics["accuracy"]
            );
            fold_results.push(TrainingFold {
                fold,
                train_range,
                val_range,
                metrics,
            });
        }
        let avg_validation_metrics =
            average_metrics(&fold_results.iter().map(|f| f.metrics.clone()).collect::<Vec<_>>());

        // the persisted artifact: a fresh fit on the whole train_val region
        let mut final_learner =
            Learner::new(self.settings.algorithm, &self.settings.hyperparameters);
        final_learner.fit(
            &x.slice(s![..train_val_len, ..]).to_owned(),
            &y[..train_val_len],
            &set.feature_names,
        )?;

        let train_proba =
            final_learner.predict_proba(&x.slice(s![..train_val_len, ..]).to_owned())?;
        let train_up: Vec<f64> = train_proba.column(1).iter().copied().collect();
        let train_metrics = evaluate(&y[..train_val_len], &train_up);

        // held-out suffix: reported, never used for selection
        let test_proba =
            final_learner.predict_proba(&x.slice(s![train_val_len.., ..]).to_owned())?;
        let test_up: Vec<f64> = test_proba.column(1).iter().copied().collect();
        let test_metrics = evaluate(&y[train_val_len..], &test_up);

        let mut hyperparameters = self.settings.hyperparameters.clone();
        if hyperparameters.is_empty() {
            hyperparameters = DEFAULT_HYPERPARAMETERS.clone();
        }

        let report = TrainingReport {
            ticker: ticker.to_string(),
            algorithm: self.settings.algorithm,
            artifact: ModelArtifact {
                learner: final_learner,
                scaler,
                feature_schema: set.feature_names.clone(),
            },
            fold_results,
            avg_validation_metrics,
            train_metrics,
            test_metrics,
            n_train_samples: train_val_len,
            data_start_date: set.dates[0],
            data_end_date: set.dates[usable - 1],
            training_duration_seconds: started.elapsed().as_secs_f64(),
            hyperparameters,
        };
        info!(
            "✅ trained {}: avg val accuracy {:.3}, test accuracy {:.3} ({:.2}s)",
            ticker,
            report.avg_validation_metrics["accuracy"],
            report.test_metrics["accuracy"],
            report.training_duration_seconds
        );
        Ok(report)
    }

    /// Train one ticker and hand the result to the registry.
    pub fn train_and_register(
        &self,
        registry: &ModelRegistry,
        ticker: &str,
        as_of: NaiveDate,
        promote: bool,
    ) -> QuantrsResult<ModelMetadata> {
        let report = self.train(ticker, as_of)?;
        let version = registry.next_version(ticker, &self.settings.model_type)?;
        let metadata = self.build_metadata(&report, &version);
        registry.register(&report.artifact, metadata, promote)
    }

    /// Batch mode: per-ticker failures land in the result map, the rest of
    /// the batch keeps going.
    pub fn train_batch(
        &self,
        registry: &ModelRegistry,
        tickers: &[String],
        as_of: NaiveDate,
        promote: bool,
    ) -> BTreeMap<String, QuantrsResult<ModelMetadata>> {
        let mut results = BTreeMap::new();
        for ticker in tickers {
            let outcome = self.train_and_register(registry, ticker, as_of, promote);
            if let Err(e) = &outcome {
                error!("❌ training {} failed, skipping: {}", ticker, e);
            }
            results.insert(ticker.clone(), outcome);
        }
        results
    }

    fn build_metadata(&self, report: &TrainingReport, version: &str) -> ModelMetadata {
        let ticker_lower = report.ticker.to_lowercase();
        ModelMetadata {
            model_id: format!(
                "{}_{}_v{}",
                ticker_lower,
                self.settings.model_type,
                version.replace('.', "_")
            ),
            model_name: format!("{}_{}", ticker_lower, self.settings.model_type),
            version: version.to_string(),
            ticker: report.ticker.clone(),
            model_type: self.settings.model_type.clone(),
            algorithm: report.algorithm.as_str().to_string(),
            trained_at: Utc::now(),
            training_duration_seconds: report.training_duration_seconds,
            n_train_samples: report.n_train_samples,
            n_features: report.artifact.feature_schema.len(),
            feature_names: report.artifact.feature_schema.clone(),
            data_start_date: report.data_start_date,
            data_end_date: report.data_end_date,
            train_metrics: report.train_metrics.clone(),
            val_metrics: report.avg_validation_metrics.clone(),
            test_metrics: report.test_metrics.clone(),
            hyperparameters: report.hyperparameters.clone(),
            status: ModelStatus::Staging,
            deployed_at: None,
            artifact_path: String::new(),
            tags: self.settings.tags.clone(),
        }
    }
}

fn matrix_of(set: &SupervisedSet) -> QuantrsResult<Array2<f64>> {
    let rows = set.len();
    let cols = set.feature_names.len();
    let flat: Vec<f64> = set.rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows, cols), flat)
        .map_err(|e| QuantrsError::general(format!("feature matrix shape: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::testing::SyntheticProvider;
    use crate::features::{FeatureVector, PriceRow};
    use crate::learner::metrics::METRIC_KEYS;
    use crate::registry::testing::temp_registry_root;
    use crate::store::ModelFilter;

    fn synthetic_trainer(days: usize, algorithm: Algorithm) -> (ModelTrainer, NaiveDate) {
        let provider = SyntheticProvider::new(days, 11);
        let as_of = provider.rows.last().expect("rows").date;
        let settings = TrainerSettings {
            algorithm,
            ..TrainerSettings::default()
        };
        (ModelTrainer::new(Arc::new(provider), settings), as_of)
    }

    #[test]
    fn test_walk_forward_folds_never_leak_future_data() {
        let splitter = WalkForwardSplitter::new(5);
        for len in [12, 57, 400] {
            for (train, val) in splitter.splits(len).expect("splits") {
                assert!(train.start == 0);
                assert!(train.end <= val.start, "train must end before val starts");
                assert!(!val.is_empty());
                assert!(val.end <= len);
            }
        }
        // folds expand monotonically
        let folds = splitter.splits(120).expect("splits");
        for pair in folds.windows(2) {
            assert!(pair[0].0.end < pair[1].0.end);
        }
    }

    #[test]
    fn test_splitter_rejects_tiny_sets() {
        assert!(WalkForwardSplitter::new(5).splits(5).is_err());
    }

    #[test]
    fn test_two_years_of_daily_data_end_to_end() {
        // scenario: 2y of synthetic OHLCV, n_splits=5, test_size=0.2
        let (trainer, as_of) = synthetic_trainer(504, Algorithm::Logistic);
        let report = trainer.train("TST", as_of).expect("training succeeds");

        assert_eq!(report.fold_results.len(), 5);
        let keys: Vec<&str> = report
            .avg_validation_metrics
            .keys()
            .map(|k| k.as_str())
            .collect();
        let mut expected: Vec<&str> = METRIC_KEYS.to_vec();
        expected.sort_unstable();
        assert_eq!(keys, expected);
        assert!(!report.test_metrics.is_empty());
        assert!(report.n_train_samples > 300);
        assert!(report.data_start_date < report.data_end_date);
    }

    #[test]
    fn test_train_and_register_lands_in_staging() {
        let (trainer, as_of) = synthetic_trainer(504, Algorithm::Logistic);
        let root = temp_registry_root("trainer");
        let registry = ModelRegistry::new(&root, None).expect("registry");

        let metadata = trainer
            .train_and_register(&registry, "TST", as_of, false)
            .expect("register");
        assert_eq!(metadata.status, ModelStatus::Staging);
        assert!(std::path::Path::new(&metadata.artifact_path).exists());
        assert_eq!(metadata.version, "1.0.0");

        let listed = registry.list_models(&ModelFilter::default()).expect("list");
        assert_eq!(listed.len(), 1);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_undersized_ticker_is_a_data_error() {
        let (trainer, as_of) = synthetic_trainer(25, Algorithm::Logistic);
        let err = trainer.train("TST", as_of).unwrap_err();
        assert!(matches!(err, QuantrsError::Data { .. }));
    }

    #[test]
    fn test_kill_switch_interrupts_between_folds() {
        let (trainer, as_of) = synthetic_trainer(504, Algorithm::Logistic);
        trainer.kill_switch().store(true, Ordering::SeqCst);
        let err = trainer.train("TST", as_of).unwrap_err();
        assert!(matches!(err, QuantrsError::Interrupted { fold: 0, .. }));
    }

    /// Provider that has data for every ticker except the ones listed.
    struct PartialProvider {
        inner: SyntheticProvider,
        broken: Vec<String>,
    }

    impl FeatureProvider for PartialProvider {
        fn get_price_window(
            &self,
            ticker: &str,
            as_of: NaiveDate,
            lookback: u32,
        ) -> QuantrsResult<Vec<PriceRow>> {
            if self.broken.iter().any(|b| b == ticker) {
                return Ok(Vec::new());
            }
            self.inner.get_price_window(ticker, as_of, lookback)
        }

        fn get_computed_features(
            &self,
            ticker: &str,
            as_of: NaiveDate,
        ) -> QuantrsResult<FeatureVector> {
            self.inner.get_computed_features(ticker, as_of)
        }
    }

    #[test]
    fn test_batch_isolates_per_ticker_failures() {
        let inner = SyntheticProvider::new(504, 11);
        let as_of = inner.rows.last().expect("rows").date;
        let provider = PartialProvider {
            inner,
            broken: vec!["BAD".to_string()],
        };
        let trainer = ModelTrainer::new(
            Arc::new(provider),
            TrainerSettings {
                algorithm: Algorithm::Logistic,
                ..TrainerSettings::default()
            },
        );
        let root = temp_registry_root("batch");
        let registry = ModelRegistry::new(&root, None).expect("registry");

        let results = trainer.train_batch(
            &registry,
            &["GOOD".to_string(), "BAD".to_string()],
            as_of,
            false,
        );
        assert!(results["GOOD"].is_ok());
        assert!(matches!(
            results["BAD"].as_ref().unwrap_err(),
            QuantrsError::Data { .. }
        ));
        std::fs::remove_dir_all(&root).ok();
    }
}

pub mod cache;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{QuantrsError, QuantrsResult};
use crate::features::FeatureProvider;
use crate::registry::ModelRegistry;
use crate::store::{MetadataStore, PredictionRecord};
use self::cache::ArtifactCache;

/// How a predict call picks its artifact. Resolution happens exactly once,
/// at call start; a promotion completing mid-flight affects the next call,
/// not the running one.
#[derive(Debug, Clone)]
pub enum ModelSelector {
    /// The current production model for (ticker, model_type).
    Production { model_type: String },
    /// An explicit registry model id.
    Id(String),
    /// An explicit artifact path, bypassing the registry.
    Path(PathBuf),
    /// The most recently trained model whose name contains the pattern.
    Latest { pattern: String },
}

/// One served prediction.
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub ticker: String,
    pub model_name: String,
    pub model_id: Option<String>,
    pub prediction_date: NaiveDate,
    pub target_date: NaiveDate,
    pub predicted_direction: String,
    pub probability_down: f64,
    pub probability_up: f64,
    pub confidence: f64,
    /// Top-N (feature, weight) explanation: exact attribution when the
    /// learner supports it, global importances otherwise.
    pub top_features: Vec<(String, f64)>,
}

/// Aggregated multi-model prediction. `agreement_score` is the fraction of
/// models voting with the majority: a cheap consensus signal, not a
/// calibrated probability.
#[derive(Debug, Clone, Serialize)]
pub struct EnsemblePrediction {
    pub ticker: String,
    pub prediction_date: NaiveDate,
    pub target_date: NaiveDate,
    pub predicted_direction: String,
    pub avg_probability_up: f64,
    pub avg_probability_down: f64,
    pub agreement_score: f64,
    pub models_used: Vec<String>,
    pub predictions: BTreeMap<String, Prediction>,
}

/// Serves predictions from registered artifacts: resolve, load through the
/// shared LRU cache, align live features to the artifact schema, infer,
/// persist the record best-effort.
pub struct PredictionEngine {
    registry: Arc<ModelRegistry>,
    provider: Arc<dyn FeatureProvider>,
    store: Option<Arc<dyn MetadataStore>>,
    cache: ArtifactCache,
    horizon_days: u32,
    top_n_features: usize,
    feature_version: String,
}

impl PredictionEngine {
    pub fn new(
        registry: Arc<ModelRegistry>,
        provider: Arc<dyn FeatureProvider>,
        store: Option<Arc<dyn MetadataStore>>,
        cache: ArtifactCache,
        horizon_days: u32,
        top_n_features: usize,
        feature_version: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            provider,
            store,
            cache,
            horizon_days,
            top_n_features,
            feature_version: feature_version.into(),
        }
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    fn resolve(
        &self,
        ticker: &str,
        selector: &ModelSelector,
    ) -> QuantrsResult<(PathBuf, String, Option<String>)> {
        match selector {
            ModelSelector::Production { model_type } => {
                let metadata = self
                    .registry
                    .production_for(ticker, model_type)?
                    .ok_or_else(|| {
                        QuantrsError::model_not_found(format!(
                            "no production model for {}/{}",
                            ticker, model_type
                        ))
                    })?;
                Ok((
                    PathBuf::from(&metadata.artifact_path),
                    metadata.model_name.clone(),
                    Some(metadata.model_id),
                ))
            }
            ModelSelector::Id(model_id) => {
                let metadata = self.registry.load(model_id)?;
                Ok((
                    PathBuf::from(&metadata.artifact_path),
                    metadata.model_name.clone(),
                    Some(metadata.model_id),
                ))
            }
            ModelSelector::Path(path) => {
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                Ok((path.clone(), name, None))
            }
            ModelSelector::Latest { pattern } => {
                let metadata = self.registry.latest_matching(pattern)?.ok_or_else(|| {
                    QuantrsError::model_not_found(format!("no model matching '{}'", pattern))
                })?;
                Ok((
                    PathBuf::from(&metadata.artifact_path),
                    metadata.model_name.clone(),
                    Some(metadata.model_id),
                ))
            }
        }
    }

    /// Serve one prediction for `ticker` as of `as_of`.
    pub fn predict(
        &self,
        ticker: &str,
        selector: &ModelSelector,
        as_of: NaiveDate,
    ) -> QuantrsResult<Prediction> {
        // one resolution per call, held for the whole call
        let (path, model_name, model_id) = self.resolve(ticker, selector)?;
        let artifact = self.cache.get_or_load(&path)?;

        let live = self.provider.get_computed_features(ticker, as_of)?;
        let aligned = live.aligned_to(&artifact.feature_schema);
        let (probability_down, probability_up) = artifact.predict_one(&aligned)?;

        let predicted_direction = if probability_up >= probability_down {
            "up"
        } else {
            "down"
        };
        let confidence = probability_up.max(probability_down);

        let scaled = artifact.scaler.transform_row(&aligned);
        let mut top_features = artifact
            .learner
            .attribution(&scaled)
            .unwrap_or_else(|| artifact.learner.feature_importance());
        top_features.truncate(self.top_n_features);

        let prediction = Prediction {
            ticker: ticker.to_string(),
            model_name: model_name.clone(),
            model_id,
            prediction_date: as_of,
            target_date: as_of + Days::new(self.horizon_days as u64),
            predicted_direction: predicted_direction.to_string(),
            probability_down,
            probability_up,
            confidence,
            top_features,
        };

        let record = PredictionRecord {
            ticker: prediction.ticker.clone(),
            prediction_date: prediction.prediction_date,
            target_date: prediction.target_date,
            model_name,
            predicted_direction: prediction.predicted_direction.clone(),
            confidence,
            feature_version: self.feature_version.clone(),
        };
        if let Err(e) = self.save_prediction(&record) {
            warn!(
                "prediction for {} served but not persisted, continuing: {}",
                ticker, e
            );
        }

        info!(
            "🔮 {} {} -> {} (confidence {:.3})",
            prediction.model_name, ticker, prediction.predicted_direction, confidence
        );
        Ok(prediction)
    }

    /// Upsert a prediction record, keyed by
    /// (ticker, prediction_date, target_date, model_name). A missing store
    /// means manifest-only mode; the record is simply not mirrored.
    pub fn save_prediction(&self, record: &PredictionRecord) -> QuantrsResult<()> {
        match &self.store {
            Some(store) => store.upsert_prediction(record),
            None => {
                debug!("no metadata store configured, skipping prediction persist");
                Ok(())
            }
        }
    }

    /// Predict once per model type and aggregate. A failing model type is
    /// skipped and logged; only zero survivors fail the call.
    pub fn predict_ensemble(
        &self,
        ticker: &str,
        model_types: &[String],
        as_of: NaiveDate,
    ) -> QuantrsResult<EnsemblePrediction> {
        let mut predictions = BTreeMap::new();
        for model_type in model_types {
            let selector = ModelSelector::Production {
                model_type: model_type.clone(),
            };
            match self.predict(ticker, &selector, as_of) {
                Ok(prediction) => {
                    predictions.insert(model_type.clone(), prediction);
                }
                Err(e) => {
                    warn!(
                        "skipping model type '{}' in ensemble for {}: {}",
                        model_type, ticker, e
                    );
                }
            }
        }

        if predictions.is_empty() {
            return Err(QuantrsError::model_not_found(format!(
                "no model type produced a prediction for {} out of {:?}",
                ticker, model_types
            )));
        }

        let total = predictions.len() as f64;
        let avg_probability_up = predictions
            .values()
            .map(|p| p.probability_up)
            .sum::<f64>()
            / total;
        let avg_probability_down = predictions
            .values()
            .map(|p| p.probability_down)
            .sum::<f64>()
            / total;
        let up_votes = predictions
            .values()
            .filter(|p| p.predicted_direction == "up")
            .count();
        let down_votes = predictions.len() - up_votes;
        // ties go to "up" so the outcome is deterministic
        let predicted_direction = if up_votes >= down_votes { "up" } else { "down" };
        let agreement_score = up_votes.max(down_votes) as f64 / total;

        Ok(EnsemblePrediction {
            ticker: ticker.to_string(),
            prediction_date: as_of,
            target_date: as_of + Days::new(self.horizon_days as u64),
            predicted_direction: predicted_direction.to_string(),
            avg_probability_up,
            avg_probability_down,
            agreement_score,
            models_used: predictions.keys().cloned().collect(),
            predictions,
        })
    }

    /// Per-ticker failure isolation for bulk serving.
    pub fn predict_batch(
        &self,
        tickers: &[String],
        model_type: &str,
        as_of: NaiveDate,
    ) -> BTreeMap<String, QuantrsResult<Prediction>> {
        let selector = ModelSelector::Production {
            model_type: model_type.to_string(),
        };
        let mut results = BTreeMap::new();
        for ticker in tickers {
            let outcome = self.predict(ticker, &selector, as_of);
            if let Err(e) = &outcome {
                warn!("prediction for {} failed, skipping: {}", ticker, e);
            }
            results.insert(ticker.clone(), outcome);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::testing::SyntheticProvider;
    use crate::learner::Algorithm;
    use crate::registry::testing::temp_registry_root;
    use crate::store::SqliteMetadataStore;
    use crate::trainer::{ModelTrainer, TrainerSettings};

    struct Fixture {
        engine: PredictionEngine,
        registry: Arc<ModelRegistry>,
        as_of: NaiveDate,
        root: PathBuf,
    }

    fn fixture(tag: &str, model_types: &[&str]) -> Fixture {
        let provider = Arc::new(SyntheticProvider::new(504, 5));
        let as_of = provider.rows.last().expect("rows").date;
        let root = temp_registry_root(tag);
        let registry = Arc::new(ModelRegistry::new(&root, None).expect("registry"));

        for model_type in model_types {
            let trainer = ModelTrainer::new(
                provider.clone(),
                TrainerSettings {
                    algorithm: Algorithm::Logistic,
                    model_type: model_type.to_string(),
                    ..TrainerSettings::default()
                },
            );
            trainer
                .train_and_register(&registry, "TST", as_of, true)
                .expect("train and promote");
        }

        let engine = PredictionEngine::new(
            registry.clone(),
            provider,
            None,
            ArtifactCache::new(4),
            1,
            5,
            "v1",
        );
        Fixture {
            engine,
            registry,
            as_of,
            root,
        }
    }

    #[test]
    fn test_predict_production_is_deterministic() {
        let fx = fixture("engine-deterministic", &["direction"]);
        let selector = ModelSelector::Production {
            model_type: "direction".to_string(),
        };
        let first = fx.engine.predict("TST", &selector, fx.as_of).expect("predict");
        let second = fx.engine.predict("TST", &selector, fx.as_of).expect("predict");
        assert_eq!(first.probability_up, second.probability_up);
        assert_eq!(first.predicted_direction, second.predicted_direction);
        assert!((first.probability_up + first.probability_down - 1.0).abs() < 1e-9);
        assert!(first.confidence >= 0.5);
        assert!(!first.top_features.is_empty());
        assert_eq!(first.target_date, fx.as_of + Days::new(1));
        std::fs::remove_dir_all(&fx.root).ok();
    }

    #[test]
    fn test_missing_production_model_is_not_found() {
        let fx = fixture("engine-missing", &["direction"]);
        let selector = ModelSelector::Production {
            model_type: "swing".to_string(),
        };
        let err = fx.engine.predict("TST", &selector, fx.as_of).unwrap_err();
        assert!(matches!(err, QuantrsError::ModelNotFound { .. }));
        std::fs::remove_dir_all(&fx.root).ok();
    }

    #[test]
    fn test_selector_by_id_and_by_path_agree() {
        let fx = fixture("engine-selectors", &["direction"]);
        let metadata = fx
            .registry
            .production_for("TST", "direction")
            .expect("lookup")
            .expect("present");

        let by_id = fx
            .engine
            .predict("TST", &ModelSelector::Id(metadata.model_id.clone()), fx.as_of)
            .expect("by id");
        let by_path = fx
            .engine
            .predict(
                "TST",
                &ModelSelector::Path(PathBuf::from(&metadata.artifact_path)),
                fx.as_of,
            )
            .expect("by path");
        let by_latest = fx
            .engine
            .predict(
                "TST",
                &ModelSelector::Latest {
                    pattern: "direction".to_string(),
                },
                fx.as_of,
            )
            .expect("by latest");
        assert_eq!(by_id.probability_up, by_path.probability_up);
        assert_eq!(by_id.probability_up, by_latest.probability_up);
        std::fs::remove_dir_all(&fx.root).ok();
    }

    #[test]
    fn test_ensemble_agreement_bounds() {
        let fx = fixture("engine-ensemble", &["direction", "swing", "momentum"]);
        let types: Vec<String> = ["direction", "swing", "momentum"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let ensemble = fx
            .engine
            .predict_ensemble("TST", &types, fx.as_of)
            .expect("ensemble");
        // odd model count: strictly above one half
        assert!(ensemble.agreement_score > 0.5);
        assert!(ensemble.agreement_score <= 1.0);
        assert_eq!(ensemble.models_used.len(), 3);

        let even = fx
            .engine
            .predict_ensemble("TST", &types[..2].to_vec(), fx.as_of)
            .expect("even ensemble");
        assert!(even.agreement_score >= 0.5);
        assert!(even.agreement_score <= 1.0);
        std::fs::remove_dir_all(&fx.root).ok();
    }

    #[test]
    fn test_ensemble_tolerates_partial_failure() {
        let fx = fixture("engine-partial", &["direction"]);
        let types = vec!["direction".to_string(), "ghost".to_string()];
        let ensemble = fx
            .engine
            .predict_ensemble("TST", &types, fx.as_of)
            .expect("partial ensemble");
        assert_eq!(ensemble.models_used, vec!["direction".to_string()]);
        assert_eq!(ensemble.agreement_score, 1.0);

        let all_broken = vec!["ghost".to_string()];
        assert!(fx.engine.predict_ensemble("TST", &all_broken, fx.as_of).is_err());
        std::fs::remove_dir_all(&fx.root).ok();
    }

    #[test]
    fn test_prediction_record_is_upserted() {
        let provider = Arc::new(SyntheticProvider::new(504, 5));
        let as_of = provider.rows.last().expect("rows").date;
        let root = temp_registry_root("engine-persist");
        let store = Arc::new(SqliteMetadataStore::open_in_memory().expect("store"));
        let registry = Arc::new(
            ModelRegistry::new(&root, Some(store.clone() as Arc<dyn MetadataStore>))
                .expect("registry"),
        );
        let trainer = ModelTrainer::new(
            provider.clone(),
            TrainerSettings {
                algorithm: Algorithm::Logistic,
                ..TrainerSettings::default()
            },
        );
        trainer
            .train_and_register(&registry, "TST", as_of, true)
            .expect("train");

        let engine = PredictionEngine::new(
            registry,
            provider,
            Some(store.clone() as Arc<dyn MetadataStore>),
            ArtifactCache::new(4),
            1,
            5,
            "v1",
        );
        let selector = ModelSelector::Production {
            model_type: "direction".to_string(),
        };
        engine.predict("TST", &selector, as_of).expect("first");
        engine.predict("TST", &selector, as_of).expect("second (upsert)");
        assert_eq!(store.prediction_count().expect("count"), 1);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_predict_batch_isolates_failures() {
        let fx = fixture("engine-batch", &["direction"]);
        let results = fx.engine.predict_batch(
            &["TST".to_string(), "TST2".to_string()],
            "direction",
            fx.as_of,
        );
        assert_eq!(results.len(), 2);
        assert!(results["TST"].is_ok());
        // no production model was ever registered for TST2
        assert!(matches!(
            results["TST2"].as_ref().unwrap_err(),
            QuantrsError::ModelNotFound { .. }
        ));
        std::fs::remove_dir_all(&fx.root).ok();
    }
}

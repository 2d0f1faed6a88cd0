pub mod manifest;
pub mod metadata;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{info, warn};

use crate::errors::{QuantrsError, QuantrsResult};
use crate::learner::ModelArtifact;
use crate::store::{MetadataStore, ModelFilter};
use manifest::Manifest;
use metadata::{next_version, ModelMetadata, ModelStatus};

/// Durable, versioned store of trained artifacts with a promotion state
/// machine. On-disk layout:
///
/// ```text
/// <root>/registry.json            authoritative index (model_id -> metadata)
/// <root>/<model_id>/model.bin     the serialized artifact
/// <root>/<model_id>/artifacts/    auxiliary artifacts
/// <root>/<model_id>/metadata.json per-model metadata copy
/// ```
///
/// Every mutation happens under the manifest lock, so readers resolving
/// "the production model" see either the pre- or post-transition state,
/// never an intermediate one.
pub struct ModelRegistry {
    root: PathBuf,
    manifest: Mutex<Manifest>,
    store: Option<Arc<dyn MetadataStore>>,
}

impl ModelRegistry {
    pub fn new(
        root: impl Into<PathBuf>,
        store: Option<Arc<dyn MetadataStore>>,
    ) -> QuantrsResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| QuantrsError::io("create registry root", e))?;
        let manifest = Manifest::load(root.join("registry.json"))?;
        Ok(Self {
            root,
            manifest: Mutex::new(manifest),
            store,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_manifest(&self) -> QuantrsResult<MutexGuard<'_, Manifest>> {
        self.manifest
            .lock()
            .map_err(|_| QuantrsError::general("registry manifest lock poisoned"))
    }

    /// Best-effort relational mirror. A failure here is the
    /// registry-consistency warning case: logged, never fatal, repaired
    /// later by `reconcile`.
    fn mirror(&self, metadata: &ModelMetadata) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_model(metadata) {
                warn!(
                    "registry consistency warning: relational mirror of {} failed, manifest remains authoritative: {}",
                    metadata.model_id, e
                );
            }
        }
    }

    /// Register a freshly trained artifact. Always creates a brand-new
    /// STAGING record; `promote` additionally runs a production promotion
    /// right after.
    pub fn register(
        &self,
        artifact: &ModelArtifact,
        mut metadata: ModelMetadata,
        promote: bool,
    ) -> QuantrsResult<ModelMetadata> {
        let model_dir = self.root.join(&metadata.model_id);
        fs::create_dir_all(model_dir.join("artifacts"))
            .map_err(|e| QuantrsError::io("create model directory", e))?;
        let artifact_path = model_dir.join("model.bin");
        artifact.save(&artifact_path)?;

        metadata.status = ModelStatus::Staging;
        metadata.deployed_at = None;
        metadata.artifact_path = artifact_path.display().to_string();

        let metadata_json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| QuantrsError::parsing("model metadata", e.to_string()))?;
        fs::write(model_dir.join("metadata.json"), metadata_json)
            .map_err(|e| QuantrsError::io("write metadata.json", e))?;

        {
            let mut manifest = self.lock_manifest()?;
            manifest.upsert(metadata.clone());
            manifest.save()?;
        }
        self.mirror(&metadata);
        info!(
            "📦 registered {} v{} ({}/{}) in staging",
            metadata.model_id, metadata.version, metadata.ticker, metadata.model_type
        );

        if promote {
            return self.promote_to_production(&metadata.model_id, true);
        }
        Ok(metadata)
    }

    /// Promote `model_id` to production, optionally demoting the current
    /// production model of the same (ticker, model_type) to ARCHIVED.
    /// The demotion and promotion commit as one manifest write. Promoting
    /// the current production model again is a no-op.
    pub fn promote_to_production(
        &self,
        model_id: &str,
        demote_current: bool,
    ) -> QuantrsResult<ModelMetadata> {
        let mut touched: Vec<ModelMetadata> = Vec::new();
        let promoted = {
            let mut manifest = self.lock_manifest()?;
            let target = manifest
                .get(model_id)
                .ok_or_else(|| QuantrsError::model_not_found(model_id))?
                .clone();

            if !Path::new(&target.artifact_path).exists() {
                return Err(QuantrsError::promotion(
                    "promote_to_production",
                    format!("artifact missing at {}", target.artifact_path),
                ));
            }

            if target.status == ModelStatus::Production {
                // idempotent; also guards against self-demotion below
                return Ok(target);
            }

            if demote_current {
                let lineage = target.lineage();
                let demote_id = manifest
                    .values()
                    .find(|m| {
                        m.model_id != model_id
                            && m.status == ModelStatus::Production
                            && m.lineage() == lineage
                    })
                    .map(|m| m.model_id.clone());
                if let Some(demote_id) = demote_id {
                    if let Some(current) = manifest.get_mut(&demote_id) {
                        current.status = ModelStatus::Archived;
                        touched.push(current.clone());
                        info!("📉 archived previous production model {}", demote_id);
                    }
                }
            }

            let record = manifest
                .get_mut(model_id)
                .ok_or_else(|| QuantrsError::model_not_found(model_id))?;
            record.status = ModelStatus::Production;
            record.deployed_at = Some(Utc::now());
            let promoted = record.clone();
            touched.push(promoted.clone());
            manifest.save()?;
            promoted
        };

        for metadata in &touched {
            self.write_metadata_json(metadata);
            self.mirror(metadata);
        }
        info!(
            "🚀 promoted {} to production for {}/{}",
            promoted.model_id, promoted.ticker, promoted.model_type
        );
        Ok(promoted)
    }

    /// Rollback is just promotion of an older artifact; there is no
    /// special-cased path.
    pub fn rollback_to_version(&self, ticker: &str, version: &str) -> QuantrsResult<ModelMetadata> {
        let model_id = {
            let manifest = self.lock_manifest()?;
            let found = manifest
                .values()
                .find(|m| m.ticker == ticker && m.version == version)
                .map(|m| m.model_id.clone())
                .ok_or_else(|| {
                    QuantrsError::model_not_found(format!("{} version {}", ticker, version))
                })?;
            found
        };
        info!("⏪ rolling back {} to version {}", ticker, version);
        self.promote_to_production(&model_id, true)
    }

    /// Delete a model and its directory. Production models cannot be
    /// deleted directly; demote first. `confirm` must be explicit.
    pub fn delete_model(&self, model_id: &str, confirm: bool) -> QuantrsResult<()> {
        if !confirm {
            return Err(QuantrsError::promotion(
                "delete_model",
                "deletion requires explicit confirmation",
            ));
        }
        {
            let mut manifest = self.lock_manifest()?;
            let target = manifest
                .get(model_id)
                .ok_or_else(|| QuantrsError::model_not_found(model_id))?;
            if target.status == ModelStatus::Production {
                return Err(QuantrsError::promotion(
                    "delete_model",
                    format!("{} is in production; demote it first", model_id),
                ));
            }
            manifest.delete(model_id);
            manifest.save()?;
        }

        let model_dir = self.root.join(model_id);
        if model_dir.exists() {
            fs::remove_dir_all(&model_dir)
                .map_err(|e| QuantrsError::io("remove model directory", e))?;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_model(model_id) {
                warn!(
                    "registry consistency warning: relational delete of {} failed: {}",
                    model_id, e
                );
            }
        }
        info!("🗑️ deleted model {}", model_id);
        Ok(())
    }

    /// Advisory status updates (TRAINING while a job is in flight, FAILED
    /// afterwards). Production/Archived transitions must go through
    /// `promote_to_production`.
    pub fn set_status(&self, model_id: &str, status: ModelStatus) -> QuantrsResult<()> {
        if matches!(status, ModelStatus::Production | ModelStatus::Archived) {
            return Err(QuantrsError::promotion(
                "set_status",
                "production/archived transitions must use promote_to_production",
            ));
        }
        let updated = {
            let mut manifest = self.lock_manifest()?;
            let record = manifest
                .get_mut(model_id)
                .ok_or_else(|| QuantrsError::model_not_found(model_id))?;
            record.status = status;
            let updated = record.clone();
            manifest.save()?;
            updated
        };
        self.write_metadata_json(&updated);
        self.mirror(&updated);
        Ok(())
    }

    pub fn load(&self, model_id: &str) -> QuantrsResult<ModelMetadata> {
        let manifest = self.lock_manifest()?;
        manifest
            .get(model_id)
            .cloned()
            .ok_or_else(|| QuantrsError::model_not_found(model_id))
    }

    pub fn list_models(&self, filter: &ModelFilter) -> QuantrsResult<Vec<ModelMetadata>> {
        let manifest = self.lock_manifest()?;
        let mut models: Vec<ModelMetadata> = manifest
            .values()
            .filter(|m| {
                filter.ticker.as_deref().map_or(true, |t| m.ticker == t)
                    && filter
                        .model_type
                        .as_deref()
                        .map_or(true, |t| m.model_type == t)
                    && filter.status.map_or(true, |s| m.status == s)
            })
            .cloned()
            .collect();
        models.sort_by(|a, b| b.trained_at.cmp(&a.trained_at));
        Ok(models)
    }

    /// The single production model for a lineage, if any.
    pub fn production_for(
        &self,
        ticker: &str,
        model_type: &str,
    ) -> QuantrsResult<Option<ModelMetadata>> {
        let manifest = self.lock_manifest()?;
        let found = manifest
            .values()
            .find(|m| {
                m.ticker == ticker
                    && m.model_type == model_type
                    && m.status == ModelStatus::Production
            })
            .cloned();
        Ok(found)
    }

    /// Most recently trained model whose name contains `pattern`.
    pub fn latest_matching(&self, pattern: &str) -> QuantrsResult<Option<ModelMetadata>> {
        let manifest = self.lock_manifest()?;
        Ok(manifest
            .values()
            .filter(|m| m.model_name.contains(pattern))
            .max_by_key(|m| m.trained_at)
            .cloned())
    }

    /// Next semantic version for a lineage.
    pub fn next_version(&self, ticker: &str, model_type: &str) -> QuantrsResult<String> {
        let manifest = self.lock_manifest()?;
        Ok(next_version(
            manifest
                .values()
                .filter(|m| m.ticker == ticker && m.model_type == model_type)
                .map(|m| m.version.as_str()),
        ))
    }

    /// Recompute the relational table from the authoritative manifest:
    /// upsert every manifest entry and drop relational rows the manifest no
    /// longer knows. Returns the number of repaired rows.
    pub fn reconcile(&self) -> QuantrsResult<usize> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| QuantrsError::general("no metadata store configured"))?;

        let snapshot: Vec<ModelMetadata> = {
            let manifest = self.lock_manifest()?;
            manifest.values().cloned().collect()
        };

        let mut repaired = 0;
        for metadata in &snapshot {
            store.upsert_model(metadata)?;
            repaired += 1;
        }

        let known: std::collections::HashSet<&str> =
            snapshot.iter().map(|m| m.model_id.as_str()).collect();
        for stale in store.query_models(&ModelFilter::default())? {
            if !known.contains(stale.model_id.as_str()) {
                store.delete_model(&stale.model_id)?;
                repaired += 1;
            }
        }
        info!("🔧 reconciled relational store: {} rows touched", repaired);
        Ok(repaired)
    }

    /// Keep the per-model metadata.json in step with the manifest. Failures
    /// are logged only; the manifest already committed.
    fn write_metadata_json(&self, metadata: &ModelMetadata) {
        let path = self.root.join(&metadata.model_id).join("metadata.json");
        match serde_json::to_string_pretty(metadata) {
            Ok(json) => {
                if let Err(e) = fs::write(&path, json) {
                    warn!("failed to refresh {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("failed to serialize metadata for {}: {}", metadata.model_id, e),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::learner::{Algorithm, Hyperparameters, Learner, ModelArtifact, StandardScaler};
    use chrono::NaiveDate;
    use ndarray::Array2;
    use std::collections::BTreeMap;

    pub fn temp_registry_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "quantrs-registry-{}-{}-{:?}",
            tag,
            std::process::id(),
            std::thread::current().id()
        ));
        fs::create_dir_all(&dir).expect("temp registry root");
        dir
    }

    pub fn tiny_artifact() -> ModelArtifact {
        let x = Array2::from_shape_vec((6, 1), vec![-2.0, -1.0, -0.5, 0.5, 1.0, 2.0])
            .expect("shape");
        let y = vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let names = vec!["signal".to_string()];
        let scaler = StandardScaler::fit(&x);
        let mut learner = Learner::new(Algorithm::Logistic, &Hyperparameters::new());
        learner
            .fit(&scaler.transform(&x), &y, &names)
            .expect("fit tiny learner");
        ModelArtifact {
            learner,
            scaler,
            feature_schema: names,
        }
    }

    pub fn metadata_for(model_id: &str, ticker: &str, version: &str) -> ModelMetadata {
        ModelMetadata {
            model_id: model_id.to_string(),
            model_name: format!("{}_direction", ticker.to_lowercase()),
            version: version.to_string(),
            ticker: ticker.to_string(),
            model_type: "direction".to_string(),
            algorithm: "logistic".to_string(),
            trained_at: Utc::now(),
            training_duration_seconds: 0.1,
            n_train_samples: 6,
            n_features: 1,
            feature_names: vec!["signal".to_string()],
            data_start_date: NaiveDate::from_ymd_opt(2022, 1, 3).expect("date"),
            data_end_date: NaiveDate::from_ymd_opt(2022, 6, 3).expect("date"),
            train_metrics: BTreeMap::new(),
            val_metrics: BTreeMap::new(),
            test_metrics: BTreeMap::new(),
            hyperparameters: BTreeMap::new(),
            status: ModelStatus::Staging,
            deployed_at: None,
            artifact_path: String::new(),
            tags: Vec::new(),
        }
    }
}

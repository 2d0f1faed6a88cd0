use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use crate::errors::{QuantrsError, QuantrsResult};
use crate::registry::metadata::{ModelMetadata, ModelStatus};

/// One persisted prediction, unique per
/// (ticker, prediction_date, target_date, model_name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub ticker: String,
    pub prediction_date: NaiveDate,
    pub target_date: NaiveDate,
    pub model_name: String,
    pub predicted_direction: String,
    pub confidence: f64,
    pub feature_version: String,
}

/// Filter for relational model queries.
#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    pub ticker: Option<String>,
    pub model_type: Option<String>,
    pub status: Option<ModelStatus>,
}

/// External relational collaborator. The registry mirrors metadata into it
/// best-effort and the prediction engine records predictions through it;
/// everything keeps working in manifest-only mode when it is unreachable.
pub trait MetadataStore: Send + Sync {
    fn upsert_model(&self, metadata: &ModelMetadata) -> QuantrsResult<()>;
    fn upsert_prediction(&self, record: &PredictionRecord) -> QuantrsResult<()>;
    fn query_models(&self, filter: &ModelFilter) -> QuantrsResult<Vec<ModelMetadata>>;
    fn delete_model(&self, model_id: &str) -> QuantrsResult<()>;
}

/// SQLite-backed MetadataStore. Key columns are broken out for filtering;
/// the full metadata travels as a JSON payload column so the table never
/// lags behind the struct.
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    pub fn open(path: impl AsRef<Path>) -> QuantrsResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| QuantrsError::database("open metadata db", e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> QuantrsResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| QuantrsError::database("open in-memory metadata db", e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> QuantrsResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS model_metadata (
                model_id TEXT PRIMARY KEY,
                ticker TEXT NOT NULL,
                model_type TEXT NOT NULL,
                model_name TEXT NOT NULL,
                version TEXT NOT NULL,
                status TEXT NOT NULL,
                trained_at TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS predictions (
                ticker TEXT NOT NULL,
                prediction_date TEXT NOT NULL,
                target_date TEXT NOT NULL,
                model_name TEXT NOT NULL,
                predicted_direction TEXT NOT NULL,
                confidence REAL NOT NULL,
                feature_version TEXT NOT NULL,
                PRIMARY KEY (ticker, prediction_date, target_date, model_name)
            )",
            [],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn prediction_count(&self) -> QuantrsResult<i64> {
        let conn = self.lock_conn()?;
        conn.query_row("SELECT COUNT(*) FROM predictions", [], |row| row.get(0))
            .map_err(|e| QuantrsError::database("count predictions", e.to_string()))
    }

    fn lock_conn(&self) -> QuantrsResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| QuantrsError::general("metadata db connection lock poisoned"))
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn upsert_model(&self, metadata: &ModelMetadata) -> QuantrsResult<()> {
        let payload = serde_json::to_string(metadata)
            .map_err(|e| QuantrsError::parsing("model metadata", e.to_string()))?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO model_metadata
             (model_id, ticker, model_type, model_name, version, status, trained_at, payload)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(model_id) DO UPDATE SET
                 status = excluded.status,
                 payload = excluded.payload",
            (
                &metadata.model_id,
                &metadata.ticker,
                &metadata.model_type,
                &metadata.model_name,
                &metadata.version,
                metadata.status.to_string(),
                metadata.trained_at.to_rfc3339(),
                payload,
            ),
        )
        .map_err(|e| QuantrsError::database("upsert model metadata", e.to_string()))?;
        debug!("mirrored metadata for {} into relational store", metadata.model_id);
        Ok(())
    }

    fn upsert_prediction(&self, record: &PredictionRecord) -> QuantrsResult<()> {
        let conn = self.lock_conn()?;
        // conflict resolution touches only the mutable outcome columns
        conn.execute(
            "INSERT INTO predictions
             (ticker, prediction_date, target_date, model_name,
              predicted_direction, confidence, feature_version)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(ticker, prediction_date, target_date, model_name) DO UPDATE SET
                 predicted_direction = excluded.predicted_direction,
                 confidence = excluded.confidence,
                 feature_version = excluded.feature_version",
            (
                &record.ticker,
                record.prediction_date.format("%Y-%m-%d").to_string(),
                record.target_date.format("%Y-%m-%d").to_string(),
                &record.model_name,
                &record.predicted_direction,
                record.confidence,
                &record.feature_version,
            ),
        )
        .map_err(|e| QuantrsError::database("upsert prediction", e.to_string()))?;
        Ok(())
    }

    fn query_models(&self, filter: &ModelFilter) -> QuantrsResult<Vec<ModelMetadata>> {
        let conn = self.lock_conn()?;
        let mut sql = "SELECT payload FROM model_metadata WHERE 1=1".to_string();
        let mut params: Vec<String> = Vec::new();
        if let Some(ticker) = &filter.ticker {
            sql.push_str(" AND ticker = ?");
            params.push(ticker.clone());
        }
        if let Some(model_type) = &filter.model_type {
            sql.push_str(" AND model_type = ?");
            params.push(model_type.clone());
        }
        if let Some(status) = &filter.status {
            sql.push_str(" AND status = ?");
            params.push(status.to_string());
        }
        sql.push_str(" ORDER BY trained_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let payloads: Vec<String> = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        payloads
            .into_iter()
            .map(|payload| {
                serde_json::from_str(&payload)
                    .map_err(|e| QuantrsError::parsing("model metadata payload", e.to_string()))
            })
            .collect()
    }

    fn delete_model(&self, model_id: &str) -> QuantrsResult<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM model_metadata WHERE model_id = ?", [model_id])
            .map_err(|e| QuantrsError::database("delete model metadata", e.to_string()))?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn sample_metadata(model_id: &str, status: ModelStatus) -> ModelMetadata {
        ModelMetadata {
            model_id: model_id.to_string(),
            model_name: "tst_direction".to_string(),
            version: "1.0.0".to_string(),
            ticker: "TST".to_string(),
            model_type: "direction".to_string(),
            algorithm: "forest".to_string(),
            trained_at: Utc::now(),
            training_duration_seconds: 2.5,
            n_train_samples: 400,
            n_features: 10,
            feature_names: vec!["return_1d".to_string()],
            data_start_date: NaiveDate::from_ymd_opt(2022, 1, 3).expect("date"),
            data_end_date: NaiveDate::from_ymd_opt(2023, 12, 29).expect("date"),
            train_metrics: BTreeMap::new(),
            val_metrics: BTreeMap::new(),
            test_metrics: BTreeMap::new(),
            hyperparameters: BTreeMap::new(),
            status,
            deployed_at: None,
            artifact_path: "registry/m/model.bin".to_string(),
            tags: vec!["test".to_string()],
        }
    }

    #[test]
    fn test_model_upsert_is_idempotent() {
        let store = SqliteMetadataStore::open_in_memory().expect("open");
        let mut metadata = sample_metadata("m1", ModelStatus::Staging);
        store.upsert_model(&metadata).expect("insert");
        metadata.status = ModelStatus::Production;
        store.upsert_model(&metadata).expect("update");

        let rows = store
            .query_models(&ModelFilter {
                ticker: Some("TST".to_string()),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ModelStatus::Production);
    }

    #[test]
    fn test_status_filter() {
        let store = SqliteMetadataStore::open_in_memory().expect("open");
        store
            .upsert_model(&sample_metadata("m1", ModelStatus::Staging))
            .expect("insert");
        store
            .upsert_model(&sample_metadata("m2", ModelStatus::Production))
            .expect("insert");

        let production = store
            .query_models(&ModelFilter {
                status: Some(ModelStatus::Production),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(production.len(), 1);
        assert_eq!(production[0].model_id, "m2");
    }

    #[test]
    fn test_prediction_conflict_updates_outcome_columns() {
        let store = SqliteMetadataStore::open_in_memory().expect("open");
        let mut record = PredictionRecord {
            ticker: "TST".to_string(),
            prediction_date: NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"),
            target_date: NaiveDate::from_ymd_opt(2024, 3, 2).expect("date"),
            model_name: "tst_direction".to_string(),
            predicted_direction: "up".to_string(),
            confidence: 0.61,
            feature_version: "v1".to_string(),
        };
        store.upsert_prediction(&record).expect("insert");
        record.predicted_direction = "down".to_string();
        record.confidence = 0.55;
        store.upsert_prediction(&record).expect("upsert");

        let conn = store.conn.lock().expect("lock");
        let (direction, confidence, count): (String, f64, i64) = conn
            .query_row(
                "SELECT predicted_direction, confidence, COUNT(*) OVER () FROM predictions",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("row");
        assert_eq!(count, 1);
        assert_eq!(direction, "down");
        assert!((confidence - 0.55).abs() < 1e-9);
    }
}

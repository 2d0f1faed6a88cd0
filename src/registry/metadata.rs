use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{QuantrsError, QuantrsResult};
use crate::learner::Hyperparameters;

/// Lifecycle state of a registered model. `Training` is advisory only, set
/// by a caller while a long job is in flight; the registry itself never
/// produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelStatus {
    Training,
    Staging,
    Production,
    Archived,
    Failed,
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Training => "TRAINING",
            Self::Staging => "STAGING",
            Self::Production => "PRODUCTION",
            Self::Archived => "ARCHIVED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Identity and provenance record for one trained artifact. Created at
/// registration in STAGING; mutated only by registry transitions; never
/// deleted once it has been in production.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_id: String,
    pub model_name: String,
    pub version: String,
    pub ticker: String,
    pub model_type: String,
    pub algorithm: String,
    pub trained_at: DateTime<Utc>,
    pub training_duration_seconds: f64,
    pub n_train_samples: usize,
    pub n_features: usize,
    pub feature_names: Vec<String>,
    pub data_start_date: NaiveDate,
    pub data_end_date: NaiveDate,
    pub train_metrics: BTreeMap<String, f64>,
    pub val_metrics: BTreeMap<String, f64>,
    pub test_metrics: BTreeMap<String, f64>,
    pub hyperparameters: Hyperparameters,
    pub status: ModelStatus,
    pub deployed_at: Option<DateTime<Utc>>,
    pub artifact_path: String,
    pub tags: Vec<String>,
}

impl ModelMetadata {
    /// Lineage key: one production model is allowed per lineage.
    pub fn lineage(&self) -> (String, String) {
        (self.ticker.clone(), self.model_type.clone())
    }
}

/// Semantic version helpers for per-lineage monotonic versions.
pub fn parse_version(version: &str) -> QuantrsResult<(u64, u64, u64)> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 {
        return Err(QuantrsError::parsing(
            "version",
            format!("'{}' is not MAJOR.MINOR.PATCH", version),
        ));
    }
    let parse = |s: &str| {
        s.parse::<u64>()
            .map_err(|e| QuantrsError::parsing("version", format!("'{}': {}", version, e)))
    };
    Ok((parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
}

/// Next version in a lineage: bump the minor of the highest existing
/// version, or start at 1.0.0 for an empty lineage.
pub fn next_version<'a>(existing: impl Iterator<Item = &'a str>) -> String {
    let mut best: Option<(u64, u64, u64)> = None;
    for version in existing {
        if let Ok(parsed) = parse_version(version) {
            if best.map(|b| parsed > b).unwrap_or(true) {
                best = Some(parsed);
            }
        }
    }
    match best {
        Some((major, minor, _)) => format!("{}.{}.0", major, minor + 1),
        None => "1.0.0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&ModelStatus::Production).expect("serialize");
        assert_eq!(json, "\"PRODUCTION\"");
    }

    #[test]
    fn test_next_version_bumps_minor() {
        let versions = ["1.0.0", "1.2.0", "1.1.0"];
        assert_eq!(next_version(versions.iter().copied()), "1.3.0");
    }

    #[test]
    fn test_next_version_empty_lineage() {
        assert_eq!(next_version(std::iter::empty()), "1.0.0");
    }

    #[test]
    fn test_parse_version_rejects_garbage() {
        assert!(parse_version("v1.2").is_err());
        assert!(parse_version("1.2.x").is_err());
    }
}

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{QuantrsError, QuantrsResult};
use crate::registry::metadata::ModelMetadata;

/// The root `registry.json` index, treated as a small embedded key-value
/// store (model_id -> metadata) behind a load/save/upsert/delete surface.
/// It is the authoritative copy; the relational mirror is best-effort.
#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    entries: BTreeMap<String, ModelMetadata>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManifestFile {
    models: BTreeMap<String, ModelMetadata>,
}

impl Manifest {
    /// Load the manifest at `path`, starting empty when the file does not
    /// exist yet.
    pub fn load(path: impl Into<PathBuf>) -> QuantrsResult<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| QuantrsError::io("read registry manifest", e))?;
            let file: ManifestFile = serde_json::from_str(&content).map_err(|e| {
                QuantrsError::parsing("registry manifest", format!("{}: {}", path.display(), e))
            })?;
            file.models
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    /// Persist atomically: write a sibling temp file, then rename over the
    /// manifest so a concurrent reader never observes a half-written index.
    pub fn save(&self) -> QuantrsResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| QuantrsError::io("create registry root", e))?;
        }
        let file = ManifestFile {
            models: self.entries.clone(),
        };
        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| QuantrsError::parsing("registry manifest", e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| QuantrsError::io("write registry manifest", e))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| QuantrsError::io("replace registry manifest", e))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelMetadata> {
        self.entries.get(model_id)
    }

    pub fn get_mut(&mut self, model_id: &str) -> Option<&mut ModelMetadata> {
        self.entries.get_mut(model_id)
    }

    pub fn upsert(&mut self, metadata: ModelMetadata) {
        self.entries.insert(metadata.model_id.clone(), metadata);
    }

    pub fn delete(&mut self, model_id: &str) -> Option<ModelMetadata> {
        self.entries.remove(model_id)
    }

    pub fn values(&self) -> impl Iterator<Item = &ModelMetadata> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

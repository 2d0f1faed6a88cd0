use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::debug;

use crate::errors::{QuantrsError, QuantrsResult};
use crate::learner::ModelArtifact;

/// Cache key: resolved artifact path plus its modification time. A replaced
/// file gets a fresh mtime, hence a fresh key, so externally swapped
/// artifacts are picked up without restarting the serving process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: PathBuf,
    mtime: SystemTime,
}

struct CacheState {
    entries: HashMap<CacheKey, Arc<ModelArtifact>>,
    /// Recency order, least recent first.
    order: Vec<CacheKey>,
}

/// Bounded LRU cache of deserialized artifacts, shared by concurrent
/// predict calls. Explicitly constructed and injected (and resettable) so
/// tests never fight ambient global state. Structural mutation happens
/// under one mutex; a per-path load guard keeps concurrent misses on the
/// same artifact from deserializing it twice.
pub struct ArtifactCache {
    capacity: usize,
    state: Mutex<CacheState>,
    load_guards: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ArtifactCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
            load_guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached artifact and load guard.
    pub fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.clear();
            state.order.clear();
        }
        if let Ok(mut guards) = self.load_guards.lock() {
            guards.clear();
        }
    }

    /// Fetch the artifact at `path`, deserializing at most once per
    /// (path, mtime) even under concurrent callers.
    pub fn get_or_load(&self, path: &Path) -> QuantrsResult<Arc<ModelArtifact>> {
        let key = self.key_for(path)?;

        if let Some(artifact) = self.lookup(&key)? {
            return Ok(artifact);
        }

        // per-path guard: one loader deserializes, the rest wait and then
        // hit the cache
        let guard = {
            let mut guards = self
                .load_guards
                .lock()
                .map_err(|_| QuantrsError::general("cache load-guard lock poisoned"))?;
            guards
                .entry(key.path.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _held = guard
            .lock()
            .map_err(|_| QuantrsError::general("cache load guard poisoned"))?;

        if let Some(artifact) = self.lookup(&key)? {
            return Ok(artifact);
        }

        debug!("artifact cache miss, deserializing {}", key.path.display());
        let artifact = Arc::new(ModelArtifact::load(&key.path)?);
        self.insert(key, artifact.clone())?;
        Ok(artifact)
    }

    fn key_for(&self, path: &Path) -> QuantrsResult<CacheKey> {
        let meta = fs::metadata(path)
            .map_err(|e| QuantrsError::model_not_found(format!("{} ({})", path.display(), e)))?;
        let mtime = meta
            .modified()
            .map_err(|e| QuantrsError::io("read artifact mtime", e))?;
        Ok(CacheKey {
            path: path.to_path_buf(),
            mtime,
        })
    }

    fn lookup(&self, key: &CacheKey) -> QuantrsResult<Option<Arc<ModelArtifact>>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| QuantrsError::general("artifact cache lock poisoned"))?;
        if let Some(artifact) = state.entries.get(key).cloned() {
            state.order.retain(|k| k != key);
            state.order.push(key.clone());
            return Ok(Some(artifact));
        }
        Ok(None)
    }

    fn insert(&self, key: CacheKey, artifact: Arc<ModelArtifact>) -> QuantrsResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| QuantrsError::general("artifact cache lock poisoned"))?;

        // stale generations of the same path can never be served again
        let stale: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|k| k.path == key.path && k.mtime != key.mtime)
            .cloned()
            .collect();
        for k in stale {
            state.entries.remove(&k);
            state.order.retain(|o| *o != k);
        }

        while state.entries.len() >= self.capacity {
            let Some(evicted) = state.order.first().cloned() else {
                break;
            };
            state.order.remove(0);
            state.entries.remove(&evicted);
            debug!("evicted {} from artifact cache", evicted.path.display());
        }

        state.order.push(key.clone());
        state.entries.insert(key, artifact);
        Ok(())
    }
}

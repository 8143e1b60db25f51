/// Lock-free cache of immutable workflow versions
///
/// Versions never change once published, so a cached entry never goes stale.
/// Lookups read an ArcSwap'd map; a miss loads from storage and swaps in a new
/// map containing the loaded version. Concurrent runs keep reading while the
/// map is replaced.

use crate::error::EngineError;
use crate::workflow::{storage::EngineStorage, types::WorkflowVersion};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

#[derive(Debug)]
pub struct VersionCache {
    /// Key: version_id, Value: shared version snapshot
    versions: ArcSwap<HashMap<String, Arc<WorkflowVersion>>>,

    /// Persistent storage used on cache misses
    storage: EngineStorage,
}

impl VersionCache {
    pub fn new(storage: EngineStorage) -> Self {
        Self {
            versions: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    /// Get a version by id, loading it from storage on a miss
    pub async fn get_or_load(&self, version_id: &str) -> Result<Arc<WorkflowVersion>> {
        if let Some(version) = self.get(version_id) {
            return Ok(version);
        }

        let version = self
            .storage
            .get_version(version_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow version", version_id))?;
        let version = Arc::new(version);

        self.versions.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(version_id.to_string(), Arc::clone(&version));
            next
        });

        tracing::debug!("📦 Cached workflow version: {} ({} nodes)", version_id, version.nodes.len());
        Ok(version)
    }

    /// Cached version without touching storage
    pub fn get(&self, version_id: &str) -> Option<Arc<WorkflowVersion>> {
        self.versions.load().get(version_id).cloned()
    }
}

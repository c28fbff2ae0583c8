pub mod file;

use crate::shared::error::{EngineError, EngineResult};
use async_trait::async_trait;
use broker_core::ResourceHandle;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub use file::FileInventoryRepository;

/// Durable record of every resource the broker believes is checked out.
///
/// Each call is atomic: readers see a handle either wholly before or wholly
/// after a `put`/`remove`, never in between.
#[async_trait]
pub trait InventoryRepository: Send + Sync {
    async fn get(&self, id: &str) -> EngineResult<Option<ResourceHandle>>;

    /// Inserts or replaces the whole handle.
    async fn put(&self, handle: ResourceHandle) -> EngineResult<()>;

    /// Returns whether a handle was removed.
    async fn remove(&self, id: &str) -> EngineResult<bool>;

    /// Consistent snapshot, oldest first.
    async fn list(&self) -> EngineResult<Vec<ResourceHandle>>;
}

pub(crate) fn sorted(mut handles: Vec<ResourceHandle>) -> Vec<ResourceHandle> {
    handles.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    handles
}

fn poisoned() -> EngineError {
    EngineError::Storage("Lock poisoned".to_string())
}

#[derive(Clone, Default)]
pub struct InMemoryInventoryRepository {
    storage: Arc<RwLock<HashMap<String, ResourceHandle>>>,
}

impl InMemoryInventoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InventoryRepository for InMemoryInventoryRepository {
    async fn get(&self, id: &str) -> EngineResult<Option<ResourceHandle>> {
        let storage = self.storage.read().map_err(|_| poisoned())?;
        Ok(storage.get(id).cloned())
    }

    async fn put(&self, handle: ResourceHandle) -> EngineResult<()> {
        let mut storage = self.storage.write().map_err(|_| poisoned())?;
        storage.insert(handle.id.clone(), handle);
        Ok(())
    }

    async fn remove(&self, id: &str) -> EngineResult<bool> {
        let mut storage = self.storage.write().map_err(|_| poisoned())?;
        Ok(storage.remove(id).is_some())
    }

    async fn list(&self) -> EngineResult<Vec<ResourceHandle>> {
        let storage = self.storage.read().map_err(|_| poisoned())?;
        Ok(sorted(storage.values().cloned().collect()))
    }
}

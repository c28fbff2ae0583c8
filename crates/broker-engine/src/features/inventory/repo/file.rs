use crate::features::inventory::repo::{sorted, InventoryRepository};
use crate::shared::error::{EngineError, EngineResult};
use async_trait::async_trait;
use broker_core::ResourceHandle;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Inventory persisted as a JSON array of handles.
///
/// Every mutation rewrites the whole file through a temporary sibling that is
/// renamed into place, so the file on disk is always a complete snapshot.
/// The in-memory copy only changes once the write has succeeded.
pub struct FileInventoryRepository {
    path: PathBuf,
    storage: RwLock<HashMap<String, ResourceHandle>>,
}

impl FileInventoryRepository {
    /// Opens the inventory at `path`; a missing file is an empty inventory.
    pub async fn open(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let handles: Vec<ResourceHandle> = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                EngineError::Storage(format!("corrupt inventory {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(EngineError::Storage(format!(
                    "failed to read inventory {}: {e}",
                    path.display()
                )))
            }
        };

        info!(path = %path.display(), handles = handles.len(), "Inventory loaded");

        Ok(Self {
            path,
            storage: RwLock::new(
                handles
                    .into_iter()
                    .map(|handle| (handle.id.clone(), handle))
                    .collect(),
            ),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "inventory.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn persist(&self, snapshot: &HashMap<String, ResourceHandle>) -> EngineResult<()> {
        let handles = sorted(snapshot.values().cloned().collect());
        let bytes = serde_json::to_vec_pretty(&handles)
            .map_err(|e| EngineError::Storage(format!("failed to encode inventory: {e}")))?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes).await.map_err(|e| {
            EngineError::Storage(format!("failed to write {}: {e}", temp.display()))
        })?;
        tokio::fs::rename(&temp, &self.path).await.map_err(|e| {
            EngineError::Storage(format!(
                "failed to replace {}: {e}",
                self.path.display()
            ))
        })?;

        debug!(path = %self.path.display(), handles = handles.len(), "Inventory persisted");
        Ok(())
    }
}

#[async_trait]
impl InventoryRepository for FileInventoryRepository {
    async fn get(&self, id: &str) -> EngineResult<Option<ResourceHandle>> {
        let storage = self.storage.read().await;
        Ok(storage.get(id).cloned())
    }

    async fn put(&self, handle: ResourceHandle) -> EngineResult<()> {
        let mut storage = self.storage.write().await;
        let mut next = storage.clone();
        next.insert(handle.id.clone(), handle);
        self.persist(&next).await?;
        *storage = next;
        Ok(())
    }

    async fn remove(&self, id: &str) -> EngineResult<bool> {
        let mut storage = self.storage.write().await;
        if !storage.contains_key(id) {
            return Ok(false);
        }
        let mut next = storage.clone();
        next.remove(id);
        self.persist(&next).await?;
        *storage = next;
        Ok(true)
    }

    async fn list(&self) -> EngineResult<Vec<ResourceHandle>> {
        let storage = self.storage.read().await;
        Ok(sorted(storage.values().cloned().collect()))
    }
}

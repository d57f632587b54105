//! Project-scoped store handles.

use super::{validate_project_id, MemoryError, MemoryStore};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

lazy_static! {
    static ref REGISTRIES: std::sync::Mutex<HashMap<PathBuf, Arc<MemoryRegistry>>> =
        std::sync::Mutex::new(HashMap::new());
}

/// A store shared between callers; the mutex serializes writes per project.
pub type SharedMemory = Arc<Mutex<MemoryStore>>;

/// Owns one [`MemoryStore`] per open project under a data directory.
///
/// Two handles for the same project id always point at the same store, so
/// writes within a project are serialized while different projects proceed
/// independently.
#[derive(Debug)]
pub struct MemoryRegistry {
    data_dir: PathBuf,
    open: Mutex<HashMap<String, SharedMemory>>,
}

impl MemoryRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide registry for `data_dir`.
    ///
    /// Callers naming the same directory get the same registry, and so the
    /// same store for each project.
    pub fn shared(data_dir: impl Into<PathBuf>) -> Arc<Self> {
        let data_dir = data_dir.into();
        let mut registries = REGISTRIES.lock().unwrap_or_else(PoisonError::into_inner);
        let registry = registries
            .entry(data_dir.clone())
            .or_insert_with(|| Arc::new(Self::new(data_dir)));
        Arc::clone(registry)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Start a new, empty project.
    pub async fn create(&self, project_id: &str) -> Result<SharedMemory, MemoryError> {
        validate_project_id(project_id)?;
        let dir = self.data_dir.join(project_id);
        if fs::try_exists(&dir).await? {
            return Err(MemoryError::ProjectExists(project_id.to_string()));
        }
        fs::create_dir_all(&dir).await?;
        info!(project = project_id, "Created project");
        self.open_existing(project_id).await
    }

    /// Open a project that already exists on disk.
    pub async fn open(&self, project_id: &str) -> Result<SharedMemory, MemoryError> {
        validate_project_id(project_id)?;
        if !fs::try_exists(self.data_dir.join(project_id)).await? {
            return Err(MemoryError::ProjectNotFound(project_id.to_string()));
        }
        self.open_existing(project_id).await
    }

    pub async fn open_or_create(&self, project_id: &str) -> Result<SharedMemory, MemoryError> {
        match self.open(project_id).await {
            Err(MemoryError::ProjectNotFound(_)) => self.create(project_id).await,
            other => other,
        }
    }

    /// Drop the cached handle and stop it writing.
    ///
    /// Outstanding clones can still be read and mutated in memory, but their
    /// writes report [`Durability::Volatile`](super::Durability::Volatile).
    /// The next `open` reloads from disk.
    pub async fn close(&self, project_id: &str) -> bool {
        let removed = self.open.lock().await.remove(project_id);
        match removed {
            Some(store) => {
                store.lock().await.mark_closed();
                true
            }
            None => false,
        }
    }

    /// Close the project and remove its files.
    pub async fn delete(&self, project_id: &str) -> Result<(), MemoryError> {
        validate_project_id(project_id)?;
        let dir = self.data_dir.join(project_id);
        if !fs::try_exists(&dir).await? {
            return Err(MemoryError::ProjectNotFound(project_id.to_string()));
        }
        self.close(project_id).await;
        fs::remove_dir_all(&dir).await?;
        info!(project = project_id, "Deleted project");
        Ok(())
    }

    /// Ids of all projects on disk, sorted.
    pub async fn list(&self) -> Result<Vec<String>, MemoryError> {
        if !fs::try_exists(&self.data_dir).await? {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if validate_project_id(name).is_ok() {
                        ids.push(name.to_string());
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn open_existing(&self, project_id: &str) -> Result<SharedMemory, MemoryError> {
        let mut open = self.open.lock().await;
        if let Some(store) = open.get(project_id) {
            return Ok(Arc::clone(store));
        }

        let store = Arc::new(Mutex::new(
            MemoryStore::open(&self.data_dir, project_id).await?,
        ));
        open.insert(project_id.to_string(), Arc::clone(&store));
        Ok(store)
    }
}

//! JSON file backed local store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use driftsync_common::{
    AnyModel, DeadLetter, Error, ModelId, ModelName, MutationEvent, MutationSyncMetadata,
    QueryPredicate, QuerySortDescriptor, Result,
};

use crate::state::StoreState;
use crate::store::LocalStore;

const STORE_FILE: &str = "store.json";

/// Durable local store that keeps its contents in one JSON document.
///
/// Every write rewrites the document through a temporary file followed by a
/// rename, so a crash leaves either the previous or the new contents on disk.
/// A write runs on its own task, so cancelling the caller never leaves the
/// document and the in-memory copy apart.
/// This is a reference implementation, not a storage engine: the whole store
/// is held in memory and the file layout is not a stable format.
pub struct FileStore {
    path: PathBuf,
    state: Arc<Mutex<StoreState>>,
}

impl FileStore {
    /// Open a store rooted at `dir`.
    ///
    /// # Postconditions
    /// - `dir` is created if it doesn't exist
    /// - Previously persisted contents are loaded
    ///
    /// # Errors
    /// - Permission denied
    /// - The store document exists but cannot be parsed
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await.map_err(Error::Io)?;

        let path = dir.join(STORE_FILE);
        let state = if fs::try_exists(&path).await.map_err(Error::Io)? {
            let content = fs::read_to_string(&path).await.map_err(Error::Io)?;
            serde_json::from_str(&content).map_err(|e| {
                Error::Storage(format!("Corrupt store file {}: {}", path.display(), e))
            })?
        } else {
            StoreState::default()
        };

        info!(path = %path.display(), "Opened file store");
        Ok(Self {
            path,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Location of the store document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` and persist. The in-memory state is only replaced once
    /// the new document is on disk.
    async fn update<T>(&self, change: impl FnOnce(&mut StoreState) -> T) -> Result<T> {
        let mut guard = self.state.clone().lock_owned().await;
        let mut next = (*guard).clone();
        let output = change(&mut next);

        let path = self.path.clone();
        tokio::spawn(async move {
            persist(&path, &next).await?;
            *guard = next;
            Ok::<(), Error>(())
        })
        .await
        .map_err(|e| Error::Storage(format!("Store write task failed: {}", e)))??;

        Ok(output)
    }
}

async fn persist(path: &Path, state: &StoreState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).await.map_err(Error::Io)?;
    fs::rename(&tmp, path).await.map_err(Error::Io)?;
    debug!(path = %path.display(), "Persisted file store");
    Ok(())
}

#[async_trait]
impl LocalStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn query(
        &self,
        model_name: &ModelName,
        predicate: Option<&QueryPredicate>,
        sort: &[QuerySortDescriptor],
    ) -> Result<Vec<AnyModel>> {
        Ok(self.state.lock().await.query(model_name, predicate, sort))
    }

    async fn query_by_id(
        &self,
        model_name: &ModelName,
        id: &ModelId,
    ) -> Result<Option<AnyModel>> {
        Ok(self.state.lock().await.get(model_name, id))
    }

    async fn save(&self, model: &AnyModel) -> Result<()> {
        self.update(|state| state.save(model)).await
    }

    async fn delete(&self, model_name: &ModelName, id: &ModelId) -> Result<Option<AnyModel>> {
        self.update(|state| state.delete(model_name, id)).await
    }

    async fn query_sync_metadata(
        &self,
        model_id: &ModelId,
        model_name: &ModelName,
    ) -> Result<Option<MutationSyncMetadata>> {
        Ok(self.state.lock().await.sync_metadata(model_id, model_name))
    }

    async fn save_sync_metadata(&self, metadata: &MutationSyncMetadata) -> Result<()> {
        self.update(|state| state.save_sync_metadata(metadata)).await
    }

    async fn all_sync_metadata(&self) -> Result<Vec<MutationSyncMetadata>> {
        Ok(self.state.lock().await.all_sync_metadata())
    }

    async fn save_mutation_event(&self, event: &MutationEvent) -> Result<()> {
        self.update(|state| state.save_mutation_event(event)).await
    }

    async fn delete_mutation_event(&self, id: &str) -> Result<bool> {
        self.update(|state| state.delete_mutation_event(id)).await
    }

    async fn mutation_events(&self) -> Result<Vec<MutationEvent>> {
        Ok(self.state.lock().await.mutation_events())
    }

    async fn save_dead_letter(&self, dead_letter: &DeadLetter) -> Result<()> {
        self.update(|state| state.save_dead_letter(dead_letter)).await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.state.lock().await.dead_letters())
    }

    async fn delete_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>> {
        self.update(|state| state.delete_dead_letter(id)).await
    }
}

//! In-memory local store for testing.

use async_trait::async_trait;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use driftsync_common::{
    AnyModel, DeadLetter, Error, ModelId, ModelName, MutationEvent, MutationSyncMetadata,
    QueryPredicate, QuerySortDescriptor, Result,
};

use crate::state::StoreState;
use crate::store::LocalStore;

/// In-memory local store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Clones share the same underlying collections.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        self.state
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        self.state
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn query(
        &self,
        model_name: &ModelName,
        predicate: Option<&QueryPredicate>,
        sort: &[QuerySortDescriptor],
    ) -> Result<Vec<AnyModel>> {
        Ok(self.read()?.query(model_name, predicate, sort))
    }

    async fn query_by_id(
        &self,
        model_name: &ModelName,
        id: &ModelId,
    ) -> Result<Option<AnyModel>> {
        Ok(self.read()?.get(model_name, id))
    }

    async fn save(&self, model: &AnyModel) -> Result<()> {
        self.write()?.save(model);
        Ok(())
    }

    async fn delete(&self, model_name: &ModelName, id: &ModelId) -> Result<Option<AnyModel>> {
        Ok(self.write()?.delete(model_name, id))
    }

    async fn query_sync_metadata(
        &self,
        model_id: &ModelId,
        model_name: &ModelName,
    ) -> Result<Option<MutationSyncMetadata>> {
        Ok(self.read()?.sync_metadata(model_id, model_name))
    }

    async fn save_sync_metadata(&self, metadata: &MutationSyncMetadata) -> Result<()> {
        self.write()?.save_sync_metadata(metadata);
        Ok(())
    }

    async fn all_sync_metadata(&self) -> Result<Vec<MutationSyncMetadata>> {
        Ok(self.read()?.all_sync_metadata())
    }

    async fn save_mutation_event(&self, event: &MutationEvent) -> Result<()> {
        self.write()?.save_mutation_event(event);
        Ok(())
    }

    async fn delete_mutation_event(&self, id: &str) -> Result<bool> {
        Ok(self.write()?.delete_mutation_event(id))
    }

    async fn mutation_events(&self) -> Result<Vec<MutationEvent>> {
        Ok(self.read()?.mutation_events())
    }

    async fn save_dead_letter(&self, dead_letter: &DeadLetter) -> Result<()> {
        self.write()?.save_dead_letter(dead_letter);
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.read()?.dead_letters())
    }

    async fn delete_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>> {
        Ok(self.write()?.delete_dead_letter(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_common::{MutationType, QueryPredicate, QuerySortDescriptor};
    use serde_json::json;

    fn post(id: &str, title: &str, rating: i64) -> AnyModel {
        AnyModel::new(
            ModelName::new("Post").unwrap(),
            json!({ "id": id, "title": title, "rating": rating }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_query() {
        let store = MemoryStore::new();
        let name = ModelName::new("Post").unwrap();

        store.save(&post("1", "t", 3)).await.unwrap();
        store.save(&post("2", "other", 5)).await.unwrap();
        store.save(&post("3", "t", 1)).await.unwrap();

        let predicate = QueryPredicate::field("title").eq("t");
        let sort = [QuerySortDescriptor::descending("rating")];
        let results = store.query(&name, Some(&predicate), &sort).await.unwrap();

        let ids: Vec<&str> = results.iter().map(|m| m.id().as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn test_save_replaces_existing_record() {
        let store = MemoryStore::new();
        let name = ModelName::new("Post").unwrap();
        let id = ModelId::new("1").unwrap();

        store.save(&post("1", "first", 1)).await.unwrap();
        store.save(&post("1", "second", 1)).await.unwrap();

        let model = store.query_by_id(&name, &id).await.unwrap().unwrap();
        assert_eq!(model.field("title"), Some(&json!("second")));
        assert_eq!(store.query(&name, None, &[]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        let name = ModelName::new("Post").unwrap();
        let id = ModelId::new("1").unwrap();

        store.save(&post("1", "t", 1)).await.unwrap();
        assert!(store.delete(&name, &id).await.unwrap().is_some());
        assert!(store.query_by_id(&name, &id).await.unwrap().is_none());
        assert!(store.delete(&name, &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mutation_events_for_record() {
        let store = MemoryStore::new();
        let name = ModelName::new("Post").unwrap();

        let first = MutationEvent::new(&post("1", "a", 1), MutationType::Create, None).unwrap();
        let other = MutationEvent::new(&post("2", "b", 1), MutationType::Create, None).unwrap();
        let second = MutationEvent::new(&post("1", "c", 1), MutationType::Update, None).unwrap();
        for event in [&second, &other, &first] {
            store.save_mutation_event(event).await.unwrap();
        }

        let events = store
            .mutation_events_for(&name, &ModelId::new("1").unwrap())
            .await
            .unwrap();
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);

        assert!(store.delete_mutation_event(&first.id).await.unwrap());
        assert!(!store.delete_mutation_event(&first.id).await.unwrap());
        assert_eq!(store.mutation_events().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_metadata() {
        let store = MemoryStore::new();
        let metadata = MutationSyncMetadata {
            model_id: ModelId::new("1").unwrap(),
            model_name: ModelName::new("Post").unwrap(),
            version: 2,
            deleted: false,
            last_changed_at: 100,
        };

        store.save_sync_metadata(&metadata).await.unwrap();
        let loaded = store
            .query_sync_metadata(&metadata.model_id, &metadata.model_name)
            .await
            .unwrap();
        assert_eq!(loaded, Some(metadata));
        assert_eq!(store.all_sync_metadata().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letters() {
        let store = MemoryStore::new();
        let event = MutationEvent::new(&post("1", "t", 1), MutationType::Create, None).unwrap();
        let letter = DeadLetter::new(event.clone(), "rejected");

        store.save_dead_letter(&letter).await.unwrap();
        assert_eq!(store.dead_letters().await.unwrap(), vec![letter.clone()]);

        let removed = store.delete_dead_letter(&event.id).await.unwrap();
        assert_eq!(removed, Some(letter));
        assert!(store.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryStore::new();
        let clone = store.clone();
        store.save(&post("1", "t", 1)).await.unwrap();

        let name = ModelName::new("Post").unwrap();
        assert_eq!(clone.query(&name, None, &[]).await.unwrap().len(), 1);
    }
}

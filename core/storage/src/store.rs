//! Local store trait definition.

use async_trait::async_trait;

use driftsync_common::{
    AnyModel, DeadLetter, ModelId, ModelName, MutationEvent, MutationSyncMetadata,
    QueryPredicate, QuerySortDescriptor, Result,
};

/// Keyed record storage used by the sync core.
///
/// A store holds four collections: model records, per-record sync
/// metadata, the mutation event outbox and the dead-letter list.
/// Implementations must serialize conflicting writes themselves.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the store name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Query records of one model type.
    ///
    /// # Postconditions
    /// - Only records matching `predicate` are returned (all when `None`)
    /// - Results are ordered by `sort`, then by model id
    async fn query(
        &self,
        model_name: &ModelName,
        predicate: Option<&QueryPredicate>,
        sort: &[QuerySortDescriptor],
    ) -> Result<Vec<AnyModel>>;

    /// Fetch a single record by identity.
    async fn query_by_id(&self, model_name: &ModelName, id: &ModelId)
        -> Result<Option<AnyModel>>;

    /// Insert or replace a record.
    async fn save(&self, model: &AnyModel) -> Result<()>;

    /// Remove a record, returning it if it existed.
    async fn delete(&self, model_name: &ModelName, id: &ModelId) -> Result<Option<AnyModel>>;

    /// Last known server state of a record.
    async fn query_sync_metadata(
        &self,
        model_id: &ModelId,
        model_name: &ModelName,
    ) -> Result<Option<MutationSyncMetadata>>;

    /// Insert or replace the sync metadata of a record.
    async fn save_sync_metadata(&self, metadata: &MutationSyncMetadata) -> Result<()>;

    /// All stored sync metadata, ordered by model name and id.
    async fn all_sync_metadata(&self) -> Result<Vec<MutationSyncMetadata>>;

    /// Insert or replace a mutation event, keyed by its event id.
    ///
    /// Replacing keeps whatever `created_at` the caller supplies, so a merge
    /// that preserves the original timestamp also preserves the FIFO slot.
    async fn save_mutation_event(&self, event: &MutationEvent) -> Result<()>;

    /// Remove a mutation event. Returns whether it existed.
    async fn delete_mutation_event(&self, id: &str) -> Result<bool>;

    /// All mutation events in outbox order.
    ///
    /// # Postconditions
    /// - Ordered by `created_at`, ties broken by event id
    async fn mutation_events(&self) -> Result<Vec<MutationEvent>>;

    /// Mutation events of a single record in outbox order.
    async fn mutation_events_for(
        &self,
        model_name: &ModelName,
        model_id: &ModelId,
    ) -> Result<Vec<MutationEvent>> {
        let events = self.mutation_events().await?;
        Ok(events
            .into_iter()
            .filter(|e| &e.model_name == model_name && &e.model_id == model_id)
            .collect())
    }

    /// Insert or replace a dead letter, keyed by its event id.
    async fn save_dead_letter(&self, dead_letter: &DeadLetter) -> Result<()>;

    /// All dead letters ordered by failure time.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Remove a dead letter, returning it if it existed.
    async fn delete_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>>;
}

//! Collections shared by the bundled store implementations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use driftsync_common::{
    sort_models, AnyModel, DeadLetter, ModelId, ModelName, MutationEvent, MutationSyncMetadata,
    QueryPredicate, QuerySortDescriptor,
};

/// Complete contents of a store.
///
/// `FileStore` persists this structure as a single JSON document, so the
/// `inProcess` flag of each event survives a restart together with the rest
/// of the outbox.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoreState {
    #[serde(default)]
    records: BTreeMap<ModelName, BTreeMap<ModelId, AnyModel>>,
    #[serde(default)]
    sync_metadata: BTreeMap<String, MutationSyncMetadata>,
    #[serde(default)]
    mutation_events: BTreeMap<String, MutationEvent>,
    #[serde(default)]
    dead_letters: BTreeMap<String, DeadLetter>,
}

impl StoreState {
    pub(crate) fn query(
        &self,
        model_name: &ModelName,
        predicate: Option<&QueryPredicate>,
        sort: &[QuerySortDescriptor],
    ) -> Vec<AnyModel> {
        let Some(records) = self.records.get(model_name) else {
            return Vec::new();
        };

        // BTreeMap iteration yields id order, which the stable sort keeps
        // as the tie-breaker.
        let mut models: Vec<AnyModel> = records
            .values()
            .filter(|m| predicate.map_or(true, |p| p.evaluate(m)))
            .cloned()
            .collect();
        sort_models(&mut models, sort);
        models
    }

    pub(crate) fn get(&self, model_name: &ModelName, id: &ModelId) -> Option<AnyModel> {
        self.records.get(model_name)?.get(id).cloned()
    }

    pub(crate) fn save(&mut self, model: &AnyModel) {
        self.records
            .entry(model.model_name().clone())
            .or_default()
            .insert(model.id().clone(), model.clone());
    }

    pub(crate) fn delete(&mut self, model_name: &ModelName, id: &ModelId) -> Option<AnyModel> {
        let records = self.records.get_mut(model_name)?;
        let removed = records.remove(id);
        if records.is_empty() {
            self.records.remove(model_name);
        }
        removed
    }

    pub(crate) fn sync_metadata(
        &self,
        model_id: &ModelId,
        model_name: &ModelName,
    ) -> Option<MutationSyncMetadata> {
        self.sync_metadata
            .get(&MutationSyncMetadata::key(model_name, model_id))
            .cloned()
    }

    pub(crate) fn save_sync_metadata(&mut self, metadata: &MutationSyncMetadata) {
        self.sync_metadata.insert(
            MutationSyncMetadata::key(&metadata.model_name, &metadata.model_id),
            metadata.clone(),
        );
    }

    pub(crate) fn all_sync_metadata(&self) -> Vec<MutationSyncMetadata> {
        self.sync_metadata.values().cloned().collect()
    }

    pub(crate) fn save_mutation_event(&mut self, event: &MutationEvent) {
        self.mutation_events.insert(event.id.clone(), event.clone());
    }

    pub(crate) fn delete_mutation_event(&mut self, id: &str) -> bool {
        self.mutation_events.remove(id).is_some()
    }

    pub(crate) fn mutation_events(&self) -> Vec<MutationEvent> {
        let mut events: Vec<MutationEvent> = self.mutation_events.values().cloned().collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        events
    }

    pub(crate) fn save_dead_letter(&mut self, dead_letter: &DeadLetter) {
        self.dead_letters
            .insert(dead_letter.id().to_string(), dead_letter.clone());
    }

    pub(crate) fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut letters: Vec<DeadLetter> = self.dead_letters.values().cloned().collect();
        letters.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then_with(|| a.id().cmp(b.id())));
        letters
    }

    pub(crate) fn delete_dead_letter(&mut self, id: &str) -> Option<DeadLetter> {
        self.dead_letters.remove(id)
    }
}

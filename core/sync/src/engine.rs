//! Application-facing sync engine.
//!
//! [`SyncEngine`] wires the local store, the outbox, the outgoing queue and
//! live queries together. Local writes go to the store first and are then
//! submitted to the outbox; the outgoing queue pushes them to the backend
//! once [`SyncEngine::start_syncing_to_cloud`] is called.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use driftsync_common::{
    AnyModel, Error, ModelId, ModelName, MutationEvent, MutationType, QueryPredicate,
    QuerySortDescriptor, Result,
};
use driftsync_storage::{LocalStore, ModelRegistry};

use crate::config::SyncConfig;
use crate::conflict::ConflictHandler;
use crate::events::{ChangeStream, Hub};
use crate::observe::{ObserveQuery, ObserveQuerySubscription};
use crate::outbox::MutationOutbox;
use crate::outgoing::{OutgoingMutationQueue, QueueState};
use crate::reconcile::LocalReconciliationQueue;
use crate::transport::RemoteTransport;

/// Main entry point for local writes, queries and cloud sync.
pub struct SyncEngine {
    store: Arc<dyn LocalStore>,
    registry: Arc<ModelRegistry>,
    config: SyncConfig,
    hub: Arc<Hub>,
    changes: ChangeStream,
    outbox: Arc<MutationOutbox>,
    reconciliation: Arc<LocalReconciliationQueue>,
    queue: OutgoingMutationQueue,
    /// Serializes local writes with their outbox submission.
    writes: Mutex<()>,
}

impl SyncEngine {
    /// Create an engine resolving conflicts with `config.conflict_strategy`.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    /// - `Error::Configuration` if the configuration is invalid
    pub fn new(
        store: Arc<dyn LocalStore>,
        registry: ModelRegistry,
        config: SyncConfig,
    ) -> Result<Self> {
        let handler = Arc::new(config.conflict_strategy);
        Self::with_conflict_handler(store, registry, config, handler)
    }

    /// Create an engine with a custom conflict handler.
    pub fn with_conflict_handler(
        store: Arc<dyn LocalStore>,
        registry: ModelRegistry,
        config: SyncConfig,
        conflict_handler: Arc<dyn ConflictHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let hub = Arc::new(Hub::new(config.hub_capacity));
        let changes = ChangeStream::new(config.change_stream_capacity);
        let outbox = Arc::new(MutationOutbox::new(store.clone(), hub.clone()));
        let reconciliation = Arc::new(LocalReconciliationQueue::new(
            store.clone(),
            changes.clone(),
            hub.clone(),
        ));
        let queue = OutgoingMutationQueue::new(
            outbox.clone(),
            hub.clone(),
            config.outbox.clone(),
            conflict_handler,
        );

        info!("Sync engine created on store '{}'", store.name());

        Ok(Self {
            store,
            registry: Arc::new(registry),
            config,
            hub,
            changes,
            outbox,
            reconciliation,
            queue,
            writes: Mutex::new(()),
        })
    }

    /// Save a model locally and queue it for the backend.
    ///
    /// Creates the record if it does not exist locally, updates it otherwise.
    ///
    /// # Preconditions
    /// - A `condition` requires the record to exist
    ///
    /// # Postconditions
    /// - The model is in the local store and the change is published
    /// - The outbox holds the net effect of all pending writes to the record
    ///
    /// # Errors
    /// - Decode errors if the model violates its schema
    /// - `Error::Conflict` if the existing record does not satisfy `condition`
    /// - `Error::Disposition` if the outbox refuses the change; the local
    ///   record is restored
    pub async fn save(
        &self,
        model: AnyModel,
        condition: Option<QueryPredicate>,
    ) -> Result<MutationEvent> {
        self.registry.validate(&model)?;
        let _guard = self.writes.lock().await;

        let existing = self.store.query_by_id(model.model_name(), model.id()).await?;
        check_condition(existing.as_ref(), condition.as_ref(), model.model_name(), model.id())?;

        let mutation_type = if existing.is_some() {
            MutationType::Update
        } else {
            MutationType::Create
        };
        let event = MutationEvent::new(&model, mutation_type, condition.as_ref())?;

        self.store.save(&model).await?;
        if let Err(e) = self.outbox.submit(event.clone()).await {
            warn!("Restoring {} {} after rejected save", model.model_name(), model.id());
            match existing {
                Some(previous) => self.store.save(&previous).await?,
                None => {
                    self.store.delete(model.model_name(), model.id()).await?;
                }
            }
            return Err(e);
        }

        debug!("Saved {} {} ({})", model.model_name(), model.id(), mutation_type);
        self.changes.publish(event.clone());
        Ok(event)
    }

    /// Delete a record locally and queue the deletion for the backend.
    ///
    /// Returns `None` when the record does not exist locally.
    ///
    /// # Errors
    /// - `Error::Conflict` if the record does not satisfy `condition`
    /// - `Error::Disposition` if the outbox refuses the change; the local
    ///   record is restored
    pub async fn delete(
        &self,
        model_name: &ModelName,
        id: &ModelId,
        condition: Option<QueryPredicate>,
    ) -> Result<Option<MutationEvent>> {
        let _guard = self.writes.lock().await;

        let Some(existing) = self.store.query_by_id(model_name, id).await? else {
            debug!("Nothing to delete for {} {}", model_name, id);
            return Ok(None);
        };
        check_condition(Some(&existing), condition.as_ref(), model_name, id)?;

        let event = MutationEvent::new(&existing, MutationType::Delete, condition.as_ref())?;

        self.store.delete(model_name, id).await?;
        if let Err(e) = self.outbox.submit(event.clone()).await {
            warn!("Restoring {} {} after rejected delete", model_name, id);
            self.store.save(&existing).await?;
            return Err(e);
        }

        debug!("Deleted {} {}", model_name, id);
        self.changes.publish(event.clone());
        Ok(Some(event))
    }

    /// Query the local store.
    pub async fn query(
        &self,
        model_name: &ModelName,
        predicate: Option<&QueryPredicate>,
        sort: &[QuerySortDescriptor],
    ) -> Result<Vec<AnyModel>> {
        self.store.query(model_name, predicate, sort).await
    }

    /// Start a live query.
    pub fn observe_query(
        &self,
        model_name: ModelName,
        predicate: Option<QueryPredicate>,
        sort: Vec<QuerySortDescriptor>,
    ) -> ObserveQuerySubscription {
        ObserveQuery::new(
            model_name,
            predicate,
            sort,
            self.store.clone(),
            self.registry.clone(),
            self.hub.clone(),
            self.changes.clone(),
            self.config.observe_query.clone(),
        )
        .subscribe()
    }

    /// Start pushing the outbox to the backend through `transport`.
    pub async fn start_syncing_to_cloud(&self, transport: Arc<dyn RemoteTransport>) -> Result<()> {
        info!("Starting cloud sync via '{}'", transport.name());
        self.queue
            .start(transport, self.changes.clone(), self.reconciliation.clone())
            .await
    }

    /// Stop pushing the outbox. Pending events stay queued.
    pub async fn stop_syncing_to_cloud(&self) -> Result<()> {
        info!("Stopping cloud sync");
        self.queue.stop().await
    }

    pub fn queue_state(&self) -> QueueState {
        self.queue.state()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn changes(&self) -> &ChangeStream {
        &self.changes
    }

    pub fn outbox(&self) -> &Arc<MutationOutbox> {
        &self.outbox
    }

    /// Entry point for changes received from the backend.
    pub fn reconciliation_queue(&self) -> &Arc<LocalReconciliationQueue> {
        &self.reconciliation
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

fn check_condition(
    existing: Option<&AnyModel>,
    condition: Option<&QueryPredicate>,
    model_name: &ModelName,
    id: &ModelId,
) -> Result<()> {
    let Some(condition) = condition else {
        return Ok(());
    };
    match existing {
        Some(model) if condition.evaluate(model) => Ok(()),
        Some(_) => Err(Error::Conflict(format!(
            "{} {} does not satisfy the write condition",
            model_name, id
        ))),
        None => Err(Error::InvalidInput(format!(
            "conditional write on missing {} {}",
            model_name, id
        ))),
    }
}

//! Scripted collaborators shared by the unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

use driftsync_common::{
    AnyModel, DeadLetter, Error, ModelId, ModelName, MutationEvent, MutationSync,
    MutationSyncMetadata, MutationType, QueryPredicate, QuerySortDescriptor, Result,
};
use driftsync_storage::{LocalStore, MemoryStore};

use crate::transport::{RemoteTransport, TransportError};

/// Build the backend's acknowledgement of `event`.
pub(crate) fn acknowledge(event: &MutationEvent) -> MutationSync {
    let model = event.decode_model().expect("event payload decodes");
    MutationSync {
        sync_metadata: MutationSyncMetadata {
            model_id: event.model_id.clone(),
            model_name: event.model_name.clone(),
            version: event.version.unwrap_or(0) + 1,
            deleted: event.mutation_type == MutationType::Delete,
            last_changed_at: chrono::Utc::now().timestamp_millis(),
        },
        model,
    }
}

/// Transport answering from a script, acknowledging everything else.
pub(crate) struct ScriptedTransport {
    responses: Mutex<VecDeque<std::result::Result<MutationSync, TransportError>>>,
    calls: Mutex<Vec<MutationEvent>>,
    call_count: watch::Sender<usize>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        let (call_count, _) = watch::channel(0);
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            call_count,
            gate: None,
        }
    }

    /// A transport that holds every response until a permit is added to the
    /// returned semaphore.
    pub(crate) fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut transport = Self::new();
        transport.gate = Some(gate.clone());
        (transport, gate)
    }

    pub(crate) fn push_response(&self, response: std::result::Result<MutationSync, TransportError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub(crate) fn calls(&self) -> Vec<MutationEvent> {
        self.calls.lock().unwrap().clone()
    }

    /// Wait until at least `count` mutate calls started.
    pub(crate) async fn wait_for_calls(&self, count: usize) {
        let mut calls = self.call_count.subscribe();
        tokio::time::timeout(Duration::from_secs(5), calls.wait_for(|n| *n >= count))
            .await
            .expect("timed out waiting for transport calls")
            .expect("call counter closed");
    }
}

#[async_trait]
impl RemoteTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn mutate(
        &self,
        event: &MutationEvent,
    ) -> std::result::Result<MutationSync, TransportError> {
        self.calls.lock().unwrap().push(event.clone());
        self.call_count.send_modify(|n| *n += 1);

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        let scripted = self.responses.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(acknowledge(event)))
    }
}

/// Memory store with switchable failures.
#[derive(Default)]
pub(crate) struct FailingStore {
    inner: MemoryStore,
    pub(crate) fail_queries: AtomicBool,
    pub(crate) fail_event_deletes: AtomicBool,
}

impl FailingStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn check(flag: &AtomicBool, operation: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("injected {} failure", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for FailingStore {
    fn name(&self) -> &str {
        "failing"
    }

    async fn query(
        &self,
        model_name: &ModelName,
        predicate: Option<&QueryPredicate>,
        sort: &[QuerySortDescriptor],
    ) -> Result<Vec<AnyModel>> {
        Self::check(&self.fail_queries, "query")?;
        self.inner.query(model_name, predicate, sort).await
    }

    async fn query_by_id(
        &self,
        model_name: &ModelName,
        id: &ModelId,
    ) -> Result<Option<AnyModel>> {
        self.inner.query_by_id(model_name, id).await
    }

    async fn save(&self, model: &AnyModel) -> Result<()> {
        self.inner.save(model).await
    }

    async fn delete(&self, model_name: &ModelName, id: &ModelId) -> Result<Option<AnyModel>> {
        self.inner.delete(model_name, id).await
    }

    async fn query_sync_metadata(
        &self,
        model_id: &ModelId,
        model_name: &ModelName,
    ) -> Result<Option<MutationSyncMetadata>> {
        self.inner.query_sync_metadata(model_id, model_name).await
    }

    async fn save_sync_metadata(&self, metadata: &MutationSyncMetadata) -> Result<()> {
        self.inner.save_sync_metadata(metadata).await
    }

    async fn all_sync_metadata(&self) -> Result<Vec<MutationSyncMetadata>> {
        self.inner.all_sync_metadata().await
    }

    async fn save_mutation_event(&self, event: &MutationEvent) -> Result<()> {
        self.inner.save_mutation_event(event).await
    }

    async fn delete_mutation_event(&self, id: &str) -> Result<bool> {
        Self::check(&self.fail_event_deletes, "mutation event delete")?;
        self.inner.delete_mutation_event(id).await
    }

    async fn mutation_events(&self) -> Result<Vec<MutationEvent>> {
        self.inner.mutation_events().await
    }

    async fn save_dead_letter(&self, dead_letter: &DeadLetter) -> Result<()> {
        self.inner.save_dead_letter(dead_letter).await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.inner.dead_letters().await
    }

    async fn delete_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>> {
        self.inner.delete_dead_letter(id).await
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub(crate) async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within five seconds"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

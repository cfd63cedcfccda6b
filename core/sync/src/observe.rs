//! Live query snapshots.
//!
//! An [`ObserveQuery`] runs the query once, then folds every matching change
//! from the [`ChangeStream`] into its result set and publishes a new
//! [`QuerySnapshot`] after each fold. Until the model type finished its
//! initial sync, changes are folded in batches bounded by count and time.

use futures::Stream;
use std::cmp::Ordering;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use driftsync_common::{
    compare_models, AnyModel, ModelId, ModelName, MutationEvent, MutationType, QueryPredicate,
    QuerySortDescriptor, Result,
};
use driftsync_storage::{LocalStore, ModelRegistry};

use crate::config::ObserveQueryConfig;
use crate::events::{ChangeStream, Hub, HubEvent};

/// Immutable view of a live query.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    /// Matching records in query order.
    pub items: Vec<AnyModel>,
    /// Whether the model type finished its initial sync.
    pub is_synced: bool,
    /// Changes folded since the previous snapshot, one per record.
    pub items_changed: Vec<MutationEvent>,
}

enum Control {
    Start,
    Reset,
    Cancel,
}

/// A live query waiting to be subscribed.
pub struct ObserveQuery {
    model_name: ModelName,
    predicate: Option<QueryPredicate>,
    sort: Vec<QuerySortDescriptor>,
    store: Arc<dyn LocalStore>,
    registry: Arc<ModelRegistry>,
    hub: Arc<Hub>,
    changes: ChangeStream,
    config: ObserveQueryConfig,
}

impl ObserveQuery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model_name: ModelName,
        predicate: Option<QueryPredicate>,
        sort: Vec<QuerySortDescriptor>,
        store: Arc<dyn LocalStore>,
        registry: Arc<ModelRegistry>,
        hub: Arc<Hub>,
        changes: ChangeStream,
        config: ObserveQueryConfig,
    ) -> Self {
        Self {
            model_name,
            predicate,
            sort,
            store,
            registry,
            hub,
            changes,
            config,
        }
    }

    /// Start the query task and return its snapshot stream.
    ///
    /// Must be called within a tokio runtime.
    pub fn subscribe(self) -> ObserveQuerySubscription {
        let (snapshot_tx, snapshots) = mpsc::channel(self.config.snapshot_buffer.max(1));
        let (control, control_rx) = mpsc::unbounded_channel();

        let task = ObserveTask {
            query: self,
            control: control_rx,
            snapshots: snapshot_tx,
        };
        tokio::spawn(task.run());

        ObserveQuerySubscription { snapshots, control }
    }
}

/// Stream of snapshots of one live query.
///
/// The first item is the initial result set. An initial query failure is
/// delivered as an `Err` item and ends the stream. Dropping the subscription
/// cancels the query.
pub struct ObserveQuerySubscription {
    snapshots: mpsc::Receiver<Result<QuerySnapshot>>,
    control: mpsc::UnboundedSender<Control>,
}

impl ObserveQuerySubscription {
    /// Drop the current result set and change subscriptions.
    ///
    /// The stream stays open; [`start`](Self::start) runs the query again.
    pub fn reset(&self) {
        let _ = self.control.send(Control::Reset);
    }

    /// Restart a query after [`reset`](Self::reset). No-op while running.
    pub fn start(&self) {
        let _ = self.control.send(Control::Start);
    }

    /// Stop the query and end the stream.
    pub fn cancel(&self) {
        let _ = self.control.send(Control::Cancel);
    }
}

impl Stream for ObserveQuerySubscription {
    type Item = Result<QuerySnapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.snapshots.poll_recv(cx)
    }
}

impl Drop for ObserveQuerySubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

enum SessionEnd {
    Reset,
    Finished,
}

struct ObserveTask {
    query: ObserveQuery,
    control: mpsc::UnboundedReceiver<Control>,
    snapshots: mpsc::Sender<Result<QuerySnapshot>>,
}

impl ObserveTask {
    async fn run(mut self) {
        loop {
            match self.run_session().await {
                SessionEnd::Reset => {
                    debug!("Observe query on {} reset", self.query.model_name);
                    if !self.wait_for_start().await {
                        break;
                    }
                }
                SessionEnd::Finished => break,
            }
        }
        debug!("Observe query on {} finished", self.query.model_name);
    }

    async fn wait_for_start(&mut self) -> bool {
        loop {
            match self.control.recv().await {
                Some(Control::Start) => return true,
                Some(Control::Reset) => continue,
                Some(Control::Cancel) | None => return false,
            }
        }
    }

    async fn run_session(&mut self) -> SessionEnd {
        // Subscribe before the initial query so no change falls in between.
        let mut changes = self.query.changes.subscribe();
        let mut hub = self.query.hub.subscribe();
        let mut hub_open = true;

        let mut view = QueryView {
            model_name: self.query.model_name.clone(),
            predicate: self.query.predicate.clone(),
            sort: self.query.sort.clone(),
            items: Vec::new(),
            is_synced: self.query.hub.is_model_synced(&self.query.model_name),
        };

        match self.baseline().await {
            Ok(items) => view.items = items,
            Err(err) => {
                warn!("Initial query on {} failed: {}", self.query.model_name, err);
                let _ = self.snapshots.send(Err(err)).await;
                return SessionEnd::Finished;
            }
        }
        if !self.publish(view.snapshot(Vec::new())).await {
            return SessionEnd::Finished;
        }

        let mut batch: Vec<MutationEvent> = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let mut synced_now = false;

            tokio::select! {
                biased;

                control = self.control.recv() => match control {
                    Some(Control::Start) => {}
                    Some(Control::Reset) => return SessionEnd::Reset,
                    Some(Control::Cancel) | None => return SessionEnd::Finished,
                },

                received = hub.recv(), if hub_open => match received {
                    Ok(HubEvent::ModelSynced(name)) if name == self.query.model_name => {
                        synced_now = true;
                    }
                    Ok(HubEvent::Ready) => synced_now = true,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        synced_now = self.query.hub.is_model_synced(&self.query.model_name);
                    }
                    Err(RecvError::Closed) => hub_open = false,
                },

                received = changes.recv() => match received {
                    Ok(event) => {
                        if event.model_name != self.query.model_name {
                            continue;
                        }
                        if view.is_synced {
                            let changed = view.fold(&self.query.registry, vec![event]);
                            if !changed.is_empty() && !self.publish(view.snapshot(changed)).await {
                                return SessionEnd::Finished;
                            }
                        } else {
                            batch.push(event);
                            deadline.get_or_insert_with(|| {
                                Instant::now() + self.query.config.batch_window
                            });
                            if batch.len() >= self.query.config.max_batch_size
                                && !self.flush(&mut view, &mut batch, &mut deadline).await
                            {
                                return SessionEnd::Finished;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "Observe query on {} missed {} changes, re-running query",
                            self.query.model_name, skipped
                        );
                        batch.clear();
                        deadline = None;
                        match self.baseline().await {
                            Ok(items) => view.items = items,
                            Err(err) => {
                                let _ = self.snapshots.send(Err(err)).await;
                                return SessionEnd::Finished;
                            }
                        }
                        if !self.publish(view.snapshot(Vec::new())).await {
                            return SessionEnd::Finished;
                        }
                    }
                    Err(RecvError::Closed) => {
                        self.flush(&mut view, &mut batch, &mut deadline).await;
                        return SessionEnd::Finished;
                    }
                },

                _ = sleep_until_deadline(deadline) => {
                    if !self.flush(&mut view, &mut batch, &mut deadline).await {
                        return SessionEnd::Finished;
                    }
                }
            }

            if synced_now && !view.is_synced {
                debug!("Model {} synced, publishing immediately", self.query.model_name);
                view.is_synced = true;
                let changed = view.fold(&self.query.registry, std::mem::take(&mut batch));
                deadline = None;
                if !self.publish(view.snapshot(changed)).await {
                    return SessionEnd::Finished;
                }
            }
        }
    }

    async fn baseline(&self) -> Result<Vec<AnyModel>> {
        self.query
            .store
            .query(
                &self.query.model_name,
                self.query.predicate.as_ref(),
                &self.query.sort,
            )
            .await
    }

    /// Fold the pending batch. Returns false once the subscriber is gone.
    async fn flush(
        &self,
        view: &mut QueryView,
        batch: &mut Vec<MutationEvent>,
        deadline: &mut Option<Instant>,
    ) -> bool {
        *deadline = None;
        if batch.is_empty() {
            return true;
        }
        let changed = view.fold(&self.query.registry, std::mem::take(batch));
        if changed.is_empty() {
            return true;
        }
        self.publish(view.snapshot(changed)).await
    }

    async fn publish(&self, snapshot: QuerySnapshot) -> bool {
        self.snapshots.send(Ok(snapshot)).await.is_ok()
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Current result set of a live query.
struct QueryView {
    model_name: ModelName,
    predicate: Option<QueryPredicate>,
    sort: Vec<QuerySortDescriptor>,
    items: Vec<AnyModel>,
    is_synced: bool,
}

impl QueryView {
    fn snapshot(&self, items_changed: Vec<MutationEvent>) -> QuerySnapshot {
        QuerySnapshot {
            items: self.items.clone(),
            is_synced: self.is_synced,
            items_changed,
        }
    }

    /// Fold events in arrival order and return the ones that changed the
    /// result set, keeping the latest per record.
    fn fold(&mut self, registry: &ModelRegistry, events: Vec<MutationEvent>) -> Vec<MutationEvent> {
        let mut changed: Vec<MutationEvent> = Vec::new();

        for event in events {
            if event.model_name != self.model_name {
                continue;
            }
            let model = match registry.decode(&event) {
                Ok(model) => model,
                Err(err) => {
                    warn!("Skipping undecodable change {}: {}", event.id, err);
                    continue;
                }
            };

            let applied = match event.mutation_type {
                MutationType::Delete => self.remove(model.id()),
                MutationType::Create | MutationType::Update => {
                    if self.predicate.as_ref().map_or(true, |p| p.evaluate(&model)) {
                        self.upsert(model)
                    } else {
                        // The record left the query.
                        self.remove(model.id())
                    }
                }
            };

            if applied {
                changed.retain(|e| e.model_id != event.model_id);
                changed.push(event);
            }
        }
        changed
    }

    fn position(&self, id: &ModelId) -> Option<usize> {
        self.items.iter().position(|m| m.id() == id)
    }

    fn remove(&mut self, id: &ModelId) -> bool {
        match self.position(id) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    fn upsert(&mut self, model: AnyModel) -> bool {
        if let Some(index) = self.position(model.id()) {
            if self.items[index] == model {
                return false;
            }
            self.items.remove(index);
        }

        let sort = &self.sort;
        let index = self
            .items
            .partition_point(|m| order(m, &model, sort) != Ordering::Greater);
        self.items.insert(index, model);
        true
    }
}

fn order(a: &AnyModel, b: &AnyModel, sort: &[QuerySortDescriptor]) -> Ordering {
    compare_models(a, b, sort).then_with(|| a.id().cmp(b.id()))
}

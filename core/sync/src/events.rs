//! Operational hub and the unified model change stream.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use driftsync_common::{MutationEvent, MutationSync, ModelName};

/// Operational event published on the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// Outbox emptiness after the queue started or finished an event.
    OutboxStatus { is_empty: bool },
    /// An event was handed to the transport.
    OutboxMutationEnqueued(MutationEvent),
    /// The backend acknowledged an event.
    OutboxMutationProcessed {
        event: MutationEvent,
        remote: MutationSync,
    },
    /// An event failed terminally and left the outbox.
    MutationFailed { event: MutationEvent, error: String },
    /// The outgoing queue entered its error state.
    QueueErrored { error: String },
    /// A local mutation was refused by the disposition rules.
    SubmissionRejected { event: MutationEvent, error: String },
    /// The backend refused a conditional write.
    ConditionalSaveFailed(MutationEvent),
    /// A remote change was applied to the local store.
    SyncReceived(MutationEvent),
    /// The initial sync of a model type completed.
    ModelSynced(ModelName),
    /// Every model type finished its initial sync.
    Ready,
}

#[derive(Debug, Default)]
struct SyncStatus {
    ready: bool,
    synced_models: HashSet<ModelName>,
}

/// Broadcast channel of operational events.
///
/// The hub also remembers which model types have completed their initial
/// sync so late subscribers can read the current status.
#[derive(Debug)]
pub struct Hub {
    sender: broadcast::Sender<HubEvent>,
    status: RwLock<SyncStatus>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            status: RwLock::new(SyncStatus::default()),
        }
    }

    /// Publish an event. Events sent with no subscriber are dropped.
    pub fn dispatch(&self, event: HubEvent) {
        match &event {
            HubEvent::ModelSynced(name) => {
                self.status
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .synced_models
                    .insert(name.clone());
            }
            HubEvent::Ready => {
                self.status
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .ready = true;
            }
            _ => {}
        }

        if self.sender.send(event).is_err() {
            debug!("Hub event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    /// Whether `model_name` finished its initial sync.
    pub fn is_model_synced(&self, model_name: &ModelName) -> bool {
        let status = self.status.read().unwrap_or_else(PoisonError::into_inner);
        status.ready || status.synced_models.contains(model_name)
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ready
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Stream of local and remote model changes consumed by live queries.
#[derive(Debug, Clone)]
pub struct ChangeStream {
    sender: broadcast::Sender<MutationEvent>,
}

impl ChangeStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: MutationEvent) {
        // No live query is listening; nothing to fold into.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
        self.sender.subscribe()
    }
}

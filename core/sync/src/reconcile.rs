//! Application of remote-originated changes to the local store.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use driftsync_common::{MutationEvent, MutationSync, Result};
use driftsync_storage::LocalStore;

use crate::events::{ChangeStream, Hub, HubEvent};

/// What happened to an offered remote change.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The change was written locally and published as this event.
    Applied(MutationEvent),
    /// Local mutations for the record are still queued; they win.
    Skipped,
}

/// Receives remote changes and feeds them into the local store and the
/// change stream.
#[async_trait]
pub trait ReconciliationQueue: Send + Sync {
    async fn offer(&self, remote: MutationSync) -> Result<ReconcileOutcome>;
}

/// Reconciliation queue writing straight to a local store.
pub struct LocalReconciliationQueue {
    store: Arc<dyn LocalStore>,
    changes: ChangeStream,
    hub: Arc<Hub>,
}

impl LocalReconciliationQueue {
    pub fn new(store: Arc<dyn LocalStore>, changes: ChangeStream, hub: Arc<Hub>) -> Self {
        Self {
            store,
            changes,
            hub,
        }
    }
}

#[async_trait]
impl ReconciliationQueue for LocalReconciliationQueue {
    async fn offer(&self, remote: MutationSync) -> Result<ReconcileOutcome> {
        let pending = self
            .store
            .mutation_events_for(remote.model.model_name(), remote.model.id())
            .await?;
        if !pending.is_empty() {
            debug!(
                "Skipping remote {} {}: {} local mutations pending",
                remote.model.model_name(),
                remote.model.id(),
                pending.len()
            );
            return Ok(ReconcileOutcome::Skipped);
        }

        let event = apply_remote(self.store.as_ref(), &self.changes, &self.hub, &remote).await?;
        Ok(ReconcileOutcome::Applied(event))
    }
}

/// Write a remote record and its metadata locally, then announce it.
///
/// # Postconditions
/// - The record is saved, or removed when the remote is deleted
/// - The sync metadata is saved
/// - The change is published and `SyncReceived` dispatched
pub(crate) async fn apply_remote(
    store: &dyn LocalStore,
    changes: &ChangeStream,
    hub: &Hub,
    remote: &MutationSync,
) -> Result<MutationEvent> {
    if remote.sync_metadata.deleted {
        store
            .delete(remote.model.model_name(), remote.model.id())
            .await?;
    } else {
        store.save(&remote.model).await?;
    }
    store.save_sync_metadata(&remote.sync_metadata).await?;

    let event = remote.to_mutation_event()?;
    changes.publish(event.clone());
    hub.dispatch(HubEvent::SyncReceived(event.clone()));
    Ok(event)
}

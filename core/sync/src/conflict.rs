//! Handling of conflicts the backend could not resolve.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use driftsync_common::{AnyModel, Error, MutationEvent, MutationSync, MutationType, Result};

/// Local and remote state of a conflicting update.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictData {
    /// The model the client tried to write.
    pub local: AnyModel,
    /// The model as currently stored by the backend.
    pub remote: AnyModel,
}

/// Decision for a conflicting update.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    /// Discard the local change and take the remote record.
    ApplyRemote,
    /// Send the local model again on top of the remote version.
    RetryLocal,
    /// Send this model instead, on top of the remote version.
    Retry(AnyModel),
}

/// Decides conflicting updates.
#[async_trait]
pub trait ConflictHandler: Send + Sync {
    async fn resolve(&self, conflict: ConflictData) -> ConflictResolution;
}

/// Fixed conflict strategy, selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStrategy {
    /// Remote wins.
    #[default]
    ApplyRemote,
    /// Local wins.
    RetryLocal,
}

#[async_trait]
impl ConflictHandler for ConflictStrategy {
    async fn resolve(&self, _conflict: ConflictData) -> ConflictResolution {
        match self {
            ConflictStrategy::ApplyRemote => ConflictResolution::ApplyRemote,
            ConflictStrategy::RetryLocal => ConflictResolution::RetryLocal,
        }
    }
}

/// Next step for an event rejected with an unhandled conflict.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConflictOutcome {
    /// Local and remote already agree; drop the event.
    Skip,
    /// Overwrite the local record with the remote one and drop the event.
    ApplyRemote,
    /// Send this event in place of the rejected one.
    Resend(MutationEvent),
}

/// Decide how to reconcile `event` with the conflicting `remote` record.
///
/// # Errors
/// - `Error::Conflict` for a create, which the backend never reports as a
///   conflict
/// - Decode errors if the event payload is unreadable
pub(crate) async fn resolve_conflict_unhandled(
    event: &MutationEvent,
    remote: &MutationSync,
    handler: &dyn ConflictHandler,
) -> Result<ConflictOutcome> {
    match event.mutation_type {
        MutationType::Create => Err(Error::Conflict(format!(
            "unexpected unhandled conflict for create of {} {}",
            event.model_name, event.model_id
        ))),
        MutationType::Delete => {
            if remote.sync_metadata.deleted {
                debug!("Deleted both locally and remotely: {}", event.model_id);
                Ok(ConflictOutcome::Skip)
            } else {
                // The local delete loses; bring the remote record back.
                Ok(ConflictOutcome::ApplyRemote)
            }
        }
        MutationType::Update => {
            if remote.sync_metadata.deleted {
                return Ok(ConflictOutcome::ApplyRemote);
            }

            let local = event.decode_model()?;
            let conflict = ConflictData {
                local: local.clone(),
                remote: remote.model.clone(),
            };
            let model = match handler.resolve(conflict).await {
                ConflictResolution::ApplyRemote => return Ok(ConflictOutcome::ApplyRemote),
                ConflictResolution::RetryLocal => local,
                ConflictResolution::Retry(model) => model,
            };

            if model.id() != &event.model_id || model.model_name() != &event.model_name {
                return Err(Error::Conflict(format!(
                    "conflict handler returned {} {} for {} {}",
                    model.model_name(),
                    model.id(),
                    event.model_name,
                    event.model_id
                )));
            }

            let mut resend = event.clone();
            resend.json = model.to_json()?;
            resend.version = Some(remote.sync_metadata.version);
            Ok(ConflictOutcome::Resend(resend))
        }
    }
}

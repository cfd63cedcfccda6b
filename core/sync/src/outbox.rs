//! Durable outbox of local mutations.
//!
//! The outbox owns the mutation event collection of the local store. New
//! events go through [`MutationOutbox::submit`], which applies the
//! disposition rules; the outgoing queue pulls events through a
//! [`MutationEventSubscription`].

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use driftsync_common::{monotonic_timestamp, DeadLetter, Error, MutationEvent, Result};
use driftsync_storage::LocalStore;

use crate::disposition::{disposition, merge, Disposition};
use crate::events::{Hub, HubEvent};

/// What `submit` did with a candidate event.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The candidate was appended to the outbox.
    Enqueued(MutationEvent),
    /// The candidate was folded into a queued event, returned here.
    Merged(MutationEvent),
    /// The candidate cancelled out a queued create; nothing is queued for the
    /// record anymore.
    Discarded,
}

/// Durable FIFO of not-yet-acknowledged mutations.
pub struct MutationOutbox {
    store: Arc<dyn LocalStore>,
    hub: Arc<Hub>,
    /// Serializes every read-modify-write of the event collection.
    ingest: Mutex<()>,
    wake: watch::Sender<u64>,
}

impl MutationOutbox {
    pub fn new(store: Arc<dyn LocalStore>, hub: Arc<Hub>) -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            store,
            hub,
            ingest: Mutex::new(()),
            wake,
        }
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Add a local mutation to the outbox.
    ///
    /// # Preconditions
    /// - The record change described by `candidate` is already in the local
    ///   store
    ///
    /// # Postconditions
    /// - `candidate.version` is stamped from the record's sync metadata
    /// - The record has at most one queued, not-in-process event unless a
    ///   conditional event is involved
    ///
    /// # Errors
    /// - Storage errors
    /// - `Error::Disposition` if the candidate conflicts with queued events;
    ///   the queued events are left untouched
    pub async fn submit(&self, mut candidate: MutationEvent) -> Result<SubmitOutcome> {
        let _guard = self.ingest.lock().await;

        if let Some(metadata) = self
            .store
            .query_sync_metadata(&candidate.model_id, &candidate.model_name)
            .await?
        {
            candidate.version = Some(metadata.version);
        }

        let existing: Vec<MutationEvent> = self
            .store
            .mutation_events_for(&candidate.model_name, &candidate.model_id)
            .await?
            .into_iter()
            .filter(|e| !e.in_process)
            .collect();

        let outcome = match disposition(&candidate, &existing) {
            Disposition::SaveCandidate => {
                candidate.in_process = false;
                self.store.save_mutation_event(&candidate).await?;
                SubmitOutcome::Enqueued(candidate)
            }
            Disposition::ReplaceLocalWithCandidate => {
                let (first, redundant) = existing.split_first().ok_or_else(|| {
                    Error::Storage("queued event disappeared during submit".to_string())
                })?;
                let merged = merge(first, &candidate);
                self.store.save_mutation_event(&merged).await?;
                for event in redundant {
                    self.store.delete_mutation_event(&event.id).await?;
                }
                SubmitOutcome::Merged(merged)
            }
            Disposition::DropCandidateAndDeleteLocal => {
                for event in &existing {
                    self.store.delete_mutation_event(&event.id).await?;
                }
                self.store
                    .delete(&candidate.model_name, &candidate.model_id)
                    .await?;
                SubmitOutcome::Discarded
            }
            Disposition::DropCandidateWithError(reason) => {
                warn!("Rejected {} of {}: {}", candidate.mutation_type, candidate.model_id, reason);
                self.hub.dispatch(HubEvent::SubmissionRejected {
                    event: candidate,
                    error: reason.clone(),
                });
                return Err(Error::Disposition(reason));
            }
        };

        debug!("Submitted mutation: {:?}", outcome);
        self.notify();
        Ok(outcome)
    }

    /// Subscribe to the outbox as its single consumer.
    pub fn subscribe(self: &Arc<Self>) -> MutationEventSubscription {
        MutationEventSubscription {
            outbox: Arc::clone(self),
            wake: self.wake.subscribe(),
        }
    }

    /// Return the oldest event, marking it in process.
    ///
    /// An event already in process is returned unchanged, so an interrupted
    /// dispatch resumes with the same event.
    async fn take_next(&self) -> Result<Option<MutationEvent>> {
        let _guard = self.ingest.lock().await;

        let Some(mut event) = self.store.mutation_events().await?.into_iter().next() else {
            return Ok(None);
        };
        if !event.in_process {
            event.in_process = true;
            self.store.save_mutation_event(&event).await?;
        }
        Ok(Some(event))
    }

    /// Persist a changed in-process event (e.g. a refreshed version).
    pub(crate) async fn update_in_process(&self, event: &MutationEvent) -> Result<()> {
        let _guard = self.ingest.lock().await;
        self.store.save_mutation_event(event).await
    }

    /// Remove an event the backend acknowledged or that was reconciled.
    pub async fn complete(&self, event: &MutationEvent) -> Result<()> {
        let _guard = self.ingest.lock().await;
        if !self.store.delete_mutation_event(&event.id).await? {
            debug!("Completed event {} was already gone", event.id);
        }
        Ok(())
    }

    /// Move an event to the dead-letter list.
    pub async fn dead_letter(&self, event: &MutationEvent, error: &str) -> Result<DeadLetter> {
        let _guard = self.ingest.lock().await;
        let mut stored = event.clone();
        stored.in_process = false;
        let letter = DeadLetter::new(stored, error);
        self.store.save_dead_letter(&letter).await?;
        self.store.delete_mutation_event(&event.id).await?;
        info!("Moved event {} to dead letters: {}", event.id, error);
        Ok(letter)
    }

    /// Queued events in outbox order.
    pub async fn pending(&self) -> Result<Vec<MutationEvent>> {
        self.store.mutation_events().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.pending().await?.is_empty())
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.store.dead_letters().await
    }

    /// Put a dead-lettered event back at the end of the outbox.
    ///
    /// The event is submitted again, so it is reconciled with whatever was
    /// queued for the record since it failed.
    ///
    /// # Errors
    /// - `Error::NotFound` if no dead letter has this id
    /// - Disposition errors; the dead letter is kept in that case
    pub async fn requeue_dead_letter(&self, id: &str) -> Result<SubmitOutcome> {
        let letter = self
            .store
            .dead_letters()
            .await?
            .into_iter()
            .find(|l| l.id() == id)
            .ok_or_else(|| Error::NotFound(format!("Dead letter '{}' not found", id)))?;

        let mut event = letter.event;
        event.in_process = false;
        event.created_at = monotonic_timestamp();

        let outcome = self.submit(event).await?;
        self.store.delete_dead_letter(id).await?;
        info!("Requeued dead letter {}", id);
        Ok(outcome)
    }

    /// Drop a dead letter for good.
    pub async fn discard_dead_letter(&self, id: &str) -> Result<DeadLetter> {
        self.store
            .delete_dead_letter(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Dead letter '{}' not found", id)))
    }

    fn notify(&self) {
        self.wake.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

/// Pull-based consumer of the outbox.
pub struct MutationEventSubscription {
    outbox: Arc<MutationOutbox>,
    wake: watch::Receiver<u64>,
}

impl MutationEventSubscription {
    /// Wait for the oldest event and mark it in process.
    ///
    /// Cancel-safe: dropping the future leaves the outbox unchanged apart
    /// from the durable in-process flag.
    pub async fn next_event(&mut self) -> Result<MutationEvent> {
        loop {
            self.wake.borrow_and_update();
            if let Some(event) = self.outbox.take_next().await? {
                return Ok(event);
            }
            self.wake
                .changed()
                .await
                .map_err(|_| Error::Cancelled("outbox closed".to_string()))?;
        }
    }
}

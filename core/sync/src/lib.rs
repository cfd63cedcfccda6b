//! driftsync Sync Engine
//!
//! This crate keeps local mutations flowing to a backend and local queries
//! live, including:
//! - A durable outbox that collapses pending mutations per record
//! - An outgoing queue that sends one event at a time with retry and backoff
//! - Conflict processing and reconciliation of remote changes
//! - Observe queries publishing incremental snapshots
//! - An operational event hub

pub mod config;
pub mod conflict;
pub mod disposition;
pub mod engine;
pub mod events;
pub mod observe;
pub mod outbox;
pub mod outgoing;
pub mod reconcile;
pub mod retry;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use config::{ObserveQueryConfig, OutboxConfig, SyncConfig, TerminalFailurePolicy};
pub use conflict::{ConflictData, ConflictHandler, ConflictResolution, ConflictStrategy};
pub use disposition::{disposition, Disposition};
pub use engine::SyncEngine;
pub use events::{ChangeStream, Hub, HubEvent};
pub use observe::{ObserveQuery, ObserveQuerySubscription, QuerySnapshot};
pub use outbox::{MutationEventSubscription, MutationOutbox, SubmitOutcome};
pub use outgoing::{OutgoingMutationQueue, QueueAction, QueueState};
pub use reconcile::{LocalReconciliationQueue, ReconcileOutcome, ReconciliationQueue};
pub use retry::{RetryConfig, RetryExecutor};
pub use transport::{RemoteTransport, TransportError};

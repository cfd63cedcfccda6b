//! Outgoing mutation queue.
//!
//! A single actor task drains the outbox one event at a time and sends each
//! event to the remote transport. Callers talk to the actor through
//! [`OutgoingMutationQueue`]; the actor owns the state machine.

use futures::future::{BoxFuture, FutureExt};
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use driftsync_common::{Error, MutationEvent, MutationSync, Result};

use crate::config::{OutboxConfig, TerminalFailurePolicy};
use crate::conflict::{resolve_conflict_unhandled, ConflictHandler, ConflictOutcome};
use crate::events::{ChangeStream, Hub, HubEvent};
use crate::outbox::{MutationEventSubscription, MutationOutbox};
use crate::reconcile::ReconciliationQueue;
use crate::retry::RetryExecutor;
use crate::transport::{RemoteTransport, TransportError};

/// State of the outgoing queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueState {
    NotInitialized,
    Stopped,
    Starting,
    /// Waiting for the outbox to yield the next event.
    RequestingEvent,
    /// An event is with the transport.
    WaitingForEventToProcess,
    /// A step failed. Only a new start leaves this state.
    InError(String),
}

/// Input of the queue state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueAction {
    Initialized,
    ReceivedStart,
    ReceivedSubscription,
    EnqueuedEvent,
    ProcessedEvent,
    Errored(String),
    ReceivedStop,
}

/// Pure transition function of the queue.
///
/// Unexpected (state, action) pairs keep the current state.
pub fn resolve(state: &QueueState, action: &QueueAction) -> QueueState {
    use QueueAction as A;
    use QueueState as S;

    match (state, action) {
        (S::NotInitialized, A::Initialized) => S::Stopped,
        (S::NotInitialized | S::Stopped | S::InError(_), A::ReceivedStart) => S::Starting,
        (S::Starting, A::ReceivedSubscription) => S::RequestingEvent,
        (S::RequestingEvent, A::EnqueuedEvent) => S::WaitingForEventToProcess,
        (S::WaitingForEventToProcess, A::ProcessedEvent) => S::RequestingEvent,
        (_, A::Errored(message)) => S::InError(message.clone()),
        (S::NotInitialized, A::ReceivedStop) => S::NotInitialized,
        (_, A::ReceivedStop) => S::Stopped,
        (state, action) => {
            warn!("Unexpected queue action {:?} in state {:?}", action, state);
            state.clone()
        }
    }
}

enum Command {
    Start {
        transport: Arc<dyn RemoteTransport>,
        publisher: ChangeStream,
        reconciliation: Arc<dyn ReconciliationQueue>,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the outgoing queue actor.
///
/// Dropping the handle shuts the actor down.
pub struct OutgoingMutationQueue {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<QueueState>,
}

impl OutgoingMutationQueue {
    /// Spawn the queue actor. Must be called within a tokio runtime.
    pub fn new(
        outbox: Arc<MutationOutbox>,
        hub: Arc<Hub>,
        config: OutboxConfig,
        conflict_handler: Arc<dyn ConflictHandler>,
    ) -> Self {
        let (commands, receiver) = mpsc::channel(16);
        let (state_tx, state) = watch::channel(QueueState::NotInitialized);

        let worker = QueueWorker {
            outbox,
            hub,
            config,
            conflict_handler,
            state: state_tx,
            commands: receiver,
            session: None,
        };
        tokio::spawn(worker.run());

        Self { commands, state }
    }

    /// Begin draining the outbox.
    ///
    /// # Postconditions
    /// - The queue is subscribed to the outbox and requesting events
    /// - A queue already running is restarted; an in-flight event is resent
    pub async fn start(
        &self,
        transport: Arc<dyn RemoteTransport>,
        publisher: ChangeStream,
        reconciliation: Arc<dyn ReconciliationQueue>,
    ) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Start {
            transport,
            publisher,
            reconciliation,
            reply,
        })
        .await?;
        done.await
            .map_err(|_| Error::Cancelled("outgoing queue shut down".to_string()))
    }

    /// Stop draining the outbox.
    ///
    /// An in-flight request is abandoned; its event stays in process and is
    /// resent first on the next start.
    pub async fn stop(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Stop { reply }).await?;
        done.await
            .map_err(|_| Error::Cancelled("outgoing queue shut down".to_string()))
    }

    pub fn state(&self) -> QueueState {
        self.state.borrow().clone()
    }

    /// Receiver of every state change.
    pub fn watch_state(&self) -> watch::Receiver<QueueState> {
        self.state.clone()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Cancelled("outgoing queue shut down".to_string()))
    }
}

/// Collaborators of one started run of the queue.
struct Session {
    outbox: Arc<MutationOutbox>,
    hub: Arc<Hub>,
    config: OutboxConfig,
    conflict_handler: Arc<dyn ConflictHandler>,
    transport: Arc<dyn RemoteTransport>,
    publisher: ChangeStream,
    reconciliation: Arc<dyn ReconciliationQueue>,
}

enum StepOutput {
    Event(MutationEvent),
    Processed,
}

struct StepResult {
    subscription: MutationEventSubscription,
    output: Result<StepOutput>,
}

struct QueueWorker {
    outbox: Arc<MutationOutbox>,
    hub: Arc<Hub>,
    config: OutboxConfig,
    conflict_handler: Arc<dyn ConflictHandler>,
    state: watch::Sender<QueueState>,
    commands: mpsc::Receiver<Command>,
    session: Option<Arc<Session>>,
}

impl QueueWorker {
    async fn run(mut self) {
        self.apply(QueueAction::Initialized);
        let mut step: Option<BoxFuture<'static, StepResult>> = None;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    // Dropping the step cancels whatever it was waiting on.
                    step = None;
                    match command {
                        Some(Command::Start { transport, publisher, reconciliation, reply }) => {
                            step = self.start(transport, publisher, reconciliation).await;
                            let _ = reply.send(());
                        }
                        Some(Command::Stop { reply }) => {
                            self.session = None;
                            self.apply(QueueAction::ReceivedStop);
                            info!("Outgoing mutation queue stopped");
                            let _ = reply.send(());
                        }
                        None => break,
                    }
                }
                result = poll_step(&mut step) => {
                    step = self.advance(result);
                }
            }
        }

        debug!("Outgoing mutation queue shut down");
    }

    async fn start(
        &mut self,
        transport: Arc<dyn RemoteTransport>,
        publisher: ChangeStream,
        reconciliation: Arc<dyn ReconciliationQueue>,
    ) -> Option<BoxFuture<'static, StepResult>> {
        self.apply(QueueAction::ReceivedStart);
        info!("Starting outgoing mutation queue with {}", transport.name());

        let session = Arc::new(Session {
            outbox: self.outbox.clone(),
            hub: self.hub.clone(),
            config: self.config.clone(),
            conflict_handler: self.conflict_handler.clone(),
            transport,
            publisher,
            reconciliation,
        });
        self.session = Some(session.clone());

        let subscription = self.outbox.subscribe();
        session.dispatch_status().await;
        self.apply(QueueAction::ReceivedSubscription);

        Some(request_event(subscription).boxed())
    }

    /// Feed a finished step into the state machine and return the next one.
    fn advance(&mut self, result: StepResult) -> Option<BoxFuture<'static, StepResult>> {
        let StepResult {
            subscription,
            output,
        } = result;

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                self.fail(err);
                return None;
            }
        };

        let Some(session) = self.session.clone() else {
            self.fail(Error::Configuration(
                "No session while advancing the outgoing queue".to_string(),
            ));
            return None;
        };

        match output {
            StepOutput::Event(event) => {
                self.apply(QueueAction::EnqueuedEvent);
                Some(process_event(session, subscription, event).boxed())
            }
            StepOutput::Processed => {
                self.apply(QueueAction::ProcessedEvent);
                Some(request_event(subscription).boxed())
            }
        }
    }

    fn fail(&mut self, err: Error) {
        error!("Outgoing mutation queue failed: {}", err);
        let message = err.to_string();
        self.apply(QueueAction::Errored(message.clone()));
        self.hub.dispatch(HubEvent::QueueErrored { error: message });
    }

    fn apply(&self, action: QueueAction) {
        self.state.send_modify(|state| {
            let next = resolve(state, &action);
            debug!("Queue {:?} --{:?}--> {:?}", state, action, next);
            *state = next;
        });
    }
}

async fn poll_step(step: &mut Option<BoxFuture<'static, StepResult>>) -> StepResult {
    match step {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn request_event(mut subscription: MutationEventSubscription) -> StepResult {
    let output = subscription.next_event().await.map(StepOutput::Event);
    StepResult {
        subscription,
        output,
    }
}

async fn process_event(
    session: Arc<Session>,
    subscription: MutationEventSubscription,
    event: MutationEvent,
) -> StepResult {
    let output = session.process(event).await.map(|()| StepOutput::Processed);
    StepResult {
        subscription,
        output,
    }
}

impl Session {
    /// Send one event and settle it.
    ///
    /// Only storage failures are returned; transport failures are settled
    /// here.
    async fn process(&self, event: MutationEvent) -> Result<()> {
        let event = self.refresh_version(event).await?;
        debug!(
            "Sending {} of {} {} (version {:?})",
            event.mutation_type, event.model_name, event.model_id, event.version
        );
        self.hub
            .dispatch(HubEvent::OutboxMutationEnqueued(event.clone()));
        self.hub.dispatch(HubEvent::OutboxStatus { is_empty: false });

        match self.send(&event).await {
            Ok(remote) => self.complete(&event, remote).await?,
            Err(TransportError::ConflictUnhandled { remote }) => {
                self.settle_conflict(event, remote).await?
            }
            Err(err) => {
                if err == TransportError::ConditionalCheckFailed {
                    self.hub
                        .dispatch(HubEvent::ConditionalSaveFailed(event.clone()));
                }
                self.dispose(&event, err.into()).await?
            }
        }

        self.dispatch_status().await;
        Ok(())
    }

    async fn send(&self, event: &MutationEvent) -> std::result::Result<MutationSync, TransportError> {
        let executor = RetryExecutor::new(self.config.retry.clone());
        executor
            .execute(
                || self.transport.mutate(event),
                TransportError::is_retryable,
            )
            .await
    }

    /// Stamp the newest known server version on the event.
    ///
    /// An update queued while its create was in flight only learns the
    /// version the create produced here.
    async fn refresh_version(&self, mut event: MutationEvent) -> Result<MutationEvent> {
        let metadata = self
            .outbox
            .store()
            .query_sync_metadata(&event.model_id, &event.model_name)
            .await?;

        if let Some(metadata) = metadata {
            if event.version.map_or(true, |v| metadata.version > v) {
                event.version = Some(metadata.version);
                self.outbox.update_in_process(&event).await?;
            }
        }
        Ok(event)
    }

    /// Record an acknowledged event.
    ///
    /// The acknowledged record only replaces the local one when no newer
    /// local mutation of it is queued.
    async fn complete(&self, event: &MutationEvent, remote: MutationSync) -> Result<()> {
        let store = self.outbox.store();
        store.save_sync_metadata(&remote.sync_metadata).await?;
        self.outbox.complete(event).await?;

        let queued = store
            .mutation_events_for(&event.model_name, &event.model_id)
            .await?;
        if queued.is_empty() {
            if remote.sync_metadata.deleted {
                store
                    .delete(remote.model.model_name(), remote.model.id())
                    .await?;
            } else {
                store.save(&remote.model).await?;
            }
            self.publisher.publish(remote.to_mutation_event()?);
        } else {
            debug!(
                "Keeping local {} {}: {} newer mutations queued",
                event.model_name,
                event.model_id,
                queued.len()
            );
        }

        info!(
            "Processed {} of {} {} at version {}",
            event.mutation_type, event.model_name, event.model_id, remote.sync_metadata.version
        );
        self.hub.dispatch(HubEvent::OutboxMutationProcessed {
            event: event.clone(),
            remote,
        });
        Ok(())
    }

    async fn settle_conflict(&self, event: MutationEvent, remote: MutationSync) -> Result<()> {
        let outcome =
            match resolve_conflict_unhandled(&event, &remote, self.conflict_handler.as_ref()).await
            {
                Ok(outcome) => outcome,
                Err(err) => return self.dispose(&event, err).await,
            };

        match outcome {
            ConflictOutcome::Skip => self.outbox.complete(&event).await,
            ConflictOutcome::ApplyRemote => {
                self.outbox.complete(&event).await?;
                let result = self.reconciliation.offer(remote).await?;
                debug!("Applied remote after conflict: {:?}", result);
                Ok(())
            }
            ConflictOutcome::Resend(resend) => {
                self.outbox.update_in_process(&resend).await?;
                match self.transport.mutate(&resend).await {
                    Ok(remote) => self.complete(&resend, remote).await,
                    Err(err) => self.dispose(&resend, err.into()).await,
                }
            }
        }
    }

    /// Remove an event that failed terminally.
    async fn dispose(&self, event: &MutationEvent, error: Error) -> Result<()> {
        let error = error.to_string();
        warn!(
            "{} of {} {} failed: {}",
            event.mutation_type, event.model_name, event.model_id, error
        );
        match self.config.terminal_failure_policy {
            TerminalFailurePolicy::DeadLetter => {
                self.outbox.dead_letter(event, &error).await?;
            }
            TerminalFailurePolicy::Discard => self.outbox.complete(event).await?,
        }
        self.hub.dispatch(HubEvent::MutationFailed {
            event: event.clone(),
            error,
        });
        Ok(())
    }

    async fn dispatch_status(&self) {
        match self.outbox.is_empty().await {
            Ok(is_empty) => self.hub.dispatch(HubEvent::OutboxStatus { is_empty }),
            Err(err) => error!("Error querying mutation events: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictStrategy;
    use crate::reconcile::LocalReconciliationQueue;
    use crate::retry::RetryConfig;
    use crate::test_support::{eventually, FailingStore, ScriptedTransport};
    use driftsync_common::{
        AnyModel, ModelId, ModelName, MutationSyncMetadata, MutationType,
    };
    use driftsync_storage::{FileStore, LocalStore, MemoryStore};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    fn post(id: &str, title: &str) -> AnyModel {
        AnyModel::new(
            ModelName::new("Post").unwrap(),
            json!({ "id": id, "title": title }),
        )
        .unwrap()
    }

    fn event(id: &str, title: &str, mutation_type: MutationType) -> MutationEvent {
        MutationEvent::new(&post(id, title), mutation_type, None).unwrap()
    }

    fn fast_config(policy: TerminalFailurePolicy) -> OutboxConfig {
        OutboxConfig {
            terminal_failure_policy: policy,
            retry: RetryConfig::default()
                .with_initial_delay(Duration::from_millis(5))
                .with_jitter(false),
        }
    }

    struct Fixture {
        store: Arc<dyn LocalStore>,
        hub: Arc<Hub>,
        changes: ChangeStream,
        outbox: Arc<MutationOutbox>,
        queue: OutgoingMutationQueue,
    }

    impl Fixture {
        fn new(store: Arc<dyn LocalStore>, policy: TerminalFailurePolicy) -> Self {
            Self::with_handler(store, policy, Arc::new(ConflictStrategy::ApplyRemote))
        }

        fn with_handler(
            store: Arc<dyn LocalStore>,
            policy: TerminalFailurePolicy,
            handler: Arc<dyn ConflictHandler>,
        ) -> Self {
            let hub = Arc::new(Hub::default());
            let outbox = Arc::new(MutationOutbox::new(store.clone(), hub.clone()));
            let queue =
                OutgoingMutationQueue::new(outbox.clone(), hub.clone(), fast_config(policy), handler);
            Self {
                store,
                hub,
                changes: ChangeStream::new(64),
                outbox,
                queue,
            }
        }

        async fn start(&self, transport: Arc<ScriptedTransport>) {
            let reconciliation = Arc::new(LocalReconciliationQueue::new(
                self.store.clone(),
                self.changes.clone(),
                self.hub.clone(),
            ));
            self.queue
                .start(transport, self.changes.clone(), reconciliation)
                .await
                .unwrap();
        }

        async fn wait_until_empty(&self) {
            let outbox = self.outbox.clone();
            eventually(|| {
                let outbox = outbox.clone();
                async move { outbox.is_empty().await.unwrap() }
            })
            .await;
        }
    }

    #[test]
    fn test_state_machine_transitions() {
        use QueueAction as A;
        use QueueState as S;

        let mut state = S::NotInitialized;
        for (action, expected) in [
            (A::Initialized, S::Stopped),
            (A::ReceivedStart, S::Starting),
            (A::ReceivedSubscription, S::RequestingEvent),
            (A::EnqueuedEvent, S::WaitingForEventToProcess),
            (A::ProcessedEvent, S::RequestingEvent),
            (A::ReceivedStop, S::Stopped),
        ] {
            state = resolve(&state, &action);
            assert_eq!(state, expected);
        }

        let errored = resolve(&S::RequestingEvent, &A::Errored("boom".into()));
        assert_eq!(errored, S::InError("boom".into()));
        // Absorbing until a new start.
        assert_eq!(resolve(&errored, &A::ProcessedEvent), errored);
        assert_eq!(resolve(&errored, &A::ReceivedStart), S::Starting);

        // Unexpected actions keep the state.
        assert_eq!(resolve(&S::Stopped, &A::EnqueuedEvent), S::Stopped);
        assert_eq!(resolve(&S::NotInitialized, &A::ReceivedStop), S::NotInitialized);
    }

    #[tokio::test]
    async fn test_drains_outbox_in_order() {
        let fixture = Fixture::new(Arc::new(MemoryStore::new()), TerminalFailurePolicy::DeadLetter);
        let mut changes = fixture.changes.subscribe();

        let first = event("p1", "a", MutationType::Create);
        let second = event("p2", "b", MutationType::Create);
        fixture.outbox.submit(first.clone()).await.unwrap();
        fixture.outbox.submit(second.clone()).await.unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        fixture.start(transport.clone()).await;
        fixture.wait_until_empty().await;

        let sent: Vec<String> = transport.calls().into_iter().map(|e| e.id).collect();
        assert_eq!(sent, vec![first.id, second.id]);

        let metadata = fixture
            .store
            .query_sync_metadata(&ModelId::new("p1").unwrap(), &ModelName::new("Post").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metadata.version, 1);

        let published = changes.recv().await.unwrap();
        assert_eq!(published.model_id.as_str(), "p1");
        assert_eq!(published.version, Some(1));
    }

    #[tokio::test]
    async fn test_single_event_in_flight() {
        let fixture = Fixture::new(Arc::new(MemoryStore::new()), TerminalFailurePolicy::DeadLetter);
        for id in ["p1", "p2", "p3"] {
            fixture
                .outbox
                .submit(event(id, "t", MutationType::Create))
                .await
                .unwrap();
        }

        let (transport, gate) = ScriptedTransport::gated();
        let transport = Arc::new(transport);
        fixture.start(transport.clone()).await;

        transport.wait_for_calls(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(fixture.queue.state(), QueueState::WaitingForEventToProcess);

        gate.add_permits(1);
        transport.wait_for_calls(2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.calls().len(), 2);

        gate.add_permits(1);
        transport.wait_for_calls(3).await;
        gate.add_permits(1);
        fixture.wait_until_empty().await;
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_restart_resumes_in_process_event() {
        let temp = TempDir::new().unwrap();
        let first = event("p1", "a", MutationType::Create);
        let second = event("p2", "b", MutationType::Create);

        {
            let store: Arc<dyn LocalStore> = Arc::new(FileStore::open(temp.path()).await.unwrap());
            let fixture = Fixture::new(store, TerminalFailurePolicy::DeadLetter);
            fixture.outbox.submit(first.clone()).await.unwrap();

            let (transport, _gate) = ScriptedTransport::gated();
            let transport = Arc::new(transport);
            fixture.start(transport.clone()).await;
            transport.wait_for_calls(1).await;

            fixture.queue.stop().await.unwrap();
            assert_eq!(fixture.queue.state(), QueueState::Stopped);
            // Queued while the first event is in flight.
            fixture.outbox.submit(second.clone()).await.unwrap();
        }

        let store: Arc<dyn LocalStore> = Arc::new(FileStore::open(temp.path()).await.unwrap());
        let pending = store.mutation_events().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].in_process);
        assert_eq!(pending[0].id, first.id);

        let fixture = Fixture::new(store, TerminalFailurePolicy::DeadLetter);
        let transport = Arc::new(ScriptedTransport::new());
        fixture.start(transport.clone()).await;
        fixture.wait_until_empty().await;

        let sent: Vec<String> = transport.calls().into_iter().map(|e| e.id).collect();
        assert_eq!(sent, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_version_refreshed_before_dispatch() {
        let fixture = Fixture::new(Arc::new(MemoryStore::new()), TerminalFailurePolicy::DeadLetter);
        fixture
            .outbox
            .submit(event("p1", "a", MutationType::Create))
            .await
            .unwrap();

        let (transport, gate) = ScriptedTransport::gated();
        let transport = Arc::new(transport);
        fixture.start(transport.clone()).await;
        transport.wait_for_calls(1).await;

        // The create is in flight, so the update is queued behind it
        // without a version.
        fixture
            .outbox
            .submit(event("p1", "b", MutationType::Update))
            .await
            .unwrap();

        gate.add_permits(2);
        fixture.wait_until_empty().await;

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].version, None);
        assert_eq!(calls[1].mutation_type, MutationType::Update);
        assert_eq!(calls[1].version, Some(1));
    }

    #[tokio::test]
    async fn test_ack_does_not_overwrite_queued_local_edit() {
        let fixture = Fixture::new(Arc::new(MemoryStore::new()), TerminalFailurePolicy::DeadLetter);
        let mut changes = fixture.changes.subscribe();
        let name = ModelName::new("Post").unwrap();
        let id = ModelId::new("p1").unwrap();

        fixture.store.save(&post("p1", "a")).await.unwrap();
        fixture
            .outbox
            .submit(event("p1", "a", MutationType::Create))
            .await
            .unwrap();

        let (transport, gate) = ScriptedTransport::gated();
        let transport = Arc::new(transport);
        fixture.start(transport.clone()).await;
        transport.wait_for_calls(1).await;

        // Edited again while the create is in flight.
        fixture.store.save(&post("p1", "b")).await.unwrap();
        fixture
            .outbox
            .submit(event("p1", "b", MutationType::Update))
            .await
            .unwrap();

        // Acknowledge the create only; the update is now held at the transport.
        gate.add_permits(1);
        transport.wait_for_calls(2).await;

        let local = fixture.store.query_by_id(&name, &id).await.unwrap().unwrap();
        assert_eq!(local.field("title"), Some(&json!("b")));
        assert!(changes.try_recv().is_err());
        let metadata = fixture
            .store
            .query_sync_metadata(&id, &name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metadata.version, 1);

        gate.add_permits(1);
        fixture.wait_until_empty().await;

        let published = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published.version, Some(2));
        assert_eq!(published.mutation_type, MutationType::Update);
        let local = fixture.store.query_by_id(&name, &id).await.unwrap().unwrap();
        assert_eq!(local.field("title"), Some(&json!("b")));
    }

    #[tokio::test]
    async fn test_acked_delete_removes_local_record() {
        let fixture = Fixture::new(Arc::new(MemoryStore::new()), TerminalFailurePolicy::DeadLetter);
        let name = ModelName::new("Post").unwrap();
        let id = ModelId::new("p1").unwrap();

        fixture.store.save(&post("p1", "a")).await.unwrap();
        let mut delete = event("p1", "a", MutationType::Delete);
        delete.version = Some(1);
        fixture.outbox.submit(delete).await.unwrap();

        fixture.start(Arc::new(ScriptedTransport::new())).await;
        fixture.wait_until_empty().await;

        assert!(fixture.store.query_by_id(&name, &id).await.unwrap().is_none());
        let metadata = fixture
            .store
            .query_sync_metadata(&id, &name)
            .await
            .unwrap()
            .unwrap();
        assert!(metadata.deleted);
        assert_eq!(metadata.version, 2);
    }

    #[tokio::test]
    async fn test_retryable_error_resends_same_event() {
        let fixture = Fixture::new(Arc::new(MemoryStore::new()), TerminalFailurePolicy::DeadLetter);
        let queued = event("p1", "a", MutationType::Create);
        fixture.outbox.submit(queued.clone()).await.unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(Err(TransportError::Network("offline".into())));
        transport.push_response(Err(TransportError::Throttled("busy".into())));
        fixture.start(transport.clone()).await;
        fixture.wait_until_empty().await;

        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|e| e.id == queued.id));
        assert!(fixture.outbox.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_error_dead_letters_and_continues() {
        let fixture = Fixture::new(Arc::new(MemoryStore::new()), TerminalFailurePolicy::DeadLetter);
        let mut hub = fixture.hub.subscribe();
        let poisoned = event("p1", "a", MutationType::Create);
        let healthy = event("p2", "b", MutationType::Create);
        fixture.outbox.submit(poisoned.clone()).await.unwrap();
        fixture.outbox.submit(healthy.clone()).await.unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(Err(TransportError::Validation("bad title".into())));
        fixture.start(transport.clone()).await;
        fixture.wait_until_empty().await;

        let letters = fixture.outbox.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].id(), poisoned.id);
        assert!(letters[0].error.starts_with("Transport error:"));
        assert!(letters[0].error.contains("bad title"));
        assert_eq!(transport.calls().len(), 2);

        let mut saw_failure = false;
        while let Ok(event) = hub.try_recv() {
            if let HubEvent::MutationFailed { event, error } = event {
                assert_eq!(event.id, poisoned.id);
                assert_eq!(error, letters[0].error);
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_discard_policy_drops_event() {
        let fixture = Fixture::new(Arc::new(MemoryStore::new()), TerminalFailurePolicy::Discard);
        fixture
            .outbox
            .submit(event("p1", "a", MutationType::Create))
            .await
            .unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(Err(TransportError::Unauthorized("expired".into())));
        fixture.start(transport).await;
        fixture.wait_until_empty().await;

        assert!(fixture.outbox.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conditional_failure_dispatches_hub_event() {
        let fixture = Fixture::new(Arc::new(MemoryStore::new()), TerminalFailurePolicy::DeadLetter);
        let mut hub = fixture.hub.subscribe();
        let conditional = event("p1", "a", MutationType::Update);
        fixture.outbox.submit(conditional.clone()).await.unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(Err(TransportError::ConditionalCheckFailed));
        fixture.start(transport).await;
        fixture.wait_until_empty().await;

        let mut saw_conditional = false;
        while let Ok(event) = hub.try_recv() {
            if let HubEvent::ConditionalSaveFailed(event) = event {
                assert_eq!(event.id, conditional.id);
                saw_conditional = true;
            }
        }
        assert!(saw_conditional);
    }

    fn conflict(title: &str, version: u64, deleted: bool) -> TransportError {
        TransportError::ConflictUnhandled {
            remote: MutationSync {
                model: post("p1", title),
                sync_metadata: MutationSyncMetadata {
                    model_id: ModelId::new("p1").unwrap(),
                    model_name: ModelName::new("Post").unwrap(),
                    version,
                    deleted,
                    last_changed_at: 0,
                },
            },
        }
    }

    #[tokio::test]
    async fn test_conflict_apply_remote_overwrites_local() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let fixture = Fixture::new(store.clone(), TerminalFailurePolicy::DeadLetter);
        store.save(&post("p1", "local")).await.unwrap();
        fixture
            .outbox
            .submit(event("p1", "local", MutationType::Update))
            .await
            .unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(Err(conflict("remote", 5, false)));
        fixture.start(transport.clone()).await;
        fixture.wait_until_empty().await;

        // The event leaves the outbox before the remote record is applied.
        let reader = store.clone();
        eventually(|| {
            let reader = reader.clone();
            async move {
                let saved = reader
                    .query_by_id(&ModelName::new("Post").unwrap(), &ModelId::new("p1").unwrap())
                    .await
                    .unwrap();
                saved.and_then(|m| m.field("title").cloned()) == Some(json!("remote"))
            }
        })
        .await;
        assert!(fixture.outbox.dead_letters().await.unwrap().is_empty());
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_retry_local_resends_with_remote_version() {
        let fixture = Fixture::with_handler(
            Arc::new(MemoryStore::new()),
            TerminalFailurePolicy::DeadLetter,
            Arc::new(ConflictStrategy::RetryLocal),
        );
        let queued = event("p1", "local", MutationType::Update);
        fixture.outbox.submit(queued.clone()).await.unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(Err(conflict("remote", 5, false)));
        fixture.start(transport.clone()).await;
        fixture.wait_until_empty().await;

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].json, queued.json);
        assert_eq!(calls[1].version, Some(5));

        let metadata = fixture
            .store
            .query_sync_metadata(&ModelId::new("p1").unwrap(), &ModelName::new("Post").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metadata.version, 6);
    }

    #[tokio::test]
    async fn test_conflict_on_create_is_dead_lettered() {
        let fixture = Fixture::new(Arc::new(MemoryStore::new()), TerminalFailurePolicy::DeadLetter);
        fixture
            .outbox
            .submit(event("p1", "a", MutationType::Create))
            .await
            .unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(Err(conflict("remote", 2, false)));
        fixture.start(transport).await;
        fixture.wait_until_empty().await;

        assert_eq!(fixture.outbox.dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_enters_error_state() {
        let store = Arc::new(FailingStore::new());
        store.fail_event_deletes.store(true, Ordering::SeqCst);
        let fixture = Fixture::new(store.clone(), TerminalFailurePolicy::DeadLetter);
        let mut state = fixture.queue.watch_state();
        fixture
            .outbox
            .submit(event("p1", "a", MutationType::Create))
            .await
            .unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        fixture.start(transport.clone()).await;

        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| matches!(s, QueueState::InError(_))),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(fixture.outbox.pending().await.unwrap().len(), 1);

        // A new start resumes the event once storage recovers.
        store.fail_event_deletes.store(false, Ordering::SeqCst);
        fixture.start(transport.clone()).await;
        fixture.wait_until_empty().await;
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_abandons_in_flight_request() {
        let fixture = Fixture::new(Arc::new(MemoryStore::new()), TerminalFailurePolicy::DeadLetter);
        fixture.queue.stop().await.unwrap();
        assert_eq!(fixture.queue.state(), QueueState::Stopped);

        let queued = event("p1", "a", MutationType::Create);
        fixture.outbox.submit(queued.clone()).await.unwrap();

        let (transport, gate) = ScriptedTransport::gated();
        let transport = Arc::new(transport);
        fixture.start(transport.clone()).await;
        transport.wait_for_calls(1).await;
        fixture.queue.stop().await.unwrap();

        // The response arrives after the stop and is never applied.
        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let pending = fixture.outbox.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, queued.id);
        assert!(pending[0].in_process);
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(fixture.queue.state(), QueueState::Stopped);
    }
}

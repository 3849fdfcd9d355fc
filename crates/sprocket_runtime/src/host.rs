//! Script host.
//!
//! Runs one script invocation to a terminal state:
//!
//! 1. the script's entry point submits operations through the gate;
//! 2. the host starts queued operations (at most `max_in_flight` at a time)
//!    against the invocation's staged view and delivers each completion to
//!    the script, which may submit more;
//! 3. once nothing is queued or running the transaction commits.
//!
//! An error from the script or the budget running out aborts the
//! transaction instead, discarding every staged write and the response.

use crate::admission::{duration_ms, AdmissionConfig, AdmissionGate};
use crate::context::{Collection, Context, Request};
use crate::deadline::{DeadlineMonitor, DEFAULT_BUDGET};
use crate::monitor::{InvocationMetrics, InvocationRecorder, JournalEvent};
use crate::queue::{Completion, CompletionOrder, Operation, OperationError};
use crate::registry::{RegistryError, ScriptRegistry};
use crate::script::Script;
use crate::transaction::{AbortReason, TransactionBoundary, TransactionState};
use futures::future::BoxFuture;
use futures::stream::{FuturesOrdered, FuturesUnordered};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sprocket_core::{CollectionLink, CoreError, InvocationId, MonotonicClock, SharedClock};
use sprocket_storage::{SharedStore, StagedView, StoreConfig, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Host configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Execution budget per invocation in milliseconds
    pub budget_ms: u64,
    /// Admission gate settings
    pub admission: AdmissionConfig,
    /// Operations allowed to run at once
    pub max_in_flight: usize,
    /// Order completions are delivered in
    pub completion_order: CompletionOrder,
    /// Limits enforced by the staged view
    pub store: StoreConfig,
    /// Journal events kept per invocation
    pub journal_capacity: usize,
}

impl HostConfig {
    /// Set the execution budget
    #[must_use]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget_ms = duration_ms(budget);
        self
    }

    /// Set admission settings
    #[must_use]
    pub fn with_admission(mut self, admission: AdmissionConfig) -> Self {
        self.admission = admission;
        self
    }

    /// Set how many operations may run at once
    #[must_use]
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Set completion delivery order
    #[must_use]
    pub fn with_completion_order(mut self, order: CompletionOrder) -> Self {
        self.completion_order = order;
        self
    }

    /// Set store limits
    #[must_use]
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Set journal capacity
    #[must_use]
    pub fn with_journal_capacity(mut self, capacity: usize) -> Self {
        self.journal_capacity = capacity;
        self
    }

    /// Execution budget
    #[must_use]
    pub const fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            budget_ms: duration_ms(DEFAULT_BUDGET),
            admission: AdmissionConfig::default(),
            max_in_flight: 1,
            completion_order: CompletionOrder::default(),
            store: StoreConfig::default(),
            journal_capacity: 1024,
        }
    }
}

/// Infrastructure failure; script-level failures are reported in
/// [`InvocationOutcome::status`] instead
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Unknown or malformed procedure
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The store failed while committing
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The commit outlived the budget; the store may or may not have
    /// applied the writes
    #[error("commit of {invocation} did not finish within the budget; writes are in doubt")]
    CommitTimedOut {
        /// Invocation whose commit timed out
        invocation: InvocationId,
    },
}

impl From<HostError> for CoreError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Registry(RegistryError::NotFound { name }) => CoreError::NotFound {
                kind: "Procedure".to_string(),
                id: name,
            },
            HostError::Registry(other) => CoreError::Validation {
                field: "procedure".to_string(),
                reason: other.to_string(),
            },
            HostError::Store(inner) => inner.into(),
            HostError::CommitTimedOut { invocation } => CoreError::Timeout {
                operation: format!("commit of {invocation}"),
            },
        }
    }
}

/// Result of one invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationOutcome {
    /// Invocation id
    pub invocation: InvocationId,
    /// Terminal transaction state
    pub status: TransactionState,
    /// Response body; `None` when aborted or never set
    pub response: Option<Value>,
    /// Counters
    pub metrics: InvocationMetrics,
    /// Retained journal
    pub journal: Vec<JournalEvent>,
}

impl InvocationOutcome {
    /// Whether the invocation committed
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        self.status.is_committed()
    }
}

/// Running operations, yielding completions in the configured order
enum InFlight<'a> {
    Ordered(FuturesOrdered<BoxFuture<'a, Completion>>),
    Unordered(FuturesUnordered<BoxFuture<'a, Completion>>),
}

impl<'a> InFlight<'a> {
    fn new(order: CompletionOrder) -> Self {
        match order {
            CompletionOrder::Submission => Self::Ordered(FuturesOrdered::new()),
            CompletionOrder::AsCompleted => Self::Unordered(FuturesUnordered::new()),
        }
    }

    fn push(&mut self, fut: BoxFuture<'a, Completion>) {
        match self {
            Self::Ordered(set) => set.push_back(fut),
            Self::Unordered(set) => set.push(fut),
        }
    }

    async fn next(&mut self) -> Option<Completion> {
        match self {
            Self::Ordered(set) => set.next().await,
            Self::Unordered(set) => set.next().await,
        }
    }
}

/// Start one operation; the future never outlives the remaining budget
fn start<'a>(
    view: &'a StagedView,
    scope: &CollectionLink,
    op: Operation,
    monitor: &DeadlineMonitor,
) -> BoxFuture<'a, Completion> {
    let limit = monitor.remaining();
    let monitor = monitor.clone();
    let foreign = (op.collection != *scope).then(|| CoreError::Validation {
        field: "collection".to_string(),
        reason: format!("{} is outside the bound collection {scope}", op.collection),
    });

    async move {
        let started = monitor.now();
        let (operation, kind, tag) = (op.id, op.kind(), op.tag);
        let result = match foreign {
            Some(err) => Err(OperationError::from(err)),
            None => match tokio::time::timeout(limit, op.execute(view)).await {
                Ok(result) => result,
                Err(_) => Err(OperationError::TimedOut),
            },
        };
        Completion {
            operation,
            kind,
            tag,
            result,
            latency: monitor.now().saturating_sub(started),
        }
    }
    .boxed()
}

/// Hosts script invocations against a shared store
#[derive(Debug, Clone)]
pub struct ScriptHost {
    store: SharedStore,
    clock: SharedClock,
    config: HostConfig,
    registry: ScriptRegistry,
}

impl ScriptHost {
    /// Create a host with the monotonic clock and the built-in procedures
    #[must_use]
    pub fn new(store: SharedStore, config: HostConfig) -> Self {
        Self {
            store,
            clock: MonotonicClock::shared(),
            config,
            registry: ScriptRegistry::with_builtins(),
        }
    }

    /// Use another clock for deadlines and latencies
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Use another registry
    #[must_use]
    pub fn with_registry(mut self, registry: ScriptRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Registry, for adding procedures
    pub fn registry_mut(&mut self) -> &mut ScriptRegistry {
        &mut self.registry
    }

    /// Configuration
    #[must_use]
    pub const fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Backing store
    #[must_use]
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Run a registered procedure against a collection
    ///
    /// # Errors
    ///
    /// Returns error if the procedure is unknown, or the store fails or
    /// stalls while committing.
    pub async fn execute(
        &self,
        procedure: &str,
        collection: &CollectionLink,
        body: Value,
    ) -> Result<InvocationOutcome, HostError> {
        let mut script = self.registry.create(procedure)?;
        tracing::debug!(procedure, %collection, "executing procedure");
        self.run_script(script.as_mut(), collection, body).await
    }

    /// Run a script instance against a collection
    ///
    /// # Errors
    ///
    /// Returns error if the store fails while committing, or if the commit
    /// does not finish within the remaining budget.
    pub async fn run_script(
        &self,
        script: &mut dyn Script,
        collection: &CollectionLink,
        body: Value,
    ) -> Result<InvocationOutcome, HostError> {
        let invocation = InvocationId::new();
        let monitor = DeadlineMonitor::new(Arc::clone(&self.clock), self.config.budget());
        let view = StagedView::new(Arc::clone(&self.store), self.config.store.clone());
        let mut tx = TransactionBoundary::begin(invocation, view);
        let mut ctx = Context::new(
            invocation,
            Collection::new(
                invocation,
                collection.clone(),
                monitor.clone(),
                AdmissionGate::new(self.config.admission.clone()),
                InvocationRecorder::new(self.config.journal_capacity),
            ),
            Request::new(body),
        );
        tracing::debug!(%invocation, %collection, budget = ?monitor.budget(), "invocation started");

        let failure = match self.drive(script, &mut ctx, tx.view(), &monitor).await {
            None if monitor.is_expired() => Some(AbortReason::DeadlineExceeded),
            other => other,
        };

        let (mut collection, response) = ctx.into_parts();
        let mut writes = 0;
        let response = match failure {
            Some(reason) => {
                let cancelled = collection.cancel_pending();
                tracing::debug!(%invocation, cancelled, "cancelled pending operations");
                tx.abort(reason).await;
                None
            }
            None => match tx.commit_within(monitor.remaining()).await? {
                Some(applied) => {
                    writes = applied;
                    response.into_body().filter(|_| tx.state().is_committed())
                }
                None => return Err(HostError::CommitTimedOut { invocation }),
            },
        };

        let mut recorder = collection.into_recorder();
        let at = monitor.elapsed();
        match tx.state() {
            TransactionState::Committed => recorder.record(JournalEvent::Committed { writes, at }),
            TransactionState::Aborted { reason } => recorder.record(JournalEvent::Aborted {
                reason: reason.clone(),
                at,
            }),
            TransactionState::Running => {}
        }
        recorder.finish(at);
        let (metrics, journal) = recorder.into_parts();

        tracing::info!(
            %invocation,
            committed = tx.state().is_committed(),
            accepted = metrics.operations_accepted,
            rejected = metrics.operations_rejected,
            elapsed = ?at,
            "invocation finished"
        );
        Ok(InvocationOutcome {
            invocation,
            status: tx.state().clone(),
            response,
            metrics,
            journal,
        })
    }

    /// Run the script until it has nothing left to do or must abort
    async fn drive(
        &self,
        script: &mut dyn Script,
        ctx: &mut Context,
        view: &StagedView,
        monitor: &DeadlineMonitor,
    ) -> Option<AbortReason> {
        if let Err(err) = script.run(ctx) {
            return Some(AbortReason::ScriptFailed {
                message: err.to_string(),
            });
        }

        let mut in_flight = InFlight::new(self.config.completion_order);
        loop {
            if monitor.is_expired() {
                return Some(AbortReason::DeadlineExceeded);
            }
            while let Some(op) = ctx
                .collection_mut()
                .queue_mut()
                .start_next(self.config.max_in_flight)
            {
                in_flight.push(start(view, ctx.collection().self_link(), op, monitor));
            }

            let Some(completion) = in_flight.next().await else {
                return None;
            };
            ctx.collection_mut().settle(&completion);
            if monitor.is_expired() {
                return Some(AbortReason::DeadlineExceeded);
            }
            if let Err(err) = script.on_complete(ctx, completion) {
                return Some(AbortReason::CallbackFailed {
                    message: err.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::RejectReason;
    use crate::queue::CallbackTag;
    use crate::script::ScriptError;
    use async_trait::async_trait;
    use serde_json::json;
    use sprocket_core::{
        Attachment, CreateOptions, Document, ManualClock, ReadOptions, ResourceId,
    };
    use sprocket_storage::{
        CommitReceipt, DocumentStore, MemoryStore, SimulatedStore, StoreStats, WriteBatch,
    };

    fn coll() -> CollectionLink {
        CollectionLink::parse("orders").unwrap()
    }

    fn doc(id: &str) -> Document {
        Document::from_value(json!({"id": id})).unwrap()
    }

    /// Submits `count` creates up front and records every completion
    struct Burst {
        count: usize,
        decisions: Vec<bool>,
        reasons: Vec<RejectReason>,
        completed: Vec<CallbackTag>,
    }

    impl Burst {
        fn new(count: usize) -> Self {
            Self {
                count,
                decisions: Vec::new(),
                reasons: Vec::new(),
                completed: Vec::new(),
            }
        }
    }

    impl Script for Burst {
        fn run(&mut self, ctx: &mut Context) -> Result<(), ScriptError> {
            let link = ctx.collection().self_link().clone();
            for n in 0..self.count {
                let decision = ctx.collection_mut().create_document(
                    &link,
                    doc(&format!("d{n}")),
                    CreateOptions::default(),
                    n as CallbackTag,
                );
                self.decisions.push(decision.is_accepted());
                if let Some(reason) = decision.reject_reason() {
                    self.reasons.push(reason.clone());
                }
            }
            ctx.response_mut()
                .set_body(self.decisions.iter().filter(|d| **d).count());
            Ok(())
        }

        fn on_complete(
            &mut self,
            _ctx: &mut Context,
            completion: Completion,
        ) -> Result<(), ScriptError> {
            self.completed.push(completion.tag);
            completion.result.map(|_| ()).map_err(ScriptError::from)
        }
    }

    /// Sets the response and never touches the store
    struct Echo;

    impl Script for Echo {
        fn run(&mut self, ctx: &mut Context) -> Result<(), ScriptError> {
            let body = ctx.request().body().clone();
            ctx.response_mut().set_body(body);
            Ok(())
        }
    }

    /// Does nothing at all
    struct Silent;

    impl Script for Silent {
        fn run(&mut self, _ctx: &mut Context) -> Result<(), ScriptError> {
            Ok(())
        }
    }

    /// Creates one document, then raises from its callback
    struct Raises;

    impl Script for Raises {
        fn run(&mut self, ctx: &mut Context) -> Result<(), ScriptError> {
            let link = ctx.collection().self_link().clone();
            ctx.collection_mut()
                .create_document(&link, doc("x"), CreateOptions::default(), 0);
            ctx.response_mut().set_body("partial");
            Ok(())
        }

        fn on_complete(&mut self, _ctx: &mut Context, _: Completion) -> Result<(), ScriptError> {
            Err(ScriptError::raise("giving up"))
        }
    }

    /// Reads from a collection it is not bound to
    struct Trespass {
        status: Option<u16>,
    }

    impl Script for Trespass {
        fn run(&mut self, ctx: &mut Context) -> Result<(), ScriptError> {
            let other = CollectionLink::parse("elsewhere").unwrap();
            ctx.collection_mut().read_document(
                &other,
                ResourceId::parse("a").unwrap(),
                ReadOptions::default(),
                0,
            );
            Ok(())
        }

        fn on_complete(&mut self, _ctx: &mut Context, c: Completion) -> Result<(), ScriptError> {
            self.status = c.result.err().map(|e| e.status_code());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_echo_commits_response() {
        let host = ScriptHost::new(Arc::new(MemoryStore::new()), HostConfig::default());
        let outcome = host
            .run_script(&mut Echo, &coll(), json!({"hello": "world"}))
            .await
            .unwrap();
        assert!(outcome.is_committed());
        assert_eq!(outcome.response, Some(json!({"hello": "world"})));
    }

    #[tokio::test]
    async fn test_unset_response_is_none() {
        let host = ScriptHost::new(Arc::new(MemoryStore::new()), HostConfig::default());
        let outcome = host.run_script(&mut Silent, &coll(), json!(1)).await.unwrap();
        assert!(outcome.is_committed());
        assert!(outcome.response.is_none());
        assert_eq!(outcome.metrics.writes_committed, 0);
    }

    async fn burst_with(order: CompletionOrder, max_in_flight: usize) {
        let store = Arc::new(MemoryStore::new());
        let config = HostConfig::default()
            .with_admission(AdmissionConfig::default().with_max_pending(3))
            .with_max_in_flight(max_in_flight)
            .with_completion_order(order);
        let host = ScriptHost::new(store.clone(), config);

        let mut script = Burst::new(5);
        let outcome = host.run_script(&mut script, &coll(), json!(null)).await.unwrap();

        assert_eq!(script.decisions, [true, true, true, false, false]);
        assert_eq!(
            script.reasons,
            [RejectReason::QueueFull { limit: 3 }, RejectReason::Latched]
        );
        let mut completed = script.completed.clone();
        completed.sort_unstable();
        assert_eq!(completed, [0, 1, 2]);
        if order == CompletionOrder::Submission {
            assert_eq!(script.completed, [0, 1, 2]);
        }

        assert!(outcome.is_committed());
        assert_eq!(outcome.response, Some(json!(3)));
        assert_eq!(outcome.metrics.operations_completed, 3);
        assert_eq!(store.count(&coll()).await, 3);
    }

    #[tokio::test]
    async fn test_pre_rejection_operations_complete_once_in_submission_order() {
        burst_with(CompletionOrder::Submission, 2).await;
    }

    #[tokio::test]
    async fn test_pre_rejection_operations_complete_once_as_completed() {
        burst_with(CompletionOrder::AsCompleted, 3).await;
    }

    #[tokio::test]
    async fn test_callback_error_rolls_back() {
        let store = Arc::new(MemoryStore::new());
        let host = ScriptHost::new(store.clone(), HostConfig::default());

        let outcome = host.run_script(&mut Raises, &coll(), json!(null)).await.unwrap();
        assert!(matches!(
            outcome.status.abort_reason(),
            Some(AbortReason::CallbackFailed { message }) if message == "giving up"
        ));
        assert!(outcome.response.is_none());
        assert_eq!(store.count(&coll()).await, 0);
        assert!(matches!(
            outcome.journal.last(),
            Some(JournalEvent::Aborted { .. })
        ));
    }

    #[tokio::test]
    async fn test_deadline_rolls_back() {
        let clock = ManualClock::shared();
        let memory = Arc::new(MemoryStore::new());
        let store = Arc::new(SimulatedStore::new(memory.clone(), clock.clone()));
        store
            .stall_document(ResourceId::parse("d1").unwrap(), Duration::from_secs(6))
            .await;
        let host = ScriptHost::new(store, HostConfig::default()).with_clock(clock);

        let mut script = Burst::new(3);
        let outcome = host.run_script(&mut script, &coll(), json!(null)).await.unwrap();

        assert_eq!(
            outcome.status.abort_reason(),
            Some(&AbortReason::DeadlineExceeded)
        );
        assert!(outcome.response.is_none());
        // the stalled read of d1 used up the budget; only d0 was delivered
        assert_eq!(script.completed, [0]);
        assert_eq!(memory.count(&coll()).await, 0);
    }

    #[tokio::test]
    async fn test_foreign_collection_is_refused() {
        let host = ScriptHost::new(Arc::new(MemoryStore::new()), HostConfig::default());
        let mut script = Trespass { status: None };
        let outcome = host.run_script(&mut script, &coll(), json!(null)).await.unwrap();
        assert!(outcome.is_committed());
        assert_eq!(script.status, Some(400));
    }

    #[tokio::test]
    async fn test_unknown_procedure() {
        let host = ScriptHost::new(Arc::new(MemoryStore::new()), HostConfig::default());
        let err = host.execute("nope", &coll(), json!(null)).await.unwrap_err();
        assert!(matches!(err, HostError::Registry(RegistryError::NotFound { .. })));
        assert_eq!(CoreError::from(err).status_code(), 404);
    }

    #[tokio::test]
    async fn test_commit_backend_failure_is_host_error() {
        let clock = ManualClock::shared();
        let memory = Arc::new(MemoryStore::new());
        let store = Arc::new(SimulatedStore::new(memory.clone(), clock.clone()));
        store.fail_next_commits(1).await;
        let host = ScriptHost::new(store, HostConfig::default()).with_clock(clock);

        let err = host
            .run_script(&mut Burst::new(1), &coll(), json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Store(StoreError::Backend { .. })));
        assert_eq!(memory.count(&coll()).await, 0);
    }

    #[tokio::test]
    async fn test_journal_tracks_invocation() {
        let host = ScriptHost::new(Arc::new(MemoryStore::new()), HostConfig::default());
        let outcome = host
            .run_script(&mut Burst::new(2), &coll(), json!(null))
            .await
            .unwrap();

        let events: Vec<&str> = outcome
            .journal
            .iter()
            .map(|e| match e {
                JournalEvent::Admitted { .. } => "admitted",
                JournalEvent::Rejected { .. } => "rejected",
                JournalEvent::Completed { .. } => "completed",
                JournalEvent::Committed { .. } => "committed",
                JournalEvent::Aborted { .. } => "aborted",
            })
            .collect();
        assert_eq!(
            events,
            ["admitted", "admitted", "completed", "completed", "committed"]
        );
        assert_eq!(outcome.metrics.writes_committed, 2);
    }

    /// Store whose calls never return
    #[derive(Debug)]
    struct Hung;

    #[async_trait]
    impl DocumentStore for Hung {
        async fn get_document(
            &self,
            _: &CollectionLink,
            _: &ResourceId,
        ) -> Result<Option<Document>, StoreError> {
            futures::future::pending().await
        }

        async fn scan_documents(
            &self,
            _: &CollectionLink,
            _: Option<&ResourceId>,
            _: usize,
        ) -> Result<Vec<Document>, StoreError> {
            futures::future::pending().await
        }

        async fn get_attachment(
            &self,
            _: &CollectionLink,
            _: &ResourceId,
            _: &ResourceId,
        ) -> Result<Option<Attachment>, StoreError> {
            futures::future::pending().await
        }

        async fn list_attachments(
            &self,
            _: &CollectionLink,
            _: &ResourceId,
        ) -> Result<Vec<Attachment>, StoreError> {
            futures::future::pending().await
        }

        async fn commit(&self, _: WriteBatch) -> Result<CommitReceipt, StoreError> {
            futures::future::pending().await
        }

        async fn stats(&self) -> Result<StoreStats, StoreError> {
            Ok(StoreStats::default())
        }
    }

    #[tokio::test]
    async fn test_hung_store_cannot_outlive_budget() {
        let config = HostConfig::default().with_budget(Duration::from_millis(1_200));
        let host = ScriptHost::new(Arc::new(Hung), config);

        let mut script = Burst::new(1);
        let outcome = host.run_script(&mut script, &coll(), json!(null)).await.unwrap();
        assert_eq!(
            outcome.status.abort_reason(),
            Some(&AbortReason::DeadlineExceeded)
        );
        let timed_out = outcome.journal.iter().any(|e| {
            matches!(e, JournalEvent::Completed { status, .. } if *status == 408)
        });
        assert!(timed_out);
        // the completion was settled but never delivered
        assert!(script.completed.is_empty());
    }

    /// Memory store whose reads of `dN` take `(3 - N) * 60ms` and whose
    /// commit can be made to never return
    #[derive(Debug)]
    struct Sluggish {
        inner: Arc<MemoryStore>,
        hang_commit: bool,
    }

    impl Sluggish {
        fn read_delay(id: &ResourceId) -> Duration {
            let n = id
                .as_str()
                .strip_prefix('d')
                .and_then(|n| n.parse::<u64>().ok())
                .unwrap_or(3);
            Duration::from_millis(3u64.saturating_sub(n) * 60)
        }
    }

    #[async_trait]
    impl DocumentStore for Sluggish {
        async fn get_document(
            &self,
            collection: &CollectionLink,
            id: &ResourceId,
        ) -> Result<Option<Document>, StoreError> {
            tokio::time::sleep(Self::read_delay(id)).await;
            self.inner.get_document(collection, id).await
        }

        async fn scan_documents(
            &self,
            collection: &CollectionLink,
            after: Option<&ResourceId>,
            limit: usize,
        ) -> Result<Vec<Document>, StoreError> {
            self.inner.scan_documents(collection, after, limit).await
        }

        async fn get_attachment(
            &self,
            collection: &CollectionLink,
            document: &ResourceId,
            id: &ResourceId,
        ) -> Result<Option<Attachment>, StoreError> {
            self.inner.get_attachment(collection, document, id).await
        }

        async fn list_attachments(
            &self,
            collection: &CollectionLink,
            document: &ResourceId,
        ) -> Result<Vec<Attachment>, StoreError> {
            self.inner.list_attachments(collection, document).await
        }

        async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
            if self.hang_commit {
                futures::future::pending::<()>().await;
            }
            self.inner.commit(batch).await
        }

        async fn stats(&self) -> Result<StoreStats, StoreError> {
            self.inner.stats().await
        }
    }

    #[tokio::test]
    async fn test_hung_commit_cannot_outlive_budget() {
        let memory = Arc::new(MemoryStore::new());
        let store = Arc::new(Sluggish {
            inner: memory.clone(),
            hang_commit: true,
        });
        let config = HostConfig::default().with_budget(Duration::from_millis(1_200));
        let host = ScriptHost::new(store, config);

        let started = std::time::Instant::now();
        let mut script = Burst::new(1);
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            host.run_script(&mut script, &coll(), json!(null)),
        )
        .await
        .expect("invocation outlived its budget");

        let err = result.unwrap_err();
        assert!(matches!(err, HostError::CommitTimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(script.completed, [0]);
        assert_eq!(CoreError::from(err).status_code(), 408);
        assert_eq!(memory.count(&coll()).await, 0);
    }

    async fn staggered(order: CompletionOrder) -> Vec<CallbackTag> {
        let memory = Arc::new(MemoryStore::new());
        let store = Arc::new(Sluggish {
            inner: memory.clone(),
            hang_commit: false,
        });
        let config = HostConfig::default()
            .with_max_in_flight(3)
            .with_completion_order(order);
        let host = ScriptHost::new(store, config);

        let mut script = Burst::new(3);
        let outcome = host.run_script(&mut script, &coll(), json!(null)).await.unwrap();
        assert!(outcome.is_committed());
        assert_eq!(memory.count(&coll()).await, 3);
        script.completed
    }

    #[tokio::test]
    async fn test_submission_order_holds_back_early_finishers() {
        // d2 finishes first, d0 last
        assert_eq!(staggered(CompletionOrder::Submission).await, [0, 1, 2]);
    }

    #[tokio::test]
    async fn test_as_completed_delivers_in_finish_order() {
        assert_eq!(staggered(CompletionOrder::AsCompleted).await, [2, 1, 0]);
    }

    #[test]
    fn test_host_config_defaults_and_serde() {
        let config = HostConfig::default();
        assert_eq!(config.budget(), DEFAULT_BUDGET);
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.completion_order, CompletionOrder::Submission);

        let parsed: HostConfig =
            serde_json::from_value(json!({"budget_ms": 250, "completion_order": "asCompleted"}))
                .unwrap();
        assert_eq!(parsed.budget(), Duration::from_millis(250));
        assert_eq!(parsed.completion_order, CompletionOrder::AsCompleted);
        assert_eq!(parsed.admission, AdmissionConfig::default());
    }
}

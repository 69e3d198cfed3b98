//! End-to-end orchestrator scenarios, wiring the in-memory `Store` and
//! `Transport` reference implementations together the way a real
//! application would via `Bus`/`Orchestrator`, without any mocking of
//! the runtime's own seams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use saga_runtime::{
    DefinitionRegistry, Envelope, HandlerError, MessageTypeMatch, Orchestrator, Outcome,
    RetryPolicy, SagaContext, SagaDefinitionBuilder, SagaHandler, Scheduler, Store, StoreGateway,
    StoreError, Transport,
};
use saga_runtime::scheduler::TimeoutNotifier;
use saga_runtime::store::memory::MemoryStore;
use saga_runtime::transport::memory::MemoryTransport;
use saga_runtime::transport::{SubscribeOptions, SubscriptionHandler};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct OrderData {
    order_id: String,
    status: String,
    retries_seen: u32,
}

struct MarkPaid;

#[async_trait]
impl SagaHandler<OrderData> for MarkPaid {
    async fn handle(&self, _payload: Value, mut state: OrderData, _ctx: &mut SagaContext) -> Result<OrderData, HandlerError> {
        state.status = "paid".into();
        Ok(state)
    }
}

struct Unchanged;

#[async_trait]
impl SagaHandler<OrderData> for Unchanged {
    async fn handle(&self, _payload: Value, state: OrderData, _ctx: &mut SagaContext) -> Result<OrderData, HandlerError> {
        Ok(state)
    }
}

/// Records one call per invocation and bumps `retries_seen`, so a test
/// can see how many times the full pipeline re-ran under a concurrency
/// conflict.
struct CountingHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl SagaHandler<OrderData> for CountingHandler {
    async fn handle(&self, _payload: Value, mut state: OrderData, _ctx: &mut SagaContext) -> Result<OrderData, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        state.retries_seen += 1;
        Ok(state)
    }
}

struct PublishesAndSchedules;

#[async_trait]
impl SagaHandler<OrderData> for PublishesAndSchedules {
    async fn handle(&self, _payload: Value, state: OrderData, ctx: &mut SagaContext) -> Result<OrderData, HandlerError> {
        ctx.publish("OrderConfirmed", serde_json::json!({"orderId": state.order_id}));
        ctx.schedule("ReminderDue", serde_json::json!({"orderId": state.order_id}), 0);
        Ok(state)
    }
}

/// Reads `orderId` off ordinary domain envelopes, falling back to
/// `correlationId` for the synthetic `SagaTimeoutExpired` envelope
/// (whose payload carries no `orderId` field — see `Envelope::timeout_expired`).
fn order_id_extractor() -> Arc<dyn Fn(&Envelope) -> Option<String> + Send + Sync> {
    Arc::new(|e: &Envelope| {
        e.payload
            .get("orderId")
            .or_else(|| e.payload.get("correlationId"))
            .and_then(|v| v.as_str())
            .map(String::from)
    })
}

fn order_saga_with_handlers(handlers: Vec<(&str, Arc<dyn SagaHandler<OrderData>>)>) -> saga_runtime::SagaDefinition<OrderData> {
    let mut builder = SagaDefinitionBuilder::<OrderData>::new("OrderSaga")
        .correlation_rule(MessageTypeMatch::Exact("OrderSubmitted".into()), order_id_extractor(), true)
        .correlation_rule(MessageTypeMatch::Wildcard, order_id_extractor(), false)
        .initial_factory(Arc::new(|e: &Envelope| OrderData {
            order_id: e.payload.get("orderId").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            status: "pending".into(),
            retries_seen: 0,
        }));
    for (message_type, handler) in handlers {
        builder = builder.handler(message_type, None, handler);
    }
    builder.build().expect("valid definition")
}

fn harness(def: saga_runtime::SagaDefinition<OrderData>) -> (Arc<Orchestrator>, Arc<MemoryTransport>, Arc<StoreGateway>) {
    let mut registry = DefinitionRegistry::new();
    registry.register(def).unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let store = Arc::new(StoreGateway::new(Arc::new(MemoryStore::new())));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(registry),
        store.clone(),
        transport.clone(),
        Vec::new(),
        RetryPolicy::default(),
    ));
    (orchestrator, transport, store)
}

#[tokio::test]
async fn correlated_envelope_creates_then_updates_the_same_instance() {
    let (orchestrator, _transport, _store) = harness(order_saga_with_handlers(vec![("PaymentCaptured", Arc::new(MarkPaid))]));

    let results = orchestrator
        .dispatch(Envelope::new("OrderSubmitted", serde_json::json!({"orderId": "A"})))
        .await;
    let (_, outcome) = &results[0];
    let Outcome::Created { saga_id } = outcome.as_ref().unwrap().clone() else {
        panic!("expected Created, got {:?}", outcome);
    };

    let results = orchestrator
        .dispatch(Envelope::new("PaymentCaptured", serde_json::json!({"orderId": "A"})))
        .await;
    let (_, outcome) = &results[0];
    match outcome.as_ref().unwrap() {
        Outcome::Updated { saga_id: updated_id, version } => {
            assert_eq!(updated_id, &saga_id);
            assert_eq!(*version, 1);
        }
        other => panic!("expected Updated, got {other:?}"),
    }
}

#[tokio::test]
async fn non_start_rule_without_existing_instance_requires_start() {
    let (orchestrator, _transport, _store) = harness(order_saga_with_handlers(vec![("PaymentCaptured", Arc::new(MarkPaid))]));

    let results = orchestrator
        .dispatch(Envelope::new("PaymentCaptured", serde_json::json!({"orderId": "never-started"})))
        .await;
    assert_eq!(results[0].1.as_ref().unwrap(), &Outcome::StartRequired);
}

#[tokio::test]
async fn update_with_no_matching_handler_leaves_the_store_unchanged() {
    let (orchestrator, _transport, store) = harness(order_saga_with_handlers(vec![("PaymentCaptured", Arc::new(MarkPaid))]));

    orchestrator
        .dispatch(Envelope::new("OrderSubmitted", serde_json::json!({"orderId": "A"})))
        .await;

    let before = store.load_by_correlation("OrderSaga", "A").await.unwrap().unwrap();

    let results = orchestrator
        .dispatch(Envelope::new("UnrelatedEvent", serde_json::json!({"orderId": "A"})))
        .await;
    assert_eq!(results[0].1.as_ref().unwrap(), &Outcome::NoHandlerMatch);

    let after = store.load_by_correlation("OrderSaga", "A").await.unwrap().unwrap();
    assert_eq!(before.metadata.version, after.metadata.version);
    assert_eq!(before.data, after.data);
}

#[tokio::test]
async fn creation_with_no_matching_starter_handler_still_commits_the_initial_state() {
    // "PaymentCaptured" is the only registered handler; the starter
    // message type "OrderSubmitted" has none. The create path still
    // commits the factory's initial state (the "pure creation" reading
    // of the spec's worked example, see DESIGN.md Open Question 5).
    let (orchestrator, _transport, store) = harness(order_saga_with_handlers(vec![("PaymentCaptured", Arc::new(MarkPaid))]));

    let results = orchestrator
        .dispatch(Envelope::new("OrderSubmitted", serde_json::json!({"orderId": "A"})))
        .await;
    assert!(matches!(results[0].1.as_ref().unwrap(), Outcome::Created { .. }));

    let stored = store.load_by_correlation("OrderSaga", "A").await.unwrap().unwrap();
    let data: OrderData = serde_json::from_value(stored.data).unwrap();
    assert_eq!(data.status, "pending");
    assert_eq!(stored.metadata.version, 0);
}

#[tokio::test]
async fn handler_returning_unchanged_state_still_increments_version() {
    let (orchestrator, _transport, store) = harness(order_saga_with_handlers(vec![("Touch", Arc::new(Unchanged))]));

    orchestrator
        .dispatch(Envelope::new("OrderSubmitted", serde_json::json!({"orderId": "A"})))
        .await;
    orchestrator
        .dispatch(Envelope::new("Touch", serde_json::json!({"orderId": "A"})))
        .await;

    let stored = store.load_by_correlation("OrderSaga", "A").await.unwrap().unwrap();
    assert_eq!(stored.metadata.version, 1);
}

/// Wraps a real `MemoryStore` and, on the first `update` call only,
/// commits a phantom competing write directly through the inner store
/// before letting the real call through — deterministically
/// reproducing the "another process committed between load and
/// commit" race the Orchestrator's retry loop exists for (spec §4.D
/// Step 6), rather than depending on actual thread scheduling.
struct ConflictOnceStore {
    inner: MemoryStore,
    conflicted: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl Store for ConflictOnceStore {
    async fn load_by_correlation(&self, saga_name: &str, correlation_id: &str) -> saga_runtime::store::Result<Option<saga_runtime::state::StoredState>> {
        self.inner.load_by_correlation(saga_name, correlation_id).await
    }
    async fn load_by_id(&self, saga_name: &str, saga_id: &str) -> saga_runtime::store::Result<Option<saga_runtime::state::StoredState>> {
        self.inner.load_by_id(saga_name, saga_id).await
    }
    async fn insert(&self, saga_name: &str, correlation_id: &str, state: saga_runtime::state::StoredState) -> saga_runtime::store::Result<()> {
        self.inner.insert(saga_name, correlation_id, state).await
    }
    async fn update(&self, saga_name: &str, saga_id: &str, expected_version: u64, state: saga_runtime::state::StoredState) -> saga_runtime::store::Result<()> {
        if !self.conflicted.swap(true, Ordering::SeqCst) {
            if let Some(mut phantom) = self.inner.load_by_id(saga_name, saga_id).await.unwrap() {
                phantom.metadata.version += 1;
                self.inner.update(saga_name, saga_id, expected_version, phantom).await.unwrap();
            }
        }
        self.inner.update(saga_name, saga_id, expected_version, state).await
    }
    async fn delete(&self, saga_name: &str, saga_id: &str) -> saga_runtime::store::Result<()> {
        self.inner.delete(saga_name, saga_id).await
    }
    async fn active_with_timeout_before(&self, saga_name: &str, horizon: chrono::DateTime<chrono::Utc>) -> saga_runtime::store::Result<Vec<saga_runtime::state::StoredState>> {
        self.inner.active_with_timeout_before(saga_name, horizon).await
    }
}

#[tokio::test]
async fn concurrency_conflict_retries_and_eventually_commits() {
    let calls = Arc::new(AtomicUsize::new(0));
    let def = order_saga_with_handlers(vec![("Bump", Arc::new(CountingHandler { calls: calls.clone() }))]);

    let mut registry = DefinitionRegistry::new();
    registry.register(def).unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let store = Arc::new(StoreGateway::new(Arc::new(ConflictOnceStore {
        inner: MemoryStore::new(),
        conflicted: std::sync::atomic::AtomicBool::new(false),
    })));
    let orchestrator = Orchestrator::new(Arc::new(registry), store.clone(), transport, Vec::new(), RetryPolicy::default());

    orchestrator
        .dispatch(Envelope::new("OrderSubmitted", serde_json::json!({"orderId": "A"})))
        .await;

    let results = orchestrator
        .dispatch(Envelope::new("Bump", serde_json::json!({"orderId": "A"})))
        .await;

    assert!(matches!(results[0].1, Ok(Outcome::Updated { version: 2, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2, "the handler must re-run once against the reloaded state after the conflict");

    let stored = store.load_by_correlation("OrderSaga", "A").await.unwrap().unwrap();
    assert_eq!(stored.metadata.version, 2);
}

#[tokio::test]
async fn retry_budget_exhaustion_surfaces_as_an_error() {
    // A permanently conflicting store (every update reports the wrong
    // version) exhausts the bounded retry budget instead of looping
    // forever.
    struct AlwaysConflicts;
    #[async_trait]
    impl Store for AlwaysConflicts {
        async fn load_by_correlation(&self, _s: &str, _c: &str) -> saga_runtime::store::Result<Option<saga_runtime::state::StoredState>> {
            Ok(Some(saga_runtime::state::StoredState {
                metadata: saga_runtime::state::SagaMetadata::new("saga-1"),
                correlation_id: "A".to_string(),
                data: serde_json::to_value(OrderData { order_id: "A".into(), status: "pending".into(), retries_seen: 0 }).unwrap(),
            }))
        }
        async fn load_by_id(&self, _s: &str, _i: &str) -> saga_runtime::store::Result<Option<saga_runtime::state::StoredState>> {
            self.load_by_correlation(_s, _i).await
        }
        async fn insert(&self, _s: &str, _c: &str, _state: saga_runtime::state::StoredState) -> saga_runtime::store::Result<()> {
            Ok(())
        }
        async fn update(&self, _s: &str, _i: &str, _v: u64, _state: saga_runtime::state::StoredState) -> saga_runtime::store::Result<()> {
            Err(StoreError::ConcurrencyConflict { expected: _v, actual: _v + 1 })
        }
        async fn delete(&self, _s: &str, _i: &str) -> saga_runtime::store::Result<()> {
            Ok(())
        }
        async fn active_with_timeout_before(&self, _s: &str, _h: chrono::DateTime<chrono::Utc>) -> saga_runtime::store::Result<Vec<saga_runtime::state::StoredState>> {
            Ok(Vec::new())
        }
    }

    let mut registry = DefinitionRegistry::new();
    registry
        .register(order_saga_with_handlers(vec![("Bump", Arc::new(Unchanged))]))
        .unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let store = Arc::new(StoreGateway::new(Arc::new(AlwaysConflicts)));
    let retry_policy = RetryPolicy { base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), max_retries: 2, jitter: 0.0 };
    let orchestrator = Orchestrator::new(Arc::new(registry), store, transport, Vec::new(), retry_policy);

    let results = orchestrator.dispatch(Envelope::new("Bump", serde_json::json!({"orderId": "A"}))).await;
    assert!(matches!(
        results[0].1,
        Err(saga_runtime::OrchestratorError::ConcurrencyExhausted { attempts: 3 })
    ));
}

#[tokio::test]
async fn effects_are_not_dispatched_when_the_commit_fails() {
    struct RejectsSecondUpdate;
    #[async_trait]
    impl Store for RejectsSecondUpdate {
        async fn load_by_correlation(&self, _s: &str, _c: &str) -> saga_runtime::store::Result<Option<saga_runtime::state::StoredState>> {
            Ok(Some(saga_runtime::state::StoredState {
                metadata: saga_runtime::state::SagaMetadata::new("saga-1"),
                correlation_id: "A".to_string(),
                data: serde_json::to_value(OrderData { order_id: "A".into(), status: "pending".into(), retries_seen: 0 }).unwrap(),
            }))
        }
        async fn load_by_id(&self, s: &str, i: &str) -> saga_runtime::store::Result<Option<saga_runtime::state::StoredState>> {
            self.load_by_correlation(s, i).await
        }
        async fn insert(&self, _s: &str, _c: &str, _state: saga_runtime::state::StoredState) -> saga_runtime::store::Result<()> {
            Ok(())
        }
        async fn update(&self, _s: &str, _i: &str, v: u64, _state: saga_runtime::state::StoredState) -> saga_runtime::store::Result<()> {
            Err(StoreError::ConcurrencyConflict { expected: v, actual: v + 1 })
        }
        async fn delete(&self, _s: &str, _i: &str) -> saga_runtime::store::Result<()> {
            Ok(())
        }
        async fn active_with_timeout_before(&self, _s: &str, _h: chrono::DateTime<chrono::Utc>) -> saga_runtime::store::Result<Vec<saga_runtime::state::StoredState>> {
            Ok(Vec::new())
        }
    }

    let mut registry = DefinitionRegistry::new();
    registry
        .register(order_saga_with_handlers(vec![("Bump", Arc::new(PublishesAndSchedules))]))
        .unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let published = Arc::new(AtomicUsize::new(0));
    struct Counter(Arc<AtomicUsize>);
    impl SubscriptionHandler for Counter {
        fn handle(&self, _envelope: Envelope) -> BoxFuture<'static, saga_runtime::transport::Result<()>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }
    transport.start().await.unwrap();
    transport
        .subscribe(SubscribeOptions::default(), Box::new(Counter(published.clone())))
        .await
        .unwrap();

    let store = Arc::new(StoreGateway::new(Arc::new(RejectsSecondUpdate)));
    let retry_policy = RetryPolicy { base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(1), max_retries: 0, jitter: 0.0 };
    let orchestrator = Orchestrator::new(Arc::new(registry), store, transport, Vec::new(), retry_policy);

    let results = orchestrator.dispatch(Envelope::new("Bump", serde_json::json!({"orderId": "A"}))).await;
    assert!(results[0].1.is_err());
    assert_eq!(published.load(Ordering::SeqCst), 0, "effects must not dispatch when the commit never lands");
}

#[tokio::test]
async fn elapsed_timeout_is_delivered_as_a_synthetic_envelope() {
    struct ExpireNow;
    #[async_trait]
    impl SagaHandler<OrderData> for ExpireNow {
        async fn handle(&self, _p: Value, mut state: OrderData, _ctx: &mut SagaContext) -> Result<OrderData, HandlerError> {
            state.status = "expired".into();
            Ok(state)
        }
    }

    let def = order_saga_with_handlers(vec![(saga_runtime::SAGA_TIMEOUT_EXPIRED, Arc::new(ExpireNow))]);
    let (orchestrator, transport, store) = harness(def);

    orchestrator
        .dispatch(Envelope::new("OrderSubmitted", serde_json::json!({"orderId": "A"})))
        .await;

    let mut registry = DefinitionRegistry::new();
    registry
        .register(order_saga_with_handlers(vec![(saga_runtime::SAGA_TIMEOUT_EXPIRED, Arc::new(ExpireNow))]))
        .unwrap();
    let scheduler = Arc::new(Scheduler::new(
        transport.clone(),
        store.clone(),
        Arc::new(registry),
        saga_runtime::config::SchedulerConfig { sweep_horizon_ms: 3_600_000, poll_interval_ms: 5 },
    ));

    transport.start().await.unwrap();
    transport
        .subscribe(
            SubscribeOptions::default(),
            Box::new(OrchestratorRelay { orchestrator: orchestrator.clone() }),
        )
        .await
        .unwrap();

    scheduler.schedule("OrderSaga", "A", chrono::Utc::now() - chrono::Duration::seconds(1)).await;
    let _ticker = scheduler.clone().spawn();

    // Give the consumer task a couple of poll intervals to notice the
    // due entry, publish it, and let the relayed dispatch (spawned
    // inside `MemoryTransport::publish`) run to completion.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stored = store.load_by_correlation("OrderSaga", "A").await.unwrap().unwrap();
    let data: OrderData = serde_json::from_value(stored.data).unwrap();
    assert_eq!(data.status, "expired");
}

struct OrchestratorRelay {
    orchestrator: Arc<Orchestrator>,
}

impl SubscriptionHandler for OrchestratorRelay {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, saga_runtime::transport::Result<()>> {
        let orchestrator = self.orchestrator.clone();
        Box::pin(async move {
            orchestrator.dispatch(envelope).await;
            Ok(())
        })
    }
}

#[tokio::test]
async fn timeout_notifier_cancel_prevents_a_scheduled_timeout_from_firing() {
    let transport = Arc::new(MemoryTransport::new());
    let registry = Arc::new(DefinitionRegistry::new());
    let store = Arc::new(StoreGateway::new(Arc::new(MemoryStore::new())));
    let scheduler = Arc::new(Scheduler::new(
        transport.clone(),
        store,
        registry,
        saga_runtime::config::SchedulerConfig { sweep_horizon_ms: 3_600_000, poll_interval_ms: 5 },
    ));

    transport.start().await.unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    struct Counter(Arc<AtomicUsize>);
    impl SubscriptionHandler for Counter {
        fn handle(&self, _envelope: Envelope) -> BoxFuture<'static, saga_runtime::transport::Result<()>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }
    transport
        .subscribe(SubscribeOptions::default(), Box::new(Counter(count.clone())))
        .await
        .unwrap();

    scheduler.schedule("OrderSaga", "A", chrono::Utc::now() - chrono::Duration::seconds(1)).await;
    scheduler.cancel("OrderSaga", "A").await;
    let _ticker = scheduler.clone().spawn();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn schedule_effect_with_zero_delay_is_delivered_synchronously() {
    let def = order_saga_with_handlers(vec![("Bump", Arc::new(PublishesAndSchedules))]);
    let (orchestrator, transport, _store) = harness(def);

    orchestrator
        .dispatch(Envelope::new("OrderSubmitted", serde_json::json!({"orderId": "A"})))
        .await;

    let count = Arc::new(AtomicUsize::new(0));
    struct Counter(Arc<AtomicUsize>);
    impl SubscriptionHandler for Counter {
        fn handle(&self, _envelope: Envelope) -> BoxFuture<'static, saga_runtime::transport::Result<()>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }
    transport.start().await.unwrap();
    transport
        .subscribe(SubscribeOptions::default(), Box::new(Counter(count.clone())))
        .await
        .unwrap();

    orchestrator
        .dispatch(Envelope::new("Bump", serde_json::json!({"orderId": "A"})))
        .await;

    // Both the immediate publish and the zero-delay schedule land
    // synchronously before `dispatch` returns (spec §8: "delay=0 on
    // schedule behaves like publish").
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

//! The Orchestrator: the 8-step message-to-saga transaction (spec
//! §4.D). Resolves correlation, establishes mutual exclusion, loads or
//! creates instance state, runs the middleware chain around the
//! selected handler, commits with optimistic-concurrency retry, then
//! dispatches buffered effects and releases the lock.
//!
//! Grounded on the teacher's `InProcessEventBus::publish` loop
//! (`src/bus/in_process.rs`) for the shape of "resolve interested
//! handlers, invoke each, handle success/failure per handler" — here
//! specialized to exactly one matching saga definition per delivery
//! instead of a fan-out list, since saga correlation (unlike projector
//! domain filtering) is keyed uniquely by `(sagaName, correlationId)`.

pub mod lock;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::{Effect, MetadataPatch, SagaContext};
use crate::definition::{DefinitionRegistry, ErasedDefinition, HandlerInvocationError};
use crate::envelope::Envelope;
use crate::error::{OrchestratorError, StoreError};
use crate::middleware::{Middleware, Next, PipelineContext};
use crate::retry::RetryPolicy;
use crate::scheduler::TimeoutNotifier;
use crate::state::{SagaMetadata, StoredState};
use crate::store::gateway::StoreGateway;
use crate::transport::{PublishOptions, Transport};

use self::lock::LockTable;

/// What happened to a single `(definition, envelope)` pairing. The
/// "drop silently" rows of spec §7 (`RoutingMiss`, `StartRequired`,
/// no-handler-match) are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No correlation rule on this definition matched the envelope
    /// (wrong message type, or the extractor returned `None`).
    RoutingMiss,
    /// A rule matched, no instance exists yet, and the rule is not
    /// `canStart` (spec §4.D Step 2).
    StartRequired,
    /// An existing instance was resolved but no handler entry matched
    /// the envelope's type (spec §3: "dropped silently").
    NoHandlerMatch,
    Created { saga_id: String },
    Updated { saga_id: String, version: u64 },
}

/// Terminal step of the middleware chain: runs the selected handler
/// via the erased definition and records its outcome on the
/// `PipelineContext` (spec §4.C: "the innermost call runs the selected
/// handler"). Appended by the Orchestrator to every invocation's
/// middleware list; never registered by saga authors directly.
struct HandlerInvocation {
    definition: Arc<dyn ErasedDefinition>,
    message_type: String,
    payload: Value,
}

#[async_trait]
impl Middleware for HandlerInvocation {
    async fn handle(&self, ctx: &mut PipelineContext, _next: Next<'_>) -> Result<(), OrchestratorError> {
        let state = ctx.pre_state.clone().unwrap_or(Value::Null);
        match self
            .definition
            .invoke_handler(&self.message_type, self.payload.clone(), state, &mut ctx.saga_context)
            .await
        {
            Ok(Some(new_state)) => {
                ctx.post_state = Some(new_state);
                Ok(())
            }
            Ok(None) => {
                ctx.post_state = None;
                Ok(())
            }
            Err(HandlerInvocationError::Handler(e)) => {
                ctx.error = Some(e.0.clone());
                Err(OrchestratorError::HandlerFailure(e.0))
            }
            Err(HandlerInvocationError::Serialization(e)) => {
                ctx.error = Some(e.to_string());
                Err(OrchestratorError::StoreUnavailable(StoreError::Serialization(e)))
            }
        }
    }
}

/// Result of running the middleware chain once: the handler's output
/// state (`None` if no handler entry matched) plus the effects and
/// metadata patch the handler accumulated on its `SagaContext`.
struct InvocationResult {
    new_state: Option<Value>,
    effects: Vec<Effect>,
    patch: MetadataPatch,
}

pub struct Orchestrator {
    definitions: Arc<DefinitionRegistry>,
    store: Arc<StoreGateway>,
    transport: Arc<dyn Transport>,
    middlewares: Vec<Arc<dyn Middleware>>,
    locks: Arc<LockTable>,
    retry_policy: RetryPolicy,
    timeout_notifier: Option<Arc<dyn TimeoutNotifier>>,
}

impl Orchestrator {
    pub fn new(
        definitions: Arc<DefinitionRegistry>,
        store: Arc<StoreGateway>,
        transport: Arc<dyn Transport>,
        middlewares: Vec<Arc<dyn Middleware>>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            definitions,
            store,
            transport,
            middlewares,
            locks: Arc::new(LockTable::new()),
            retry_policy,
            timeout_notifier: None,
        }
    }

    pub fn with_timeout_notifier(mut self, notifier: Arc<dyn TimeoutNotifier>) -> Self {
        self.timeout_notifier = Some(notifier);
        self
    }

    /// Route `envelope` against every registered definition. Each
    /// definition is processed independently under its own lock; one
    /// definition's error does not prevent others from running.
    pub async fn dispatch(&self, envelope: Envelope) -> Vec<(String, Result<Outcome, OrchestratorError>)> {
        let mut results = Vec::new();
        for definition in self.definitions.iter() {
            let name = definition.name().to_string();
            let result = self.process_one(definition, envelope.clone()).await;
            if let Err(err) = &result {
                warn!(saga = %name, error = %err, "saga processing failed");
            }
            results.push((name, result));
        }
        results
    }

    #[instrument(name = "orchestrator_process_one", skip_all, fields(saga = %definition.name(), message_type = %envelope.message_type))]
    async fn process_one(&self, definition: &Arc<dyn ErasedDefinition>, envelope: Envelope) -> Result<Outcome, OrchestratorError> {
        // Step 1: definition/correlation resolution.
        let Some((correlation_id, can_start)) = definition.resolve_correlation(&envelope) else {
            return Ok(Outcome::RoutingMiss);
        };

        // Step 2: mutual exclusion, then load-or-create.
        let guard = self.locks.acquire(definition.name(), &correlation_id).await;
        let _held = guard.lock().await;

        let existing = self.store.load_by_correlation(definition.name(), &correlation_id).await?;

        match existing {
            None if !can_start => Ok(Outcome::StartRequired),
            None => self.create_instance(definition, &envelope, &correlation_id).await,
            Some(stored) => self.update_instance(definition, &envelope, &correlation_id, stored).await,
        }
    }

    /// Build the per-invocation middleware chain and run it, returning
    /// the handler's output alongside buffered effects/metadata
    /// (spec §4.D Steps 3-5).
    async fn run_pipeline(
        &self,
        definition: &Arc<dyn ErasedDefinition>,
        envelope: &Envelope,
        saga_id: &str,
        correlation_id: &str,
        existing_state: Option<Value>,
        loaded_timeout_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<InvocationResult, OrchestratorError> {
        let saga_context = SagaContext::new(definition.name(), saga_id, correlation_id, envelope.clone(), loaded_timeout_at);
        let mut pipeline_ctx = PipelineContext::new(
            definition.name(),
            correlation_id,
            saga_id,
            envelope.clone(),
            existing_state,
            saga_context,
        );

        let mut chain = self.middlewares.clone();
        chain.push(Arc::new(HandlerInvocation {
            definition: definition.clone(),
            message_type: envelope.message_type.clone(),
            payload: envelope.payload.clone(),
        }));

        Next::new(&chain).run(&mut pipeline_ctx).await?;

        let new_state = pipeline_ctx.post_state;
        let (effects, patch) = pipeline_ctx.saga_context.into_parts();
        Ok(InvocationResult { new_state, effects, patch })
    }

    async fn create_instance(
        &self,
        definition: &Arc<dyn ErasedDefinition>,
        envelope: &Envelope,
        correlation_id: &str,
    ) -> Result<Outcome, OrchestratorError> {
        let saga_id = Uuid::new_v4().to_string();
        let initial_state = definition
            .create_initial(envelope)
            .map_err(|e| OrchestratorError::StoreUnavailable(StoreError::Serialization(e)))?;

        let invocation = self
            .run_pipeline(definition, envelope, &saga_id, correlation_id, Some(initial_state.clone()), None)
            .await?;

        // Pure-creation definitions: no handler registered for the
        // starter message type, the initial state stands unchanged
        // (spec §4.D Step 4 design note).
        let final_state = invocation.new_state.unwrap_or(initial_state);

        let mut metadata = SagaMetadata::new(&saga_id);
        apply_metadata_patch(&mut metadata, &invocation.patch, false);

        let stored = StoredState { metadata, correlation_id: correlation_id.to_string(), data: final_state };
        self.store.insert(definition.name(), correlation_id, stored).await?;

        self.dispatch_effects(invocation.effects).await?;
        self.sync_timeout(definition.name(), correlation_id, invocation.patch.timeout_at).await;

        info!(saga_id = %saga_id, "saga instance created");
        Ok(Outcome::Created { saga_id })
    }

    async fn update_instance(
        &self,
        definition: &Arc<dyn ErasedDefinition>,
        envelope: &Envelope,
        correlation_id: &str,
        mut current: StoredState,
    ) -> Result<Outcome, OrchestratorError> {
        let saga_id = current.metadata.saga_id.clone();
        let mut attempt = 0u32;

        loop {
            let loaded_version = current.metadata.version;
            let loaded_timeout_at = current.metadata.timeout_at;

            let invocation = self
                .run_pipeline(
                    definition,
                    envelope,
                    &saga_id,
                    correlation_id,
                    Some(current.data.clone()),
                    loaded_timeout_at,
                )
                .await?;

            let Some(new_state) = invocation.new_state else {
                return Ok(Outcome::NoHandlerMatch);
            };

            let mut metadata = current.metadata.clone();
            metadata.version += 1;
            apply_metadata_patch(&mut metadata, &invocation.patch, true);

            let next_stored = StoredState { metadata, correlation_id: current.correlation_id.clone(), data: new_state };

            match self.store.commit(definition.name(), &saga_id, loaded_version, next_stored.clone()).await {
                Ok(()) => {
                    self.dispatch_effects(invocation.effects).await?;
                    self.sync_timeout(definition.name(), correlation_id, invocation.patch.timeout_at).await;
                    let version = next_stored.metadata.version;
                    debug!(saga_id = %saga_id, version, "saga instance updated");
                    return Ok(Outcome::Updated { saga_id, version });
                }
                Err(StoreError::ConcurrencyConflict { .. }) if self.retry_policy.should_retry(attempt) => {
                    let delay = self.retry_policy.delay_for_attempt(attempt);
                    warn!(saga_id = %saga_id, attempt, ?delay, "concurrency conflict, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    current = self
                        .store
                        .load_by_id(definition.name(), &saga_id)
                        .await?
                        .ok_or_else(|| StoreError::NotFound {
                            saga_name: definition.name().to_string(),
                            saga_id: saga_id.clone(),
                        })?;
                }
                Err(StoreError::ConcurrencyConflict { .. }) => {
                    return Err(OrchestratorError::ConcurrencyExhausted { attempts: attempt + 1 });
                }
                Err(other) => return Err(OrchestratorError::StoreUnavailable(other)),
            }
        }
    }

    async fn dispatch_effects(&self, effects: Vec<Effect>) -> Result<(), OrchestratorError> {
        for effect in effects {
            let (envelope, options) = match effect {
                Effect::Publish { message_type, payload, endpoint } => {
                    (Envelope::new(message_type, payload), PublishOptions { endpoint, delay: std::time::Duration::ZERO })
                }
                Effect::Schedule { message_type, payload, delay, endpoint } => {
                    (Envelope::new(message_type, payload), PublishOptions { endpoint, delay })
                }
            };
            self.transport
                .publish(envelope, options)
                .await
                .map_err(|e| OrchestratorError::EffectDispatchFailure(e.to_string()))?;
        }
        Ok(())
    }

    async fn sync_timeout(
        &self,
        saga_name: &str,
        correlation_id: &str,
        patch: Option<Option<chrono::DateTime<chrono::Utc>>>,
    ) {
        let Some(notifier) = &self.timeout_notifier else { return };
        match patch {
            Some(Some(at)) => notifier.schedule(saga_name, correlation_id, at).await,
            Some(None) => notifier.cancel(saga_name, correlation_id).await,
            None => {}
        }
    }
}

/// Applies a handler's accumulated `MetadataPatch` to `metadata`.
/// `bump_updated_at` is false on the create path, where
/// `SagaMetadata::new` has already stamped `created_at == updated_at`
/// (spec §3 Lifecycle) and there is no prior commit being mutated.
fn apply_metadata_patch(metadata: &mut SagaMetadata, patch: &MetadataPatch, bump_updated_at: bool) {
    if bump_updated_at {
        metadata.updated_at = chrono::Utc::now();
    }
    if patch.complete_requested {
        metadata.is_completed = true;
    }
    match patch.timeout_at {
        Some(Some(at)) => metadata.timeout_at = Some(at),
        Some(None) => metadata.timeout_at = None,
        None => {}
    }
    for (k, v) in &patch.tags {
        metadata.tags.insert(k.clone(), v.clone());
    }
}

//! Definition Registry (spec §4.A/§4.B): saga definitions, correlation
//! rules, and the handler table, plus the type erasure that lets the
//! Orchestrator hold many differently-typed `SagaDefinition<T>`s in one
//! registry — grounded on the teacher's `Saga`/`SagaHandler` trait
//! objects (`src/interfaces/saga.rs`, `src/standalone/saga_handler.rs`)
//! and its `LocalSagaContextFactory` pattern of an owning struct that
//! produces a boxed trait object per invocation.

pub mod builder;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::SagaContext;
use crate::envelope::Envelope;
use crate::error::DefinitionError;

/// How a correlation rule's `messageType` is matched against an
/// incoming envelope (spec §4.B).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTypeMatch {
    Exact(String),
    /// Matches any message type not claimed by a more specific rule.
    Wildcard,
}

impl MessageTypeMatch {
    fn matches(&self, message_type: &str) -> bool {
        match self {
            MessageTypeMatch::Exact(t) => t == message_type,
            MessageTypeMatch::Wildcard => true,
        }
    }
}

/// Extracts a correlation id from an envelope; `None` means this rule
/// does not apply to this particular envelope even though its message
/// type matched (spec §4.B: "extractor ... may return none").
pub type Extractor = Arc<dyn Fn(&Envelope) -> Option<String> + Send + Sync>;

/// One row of a saga's correlation table.
#[derive(Clone)]
pub struct CorrelationRule {
    message_type: MessageTypeMatch,
    extractor: Extractor,
    /// Whether a message matching this rule may create a new instance
    /// when no existing instance correlates (spec §4.B `canStart`).
    can_start: bool,
}

impl CorrelationRule {
    pub fn new(message_type: MessageTypeMatch, extractor: Extractor, can_start: bool) -> Self {
        Self {
            message_type,
            extractor,
            can_start,
        }
    }

    pub fn can_start(&self) -> bool {
        self.can_start
    }

    /// If this rule's message type matches the envelope, run the
    /// extractor and return `(correlation_id, can_start)`.
    fn resolve(&self, envelope: &Envelope) -> Option<(String, bool)> {
        if !self.message_type.matches(&envelope.message_type) {
            return None;
        }
        (self.extractor)(envelope).map(|id| (id, self.can_start))
    }
}

/// Builds the initial business state for a brand-new saga instance.
pub type InitialFactory<T> = Arc<dyn Fn(&Envelope) -> T + Send + Sync>;

/// Gates whether a handler entry applies to the current state
/// (spec §4.D Step 3, "Guard evaluation").
pub type Guard<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// A handler failed (spec §7 `HandlerFailure`). Carries the author's
/// message; the runtime does not interpret the contents.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// A registered state transition: `handle(payload, state, ctx) -> new state`.
///
/// Implemented directly rather than as a closure alias, following the
/// teacher's `Saga`/`SagaHandler` trait-object style — saga authors
/// write a small struct and `impl SagaHandler<T> for it`, the same
/// shape as the teacher's own saga implementations.
#[async_trait]
pub trait SagaHandler<T>: Send + Sync {
    async fn handle(&self, payload: Value, state: T, ctx: &mut SagaContext) -> Result<T, HandlerError>;
}

struct HandlerEntry<T> {
    guard: Option<Guard<T>>,
    handler: Arc<dyn SagaHandler<T>>,
}

/// A fully-typed saga definition, as a saga author writes it.
///
/// Constructed only via [`builder::SagaDefinitionBuilder`], which
/// enforces spec §4.A's validation rules before a definition can enter
/// a registry.
pub struct SagaDefinition<T> {
    name: String,
    correlation_rules: Vec<CorrelationRule>,
    initial_factory: InitialFactory<T>,
    handlers: HashMap<String, Vec<HandlerEntry<T>>>,
}

/// Type-erased form of a [`SagaDefinition<T>`], stored in the registry
/// so sagas with different state types can live side by side. State is
/// carried across this boundary as `serde_json::Value`, the same
/// erasure the Store Gateway uses (`state::StoredState`).
#[async_trait]
pub trait ErasedDefinition: Send + Sync {
    fn name(&self) -> &str;

    /// Try every correlation rule in order; the first that matches the
    /// envelope's message type and returns `Some` from its extractor
    /// wins (spec §4.B: "first matching rule wins").
    fn resolve_correlation(&self, envelope: &Envelope) -> Option<(String, bool)>;

    fn create_initial(&self, envelope: &Envelope) -> Result<Value, serde_json::Error>;

    /// Select the first handler entry registered for `message_type`
    /// whose guard (if any) passes against the deserialized state, run
    /// it, and return the re-serialized new state. `Ok(None)` means no
    /// handler entry matched — the caller drops the message (spec §3:
    /// "a type with no matching handler is dropped silently").
    async fn invoke_handler(
        &self,
        message_type: &str,
        payload: Value,
        state: Value,
        ctx: &mut SagaContext,
    ) -> Result<Option<Value>, HandlerInvocationError>;
}

/// Errors from within `ErasedDefinition::invoke_handler`: either the
/// state failed to (de)serialize against the author's type, or the
/// handler itself returned an error.
#[derive(Debug, thiserror::Error)]
pub enum HandlerInvocationError {
    #[error("state (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

struct ErasedDefinitionImpl<T> {
    def: SagaDefinition<T>,
}

#[async_trait]
impl<T> ErasedDefinition for ErasedDefinitionImpl<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.def.name
    }

    fn resolve_correlation(&self, envelope: &Envelope) -> Option<(String, bool)> {
        self.def
            .correlation_rules
            .iter()
            .find_map(|rule| rule.resolve(envelope))
    }

    fn create_initial(&self, envelope: &Envelope) -> Result<Value, serde_json::Error> {
        let data = (self.def.initial_factory)(envelope);
        serde_json::to_value(data)
    }

    async fn invoke_handler(
        &self,
        message_type: &str,
        payload: Value,
        state: Value,
        ctx: &mut SagaContext,
    ) -> Result<Option<Value>, HandlerInvocationError> {
        let Some(entries) = self.def.handlers.get(message_type) else {
            return Ok(None);
        };

        let typed_state: T = serde_json::from_value(state)?;

        let mut matched: Option<&HandlerEntry<T>> = None;
        for entry in entries {
            let passes = match &entry.guard {
                Some(guard) => guard(&typed_state),
                None => true,
            };
            if passes {
                matched = Some(entry);
                break;
            }
        }

        let Some(entry) = matched else {
            return Ok(None);
        };

        let new_state = entry.handler.handle(payload, typed_state, ctx).await?;
        Ok(Some(serde_json::to_value(new_state)?))
    }
}

/// Holds every registered saga definition, indexed for the
/// Orchestrator's correlation and dispatch needs.
#[derive(Default)]
pub struct DefinitionRegistry {
    definitions: Vec<Arc<dyn ErasedDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, def: SagaDefinition<T>) -> Result<(), DefinitionError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if self.definitions.iter().any(|d| d.name() == def.name) {
            return Err(DefinitionError::DuplicateName(def.name));
        }
        self.definitions
            .push(Arc::new(ErasedDefinitionImpl { def }));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ErasedDefinition>> {
        self.definitions.iter().find(|d| d.name() == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ErasedDefinition>> {
        self.definitions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::builder::SagaDefinitionBuilder;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderData {
        order_id: String,
        status: String,
    }

    struct MarkPaid;

    #[async_trait]
    impl SagaHandler<OrderData> for MarkPaid {
        async fn handle(
            &self,
            _payload: Value,
            mut state: OrderData,
            _ctx: &mut SagaContext,
        ) -> Result<OrderData, HandlerError> {
            state.status = "paid".into();
            Ok(state)
        }
    }

    fn order_saga() -> SagaDefinition<OrderData> {
        SagaDefinitionBuilder::new("OrderSaga")
            .correlation_rule(
                MessageTypeMatch::Exact("OrderSubmitted".into()),
                Arc::new(|e: &Envelope| e.payload.get("orderId").and_then(|v| v.as_str()).map(String::from)),
                true,
            )
            .correlation_rule(
                MessageTypeMatch::Wildcard,
                Arc::new(|e: &Envelope| e.payload.get("orderId").and_then(|v| v.as_str()).map(String::from)),
                false,
            )
            .initial_factory(Arc::new(|e: &Envelope| OrderData {
                order_id: e
                    .payload
                    .get("orderId")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                status: "pending".into(),
            }))
            .handler("PaymentCaptured", None, Arc::new(MarkPaid))
            .build()
            .expect("valid definition")
    }

    #[test]
    fn correlation_resolves_via_first_matching_rule() {
        let def = order_saga();
        let erased = ErasedDefinitionImpl { def };
        let envelope = Envelope::new("OrderSubmitted", serde_json::json!({"orderId": "A"}));
        let (id, can_start) = erased.resolve_correlation(&envelope).unwrap();
        assert_eq!(id, "A");
        assert!(can_start);
    }

    #[tokio::test]
    async fn invoke_handler_returns_none_when_no_entry_matches() {
        let def = order_saga();
        let erased = ErasedDefinitionImpl { def };
        let state = serde_json::to_value(OrderData {
            order_id: "A".into(),
            status: "pending".into(),
        })
        .unwrap();
        let mut ctx = SagaContext::new(
            "OrderSaga",
            "saga-1",
            "A",
            Envelope::new("OrderSubmitted", serde_json::json!({})),
            None,
        );
        let result = erased
            .invoke_handler("OrderSubmitted", serde_json::json!({}), state, &mut ctx)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn invoke_handler_runs_matching_entry() {
        let def = order_saga();
        let erased = ErasedDefinitionImpl { def };
        let state = serde_json::to_value(OrderData {
            order_id: "A".into(),
            status: "pending".into(),
        })
        .unwrap();
        let mut ctx = SagaContext::new(
            "OrderSaga",
            "saga-1",
            "A",
            Envelope::new("PaymentCaptured", serde_json::json!({})),
            None,
        );
        let result = erased
            .invoke_handler("PaymentCaptured", serde_json::json!({}), state, &mut ctx)
            .await
            .unwrap()
            .unwrap();
        let data: OrderData = serde_json::from_value(result).unwrap();
        assert_eq!(data.status, "paid");
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = DefinitionRegistry::new();
        registry.register(order_saga()).unwrap();
        let err = registry.register(order_saga()).unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateName(_)));
    }
}

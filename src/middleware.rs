//! Middleware pipeline (spec §4.C): cross-cutting concerns wrapped
//! around handler invocation, composed outside-in.
//!
//! Grounded on the teacher's decorator/"advice" pattern
//! (`src/advice/mod.rs`, `Instrumented`) for the idea of transparent
//! wrapper behavior, generalized here into a chain with an explicit
//! `Next` continuation (the shape concrete observability/tracing
//! middleware bodies are out of scope for — spec Non-goals — but the
//! chain mechanism itself is ambient plumbing, not a feature).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::SagaContext;
use crate::envelope::Envelope;
use crate::error::OrchestratorError;

/// What every middleware in the chain sees and may mutate
/// (spec §4.C): the envelope and correlation identity, the state
/// before and after the handler ran, a free-form metadata bag, and an
/// error slot a middleware can inspect or set.
///
/// Carries the handler-facing [`SagaContext`] so the terminal
/// middleware (handler invocation, appended by the Orchestrator) can
/// reach it; ordinary middleware only touches the fields above it.
pub struct PipelineContext {
    pub envelope: Envelope,
    pub saga_name: String,
    pub correlation_id: String,
    pub saga_id: String,
    /// State as loaded from the store, before the handler runs.
    pub existing_state: Option<Value>,
    /// Alias for `existing_state` at the point a middleware runs
    /// before the handler (spec §4.C "preState").
    pub pre_state: Option<Value>,
    /// The handler's returned state, populated after invocation.
    pub post_state: Option<Value>,
    pub metadata: BTreeMap<String, Value>,
    pub error: Option<String>,
    pub saga_context: SagaContext,
}

impl PipelineContext {
    pub fn new(
        saga_name: impl Into<String>,
        correlation_id: impl Into<String>,
        saga_id: impl Into<String>,
        envelope: Envelope,
        existing_state: Option<Value>,
        saga_context: SagaContext,
    ) -> Self {
        Self {
            envelope,
            saga_name: saga_name.into(),
            correlation_id: correlation_id.into(),
            saga_id: saga_id.into(),
            pre_state: existing_state.clone(),
            existing_state,
            post_state: None,
            metadata: BTreeMap::new(),
            error: None,
            saga_context,
        }
    }
}

/// One step of the middleware chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Run this middleware's before-logic, call `next.run(ctx)` to
    /// continue the chain (or skip it to short-circuit), then run any
    /// after-logic.
    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), OrchestratorError>;
}

/// The remainder of the middleware chain. Calling `run` invokes the
/// next middleware, or, once the chain is exhausted, the terminal step
/// the Orchestrator appends (handler invocation).
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>]) -> Self {
        Self { chain }
    }

    pub async fn run(self, ctx: &mut PipelineContext) -> Result<(), OrchestratorError> {
        match self.chain.split_first() {
            Some((mw, rest)) => mw.handle(ctx, Next { chain: rest }).await,
            None => Ok(()),
        }
    }
}

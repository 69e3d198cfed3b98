//! Minimal saga definition builder.
//!
//! Deliberately NOT a fluent/typestate DSL (out of scope per spec
//! Non-goals) — a plain ordered builder, matching the teacher's
//! `LocalSagaContextFactory::new(...)` style of assembling a struct
//! from explicit constructor arguments rather than chained generics.

use std::collections::HashMap;
use std::sync::Arc;

use crate::envelope::Envelope;
use crate::error::DefinitionError;

use super::{CorrelationRule, Extractor, Guard, InitialFactory, MessageTypeMatch, SagaDefinition, SagaHandler};

pub struct SagaDefinitionBuilder<T> {
    name: String,
    correlation_rules: Vec<CorrelationRule>,
    initial_factory: Option<InitialFactory<T>>,
    handlers: HashMap<String, Vec<super::HandlerEntry<T>>>,
}

impl<T> SagaDefinitionBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            correlation_rules: Vec::new(),
            initial_factory: None,
            handlers: HashMap::new(),
        }
    }

    pub fn correlation_rule(mut self, message_type: MessageTypeMatch, extractor: Extractor, can_start: bool) -> Self {
        self.correlation_rules
            .push(CorrelationRule::new(message_type, extractor, can_start));
        self
    }

    pub fn initial_factory(mut self, factory: InitialFactory<T>) -> Self {
        self.initial_factory = Some(factory);
        self
    }

    /// Register a handler for `message_type`. Entries for the same
    /// message type are tried in registration order; the first whose
    /// guard passes (or that has no guard) wins (spec §4.D Step 3).
    pub fn handler(
        mut self,
        message_type: impl Into<String>,
        guard: Option<Guard<T>>,
        handler: Arc<dyn SagaHandler<T>>,
    ) -> Self {
        self.handlers
            .entry(message_type.into())
            .or_default()
            .push(super::HandlerEntry { guard, handler });
        self
    }

    pub fn build(self) -> Result<SagaDefinition<T>, DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if !self.correlation_rules.iter().any(|r| r.can_start()) {
            return Err(DefinitionError::NoStartRule(self.name));
        }
        let initial_factory = self
            .initial_factory
            .ok_or_else(|| DefinitionError::MissingInitialFactory(self.name.clone()))?;
        if self.handlers.is_empty() {
            return Err(DefinitionError::EmptyHandlerTable(self.name));
        }

        Ok(SagaDefinition {
            name: self.name,
            correlation_rules: self.correlation_rules,
            initial_factory,
            handlers: self.handlers,
        })
    }
}

//! `SagaContext`: the operations surface handlers call (spec §4.D).
//!
//! All operations here mutate only an in-memory effect buffer and a
//! metadata patch (spec §4.D Step 5, "Effect buffering"). Nothing is
//! observable outside the process until the Orchestrator commits.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::envelope::Envelope;

/// A publish or schedule recorded during a handler invocation, drained
/// by the Orchestrator after a successful commit (spec §4.D Step 7).
#[derive(Debug, Clone)]
pub enum Effect {
    /// Publish immediately on the given endpoint (`None` = default).
    Publish {
        message_type: String,
        payload: Value,
        endpoint: Option<String>,
    },
    /// Publish after `delay`. A `delay` of zero is equivalent to an
    /// immediate publish (spec §8 boundary behavior).
    Schedule {
        message_type: String,
        payload: Value,
        delay: Duration,
        endpoint: Option<String>,
    },
}

/// Patch to `SagaMetadata` accumulated by context operations, applied
/// by the Orchestrator at commit time (spec §4.D Step 6).
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub complete_requested: bool,
    /// `Some(Some(at))` sets a new timeout; `Some(None)` clears it;
    /// `None` leaves the existing `timeoutAt` untouched.
    pub timeout_at: Option<Option<DateTime<Utc>>>,
    pub tags: BTreeMap<String, Value>,
}

/// Per-invocation handler context. One instance per envelope delivery;
/// never shared across invocations or threads.
pub struct SagaContext {
    saga_name: String,
    saga_id: String,
    correlation_id: String,
    envelope: Envelope,
    /// The `timeoutAt` the instance had when loaded, so
    /// `getTimeoutRemaining` can compute against it before any
    /// `setTimeout`/`clearTimeout` call in this invocation.
    loaded_timeout_at: Option<DateTime<Utc>>,
    effects: Vec<Effect>,
    patch: MetadataPatch,
}

impl SagaContext {
    pub fn new(
        saga_name: impl Into<String>,
        saga_id: impl Into<String>,
        correlation_id: impl Into<String>,
        envelope: Envelope,
        loaded_timeout_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            saga_name: saga_name.into(),
            saga_id: saga_id.into(),
            correlation_id: correlation_id.into(),
            envelope,
            loaded_timeout_at,
            effects: Vec::new(),
            patch: MetadataPatch::default(),
        }
    }

    pub fn saga_name(&self) -> &str {
        &self.saga_name
    }

    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Enqueue an outbound publish on the default or specified endpoint.
    pub fn publish(&mut self, message_type: impl Into<String>, payload: Value) {
        self.effects.push(Effect::Publish {
            message_type: message_type.into(),
            payload,
            endpoint: None,
        });
    }

    /// Enqueue an outbound publish on a specific endpoint.
    pub fn publish_to(&mut self, endpoint: impl Into<String>, message_type: impl Into<String>, payload: Value) {
        self.effects.push(Effect::Publish {
            message_type: message_type.into(),
            payload,
            endpoint: Some(endpoint.into()),
        });
    }

    /// Enqueue a delayed publish. `delay_ms == 0` behaves exactly like
    /// `publish` (spec §8 boundary behavior).
    pub fn schedule(&mut self, message_type: impl Into<String>, payload: Value, delay_ms: u64) {
        self.effects.push(Effect::Schedule {
            message_type: message_type.into(),
            payload,
            delay: Duration::from_millis(delay_ms),
            endpoint: None,
        });
    }

    /// Mark the saga complete. Consumed at commit time; does not by
    /// itself prevent further handler invocations on this instance.
    pub fn complete(&mut self) {
        self.patch.complete_requested = true;
    }

    /// Register a future timeout. Calling this more than once in the
    /// same invocation keeps only the last value (spec §8: "Timeout
    /// set twice before commit: last wins").
    pub fn set_timeout(&mut self, delay_ms: u64) {
        self.patch.timeout_at = Some(Some(Utc::now() + chrono::Duration::milliseconds(delay_ms as i64)));
    }

    /// Clear a previously registered timeout.
    pub fn clear_timeout(&mut self) {
        self.patch.timeout_at = Some(None);
    }

    /// Remaining time until `timeoutAt`, as loaded at the start of this
    /// invocation (ignores any `setTimeout`/`clearTimeout` call made
    /// earlier in the same invocation — those only take effect at commit).
    pub fn timeout_remaining(&self) -> Option<chrono::Duration> {
        self.loaded_timeout_at.map(|at| at - Utc::now())
    }

    /// Set a free-form per-instance metadata tag.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.patch.tags.insert(key.into(), value);
    }

    /// Read a per-instance metadata tag set earlier in this invocation.
    /// Tags set in prior invocations are visible on `SagaMetadata::tags`
    /// directly, not through this context.
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.patch.tags.get(key)
    }

    /// Drain the accumulated effects and metadata patch. Called by the
    /// Orchestrator after a successful commit (effects) and at commit
    /// time (patch, to compute the new `SagaMetadata`).
    pub fn into_parts(self) -> (Vec<Effect>, MetadataPatch) {
        (self.effects, self.patch)
    }
}

//! Saga state: the durable record a saga instance owns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Runtime-owned fields of a saga instance, separate from the
/// business state the definition author's type carries.
///
/// Invariant: for every successful commit, `version` persisted equals
/// the `version` of the loaded state plus exactly one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SagaMetadata {
    /// Runtime-assigned identifier of this saga instance.
    pub saga_id: String,
    /// Monotonically increasing non-negative version, used for
    /// optimistic concurrency.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Terminal once set; the runtime never flips it back on its own.
    pub is_completed: bool,
    /// Deadline at which a `SagaTimeoutExpired` message is delivered.
    pub timeout_at: Option<DateTime<Utc>>,
    /// Duration most recently passed to `setTimeout`, kept for
    /// diagnostics (`getTimeoutRemaining` reads `timeout_at` directly).
    pub timeout_duration_ms: Option<u64>,
    /// Free-form per-instance annotation bag (`ctx.setMetadata`).
    #[serde(default)]
    pub tags: std::collections::BTreeMap<String, Value>,
}

impl SagaMetadata {
    /// Metadata for a brand-new instance: version 0, freshly timestamped.
    pub fn new(saga_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            saga_id: saga_id.into(),
            version: 0,
            created_at: now,
            updated_at: now,
            is_completed: false,
            timeout_at: None,
            timeout_duration_ms: None,
            tags: std::collections::BTreeMap::new(),
        }
    }
}

/// A saga instance's durable record: runtime metadata plus
/// arbitrary user-defined business state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaState<T> {
    pub metadata: SagaMetadata,
    /// The business state the definition author's handlers operate on.
    pub data: T,
}

impl<T> SagaState<T> {
    pub fn new(saga_id: impl Into<String>, data: T) -> Self {
        Self {
            metadata: SagaMetadata::new(saga_id),
            data,
        }
    }

    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    pub fn is_completed(&self) -> bool {
        self.metadata.is_completed
    }
}

/// Type-erased form of `SagaState<T>` used at the Store Gateway
/// boundary, where a single `dyn Store` holds heterogeneous saga
/// state types. `data` is the user state serialized to JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredState {
    pub metadata: SagaMetadata,
    /// The business correlation key this instance is looked up by
    /// (spec §6 persisted-state layout: "unique per active (sagaName,
    /// correlationId)"), distinct from the runtime-assigned `saga_id`.
    pub correlation_id: String,
    pub data: Value,
}

impl StoredState {
    pub fn from_typed<T: Serialize>(state: &SagaState<T>, correlation_id: impl Into<String>) -> serde_json::Result<Self> {
        Ok(Self {
            metadata: state.metadata.clone(),
            correlation_id: correlation_id.into(),
            data: serde_json::to_value(&state.data)?,
        })
    }

    pub fn into_typed<T: for<'de> Deserialize<'de>>(self) -> serde_json::Result<SagaState<T>> {
        Ok(SagaState {
            metadata: self.metadata,
            data: serde_json::from_value(self.data)?,
        })
    }
}

//! Crate-wide error taxonomy.
//!
//! Mirrors the teacher's `BusError`/`StorageError` style: one
//! `thiserror` enum per seam, field-carrying variants instead of
//! stringly-typed errors.

use thiserror::Error;

/// Errors surfaced while validating or registering a `SagaDefinition`.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("saga definition name must be non-empty")]
    EmptyName,

    #[error("saga '{0}' has no correlation rule with canStart=true")]
    NoStartRule(String),

    #[error("saga '{0}' has no initial state factory")]
    MissingInitialFactory(String),

    #[error("saga '{0}' has no handlers and no timeout handler")]
    EmptyHandlerTable(String),

    #[error("saga '{0}' is already registered")]
    DuplicateName(String),
}

/// Errors from the `Store` contract (§6), surfaced through the
/// Store Gateway.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("saga instance already exists: {saga_name}/{saga_id}")]
    AlreadyExists { saga_name: String, saga_id: String },

    #[error("concurrency conflict: expected version {expected}, found {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    #[error("saga instance not found: {saga_name}/{saga_id}")]
    NotFound { saga_name: String, saga_id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("state (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the `Transport` contract (§6).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("delayed publish not supported by this transport")]
    DelayNotSupported,

    #[error("message nacked: {0}")]
    Nacked(String),
}

/// The taxonomy from spec §7, one variant per row.
///
/// `RoutingMiss` and `StartRequired` are not represented as errors —
/// per spec they are silent drops, not failures (see
/// `orchestrator::Outcome`). This enum covers the rows that are
/// genuinely exceptional.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("concurrency conflict exhausted retry budget after {attempts} attempts")]
    ConcurrencyExhausted { attempts: u32 },

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("handler failed: {0}")]
    HandlerFailure(String),

    #[error("effect dispatch failed (state already committed): {0}")]
    EffectDispatchFailure(String),

    #[error("transport fatal: {0}")]
    TransportFatal(#[from] TransportError),
}

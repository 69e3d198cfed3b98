//! Store contract (spec §6): the durable home for saga instances.
//!
//! Shaped after the teacher's `EventStore` trait
//! (`src/storage/event_store.rs`): a plain `async_trait` the runtime
//! depends on, with concrete backends left out of scope — only the
//! in-memory reference implementation ([`memory::MemoryStore`]) ships
//! here, the way the teacher ships `MockEventStore` alongside its real
//! backends.

pub mod gateway;
pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::state::StoredState;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable storage for saga instances, keyed by `(sagaName, sagaId)`
/// with a secondary lookup by `(sagaName, correlationId)`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Load the instance correlating to `(saga_name, correlation_id)`,
    /// if one exists (spec §4.D Step 2).
    async fn load_by_correlation(
        &self,
        saga_name: &str,
        correlation_id: &str,
    ) -> Result<Option<StoredState>>;

    async fn load_by_id(&self, saga_name: &str, saga_id: &str) -> Result<Option<StoredState>>;

    /// Insert a brand-new instance at version 0. Fails with
    /// `StoreError::AlreadyExists` if `(saga_name, saga_id)` is taken.
    async fn insert(
        &self,
        saga_name: &str,
        correlation_id: &str,
        state: StoredState,
    ) -> Result<()>;

    /// Replace an existing instance's state, iff its currently stored
    /// version equals `expected_version` (spec §4.D Step 6, optimistic
    /// concurrency). Fails with `StoreError::ConcurrencyConflict`
    /// otherwise.
    async fn update(
        &self,
        saga_name: &str,
        saga_id: &str,
        expected_version: u64,
        state: StoredState,
    ) -> Result<()>;

    async fn delete(&self, saga_name: &str, saga_id: &str) -> Result<()>;

    /// All active (not completed) instances of `saga_name` with
    /// `timeoutAt <= horizon`, for the Timeout Scheduler's startup
    /// sweep (spec §4.E).
    async fn active_with_timeout_before(
        &self,
        saga_name: &str,
        horizon: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<StoredState>>;
}

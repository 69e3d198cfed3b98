//! Store Gateway: a thin wrapper translating the generic `Store`
//! contract into the exact calls the Orchestrator needs, the way the
//! teacher's `EventBookRepository` wraps `EventStore` +
//! `SnapshotStore` (`src/repository/event_book.rs`). No caching, no
//! retry — version-check enforcement and retry live in the
//! Orchestrator (spec §4.D Step 6), not here.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::state::StoredState;
use crate::store::{Result, Store};

pub struct StoreGateway {
    store: Arc<dyn Store>,
}

impl StoreGateway {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn load_by_correlation(
        &self,
        saga_name: &str,
        correlation_id: &str,
    ) -> Result<Option<StoredState>> {
        self.store.load_by_correlation(saga_name, correlation_id).await
    }

    pub async fn load_by_id(&self, saga_name: &str, saga_id: &str) -> Result<Option<StoredState>> {
        self.store.load_by_id(saga_name, saga_id).await
    }

    pub async fn insert(&self, saga_name: &str, correlation_id: &str, state: StoredState) -> Result<()> {
        self.store.insert(saga_name, correlation_id, state).await
    }

    /// Commit `state` as the next version after `loaded_version`. The
    /// caller (Orchestrator) is responsible for incrementing
    /// `state.metadata.version` before calling this.
    pub async fn commit(
        &self,
        saga_name: &str,
        saga_id: &str,
        loaded_version: u64,
        state: StoredState,
    ) -> Result<()> {
        self.store.update(saga_name, saga_id, loaded_version, state).await
    }

    pub async fn delete(&self, saga_name: &str, saga_id: &str) -> Result<()> {
        self.store.delete(saga_name, saga_id).await
    }

    pub async fn active_with_timeout_before(
        &self,
        saga_name: &str,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<StoredState>> {
        self.store.active_with_timeout_before(saga_name, horizon).await
    }
}

//! In-memory `Store` reference implementation, standing in for the
//! out-of-scope concrete backends the way the teacher's
//! `MockEventStore` (`src/storage/mock`) stands in for
//! `SqliteEventStore`/`PostgresEventStore`/etc — a `RwLock<HashMap<..>>`
//! behind the trait, not a concurrent-map crate.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::state::StoredState;

use super::{Result, Store};

#[derive(Clone, Eq, PartialEq, Hash)]
struct InstanceKey {
    saga_name: String,
    saga_id: String,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<InstanceKey, StoredState>,
    /// (saga_name, correlation_id) -> saga_id, maintained alongside
    /// `by_id` on every insert/update.
    by_correlation: HashMap<(String, String), String>,
}

/// In-memory reference `Store`. Data does not survive process restart;
/// suitable for tests and the standalone single-process deployment
/// profile (spec Non-goals: concrete backend adapters are out of scope).
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_by_correlation(
        &self,
        saga_name: &str,
        correlation_id: &str,
    ) -> Result<Option<StoredState>> {
        let inner = self.inner.read().await;
        let Some(saga_id) = inner
            .by_correlation
            .get(&(saga_name.to_string(), correlation_id.to_string()))
        else {
            return Ok(None);
        };
        let key = InstanceKey {
            saga_name: saga_name.to_string(),
            saga_id: saga_id.clone(),
        };
        Ok(inner.by_id.get(&key).cloned())
    }

    async fn load_by_id(&self, saga_name: &str, saga_id: &str) -> Result<Option<StoredState>> {
        let inner = self.inner.read().await;
        let key = InstanceKey {
            saga_name: saga_name.to_string(),
            saga_id: saga_id.to_string(),
        };
        Ok(inner.by_id.get(&key).cloned())
    }

    async fn insert(&self, saga_name: &str, correlation_id: &str, state: StoredState) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = InstanceKey {
            saga_name: saga_name.to_string(),
            saga_id: state.metadata.saga_id.clone(),
        };
        if inner.by_id.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                saga_name: saga_name.to_string(),
                saga_id: state.metadata.saga_id.clone(),
            });
        }
        inner
            .by_correlation
            .insert((saga_name.to_string(), correlation_id.to_string()), state.metadata.saga_id.clone());
        inner.by_id.insert(key, state);
        Ok(())
    }

    async fn update(
        &self,
        saga_name: &str,
        saga_id: &str,
        expected_version: u64,
        state: StoredState,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = InstanceKey {
            saga_name: saga_name.to_string(),
            saga_id: saga_id.to_string(),
        };
        let existing = inner.by_id.get(&key).ok_or_else(|| StoreError::NotFound {
            saga_name: saga_name.to_string(),
            saga_id: saga_id.to_string(),
        })?;
        if existing.metadata.version != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_version,
                actual: existing.metadata.version,
            });
        }
        inner.by_id.insert(key, state);
        Ok(())
    }

    async fn delete(&self, saga_name: &str, saga_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = InstanceKey {
            saga_name: saga_name.to_string(),
            saga_id: saga_id.to_string(),
        };
        inner.by_id.remove(&key);
        inner
            .by_correlation
            .retain(|_, v| v != saga_id);
        Ok(())
    }

    async fn active_with_timeout_before(
        &self,
        saga_name: &str,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<StoredState>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_id
            .iter()
            .filter(|(k, v)| {
                k.saga_name == saga_name
                    && !v.metadata.is_completed
                    && v.metadata.timeout_at.is_some_and(|t| t <= horizon)
            })
            .map(|(_, v)| v.clone())
            .collect())
    }
}

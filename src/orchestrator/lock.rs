//! Per-instance lock table (spec §5): mutual exclusion keyed by
//! `(sagaName, correlationId)`, so concurrent deliveries for the same
//! instance serialize while unrelated instances proceed in parallel.
//!
//! A plain `RwLock<HashMap<..>>` of per-key `tokio::sync::Mutex`es,
//! the same interior-mutability shape the teacher uses for its
//! process-local registries (`src/bus/in_process.rs`'s
//! `RwLock<Vec<..>>`), not a concurrent-map crate.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock};

#[derive(Default)]
pub struct LockTable {
    locks: RwLock<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, saga_name: &str, correlation_id: &str) -> Arc<Mutex<()>> {
        let key = (saga_name.to_string(), correlation_id.to_string());
        if let Some(lock) = self.locks.read().await.get(&key) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the lock for `(saga_name, correlation_id)`, blocking
    /// until any concurrent delivery for the same instance finishes
    /// (spec §4.D Step 2: "establish mutual exclusion on the resolved
    /// key before loading state").
    pub async fn acquire(&self, saga_name: &str, correlation_id: &str) -> InstanceGuard {
        let lock = self.entry(saga_name, correlation_id).await;
        InstanceGuard { lock }
    }

    /// Drop lock-table entries with no other `Arc` reference. Safe to
    /// call periodically (spec §5: "entries ... may be
    /// reference-counted or swept lazily"); entries in active use are
    /// never removed, since their `Arc` strong count exceeds one.
    pub async fn sweep(&self) {
        self.locks.write().await.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Holds the per-instance lock until dropped. The caller awaits
/// `lock()` to get the actual critical-section guard.
pub struct InstanceGuard {
    lock: Arc<Mutex<()>>,
}

impl InstanceGuard {
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

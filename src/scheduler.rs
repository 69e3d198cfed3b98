//! Timeout Scheduler (spec §4.E): turns a saga's persisted `timeoutAt`
//! into a synthetic `SagaTimeoutExpired` envelope once it elapses.
//!
//! Grounded on the teacher's `TimeoutScheduler`
//! (`src/services/timeout_scheduler.rs`): a periodic poll loop that
//! queries for stale instances and publishes a timeout event through
//! the same bus every other message travels through. Generalized here
//! from the teacher's single-process-type, read-model-query design
//! into a process-local priority queue (so a tight interval isn't
//! needed to catch near-term timeouts) plus the same startup sweep the
//! teacher's query-on-a-ticker approach amounts to.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::definition::DefinitionRegistry;
use crate::envelope::Envelope;
use crate::store::gateway::StoreGateway;
use crate::transport::{PublishOptions, Transport};

/// Narrow interface the Orchestrator uses to keep the scheduler's
/// in-memory queue in sync with `ctx.setTimeout`/`ctx.clearTimeout`
/// calls committed during a saga invocation, without depending on the
/// full `Scheduler` type.
#[async_trait]
pub trait TimeoutNotifier: Send + Sync {
    async fn schedule(&self, saga_name: &str, correlation_id: &str, at: DateTime<Utc>);
    async fn cancel(&self, saga_name: &str, correlation_id: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTimeout {
    at: DateTime<Utc>,
    saga_name: String,
    correlation_id: String,
}

// Reverse ordering so `BinaryHeap` (a max-heap) pops the earliest
// deadline first.
impl Ord for ScheduledTimeout {
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at)
    }
}

impl PartialOrd for ScheduledTimeout {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Queue {
    heap: BinaryHeap<ScheduledTimeout>,
    /// Current due time per key, the source of truth for whether a
    /// popped heap entry is still live. A heap entry whose `at` no
    /// longer matches this map (rescheduled) or that's missing
    /// entirely (cancelled) is a stale duplicate, dropped lazily
    /// instead of hunted down in the heap (spec §5: "swept lazily").
    due: HashMap<(String, String), DateTime<Utc>>,
}

impl Queue {
    fn new() -> Self {
        Self { heap: BinaryHeap::new(), due: HashMap::new() }
    }
}

/// Process-local Timeout Scheduler: one consumer task polling a
/// priority queue of pending deadlines.
pub struct Scheduler {
    transport: Arc<dyn Transport>,
    store: Arc<StoreGateway>,
    definitions: Arc<DefinitionRegistry>,
    config: SchedulerConfig,
    queue: tokio::sync::Mutex<Queue>,
}

impl Scheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<StoreGateway>,
        definitions: Arc<DefinitionRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            transport,
            store,
            definitions,
            config,
            queue: tokio::sync::Mutex::new(Queue::new()),
        }
    }

    /// Sweep the store for active sagas whose deadline falls within
    /// `sweep_horizon_ms` of now, and enqueue them. Call once at
    /// process startup, before the consumer task is spawned, so a
    /// restart doesn't miss timeouts that elapsed or were close to
    /// elapsing while the process was down (spec §4.E).
    pub async fn startup_sweep(&self) {
        let horizon = Utc::now() + chrono::Duration::milliseconds(self.config.sweep_horizon_ms as i64);
        for definition in self.definitions.iter() {
            let saga_name = definition.name();
            match self.store.active_with_timeout_before(saga_name, horizon).await {
                Ok(stored) => {
                    for instance in stored {
                        if let Some(at) = instance.metadata.timeout_at {
                            self.enqueue(saga_name, &instance.correlation_id, at).await;
                        }
                    }
                }
                Err(e) => warn!(saga = %saga_name, error = %e, "timeout startup sweep failed"),
            }
        }
    }

    /// Entries are keyed by `correlation_id`, the same business key
    /// `TimeoutNotifier::schedule` receives from `ctx.setTimeout`, so a
    /// sweep-enqueued entry and a same-instance `setTimeout` call
    /// collide on the same `due` slot instead of scheduling twice.
    async fn enqueue(&self, saga_name: &str, key: &str, at: DateTime<Utc>) {
        let mut queue = self.queue.lock().await;
        queue.due.insert((saga_name.to_string(), key.to_string()), at);
        queue.heap.push(ScheduledTimeout { at, saga_name: saga_name.to_string(), correlation_id: key.to_string() });
    }

    /// Spawn the consumer task. Returns a handle the caller may abort
    /// on shutdown; the task itself runs until the process exits.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let poll_interval = std::time::Duration::from_millis(self.config.poll_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                self.fire_due().await;
            }
        })
    }

    async fn fire_due(&self) {
        let due_now = {
            let mut queue = self.queue.lock().await;
            let now = Utc::now();
            let mut due_now = Vec::new();
            while let Some(top) = queue.heap.peek() {
                if top.at > now {
                    break;
                }
                let entry = queue.heap.pop().expect("peeked Some");
                let key = (entry.saga_name.clone(), entry.correlation_id.clone());
                let is_live = queue.due.get(&key) == Some(&entry.at);
                if is_live {
                    queue.due.remove(&key);
                    due_now.push(entry);
                }
            }
            due_now
        };

        for entry in due_now {
            debug!(saga = %entry.saga_name, correlation_id = %entry.correlation_id, "timeout elapsed");
            let envelope = Envelope::timeout_expired(&entry.saga_name, &entry.correlation_id, entry.at);
            if let Err(e) = self.transport.publish(envelope, PublishOptions::default()).await {
                warn!(saga = %entry.saga_name, correlation_id = %entry.correlation_id, error = %e, "failed to publish timeout envelope");
            } else {
                info!(saga = %entry.saga_name, correlation_id = %entry.correlation_id, "timeout envelope published");
            }
        }
    }
}

#[async_trait]
impl TimeoutNotifier for Scheduler {
    async fn schedule(&self, saga_name: &str, correlation_id: &str, at: DateTime<Utc>) {
        self.enqueue(saga_name, correlation_id, at).await;
    }

    async fn cancel(&self, saga_name: &str, correlation_id: &str) {
        let mut queue = self.queue.lock().await;
        queue.due.remove(&(saga_name.to_string(), correlation_id.to_string()));
    }
}

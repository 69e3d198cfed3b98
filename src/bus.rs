//! Bus Facade: assembles the [`Transport`], [`StoreGateway`], the
//! [`DefinitionRegistry`], the middleware list, and the Timeout
//! Scheduler into the single entry point applications start and stop.
//!
//! Grounded on the teacher's `EventedBuilder::build` as an assembly
//! point (`src/facade.rs`: wires store + bus + registered sagas from
//! raw config rather than accepting pre-built pieces) and
//! `InProcessEventBus`/its bin entry points (`src/bus/in_process.rs`,
//! `src/bin/angzarr_saga.rs`) for the start/stop lifecycle shape.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::error;

use crate::config::SchedulerConfig;
use crate::definition::DefinitionRegistry;
use crate::envelope::Envelope;
use crate::error::{OrchestratorError, TransportError};
use crate::middleware::Middleware;
use crate::orchestrator::Orchestrator;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::store::gateway::StoreGateway;
use crate::transport::{self, SubscribeOptions, SubscriptionHandler, Transport};

struct OrchestratorHandler {
    orchestrator: Arc<Orchestrator>,
}

impl SubscriptionHandler for OrchestratorHandler {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, transport::Result<()>> {
        let orchestrator = self.orchestrator.clone();
        Box::pin(async move {
            // A message nacks if any registered saga's processing hit a
            // genuinely exceptional row of spec §7; an effect-dispatch
            // failure does not, since the commit it follows already
            // stood (spec §4.D Step 8).
            let mut nack_reason: Option<String> = None;
            for (saga_name, result) in orchestrator.dispatch(envelope).await {
                match result {
                    Ok(_) => {}
                    Err(err @ OrchestratorError::EffectDispatchFailure(_)) => {
                        error!(saga = %saga_name, error = %err, "effect dispatch failed after commit, not nacking");
                    }
                    Err(err) => {
                        error!(saga = %saga_name, error = %err, "saga dispatch failed, nacking");
                        nack_reason.get_or_insert_with(|| err.to_string());
                    }
                }
            }
            match nack_reason {
                Some(reason) => Err(TransportError::Nacked(reason)),
                None => Ok(()),
            }
        })
    }
}

/// The application's single entry point: wires a `Transport` to the
/// `Orchestrator`, keeps the Timeout Scheduler running alongside it,
/// and manages both lifetimes.
///
/// Subscribes on one configurable endpoint — the standalone,
/// single-process deployment profile (spec Non-goals: framework/
/// multi-process integrations are out of scope). Message-type routing
/// happens inside the `Orchestrator`, not at the transport layer, so
/// one subscription is sufficient regardless of how many saga
/// definitions are registered.
pub struct Bus {
    transport: Arc<dyn Transport>,
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<Scheduler>,
    endpoint: Option<String>,
    /// Upper bound a real `Transport`'s own `stop()` is expected to
    /// honor while draining in-flight deliveries. The in-memory
    /// reference transport has no queue to drain and ignores this;
    /// it exists for backends with actual buffering (out of scope here).
    shutdown_deadline: Duration,
    scheduler_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Bus {
    /// Assembles the Orchestrator and the Timeout Scheduler from the
    /// same `definitions`/`store`/`transport`, and attaches the
    /// Scheduler as the Orchestrator's `TimeoutNotifier` before either
    /// is handed out — so `ctx.setTimeout`/`ctx.clearTimeout` calls
    /// reach the Scheduler's queue for the lifetime of this `Bus`
    /// (spec §4.E; previously unreachable — see DESIGN.md).
    pub fn new(
        definitions: Arc<DefinitionRegistry>,
        store: Arc<StoreGateway>,
        transport: Arc<dyn Transport>,
        middlewares: Vec<Arc<dyn Middleware>>,
        retry_policy: RetryPolicy,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(transport.clone(), store.clone(), definitions.clone(), scheduler_config));
        let orchestrator = Arc::new(
            Orchestrator::new(definitions, store, transport.clone(), middlewares, retry_policy)
                .with_timeout_notifier(scheduler.clone()),
        );
        Self {
            transport,
            orchestrator,
            scheduler,
            endpoint: None,
            shutdown_deadline: Duration::from_secs(5),
            scheduler_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline = deadline;
        self
    }

    pub fn shutdown_deadline(&self) -> Duration {
        self.shutdown_deadline
    }

    /// Sweeps the store for near-term deadlines, subscribes the
    /// Orchestrator to the transport, then spawns the Scheduler's
    /// consumer task (spec §4.E: "the in-memory queue is reconstructed
    /// at bus start from a sweep of the store").
    pub async fn start(&self) -> Result<(), TransportError> {
        self.scheduler.startup_sweep().await;

        self.transport.start().await?;
        self.transport
            .subscribe(
                SubscribeOptions { endpoint: self.endpoint.clone() },
                Box::new(OrchestratorHandler { orchestrator: self.orchestrator.clone() }),
            )
            .await?;

        *self.scheduler_task.lock().await = Some(self.scheduler.clone().spawn());
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), TransportError> {
        if let Some(task) = self.scheduler_task.lock().await.take() {
            task.abort();
        }
        self.transport.stop().await
    }
}

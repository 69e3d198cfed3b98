//! In-memory `Transport` reference implementation: one fan-out list of
//! handlers per endpoint behind a `RwLock`, with delayed publish via a
//! spawned `tokio::time::sleep` task — grounded on the teacher's
//! `InProcessEventBus` (`src/bus/in_process.rs`), generalized from its
//! fixed projector/saga lists to arbitrary per-endpoint subscriber lists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::envelope::Envelope;

use super::{PublishOptions, Result, SubscribeOptions, SubscriptionHandler, Transport};

const DEFAULT_ENDPOINT: &str = "default";

#[derive(Default)]
pub struct MemoryTransport {
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn SubscriptionHandler>>>>,
    started: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoint_key(endpoint: &Option<String>) -> String {
        endpoint.clone().unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, options: SubscribeOptions, handler: Box<dyn SubscriptionHandler>) -> Result<()> {
        let key = Self::endpoint_key(&options.endpoint);
        self.subscribers
            .write()
            .await
            .entry(key)
            .or_default()
            .push(Arc::from(handler));
        Ok(())
    }

    #[tracing::instrument(name = "memory_transport_publish", skip_all, fields(message_type = %envelope.message_type))]
    async fn publish(&self, envelope: Envelope, options: PublishOptions) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            warn!("publish called before start()");
        }

        let key = Self::endpoint_key(&options.endpoint);
        let handlers = {
            let subscribers = self.subscribers.read().await;
            subscribers.get(&key).cloned().unwrap_or_default()
        };

        if handlers.is_empty() {
            debug!(endpoint = %key, "no subscribers for endpoint");
        }

        if options.delay.is_zero() {
            // Synchronous delivery: the first nack bubbles straight up
            // to the publisher, mirroring the teacher's
            // `InProcessEventBus::publish` returning `Err` as soon as a
            // synchronous consumer fails instead of swallowing it.
            for handler in handlers {
                handler.handle(envelope.clone()).await?;
            }
        } else {
            let delay = options.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for handler in handlers {
                    if let Err(e) = handler.handle(envelope.clone()).await {
                        warn!(error = %e, "delayed delivery nacked, not retried by this transport");
                    }
                }
            });
        }

        Ok(())
    }
}

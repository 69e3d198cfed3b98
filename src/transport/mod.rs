//! Transport contract (spec §6): message delivery in and out of the
//! Bus Facade.
//!
//! Shaped after the teacher's `EventBus` trait
//! (`src/interfaces/event_bus.rs`) and its `EventHandler` callback
//! object: a plain `async_trait` the runtime depends on, using
//! `BoxFuture` for the handler's trait-object-safe async callback.
//! Concrete network backends are out of scope (spec Non-goals); only
//! the in-memory reference implementation ships here, the way the
//! teacher ships `InProcessEventBus` alongside its AMQP/Kafka/NATS
//! backends.
//!
//! `SubscriptionHandler::handle` returns a `Result`, mirroring the
//! teacher's `EventHandler::handle -> BoxFuture<Result<(), BusError>>`:
//! an `Err` is a negative acknowledgment (spec §6/§7 — the message is
//! nacked and a real backend redelivers it), not merely a log line.

pub mod memory;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::envelope::Envelope;
use crate::error::TransportError;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Callback invoked for every envelope delivered on a subscription.
/// Mirrors the teacher's `EventHandler`: a trait rather than a bare
/// closure type, so subscribers can carry their own state.
///
/// Returning `Err` nacks the envelope (spec §6: "raising an error
/// implies nack"); `Ok(())` acks it.
pub trait SubscriptionHandler: Send + Sync {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>>;
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Logical endpoint/topic to subscribe on; `None` selects the
    /// transport's default.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub endpoint: Option<String>,
    /// Delay before delivery. Zero (the default) is an immediate
    /// publish (spec §8 boundary: delay=0 on schedule behaves like publish).
    pub delay: std::time::Duration,
}

/// Message transport the Bus Facade subscribes through and the
/// Orchestrator publishes effects through.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Register `handler` to be invoked for every envelope delivered
    /// on `options.endpoint`. May be called multiple times for
    /// multiple endpoints (spec §4.D: "required endpoints computed
    /// from the Definition Registry's messageType index").
    async fn subscribe(&self, options: SubscribeOptions, handler: Box<dyn SubscriptionHandler>) -> Result<()>;

    async fn publish(&self, envelope: Envelope, options: PublishOptions) -> Result<()>;
}

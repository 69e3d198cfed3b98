//! The message envelope: the unit crossing the transport boundary.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Synthetic message type published by the Timeout Scheduler.
///
/// Delivered through the same pipeline as any transport-delivered
/// message; handlers decide what to do with it via a guard.
pub const SAGA_TIMEOUT_EXPIRED: &str = "SagaTimeoutExpired";

/// Immutable unit of data crossing the transport boundary.
///
/// Envelopes are the sole input to correlation and handler dispatch.
/// Once published, an envelope's fields never change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique id assigned at publish time.
    pub id: Uuid,
    /// Discriminator selecting correlation rules and handlers.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Opaque domain payload.
    pub payload: Value,
    /// Correlation id, trace context, tenant, and other string metadata.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Wall-clock publish time.
    pub timestamp: DateTime<Utc>,
    /// Ordering hint for FIFO-style transports.
    #[serde(default)]
    pub partition_key: Option<String>,
}

impl Envelope {
    /// Build a new envelope with a fresh id and the current time.
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            payload,
            headers: HashMap::new(),
            timestamp: Utc::now(),
            partition_key: None,
        }
    }

    /// Attach a partition key (builder-style).
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Attach a header (builder-style).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Construct the synthetic `SagaTimeoutExpired` envelope for a saga
    /// whose timeout has elapsed.
    pub fn timeout_expired(saga_name: &str, correlation_id: &str, scheduled_at: DateTime<Utc>) -> Self {
        Self::new(
            SAGA_TIMEOUT_EXPIRED,
            serde_json::json!({
                "sagaName": saga_name,
                "correlationId": correlation_id,
                "scheduledAt": scheduled_at,
            }),
        )
        .with_partition_key(correlation_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_envelope_has_unique_id_and_empty_headers() {
        let e1 = Envelope::new("OrderSubmitted", serde_json::json!({"orderId": "A"}));
        let e2 = Envelope::new("OrderSubmitted", serde_json::json!({"orderId": "A"}));
        assert_ne!(e1.id, e2.id);
        assert!(e1.headers.is_empty());
    }

    #[test]
    fn timeout_expired_carries_correlation_id_as_partition_key() {
        let now = Utc::now();
        let e = Envelope::timeout_expired("OrderSaga", "A", now);
        assert_eq!(e.message_type, SAGA_TIMEOUT_EXPIRED);
        assert_eq!(e.partition_key.as_deref(), Some("A"));
        assert_eq!(e.payload["correlationId"], "A");
    }
}

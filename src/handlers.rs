// Handlers for the two inputs of the service: MQTT messages, which are
// decoded and written to the database, and the HTTP metrics endpoint.
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, header::CONTENT_TYPE};
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};
use tracing::{debug, error, info, warn};

use crate::db::ReadingStore;
use crate::metrics::BridgeMetrics;
use crate::mqtt::BrokerMessage;
use crate::reading::{ReceivedReading, SensorPayload};

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Saved,
    Undecodable,
    NotSaved,
}

/// Decode-then-persist for a single message. Shared by every in-flight
/// message task, so it holds no per-message state.
pub struct MessageHandler<S> {
    store: S,
    metrics: BridgeMetrics,
}

impl<S: ReadingStore> MessageHandler<S> {
    pub fn new(store: S, metrics: BridgeMetrics) -> Self {
        Self { store, metrics }
    }

    pub async fn handle(&self, message: BrokerMessage) -> Outcome {
        self.metrics.messages_received.inc();
        info!("Received message on topic: {}", message.topic);
        info!("Payload: {}", message.payload);
        debug!(received_at = %message.received_at, "message taken off the broker");

        let payload = match SensorPayload::decode(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.decode_failures.inc();
                error!("Failed to parse sensor data from message payload: {}", e);
                return Outcome::Undecodable;
            }
        };

        let reading = ReceivedReading::received(payload, Utc::now());
        info!(
            "Parsed sensor data: SensorId={}, Value={}",
            reading.sensor_id, reading.value
        );

        if self.store.save(&reading).await {
            self.metrics.readings_saved.inc();
            crate::success!("Sensor data saved to database. OriginalId={}", reading.original_id);
            Outcome::Saved
        } else {
            // The store already logged the cause.
            self.metrics.save_failures.inc();
            warn!("Dropped sensor reading OriginalId={}", reading.original_id);
            Outcome::NotSaved
        }
    }
}

/// Expose the bridge counters in the Prometheus text format.
pub async fn metrics_handler(Extension(metrics): Extension<BridgeMetrics>) -> (HeaderMap, String) {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metrics.registry.gather(), &mut buffer)
        .unwrap_or_default();

    let mut headers = HeaderMap::new();
    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
        headers.insert(CONTENT_TYPE, content_type);
    }
    (headers, String::from_utf8_lossy(&buffer).into_owned())
}

pub async fn health() -> &'static str {
    "ok"
}

// Prometheus counters for the bridge pipeline, kept in a private registry so
// tests can build as many as they like.
use prometheus::{IntCounter, Registry};
use std::sync::Arc;

#[derive(Clone)]
pub struct BridgeMetrics {
    pub registry: Arc<Registry>,
    pub messages_received: IntCounter,
    pub decode_failures: IntCounter,
    pub readings_saved: IntCounter,
    pub save_failures: IntCounter,
}

impl BridgeMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let messages_received = register(
            &registry,
            "bridge_messages_received_total",
            "Total MQTT messages received",
        )?;
        let decode_failures = register(
            &registry,
            "bridge_decode_failures_total",
            "Messages dropped because the payload did not decode",
        )?;
        let readings_saved = register(
            &registry,
            "bridge_readings_saved_total",
            "Readings inserted into the database",
        )?;
        let save_failures = register(
            &registry,
            "bridge_save_failures_total",
            "Readings dropped because the insert failed",
        )?;

        Ok(Self {
            registry: Arc::new(registry),
            messages_received,
            decode_failures,
            readings_saved,
            save_failures,
        })
    }

    /// One-line summary for the shutdown log.
    pub fn summary(&self) -> String {
        format!(
            "received={} decode_failures={} saved={} save_failures={}",
            self.messages_received.get(),
            self.decode_failures.get(),
            self.readings_saved.get(),
            self.save_failures.get()
        )
    }
}

fn register(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

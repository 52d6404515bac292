// `server.rs` composes the bridge: it loads settings, builds the persistence
// service and the MQTT wrapper, wires broker events to the message handler,
// optionally mounts the metrics endpoint, and owns the process lifetime.
use axum::{Extension, Router, routing::get};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, Duration};
use tracing::{error, info, warn};

use crate::config::{DEFAULT_SETTINGS_FILE, SETTINGS_PATH_VAR, Settings};
use crate::db::{PersistenceService, ReadingStore};
use crate::handlers::{self, MessageHandler};
use crate::logger;
use crate::metrics::BridgeMetrics;
use crate::mqtt::{Broker, BrokerEvent, EventReceiver, MqttBroker};

const LIVENESS_POLL: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run() -> anyhow::Result<()> {
    logger::init(&std::env::var("BRIDGE_LOG").unwrap_or_else(|_| "info".to_string()));
    info!("MQTT database bridge starting...");

    let settings_path =
        std::env::var(SETTINGS_PATH_VAR).unwrap_or_else(|_| DEFAULT_SETTINGS_FILE.to_string());
    let settings = Settings::load_or_default(Path::new(&settings_path));

    let metrics = BridgeMetrics::new()?;
    let store = PersistenceService::from_config(&settings.database)?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut broker = MqttBroker::new(settings.broker.clone(), events_tx);

    let handler = Arc::new(MessageHandler::new(store, metrics.clone()));
    let dispatcher = tokio::spawn(dispatch_events(events_rx, handler));

    if let Some(listen) = settings.metrics.listen.clone() {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let served = match TcpListener::bind(&listen).await {
                Ok(listener) => {
                    info!("Metrics listening on {}", listen);
                    serve_metrics(listener, metrics).await
                }
                Err(e) => Err(e.into()),
            };
            if let Err(e) = served {
                error!("Metrics listener on {} ended: {:#}", listen, e);
            }
        });
    }

    let running = Arc::new(AtomicBool::new(true));
    tokio::spawn(watch_for_shutdown(Arc::clone(&running)));

    info!("Connecting to MQTT broker...");
    if !broker.connect().await {
        error!("Failed to connect to MQTT broker. Exiting...");
        anyhow::bail!(
            "could not connect to MQTT broker at {}:{}",
            settings.broker.host,
            settings.broker.port
        );
    }

    subscribe_all(&mut broker, &settings.broker.topics).await;
    info!("MQTT database bridge started. Press Ctrl+C to exit.");

    while running.load(Ordering::SeqCst) {
        time::sleep(LIVENESS_POLL).await;
    }

    broker.disconnect().await;
    // Dropping the wrapper closes the event channel; the dispatcher then
    // finishes the messages already in flight.
    drop(broker);
    if time::timeout(DRAIN_TIMEOUT, dispatcher).await.is_err() {
        warn!("Gave up waiting for in-flight messages.");
    }

    info!("Messages processed: {}", metrics.summary());
    info!("MQTT database bridge stopped.");
    Ok(())
}

/// Subscribe to every topic independently. A failed topic is logged and the
/// remaining ones are still attempted.
pub async fn subscribe_all<B: Broker>(broker: &mut B, topics: &[String]) {
    info!("Subscribing to topics: {}", topics.join(", "));
    let mut failed = Vec::new();
    for topic in topics {
        if !broker.subscribe(topic).await {
            error!("Failed to subscribe to topic: {}", topic);
            failed.push(topic.as_str());
        }
    }
    if !failed.is_empty() {
        warn!(
            "Subscribed to {} of {} topics; not receiving: {}",
            topics.len() - failed.len(),
            topics.len(),
            failed.join(", ")
        );
    }
}

/// Route broker events until the channel closes. Every message runs in its
/// own task; a panicking handler is logged and does not stop the loop.
pub async fn dispatch_events<S: ReadingStore>(
    mut events: EventReceiver,
    handler: Arc<MessageHandler<S>>,
) {
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(BrokerEvent::Message(message)) => {
                    let handler = Arc::clone(&handler);
                    in_flight.spawn(async move {
                        handler.handle(message).await;
                    });
                }
                Some(BrokerEvent::Connectivity(true)) => {
                    crate::success!("Connected to MQTT broker.")
                }
                Some(BrokerEvent::Connectivity(false)) => warn!("Disconnected from MQTT broker."),
                None => break,
            },
            Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => reap(finished),
        }
    }

    while let Some(finished) = in_flight.join_next().await {
        reap(finished);
    }
}

fn reap(finished: Result<(), JoinError>) {
    if let Err(e) = finished {
        if e.is_panic() {
            error!("Error processing message: handler panicked");
        }
    }
}

async fn watch_for_shutdown(running: Arc<AtomicBool>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Stopping MQTT database bridge...");
    running.store(false, Ordering::SeqCst);
}

pub fn metrics_router(metrics: BridgeMetrics) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .route("/health", get(handlers::health))
        .layer(Extension(metrics))
}

async fn serve_metrics(listener: TcpListener, metrics: BridgeMetrics) -> anyhow::Result<()> {
    axum::serve(listener, metrics_router(metrics)).await?;
    Ok(())
}

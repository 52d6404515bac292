// MQTT broker wrapper. Owns a single `rumqttc` connection: `connect` waits
// for the CONNACK, then a background task polls the event loop and forwards
// every publish to the orchestrator as a `BrokerEvent::Message`. Connection
// state flips are forwarded as `BrokerEvent::Connectivity`.
//
// Reconnection and keep-alive are left to `rumqttc`: polling the event loop
// after an error reconnects. Sessions are clean, so topics are re-requested
// after every reconnect.
use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    SubscribeFilter, SubscribeReasonCode, Transport,
};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// One inbound publish. Lives for a single dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    fn from_publish(publish: &Publish) -> Self {
        Self::new(publish.topic.clone(), String::from_utf8_lossy(&publish.payload))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Message(BrokerMessage),
    Connectivity(bool),
}

pub type EventSender = mpsc::UnboundedSender<BrokerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BrokerEvent>;

/// Connection lifecycle the orchestrator drives.
pub trait Broker {
    /// Open the session. `false` on any failure.
    fn connect(&mut self) -> impl Future<Output = bool> + Send;
    /// Request QoS 1 delivery for `topic`. Fails fast when not connected.
    fn subscribe(&mut self, topic: &str) -> impl Future<Output = bool> + Send;
    /// Close the session. No-op when not connected.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
    fn is_connected(&self) -> bool;
}

// State shared between the wrapper and its event-loop task.
#[derive(Default)]
struct Link {
    connected: AtomicBool,
    closing: AtomicBool,
    topics: RwLock<Vec<String>>,
}

struct Session {
    client: AsyncClient,
    pump: JoinHandle<()>,
    link: Arc<Link>,
}

pub struct MqttBroker {
    config: BrokerConfig,
    events: EventSender,
    session: Option<Session>,
}

impl MqttBroker {
    pub fn new(config: BrokerConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            session: None,
        }
    }

    fn options(&self) -> MqttOptions {
        let config = &self.config;
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);
        if let Some((username, password)) = config.credentials() {
            options.set_credentials(username, password);
        }
        if config.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    fn report(&self, connected: bool) {
        // The receiver only goes away during shutdown.
        let _ = self.events.send(BrokerEvent::Connectivity(connected));
    }
}

impl Broker for MqttBroker {
    async fn connect(&mut self) -> bool {
        if self.is_connected() {
            return true;
        }
        if let Some(stale) = self.session.take() {
            stale.pump.abort();
        }

        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            "Connecting to MQTT broker"
        );
        let (client, mut eventloop) =
            AsyncClient::new(self.options(), self.config.channel_capacity);

        let connack = wait_for_connack(&mut eventloop);
        let outcome = match time::timeout(self.config.connect_timeout(), connack).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "no CONNACK within {}s",
                self.config.connect_timeout_secs
            )),
        };

        if let Err(e) = outcome {
            error!("Connection failed: {:#}", e);
            self.report(false);
            return false;
        }

        let link = Arc::new(Link::default());
        link.connected.store(true, Ordering::SeqCst);
        let pump = tokio::spawn(pump_events(
            eventloop,
            client.clone(),
            Arc::clone(&link),
            self.events.clone(),
        ));
        self.session = Some(Session { client, pump, link });

        self.report(true);
        crate::success!("Connected to MQTT broker successfully.");
        true
    }

    async fn subscribe(&mut self, topic: &str) -> bool {
        let session = match &self.session {
            Some(session) if session.link.connected.load(Ordering::SeqCst) => session,
            _ => {
                error!("Cannot subscribe to {}: not connected to broker.", topic);
                return false;
            }
        };

        match session.client.subscribe(topic, QoS::AtLeastOnce).await {
            Ok(()) => {
                session.link.topics.write().await.push(topic.to_string());
                info!("Subscribed to topic: {}", topic);
                true
            }
            Err(e) => {
                error!("Failed to subscribe to topic {}: {}", topic, e);
                false
            }
        }
    }

    async fn disconnect(&mut self) {
        if !self.is_connected() {
            return;
        }
        let Some(session) = self.session.take() else {
            return;
        };

        session.link.closing.store(true, Ordering::SeqCst);
        session.link.connected.store(false, Ordering::SeqCst);
        if let Err(e) = session.client.disconnect().await {
            debug!("MQTT disconnect request failed: {}", e);
        }

        let mut pump = session.pump;
        if time::timeout(DISCONNECT_GRACE, &mut pump).await.is_err() {
            pump.abort();
        }

        self.report(false);
        info!("Disconnected from MQTT broker.");
    }

    fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.link.connected.load(Ordering::SeqCst))
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.pump.abort();
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> anyhow::Result<()> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
                return Ok(());
            }
            Event::Incoming(Packet::ConnAck(ack)) => {
                anyhow::bail!("broker refused the connection: {:?}", ack.code);
            }
            _ => {}
        }
    }
}

/// Poll the event loop until the session is closed or the event receiver
/// goes away.
async fn pump_events(
    mut eventloop: EventLoop,
    client: AsyncClient,
    link: Arc<Link>,
    events: EventSender,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BrokerMessage::from_publish(&publish);
                if events.send(BrokerEvent::Message(message)).is_err() {
                    debug!("event receiver dropped, stopping MQTT loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !link.connected.swap(true, Ordering::SeqCst) {
                    let _ = events.send(BrokerEvent::Connectivity(true));
                    resubscribe(&client, &link.topics.read().await);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    error!(
                        pkid = ack.pkid,
                        "Broker rejected subscription: {:?}", ack.return_codes
                    );
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) if link.closing.load(Ordering::SeqCst) => {
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if link.closing.load(Ordering::SeqCst) {
                    break;
                }
                if link.connected.swap(false, Ordering::SeqCst) {
                    warn!("Lost connection to MQTT broker: {}", e);
                    let _ = events.send(BrokerEvent::Connectivity(false));
                } else {
                    debug!("mqtt loop error: {}", e);
                }
                // Back off so a dead broker does not turn into a busy loop.
                time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

// Runs inside the event-loop task, so it must not wait for channel capacity.
// Every stored topic goes out in a single SUBSCRIBE, which needs one slot of
// the request channel however long the topic list is.
fn resubscribe(client: &AsyncClient, topics: &[String]) {
    if topics.is_empty() {
        return;
    }
    let filters = topics
        .iter()
        .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtLeastOnce));
    match client.try_subscribe_many(filters) {
        Ok(()) => info!("Resubscribed to topics: {}", topics.join(", ")),
        Err(e) => error!("Failed to resubscribe to topics {}: {}", topics.join(", "), e),
    }
}

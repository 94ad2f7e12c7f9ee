//! MQTT backend for the reading queue.
//!
//! One long-lived client per role is created at startup: the ingestion side
//! publishes with `<client_id>-publisher` and the consumer subscribes with
//! `<client_id>-consumer`. Both use QoS 1 and a persistent session, so
//! readings published while the consumer is offline are delivered once it
//! reconnects. Delivery is at-least-once.
//!
//! # Example Configuration
//!
//! ```toml
//! [queue]
//! backend = "mqtt"
//! broker = "mqtt://localhost:1883"
//! topic = "temperature-readings"
//! client_id = "tempstat"
//! keep_alive = 30
//! ```
//!
//! # Reconnection
//!
//! Each client's event loop runs on its own task. Connection errors are logged
//! and the loop retries after a delay; the consumer re-subscribes whenever the
//! broker reports that the session was not kept.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tempstat_core::ReadingMessage;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::queue::{QueueError, ReadingPublisher, ReadingSource};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Publishes readings to the configured topic.
pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
    publish_timeout: Duration,
}

impl MqttPublisher {
    /// Create the publisher client and start its event loop.
    pub fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        let options = mqtt_options(config, "publisher")?;
        let (client, eventloop) = AsyncClient::new(options, config.capacity);

        tokio::spawn(drive_publisher(eventloop));
        info!(
            "MQTT publisher started for {} on topic '{}'",
            config.broker, config.topic
        );

        Ok(Self {
            client,
            topic: config.topic.clone(),
            publish_timeout: config.publish_timeout(),
        })
    }
}

#[async_trait]
impl ReadingPublisher for MqttPublisher {
    async fn publish(&self, message: &ReadingMessage) -> Result<(), QueueError> {
        let payload = message.to_json()?;
        let publish = self
            .client
            .publish(&self.topic, QoS::AtLeastOnce, false, payload);
        // The request channel fills up while the broker is unreachable.
        tokio::time::timeout(self.publish_timeout, publish)
            .await
            .map_err(|_| QueueError::Full)??;
        debug!(device_id = %message.device_id, "Published reading to MQTT");
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.client.disconnect().await?;
        info!("MQTT publisher disconnected");
        Ok(())
    }
}

/// Receives readings from the configured topic.
pub struct MqttSource {
    client: AsyncClient,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl MqttSource {
    /// Create the consumer client and start its event loop.
    ///
    /// The subscription is issued once the broker acknowledges the connection.
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        let options = mqtt_options(config, "consumer")?;
        let (client, eventloop) = AsyncClient::new(options, config.capacity);
        let (tx, rx) = mpsc::channel(config.capacity.max(1));

        tokio::spawn(drive_consumer(
            eventloop,
            client.clone(),
            config.topic.clone(),
            tx,
        ));
        info!(
            "MQTT consumer started for {} on topic '{}'",
            config.broker, config.topic
        );

        Ok(Self { client, rx })
    }
}

#[async_trait]
impl ReadingSource for MqttSource {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Error disconnecting MQTT consumer: {}", e);
        }
        self.rx.close();
        info!("MQTT consumer disconnected");
    }
}

async fn drive_publisher(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("MQTT publisher connected: {:?}", ack.code);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT publisher connection error: {}. Reconnecting...", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!("MQTT publisher event loop stopped");
}

async fn drive_consumer(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topic: String,
    tx: mpsc::Sender<Vec<u8>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(
                    "MQTT consumer connected (session present: {})",
                    ack.session_present
                );
                if !ack.session_present {
                    if let Err(e) = client.try_subscribe(&topic, QoS::AtLeastOnce) {
                        warn!("Failed to subscribe to '{}': {}", topic, e);
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if tx.send(publish.payload.to_vec()).await.is_err() {
                    debug!("Reading source dropped, stopping MQTT consumer");
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT consumer connection error: {}. Reconnecting...", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!("MQTT consumer event loop stopped");
}

/// Client options for one role (`publisher` or `consumer`).
fn mqtt_options(config: &QueueConfig, role: &str) -> Result<MqttOptions, QueueError> {
    let (host, port, use_tls) =
        parse_broker_url(&config.broker).map_err(QueueError::InvalidBroker)?;

    let mut options = MqttOptions::new(format!("{}-{}", config.client_id, role), host, port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive));
    options.set_clean_session(false);

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    if use_tls {
        options.set_transport(rumqttc::Transport::tls_with_config(
            rumqttc::TlsConfiguration::Native,
        ));
    }

    Ok(options)
}

/// Parse an MQTT broker URL into (host, port, use_tls).
fn parse_broker_url(url: &str) -> Result<(String, u16, bool), String> {
    let (use_tls, rest) = if let Some(stripped) = url.strip_prefix("mqtt://") {
        (false, stripped)
    } else if let Some(stripped) = url.strip_prefix("mqtts://") {
        (true, stripped)
    } else {
        return Err("URL must start with mqtt:// or mqtts://".to_string());
    };

    let default_port = if use_tls { 8883 } else { 1883 };

    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) => {
            let port = p.parse::<u16>().map_err(|_| format!("Invalid port: {}", p))?;
            (h.to_string(), port)
        }
        None => (rest.to_string(), default_port),
    };

    if host.is_empty() {
        return Err("Host cannot be empty".to_string());
    }

    Ok((host, port, use_tls))
}

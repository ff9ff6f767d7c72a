use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::ConnectReturnCode;
use rumqttc::Event;
use rumqttc::EventLoop;
use rumqttc::LastWill;
use rumqttc::MqttOptions;
use rumqttc::Outgoing;
use rumqttc::Packet;
use rumqttc::QoS;
use tracing::debug;

use crate::config::MqttConfig;

/// Capacity of the request queue between the client handle and the event loop.
/// Must hold a full reconnect burst (availability, discovery, status).
const REQUEST_QUEUE_SIZE: usize = 256;

/// Payload delivered on the availability topic while connected.
pub const ONLINE: &str = "online";

/// Payload delivered on the availability topic after disconnecting, also the last will.
pub const OFFLINE: &str = "offline";

/// MQTT message received from a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The broker accepted the connection (ConnAck).
    Connected,
    Message(InboundMessage),
    /// Any other protocol traffic.
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("client error: {0}")]
    Client(String),
}

/// Broker connection driven by the session task
///
/// This trait allows for mocking the broker for testing purposes. `next_event` must be
/// called repeatedly; after an error the next call attempts to reconnect.
#[async_trait]
pub trait Transport: Send {
    async fn next_event(&mut self) -> Result<TransportEvent, TransportError>;

    /// Queue a publish without waiting for the network.
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError>;

    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Flush queued publishes and close the connection.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Real transport implementation using rumqttc
pub struct RumqttcTransport {
    client: AsyncClient,
    event_loop: EventLoop,
}

impl RumqttcTransport {
    pub fn new(config: &MqttConfig, client_id: &str, availability_topic: &str) -> Self {
        let mut mqtt_options =
            MqttOptions::new(client_id.to_string(), config.broker.clone(), config.port);

        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive));

        // Allow large MQTT packets (2 MiB) for discovery payloads
        mqtt_options.set_max_packet_size(2 * 1024 * 1024, 2 * 1024 * 1024);

        mqtt_options.set_last_will(LastWill::new(
            availability_topic,
            OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_QUEUE_SIZE);
        Self { client, event_loop }
    }
}

#[async_trait]
impl Transport for RumqttcTransport {
    async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        match self.event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    Ok(TransportEvent::Connected)
                } else {
                    Err(TransportError::Connection(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )))
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                Ok(TransportEvent::Message(InboundMessage {
                    topic: publish.topic.to_string(),
                    payload: publish.payload.to_vec(),
                }))
            }
            Ok(_) => Ok(TransportEvent::Other),
            Err(e) => Err(TransportError::Connection(e.to_string())),
        }
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload)
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.client
            .try_disconnect()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        // Drive the event loop until the queued publishes and the disconnect are written.
        let flush = async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(TransportError::Connection(e.to_string())),
                }
            }
        };
        match tokio::time::timeout(Duration::from_secs(2), flush).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Timed out flushing MQTT disconnect");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
pub use mock::MockTransport;


#[cfg(test)]
pub use mock::Published;

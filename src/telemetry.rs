//! ==============================================================================
//! telemetry.rs - message-bus publisher
//! ==============================================================================
//!
//! purpose:
//!     turns readings and device status into MQTT messages. owns the broker
//!     session, registers the "offline" last will, and caches the last status
//!     that made it out.
//!
//! topics:
//!     <telemetry_topic>/temperature   {"timestamp","device_id","value","unit":"°C"}
//!     <telemetry_topic>/humidity      {"timestamp","device_id","value","unit":"%"}
//!     <status_topic> (retained)       {"timestamp","device_id","status"}
//!
//!     `temperature_topic` / `humidity_topic` replace the derived names.
//!
//! relationships:
//!     - uses: network.rs (TransportFactory), domain.rs (message shapes)
//!     - implemented by: mqtt.rs (rumqttc connector)
//!     - used by: runtime.rs
//!
//! ==============================================================================

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{iso8601_utc, now_iso8601, Quantity, Reading, StatusMessage, TelemetryMessage};
use crate::network::TransportFactory;
use crate::settings::DeviceSettings;

pub const STATUS_OFFLINE: &str = "offline";
pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no network transport available")]
    NoTransport,

    #[error("no telemetry topic configured")]
    NotConfigured,

    #[error("MQTT client is not connected")]
    NotConnected,

    #[error("MQTT transport error: {0}")]
    Transport(String),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Message the broker publishes on our behalf if we vanish.
#[derive(Debug, Clone, PartialEq)]
pub struct LastWillMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Everything a connector needs to open one broker session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub use_tls: bool,
    pub connect_timeout: Duration,
    pub last_will: Option<LastWillMessage>,
}

/// One live broker session. All calls return within bounded time.
pub trait BusSession {
    fn connect(&mut self) -> Result<(), PublishError>;
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), PublishError>;
    /// Process incoming traffic and keep-alives for up to `timeout`.
    fn service(&mut self, timeout: Duration) -> Result<(), PublishError>;
    fn is_connected(&self) -> bool;
}

pub trait BusConnector {
    fn open(
        &self,
        transport: &TransportFactory,
        options: &SessionOptions,
    ) -> Result<Box<dyn BusSession>, PublishError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicSet {
    pub telemetry: Option<String>,
    pub status: Option<String>,
    pub temperature: Option<String>,
    pub humidity: Option<String>,
}

impl TopicSet {
    pub fn topic_for(&self, quantity: Quantity) -> Option<String> {
        let explicit = match quantity {
            Quantity::Temperature => &self.temperature,
            Quantity::Humidity => &self.humidity,
        };
        explicit.clone().or_else(|| {
            self.telemetry
                .as_deref()
                .map(|base| format!("{}/{}", base.trim_end_matches('/'), quantity.topic_suffix()))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherSettings {
    pub device_id: String,
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub use_tls: bool,
    pub loop_timeout: Duration,
    pub connect_timeout: Duration,
    pub topics: TopicSet,
}

impl PublisherSettings {
    /// `None` when no broker is configured, which disables MQTT.
    pub fn from_device(settings: &DeviceSettings, connect_timeout: Duration) -> Option<Self> {
        let broker_host = settings.broker_address.clone()?;
        Some(Self {
            device_id: settings.device_id.clone(),
            broker_host,
            broker_port: settings.broker_port,
            username: settings.mqtt_username.clone(),
            password: settings.mqtt_password.clone(),
            keep_alive: settings.mqtt_keepalive,
            use_tls: settings.mqtt_use_ssl,
            loop_timeout: settings.mqtt_loop_timeout,
            connect_timeout,
            topics: TopicSet {
                telemetry: settings.telemetry_topic.clone(),
                status: settings.status_topic.clone(),
                temperature: settings.temperature_topic.clone(),
                humidity: settings.humidity_topic.clone(),
            },
        })
    }
}

pub struct TelemetryPublisher {
    settings: PublisherSettings,
    connector: Box<dyn BusConnector>,
    session: Option<Box<dyn BusSession>>,
    last_status: String,
    last_error: Option<String>,
}

impl TelemetryPublisher {
    pub fn new(settings: PublisherSettings, connector: Box<dyn BusConnector>) -> Self {
        Self {
            settings,
            connector,
            session: None,
            last_status: STATUS_OFFLINE.to_string(),
            last_error: None,
        }
    }

    pub fn connect(&mut self, transport: Option<&TransportFactory>) -> Result<(), PublishError> {
        let transport = transport.ok_or(PublishError::NoTransport)?;

        let last_will = match &self.settings.topics.status {
            Some(topic) => Some(LastWillMessage {
                topic: topic.clone(),
                payload: self.status_payload(STATUS_OFFLINE)?,
                retain: true,
            }),
            None => None,
        };

        let options = SessionOptions {
            client_id: self.settings.device_id.clone(),
            host: self.settings.broker_host.clone(),
            port: self.settings.broker_port,
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
            keep_alive: self.settings.keep_alive,
            use_tls: self.settings.use_tls,
            connect_timeout: self.settings.connect_timeout,
            last_will,
        };

        let result = self
            .connector
            .open(transport, &options)
            .and_then(|mut session| session.connect().map(|()| session));

        match result {
            Ok(session) => {
                self.session = Some(session);
                self.last_error = None;
                info!(
                    broker = %self.settings.broker_host,
                    port = self.settings.broker_port,
                    client_id = %self.settings.device_id,
                    "MQTT connected"
                );
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Publish one message per resolvable quantity topic. Returns how many
    /// messages went out.
    pub fn publish_reading(&mut self, reading: &Reading) -> Result<usize, PublishError> {
        let targets: Vec<(Quantity, String)> = Quantity::ALL
            .iter()
            .filter_map(|q| self.settings.topics.topic_for(*q).map(|topic| (*q, topic)))
            .collect();

        if targets.is_empty() {
            return Err(PublishError::NotConfigured);
        }
        if targets.len() < Quantity::ALL.len() {
            warn!(
                topic = %targets[0].1,
                "Only one telemetry topic configured, publishing a partial reading"
            );
        }

        let session = self.session.as_mut().ok_or(PublishError::NotConnected)?;
        let timestamp = iso8601_utc(reading.taken_at);

        for (quantity, topic) in &targets {
            let message = TelemetryMessage {
                timestamp: timestamp.clone(),
                device_id: self.settings.device_id.clone(),
                value: quantity.value_of(reading),
                unit: quantity.unit().to_string(),
            };
            let payload = serde_json::to_string(&message)?;
            if let Err(e) = session.publish(topic, &payload, false) {
                self.last_error = Some(e.to_string());
                return Err(e);
            }
            debug!(%topic, %payload, "Telemetry published");
        }

        Ok(targets.len())
    }

    /// Publish a retained status message. A no-op without a status topic;
    /// the cached status only changes once a message went out.
    pub fn publish_status(&mut self, status: &str) -> Result<(), PublishError> {
        let Some(topic) = self.settings.topics.status.clone() else {
            return Ok(());
        };

        let payload = self.status_payload(status)?;
        let session = self.session.as_mut().ok_or(PublishError::NotConnected)?;
        if let Err(e) = session.publish(&topic, &payload, true) {
            self.last_error = Some(e.to_string());
            return Err(e);
        }

        debug!(%topic, %status, "Status published");
        self.last_status = status.to_string();
        Ok(())
    }

    /// Drive keep-alives for `mqtt_loop_timeout`. No session, nothing to do.
    pub fn service(&mut self) -> Result<(), PublishError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.service(self.settings.loop_timeout).map_err(|e| {
            self.last_error = Some(e.to_string());
            e
        })
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_connected())
    }

    pub fn last_status(&self) -> &str {
        &self.last_status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn status_payload(&self, status: &str) -> Result<String, PublishError> {
        let message = StatusMessage {
            timestamp: now_iso8601(),
            device_id: self.settings.device_id.clone(),
            status: status.to_string(),
        };
        Ok(serde_json::to_string(&message)?)
    }
}

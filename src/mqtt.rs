//! ==============================================================================
//! mqtt.rs - rumqttc-backed bus connector
//! ==============================================================================
//!
//! purpose:
//!     the only module that speaks MQTT. builds `rumqttc::MqttOptions` from
//!     `SessionOptions` and wraps the blocking `Client`/`Connection` pair as a
//!     `BusSession`. every call is bounded: connect waits for CONNACK up to the
//!     configured timeout, service drains events up to the loop timeout.
//!
//! relationships:
//!     - implements: telemetry.rs (BusConnector, BusSession)
//!     - uses: network.rs (TransportFactory for broker name resolution)
//!     - used by: runtime.rs (bootstrap)
//!
//! ==============================================================================

use std::time::{Duration, Instant};

use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, LastWill, MqttOptions, Packet, QoS, Transport,
};
use tracing::{debug, warn};

use crate::network::TransportFactory;
use crate::telemetry::{BusConnector, BusSession, PublishError, SessionOptions};

/// rumqttc rejects keep-alives below five seconds
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// pending publishes queued between two service calls
const REQUEST_CAPACITY: usize = 10;

#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttConnector;

impl BusConnector for RumqttConnector {
    fn open(
        &self,
        transport: &TransportFactory,
        options: &SessionOptions,
    ) -> Result<Box<dyn BusSession>, PublishError> {
        let mqtt_options = build_options(transport, options)?;
        let (client, connection) = Client::new(mqtt_options, REQUEST_CAPACITY);
        Ok(Box::new(RumqttSession {
            client,
            connection,
            connect_timeout: options.connect_timeout,
            connected: false,
        }))
    }
}

/// Translate session options into rumqttc options.
///
/// Plain TCP connects to the address the transport resolved; TLS keeps the
/// host name for certificate verification.
fn build_options(
    transport: &TransportFactory,
    options: &SessionOptions,
) -> Result<MqttOptions, PublishError> {
    let host = if options.use_tls {
        options.host.clone()
    } else {
        transport
            .resolve(&options.host, options.port)
            .map_err(|e| PublishError::Transport(format!("cannot resolve {}: {}", options.host, e)))?
            .ip()
            .to_string()
    };

    let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, options.port);
    mqtt_options.set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));
    mqtt_options.set_clean_session(true);

    if let Some(username) = &options.username {
        mqtt_options.set_credentials(username.clone(), options.password.clone().unwrap_or_default());
    }

    if let Some(will) = &options.last_will {
        mqtt_options.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.clone().into_bytes(),
            QoS::AtLeastOnce,
            will.retain,
        ));
    }

    if options.use_tls {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    Ok(mqtt_options)
}

pub struct RumqttSession {
    client: Client,
    connection: Connection,
    connect_timeout: Duration,
    connected: bool,
}

impl BusSession for RumqttSession {
    fn connect(&mut self) -> Result<(), PublishError> {
        let deadline = Instant::now() + self.connect_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PublishError::Transport("timed out waiting for CONNACK".into()));
            }

            match self.connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code == ConnectReturnCode::Success {
                        self.connected = true;
                        return Ok(());
                    }
                    return Err(PublishError::Transport(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )));
                }
                Ok(Ok(event)) => debug!(?event, "MQTT event before CONNACK"),
                Ok(Err(e)) => return Err(PublishError::Transport(e.to_string())),
                Err(_) => {
                    return Err(PublishError::Transport("timed out waiting for CONNACK".into()))
                }
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), PublishError> {
        if !self.connected {
            return Err(PublishError::NotConnected);
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec())
            .map_err(|e| PublishError::Transport(e.to_string()))
    }

    fn service(&mut self, timeout: Duration) -> Result<(), PublishError> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }

            match self.connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    self.connected = ack.code == ConnectReturnCode::Success;
                    debug!(code = ?ack.code, "MQTT reconnected");
                }
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    warn!("Disconnected by broker");
                    self.connected = false;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.connected = false;
                    return Err(PublishError::Transport(e.to_string()));
                }
                // no traffic within the window
                Err(_) => return Ok(()),
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

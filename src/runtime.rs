//! ==============================================================================
//! runtime.rs - device runtime and cooperative poll loop
//! ==============================================================================
//!
//! purpose:
//!     owns every subsystem and drives them from a single thread. startup is
//!     best-effort: a missing settings file, an unreachable network or a dead
//!     broker each disable only what depends on them.
//!
//! startup order:
//!
//!     ConfigStore ─▶ ConnectivitySession ─▶ SensorReader ─▶ TelemetryPublisher
//!                    (only with an ssid)                    (only with a broker)
//!                                                     ─▶ ConfigHttpServer ─▶ status LED
//!                                                        (only with a session)
//!
//! one tick:
//!     1. service the mqtt keep-alive
//!     2. serve at most one pending http connection
//!     3. when the reading interval has elapsed, read the sensor and fan the
//!        result out to the log, the status led and the publisher
//!
//! relationships:
//!     - uses: every subsystem module, hal.rs for the real capabilities
//!     - used by: main.rs (bootstrap + run)
//!
//! ==============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{HostConfig, LifecycleConfig};
use crate::gpio::{resolve_pin, SensorKind};
use crate::hal::{DhtDriver, Hal, LinkLayer, StatusLed};
use crate::http::{ConfigHttpServer, ReadLimits, RequestContext, StatusSnapshot};
use crate::lifecycle::{restart_device, RestartRequest};
use crate::mqtt::RumqttConnector;
use crate::network::{ConnectivitySession, TransportFactory};
use crate::sensor::{SensorError, SensorReader};
use crate::settings::{DeviceSettings, SettingsDocument};
use crate::store::{ConfigError, ConfigStore, SettingsStore};
use crate::telemetry::{
    BusConnector, PublishError, PublisherSettings, TelemetryPublisher, STATUS_ERROR, STATUS_OK,
};

/// pause at the end of every tick
pub const LOOP_PAUSE: Duration = Duration::from_millis(50);
/// how long the status led stays lit after a reading
pub const LED_BLINK: Duration = Duration::from_millis(50);

/// Builds a sensor driver once the sensor type and pin are known.
pub type DhtFactory<'a> = Box<dyn FnOnce(SensorKind, u8) -> Box<dyn DhtDriver> + 'a>;

/// Everything the runtime talks to the outside world through.
pub struct Capabilities<'a> {
    pub clock: Rc<dyn Clock>,
    pub store: Box<dyn SettingsStore>,
    pub link: Box<dyn LinkLayer>,
    pub dht: DhtFactory<'a>,
    pub connector: Box<dyn BusConnector>,
    pub status_led: Option<Box<dyn StatusLed>>,
}

pub struct DeviceRuntime {
    clock: Rc<dyn Clock>,
    store: Box<dyn SettingsStore>,
    settings: SettingsDocument,
    device: DeviceSettings,
    network: Option<ConnectivitySession>,
    sensor: SensorReader,
    publisher: Option<TelemetryPublisher>,
    http: Option<ConfigHttpServer>,
    led: Option<Box<dyn StatusLed>>,
    show_sensor_data: bool,
    last_reading_at: Option<Instant>,
    sensor_fault_reported: bool,
}

impl DeviceRuntime {
    /// Start the device with the real (or mock, without `hardware`) capabilities.
    pub fn bootstrap(config: &HostConfig, hal: &Hal, clock: Rc<dyn Clock>) -> Self {
        let status_led = config.hardware.status_led_pin.and_then(|pin| match hal.status_led(pin) {
            Ok(led) => Some(led),
            Err(e) => {
                warn!(pin, error = %format!("{:#}", e), "Status LED unavailable");
                None
            }
        });

        Self::assemble(
            config,
            Capabilities {
                clock,
                store: Box::new(ConfigStore::new(&config.settings.path)),
                link: hal.link_layer(),
                dht: Box::new(|kind: SensorKind, pin: u8| hal.dht(kind, pin)),
                connector: Box::new(RumqttConnector),
                status_led,
            },
        )
    }

    /// Run the startup sequence against explicit capabilities.
    pub fn assemble(config: &HostConfig, caps: Capabilities<'_>) -> Self {
        let Capabilities { clock, store, link, dht, connector, status_led } = caps;

        // 1. settings
        let settings = load_settings(store.as_ref());
        let device = DeviceSettings::from_document(&settings);
        info!(
            device_id = %device.device_id,
            sensor = %device.sensor_type,
            pin = %device.sensor_pin,
            interval_s = device.reading_interval.as_secs_f64(),
            "Device settings loaded"
        );

        // 2. network
        let mut network = if device.wifi_ssid.is_empty() {
            info!("No Wi-Fi SSID configured, running offline");
            None
        } else {
            let mut session = ConnectivitySession::new(
                link,
                device.wifi_ssid.clone(),
                device.wifi_password.clone(),
                Rc::clone(&clock),
            );
            session.connect();
            Some(session)
        };
        let transport = network.as_mut().and_then(|n| n.transport_factory().ok());

        // 3. sensor
        let driver = match (SensorKind::parse(&device.sensor_type), resolve_pin(&device.sensor_pin)) {
            (Some(kind), Some(pin)) => {
                info!(?kind, pin, "Sensor initialized");
                Some(dht(kind, pin))
            }
            (kind, pin) => {
                error!(
                    sensor_type = %device.sensor_type,
                    sensor_pin = %device.sensor_pin,
                    type_ok = kind.is_some(),
                    pin_ok = pin.is_some(),
                    "Sensor could not be initialized"
                );
                None
            }
        };
        let sensor = SensorReader::new(driver, Rc::clone(&clock));

        // 4. telemetry
        let publisher = match PublisherSettings::from_device(&device, config.mqtt.connect_timeout()) {
            Some(publisher_settings) => start_publisher(publisher_settings, connector, transport.as_deref()),
            None => {
                info!("No broker configured, MQTT disabled");
                None
            }
        };

        // 5. http
        let http = match (&network, transport.as_deref()) {
            (None, _) => None,
            (Some(_), None) => {
                warn!("Network not connected, configuration server not started");
                None
            }
            (Some(_), Some(transport)) => start_http(config, transport),
        };

        Self {
            clock,
            store,
            settings,
            device,
            network,
            sensor,
            publisher,
            http,
            led: status_led,
            show_sensor_data: config.logging.show_sensor_data,
            last_reading_at: None,
            sensor_fault_reported: false,
        }
    }

    /// One pass of the poll loop. Returns a restart request when persisted
    /// settings need a reboot to take effect.
    pub fn tick(&mut self) -> Option<RestartRequest> {
        self.service_bus();

        if let Some(restart) = self.poll_http() {
            return Some(restart);
        }

        if self.reading_due() {
            self.last_reading_at = Some(self.clock.now());
            self.take_reading();
        }
        None
    }

    /// Loop forever; a restart request ends the process.
    pub fn run(mut self, lifecycle: &LifecycleConfig) -> ! {
        info!(interval_s = self.device.reading_interval.as_secs_f64(), "Entering poll loop");
        loop {
            if let Some(restart) = self.tick() {
                restart_device(lifecycle, &restart);
            }
            self.clock.sleep(LOOP_PAUSE);
        }
    }

    pub fn settings(&self) -> &SettingsDocument {
        &self.settings
    }

    pub fn device(&self) -> &DeviceSettings {
        &self.device
    }

    pub fn is_online(&self) -> bool {
        self.network.as_ref().is_some_and(|n| n.is_connected())
    }

    pub fn is_publishing(&self) -> bool {
        self.publisher.is_some()
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// What `/api/status` reports right now.
    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            device_id: self.device.device_id.clone(),
            status: self
                .publisher
                .as_ref()
                .map_or(STATUS_OK, |p| p.last_status())
                .to_string(),
            ip: self
                .network
                .as_ref()
                .map_or(Ipv4Addr::UNSPECIFIED, |n| n.address()),
        }
    }

    fn service_bus(&mut self) {
        let Some(publisher) = self.publisher.as_mut() else {
            return;
        };
        if let Err(e) = publisher.service() {
            warn!(error = %e, "MQTT service failed");
            report_error(publisher);
        }
    }

    fn poll_http(&mut self) -> Option<RestartRequest> {
        let status = self.status_snapshot();
        let server = self.http.as_mut()?;
        let mut ctx = RequestContext { settings: &mut self.settings, store: self.store.as_ref(), status };
        server.poll(&mut ctx)
    }

    fn reading_due(&self) -> bool {
        self.last_reading_at.map_or(true, |at| {
            self.clock.now().saturating_duration_since(at) >= self.device.reading_interval
        })
    }

    fn take_reading(&mut self) {
        let reading = match self.sensor.read() {
            Ok(reading) => reading,
            Err(SensorError::NotInitialized) => {
                if !self.sensor_fault_reported {
                    error!("Sensor not initialized, check sensor_type and sensor_pin");
                    self.sensor_fault_reported = true;
                }
                if let Some(publisher) = self.publisher.as_mut() {
                    report_error(publisher);
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "Sensor read failed");
                if let Some(publisher) = self.publisher.as_mut() {
                    report_error(publisher);
                }
                return;
            }
        };

        if self.show_sensor_data {
            info!(
                temperature = %format!("{:.1}°C", reading.temperature),
                humidity = %format!("{:.1}%", reading.humidity),
                "Reading"
            );
        }
        self.blink();

        let Some(publisher) = self.publisher.as_mut() else {
            return;
        };
        let outcome = publisher
            .publish_status(STATUS_OK)
            .and_then(|()| publisher.publish_reading(&reading));
        match outcome {
            Ok(messages) => debug!(messages, "Telemetry published"),
            Err(PublishError::NotConfigured) => debug!("No telemetry topics configured"),
            Err(e) => {
                warn!(error = %e, "Telemetry publish failed");
                report_error(publisher);
            }
        }
    }

    fn blink(&mut self) {
        let Some(led) = self.led.as_mut() else {
            return;
        };
        let result = led.set(true).and_then(|()| {
            self.clock.sleep(LED_BLINK);
            led.set(false)
        });
        if let Err(e) = result {
            warn!(error = %format!("{:#}", e), "Status LED failed, disabling it");
            self.led = None;
        }
    }
}

fn load_settings(store: &dyn SettingsStore) -> SettingsDocument {
    match store.load() {
        Ok(settings) => settings,
        Err(e @ ConfigError::NotFound(_)) => {
            info!(reason = %e, "No saved settings, using defaults");
            SettingsDocument::defaults()
        }
        Err(e) => {
            warn!(error = %e, "Settings unreadable, using defaults");
            SettingsDocument::defaults()
        }
    }
}

fn start_publisher(
    settings: PublisherSettings,
    connector: Box<dyn BusConnector>,
    transport: Option<&TransportFactory>,
) -> Option<TelemetryPublisher> {
    let mut publisher = TelemetryPublisher::new(settings, connector);
    if let Err(e) = publisher.connect(transport) {
        warn!(error = %e, "MQTT connection failed, telemetry disabled");
        return None;
    }
    if let Err(e) = publisher.publish_status(STATUS_OK) {
        warn!(error = %e, "Initial status publish failed");
    }
    Some(publisher)
}

fn start_http(config: &HostConfig, transport: &TransportFactory) -> Option<ConfigHttpServer> {
    let ip: IpAddr = match config.http.bind_address.parse() {
        Ok(ip) => ip,
        Err(e) => {
            warn!(bind_address = %config.http.bind_address, error = %e, "Invalid HTTP bind address");
            return None;
        }
    };
    let bind = SocketAddr::new(ip, config.http.port);

    match ConfigHttpServer::start(transport, bind, ReadLimits::from(&config.http)) {
        Ok(server) => {
            let shown = server.local_addr().unwrap_or(bind);
            info!(address = %transport.local_address(), listen = %shown, "Configuration server listening");
            Some(server)
        }
        Err(e) => {
            warn!(%bind, error = %e, "Configuration server could not start");
            None
        }
    }
}

fn report_error(publisher: &mut TelemetryPublisher) {
    if let Err(e) = publisher.publish_status(STATUS_ERROR) {
        debug!(error = %e, "Error status not delivered");
    }
}

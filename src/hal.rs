//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     the three narrow capabilities the runtime needs from the board:
//!     a network link layer, a dht sensor driver and a status led.
//!     abstracts away the difference between running on a real Raspberry Pi
//!     and a development machine (using mocks).
//!
//! design:
//!     - the default build compiles on any machine with mock capabilities.
//!     - feature="hardware" selects NetworkManager for the link, the adafruit
//!       python driver for the sensor and rppal for the led.
//!     - an absent capability is decided here, at construction, and disables
//!       the dependent subsystem instead of failing later.
//!
//! relationships:
//!     - used by: runtime.rs (bootstrap)
//!     - uses: gpio.rs (dht subprocess driver, rppal led)
//!     - uses: std::process::Command (nmcli)
//!
//! ==============================================================================

use std::net::Ipv4Addr;

use anyhow::{bail, Context, Result};

use crate::config::HardwareConfig;
use crate::gpio::{self, SensorKind};

/// Radio / link-layer association.
pub trait LinkLayer {
    /// Associate with the given network. Returns once the attempt finished.
    fn associate(&mut self, ssid: &str, password: &str) -> Result<()>;
    /// The IPv4 address currently assigned, if any.
    fn ipv4_address(&self) -> Option<Ipv4Addr>;
}

/// Temperature / humidity driver.
pub trait DhtDriver {
    /// `Ok(None)` when the sensor produced no value this time.
    fn sample(&mut self) -> Result<Option<(f32, f32)>>;
}

pub trait StatusLed {
    fn set(&mut self, on: bool) -> Result<()>;
}

// ==============================================================================================
// NETWORKMANAGER LINK (any linux host with nmcli)
// ==============================================================================================

/// Wi-Fi association through `nmcli`.
pub struct NmcliLink {
    interface: String,
}

impl NmcliLink {
    pub fn new(interface: impl Into<String>) -> Self {
        Self { interface: interface.into() }
    }
}

impl LinkLayer for NmcliLink {
    fn associate(&mut self, ssid: &str, password: &str) -> Result<()> {
        use std::process::Command;

        let mut cmd = Command::new("nmcli");
        cmd.args(["device", "wifi", "connect", ssid]);
        if !password.is_empty() {
            cmd.args(["password", password]);
        }
        cmd.args(["ifname", &self.interface]);

        let output = cmd.output().context("Failed to run nmcli")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("nmcli connect failed: {}", stderr.trim());
        }
        Ok(())
    }

    fn ipv4_address(&self) -> Option<Ipv4Addr> {
        use std::process::Command;

        let output = Command::new("nmcli")
            .args(["-g", "IP4.ADDRESS", "device", "show", &self.interface])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_nmcli_address(&String::from_utf8_lossy(&output.stdout))
    }
}

/// `192.168.1.20/24 | 10.0.0.5/8` -> first address
fn parse_nmcli_address(raw: &str) -> Option<Ipv4Addr> {
    raw.split(['|', '\n'])
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .find_map(|entry| entry.split('/').next()?.parse().ok())
}

// ==============================================================================================
// PYTHON DHT DRIVER
// ==============================================================================================

pub struct PythonDht {
    kind: SensorKind,
    pin: u8,
}

impl PythonDht {
    pub fn new(kind: SensorKind, pin: u8) -> Self {
        Self { kind, pin }
    }
}

impl DhtDriver for PythonDht {
    fn sample(&mut self) -> Result<Option<(f32, f32)>> {
        gpio::read_dht(self.kind, self.pin)
    }
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For WSL / Non-Hardware Build)
// ==============================================================================================

/// Pretends to associate and reports the host's primary address.
#[derive(Debug, Default)]
pub struct MockLink {
    associated: bool,
}

impl LinkLayer for MockLink {
    fn associate(&mut self, ssid: &str, _password: &str) -> Result<()> {
        tracing::debug!("[MOCK LINK] Associating with {:?}", ssid);
        self.associated = true;
        Ok(())
    }

    fn ipv4_address(&self) -> Option<Ipv4Addr> {
        if !self.associated {
            return None;
        }
        Some(primary_ipv4().unwrap_or(Ipv4Addr::LOCALHOST))
    }
}

/// Source address the kernel would route external traffic from.
/// A UDP "connect" sends nothing.
fn primary_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct MockDht;

impl DhtDriver for MockDht {
    fn sample(&mut self) -> Result<Option<(f32, f32)>> {
        tracing::debug!("[MOCK DHT] Sampling");
        Ok(Some((25.0, 50.0))) // Mock data
    }
}

#[derive(Debug)]
pub struct MockLed {
    pin: u8,
}

impl StatusLed for MockLed {
    fn set(&mut self, on: bool) -> Result<()> {
        tracing::debug!("[MOCK LED] Pin {} {}", self.pin, if on { "ON" } else { "OFF" });
        Ok(())
    }
}

// ==============================================================================================
// CAPABILITY FACTORY
// ==============================================================================================

pub struct Hal {
    #[cfg_attr(not(feature = "hardware"), allow(dead_code))]
    wifi_interface: String,
}

#[cfg(not(feature = "hardware"))]
impl Hal {
    pub fn new(config: &HardwareConfig) -> Self {
        tracing::info!("Using MOCK HAL (No hardware access)");
        Self { wifi_interface: config.wifi_interface.clone() }
    }

    pub fn link_layer(&self) -> Box<dyn LinkLayer> {
        Box::new(MockLink::default())
    }

    pub fn dht(&self, kind: SensorKind, pin: u8) -> Box<dyn DhtDriver> {
        tracing::debug!("[MOCK DHT] {:?} on pin {}", kind, pin);
        Box::new(MockDht)
    }

    pub fn status_led(&self, pin: u8) -> Result<Box<dyn StatusLed>> {
        Ok(Box::new(MockLed { pin }))
    }
}

#[cfg(feature = "hardware")]
impl Hal {
    pub fn new(config: &HardwareConfig) -> Self {
        tracing::info!("Using REAL HARDWARE HAL (nmcli, adafruit_dht, rppal)");
        Self { wifi_interface: config.wifi_interface.clone() }
    }

    pub fn link_layer(&self) -> Box<dyn LinkLayer> {
        Box::new(NmcliLink::new(self.wifi_interface.clone()))
    }

    pub fn dht(&self, kind: SensorKind, pin: u8) -> Box<dyn DhtDriver> {
        Box::new(PythonDht::new(kind, pin))
    }

    pub fn status_led(&self, pin: u8) -> Result<Box<dyn StatusLed>> {
        Ok(Box::new(gpio::GpioLed::new(pin)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nmcli_address_parsing() {
        assert_eq!(
            parse_nmcli_address("192.168.1.20/24\n"),
            Some(Ipv4Addr::new(192, 168, 1, 20))
        );
        assert_eq!(
            parse_nmcli_address("10.0.0.5/8 | 172.16.0.2/16"),
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
        assert_eq!(parse_nmcli_address(""), None);
        assert_eq!(parse_nmcli_address("--"), None);
    }

    #[test]
    fn test_mock_link_needs_association() {
        let mut link = MockLink::default();
        assert_eq!(link.ipv4_address(), None);
        link.associate("lab", "secret").unwrap();
        assert!(link.ipv4_address().is_some());
    }

    #[test]
    fn test_mock_dht_reads() {
        assert_eq!(MockDht.sample().unwrap(), Some((25.0, 50.0)));
    }
}

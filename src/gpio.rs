//! ==============================================================================
//! gpio.rs - pin naming and the real sensor / led drivers
//! ==============================================================================
//!
//! purpose:
//!     resolves the `sensor_pin` setting into a BCM pin number, selects the DHT
//!     variant from `sensor_type`, and talks to the physical DHT sensor and the
//!     status LED on a Raspberry Pi.
//!
//! relationships:
//!     - used by: hal.rs (PythonDht, status LED under feature="hardware")
//!     - used by: runtime.rs (pin + sensor type resolution at startup)
//!     - uses: python3/adafruit_dht (via subprocess for reliable timing)
//!     - uses: rppal (status LED, feature="hardware" only)
//!
//! why subprocess to python?:
//!     dht sensors require precise bit-banging timing (~microseconds).
//!     pure rust in userspace is unreliable due to lack of real-time guarantees.
//!     adafruit_dht handles this correctly with retries and timing compensation.
//!
//! ==============================================================================

use anyhow::{anyhow, Result};

/// highest BCM GPIO number on the supported boards
pub const MAX_GPIO: u8 = 53;

/// supported dht variants
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorKind {
    Dht11,
    Dht22,
}

impl SensorKind {
    /// `DHT11`, `DHT22` or `AM2302` (the packaged DHT22), any case
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DHT11" => Some(SensorKind::Dht11),
            "DHT22" | "AM2302" => Some(SensorKind::Dht22),
            _ => None,
        }
    }

    /// class name in the adafruit_dht python package
    pub fn driver_class(self) -> &'static str {
        match self {
            SensorKind::Dht11 => "DHT11",
            SensorKind::Dht22 => "DHT22",
        }
    }
}

/// resolve a pin setting such as `9`, `GP9`, `D9` or `GPIO9`
pub fn resolve_pin(raw: &str) -> Option<u8> {
    let raw = raw.trim();
    let upper = raw.to_ascii_uppercase();
    let digits = ["GPIO", "GP", "D"]
        .iter()
        .find_map(|prefix| upper.strip_prefix(prefix))
        .unwrap_or(&upper);

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u8>().ok().filter(|pin| *pin <= MAX_GPIO)
}

/// read a dht sensor once
///
/// `Ok(None)` means the sensor answered without a value (checksum miss,
/// too early); `Err` means the driver itself failed.
pub fn read_dht(kind: SensorKind, pin: u8) -> Result<Option<(f32, f32)>> {
    use std::process::Command;

    let script = format!(
        r#"
import sys
try:
    import adafruit_dht
    import board
    import json

    dht = adafruit_dht.{class}(board.D{pin})

    try:
        t, h = dht.temperature, dht.humidity
        if t is not None and h is not None:
            print(json.dumps({{"t": t, "h": h}}))
        else:
            print("null")
    except RuntimeError:
        # adafruit_dht raises RuntimeError for ordinary missed reads
        print("null")
    finally:
        dht.exit()
except Exception as e:
    print(str(e), file=sys.stderr)
    sys.exit(1)
"#,
        class = kind.driver_class(),
        pin = pin
    );

    let output = Command::new("python3")
        .arg("-c")
        .arg(&script)
        .output()
        .map_err(|e| anyhow!("Failed to run python3: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("Python error: {}", stderr.trim()));
    }

    parse_driver_output(&String::from_utf8_lossy(&output.stdout))
}

fn parse_driver_output(stdout: &str) -> Result<Option<(f32, f32)>> {
    let stdout = stdout.trim();
    if stdout == "null" || stdout.is_empty() {
        return Ok(None);
    }

    let parsed: serde_json::Value = serde_json::from_str(stdout)
        .map_err(|e| anyhow!("JSON parse error: {} (got: {})", e, stdout))?;

    let temp = parsed["t"].as_f64().ok_or_else(|| anyhow!("Missing temp"))? as f32;
    let humidity = parsed["h"].as_f64().ok_or_else(|| anyhow!("Missing humidity"))? as f32;

    Ok(Some((temp, humidity)))
}

// ==============================================================================
// status led - plain gpio output via rppal
// ==============================================================================

#[cfg(feature = "hardware")]
pub struct GpioLed {
    pin: rppal::gpio::OutputPin,
}

#[cfg(feature = "hardware")]
impl GpioLed {
    pub fn new(pin: u8) -> Result<Self> {
        let gpio = rppal::gpio::Gpio::new()?;
        let mut pin = gpio.get(pin)?.into_output();
        pin.set_low();
        Ok(Self { pin })
    }
}

#[cfg(feature = "hardware")]
impl crate::hal::StatusLed for GpioLed {
    fn set(&mut self, on: bool) -> Result<()> {
        if on {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        Ok(())
    }
}

//! ==============================================================================
//! sensor.rs - rate-limited sensor acquisition
//! ==============================================================================
//!
//! purpose:
//!     wraps a `DhtDriver` with the timing rules of the dht family: at most one
//!     successful read every `MIN_READ_INTERVAL`, a few retries per read for the
//!     frequent checksum misses, and a cached last error for diagnostics.
//!
//! relationships:
//!     - uses: hal.rs (DhtDriver), clock.rs (waits), domain.rs (Reading)
//!     - used by: runtime.rs
//!
//! ==============================================================================

use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;
use crate::domain::Reading;
use crate::hal::DhtDriver;

/// dht sensors need two seconds between conversions
pub const MIN_READ_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_READ_ATTEMPTS: u32 = 3;
pub const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SensorError {
    #[error("sensor is not initialized")]
    NotInitialized,

    #[error("sensor returned no value")]
    NoValue,

    #[error("sensor driver error: {0}")]
    Driver(String),

    #[error("sensor read failed after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },
}

pub struct SensorReader {
    driver: Option<Box<dyn DhtDriver>>,
    clock: Rc<dyn Clock>,
    last_success: Option<Instant>,
    last_error: Option<SensorError>,
}

impl SensorReader {
    /// `driver` is `None` when the sensor type or pin could not be resolved.
    pub fn new(driver: Option<Box<dyn DhtDriver>>, clock: Rc<dyn Clock>) -> Self {
        Self { driver, clock, last_success: None, last_error: None }
    }

    pub fn is_initialized(&self) -> bool {
        self.driver.is_some()
    }

    pub fn read(&mut self) -> Result<Reading, SensorError> {
        let Some(driver) = self.driver.as_mut() else {
            return Err(SensorError::NotInitialized);
        };

        if let Some(last) = self.last_success {
            let elapsed = self.clock.now().saturating_duration_since(last);
            if elapsed < MIN_READ_INTERVAL {
                self.clock.sleep(MIN_READ_INTERVAL - elapsed);
            }
        }

        for attempt in 1..=MAX_READ_ATTEMPTS {
            let failure = match driver.sample() {
                Ok(Some((temperature, humidity))) if temperature.is_finite() && humidity.is_finite() => {
                    self.last_success = Some(self.clock.now());
                    self.last_error = None;
                    return Ok(Reading { temperature, humidity, taken_at: Utc::now() });
                }
                Ok(_) => SensorError::NoValue,
                Err(e) => SensorError::Driver(format!("{:#}", e)),
            };

            debug!(attempt, error = %failure, "Sensor read attempt failed");
            self.last_error = Some(failure);
            self.clock.sleep(READ_RETRY_DELAY);
        }

        let reason = self
            .last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        Err(SensorError::Exhausted { attempts: MAX_READ_ATTEMPTS, reason })
    }

    /// last transient failure, cleared by the next successful read
    pub fn last_error(&self) -> Option<&SensorError> {
        self.last_error.as_ref()
    }
}

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// one successful sensor acquisition
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    /// temperature in celsius
    pub temperature: f32,
    /// relative humidity (0-100%)
    pub humidity: f32,
    /// when the driver produced the sample
    pub taken_at: DateTime<Utc>,
}

/// the two quantities a reading fans out into
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quantity {
    Temperature,
    Humidity,
}

impl Quantity {
    pub const ALL: [Quantity; 2] = [Quantity::Temperature, Quantity::Humidity];

    pub fn unit(self) -> &'static str {
        match self {
            Quantity::Temperature => "°C",
            Quantity::Humidity => "%",
        }
    }

    /// suffix appended to the base telemetry topic
    pub fn topic_suffix(self) -> &'static str {
        match self {
            Quantity::Temperature => "temperature",
            Quantity::Humidity => "humidity",
        }
    }

    pub fn value_of(self, reading: &Reading) -> f32 {
        match self {
            Quantity::Temperature => reading.temperature,
            Quantity::Humidity => reading.humidity,
        }
    }
}

/// per-quantity telemetry payload
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TelemetryMessage {
    pub timestamp: String,
    pub device_id: String,
    pub value: f32,
    pub unit: String,
}

/// retained device status payload (also the last-will body)
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StatusMessage {
    pub timestamp: String,
    pub device_id: String,
    pub status: String,
}

/// UTC timestamp with second precision, e.g. `2024-05-01T12:00:00Z`
pub fn iso8601_utc(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn now_iso8601() -> String {
    iso8601_utc(Utc::now())
}

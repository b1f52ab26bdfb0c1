//! ==============================================================================
//! settings.rs - device settings document
//! ==============================================================================
//!
//! purpose:
//!     the flat `key = value` document persisted on the device and edited over
//!     HTTP. parsing and serialization live here; file I/O lives in store.rs.
//!
//! format:
//!     one assignment per line, `#` comment lines and blank lines ignored.
//!
//!         wifi_ssid = "home"
//!         broker_port = 1883
//!         reading_interval_seconds = 2.5
//!         mqtt_use_ssl = false
//!
//!     unquoted tokens are coerced: true/false (any case) -> bool, a token with
//!     a `.` that parses as a finite number -> float, an integer -> int,
//!     anything else -> raw string. quoted tokens are strings.
//!
//! relationships:
//!     - used by: store.rs (load / persist), http/routes.rs (form + json api),
//!       runtime.rs (typed view via DeviceSettings)
//!
//! ==============================================================================

use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 60;
pub const DEFAULT_DEVICE_ID: &str = "pico-sensor";
pub const DEFAULT_SENSOR_PIN: i64 = 9;
pub const DEFAULT_SENSOR_TYPE: &str = "DHT11";
pub const DEFAULT_READING_INTERVAL_SECS: i64 = 2;
pub const DEFAULT_LOOP_TIMEOUT_SECS: f64 = 1.0;
pub const DEFAULT_NTP_SERVER: &str = "pool.ntp.org";

/// A single scalar setting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SettingValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl SettingValue {
    /// Parse the right-hand side of an assignment line.
    pub fn parse_token(raw: &str) -> Self {
        let raw = raw.trim();

        if let Some(inner) = raw.strip_prefix('"') {
            if let Some((body, tail)) = split_basic_string(inner) {
                if is_blank_or_comment(tail) {
                    return SettingValue::Str(unescape(body));
                }
            }
        } else if let Some(inner) = raw.strip_prefix('\'') {
            if let Some(end) = inner.find('\'') {
                if is_blank_or_comment(&inner[end + 1..]) {
                    return SettingValue::Str(inner[..end].to_string());
                }
            }
        }

        Self::from_bare_token(strip_trailing_comment(raw))
    }

    fn from_bare_token(token: &str) -> Self {
        let lowered = token.to_ascii_lowercase();
        if lowered == "true" || lowered == "false" {
            return SettingValue::Bool(lowered == "true");
        }
        if token.contains('.') {
            if let Ok(value) = token.parse::<f64>() {
                if value.is_finite() {
                    return SettingValue::Float(value);
                }
            }
        }
        if let Ok(value) = token.parse::<i64>() {
            return SettingValue::Int(value);
        }
        SettingValue::Str(token.to_string())
    }

    /// Render the value the way it is written to the settings file.
    pub fn to_token(&self) -> String {
        match self {
            SettingValue::Str(s) => format!("\"{}\"", escape(s)),
            SettingValue::Int(i) => i.to_string(),
            SettingValue::Float(f) => format_float(*f),
            SettingValue::Bool(b) => b.to_string(),
        }
    }

    /// Convert a JSON scalar. `null`, arrays, objects and non-finite numbers
    /// have no settings representation.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(SettingValue::Str(s.clone())),
            serde_json::Value::Bool(b) => Some(SettingValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(SettingValue::Int(i))
                } else {
                    n.as_f64().filter(|f| f.is_finite()).map(SettingValue::Float)
                }
            }
            _ => None,
        }
    }

    /// Coerce a form field to the type of the value it replaces.
    ///
    /// Keys without a current value, and input that does not fit the current
    /// type, are kept as strings.
    pub fn coerce_like(existing: Option<&SettingValue>, raw: &str) -> Self {
        let trimmed = raw.trim();
        let coerced = match existing {
            Some(SettingValue::Int(_)) => trimmed.parse::<i64>().ok().map(SettingValue::Int),
            Some(SettingValue::Float(_)) => trimmed
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(SettingValue::Float),
            Some(SettingValue::Bool(_)) => parse_flag(trimmed).map(SettingValue::Bool),
            _ => None,
        };
        coerced.unwrap_or_else(|| SettingValue::Str(raw.to_string()))
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Str(s) => f.write_str(s),
            SettingValue::Int(i) => write!(f, "{}", i),
            SettingValue::Float(v) => f.write_str(&format_float(*v)),
            SettingValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Parse failure with the 1-based line it happened on.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub reason: String,
}

impl ParseError {
    fn new(line: usize, reason: impl Into<String>) -> Self {
        Self { line, reason: reason.into() }
    }
}

/// Ordered flat key -> scalar mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SettingsDocument {
    entries: IndexMap<String, SettingValue>,
}

impl SettingsDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// The documented defaults, used when no settings file can be loaded.
    pub fn defaults() -> Self {
        let mut doc = Self::new();
        for key in [
            "wifi_ssid",
            "wifi_password",
            "broker_address",
        ] {
            doc.insert(key, SettingValue::Str(String::new()));
        }
        doc.insert("broker_port", SettingValue::Int(DEFAULT_BROKER_PORT as i64));
        for key in [
            "telemetry_topic",
            "status_topic",
            "temperature_topic",
            "humidity_topic",
            "mqtt_username",
            "mqtt_password",
        ] {
            doc.insert(key, SettingValue::Str(String::new()));
        }
        doc.insert("mqtt_keepalive", SettingValue::Int(DEFAULT_KEEPALIVE_SECS as i64));
        doc.insert("mqtt_use_ssl", SettingValue::Bool(false));
        doc.insert("device_id", SettingValue::Str(DEFAULT_DEVICE_ID.into()));
        doc.insert("sensor_pin", SettingValue::Int(DEFAULT_SENSOR_PIN));
        doc.insert("sensor_type", SettingValue::Str(DEFAULT_SENSOR_TYPE.into()));
        doc.insert(
            "reading_interval_seconds",
            SettingValue::Int(DEFAULT_READING_INTERVAL_SECS),
        );
        doc.insert("ntp_server", SettingValue::Str(DEFAULT_NTP_SERVER.into()));
        doc
    }

    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut doc = Self::new();

        for (index, raw_line) in text.lines().enumerate() {
            let number = index + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                return Err(ParseError::new(number, "tables are not supported"));
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ParseError::new(number, "expected `key = value`"));
            };

            let key = key.trim();
            let key = key
                .strip_prefix('"')
                .and_then(|k| k.strip_suffix('"'))
                .unwrap_or(key);
            if !is_valid_key(key) {
                return Err(ParseError::new(number, format!("invalid key `{}`", key)));
            }

            let value = value.trim();
            if value.starts_with('[') || value.starts_with('{') {
                return Err(ParseError::new(
                    number,
                    format!("`{}` is not a scalar value", key),
                ));
            }
            doc.insert(key, SettingValue::parse_token(value));
        }

        Ok(doc)
    }

    /// Serialize in document order, one `key = value` line each.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(&value.to_token());
            out.push('\n');
        }
        out
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: SettingValue) -> Option<SettingValue> {
        self.entries.insert(key.into(), value)
    }

    /// Overlay `updates` onto the document. Existing keys keep their position,
    /// new keys are appended. Returns how many values actually changed.
    pub fn merge<I>(&mut self, updates: I) -> usize
    where
        I: IntoIterator<Item = (String, SettingValue)>,
    {
        let mut changed = 0;
        for (key, value) in updates {
            if self.entries.get(&key) != Some(&value) {
                changed += 1;
            }
            self.entries.insert(key, value);
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// String view of any scalar.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            SettingValue::Str(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            SettingValue::Int(i) => Some(*i),
            SettingValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            SettingValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            SettingValue::Int(i) => Some(*i as f64),
            SettingValue::Float(f) => Some(*f),
            SettingValue::Str(s) => s.trim().parse().ok().filter(|f: &f64| f.is_finite()),
            SettingValue::Bool(_) => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            SettingValue::Bool(b) => Some(*b),
            SettingValue::Int(i) => Some(*i != 0),
            SettingValue::Str(s) => parse_flag(s.trim()),
            SettingValue::Float(_) => None,
        }
    }
}

impl FromIterator<(String, SettingValue)> for SettingsDocument {
    fn from_iter<T: IntoIterator<Item = (String, SettingValue)>>(iter: T) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

/// Keys must be bare words so every document can be written back losslessly.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ==============================================================================
// typed view
// ==============================================================================

/// Settings as the subsystems consume them, with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub broker_address: Option<String>,
    pub broker_port: u16,
    pub telemetry_topic: Option<String>,
    pub status_topic: Option<String>,
    pub temperature_topic: Option<String>,
    pub humidity_topic: Option<String>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_keepalive: Duration,
    pub mqtt_use_ssl: bool,
    pub mqtt_loop_timeout: Duration,
    pub device_id: String,
    pub sensor_pin: String,
    pub sensor_type: String,
    pub reading_interval: Duration,
}

impl DeviceSettings {
    pub fn from_document(doc: &SettingsDocument) -> Self {
        let text = |key: &str, default: &str| doc.get_str(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| {
            doc.get_str(key)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let seconds = |key: &str| {
            doc.get_f64(key)
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
        };

        Self {
            wifi_ssid: text("wifi_ssid", ""),
            wifi_password: text("wifi_password", ""),
            broker_address: optional("broker_address"),
            broker_port: doc
                .get_i64("broker_port")
                .and_then(|p| u16::try_from(p).ok())
                .filter(|p| *p != 0)
                .unwrap_or(DEFAULT_BROKER_PORT),
            telemetry_topic: optional("telemetry_topic"),
            status_topic: optional("status_topic"),
            temperature_topic: optional("temperature_topic"),
            humidity_topic: optional("humidity_topic"),
            mqtt_username: optional("mqtt_username"),
            mqtt_password: optional("mqtt_password"),
            mqtt_keepalive: doc
                .get_i64("mqtt_keepalive")
                .and_then(|s| u64::try_from(s).ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(DEFAULT_KEEPALIVE_SECS)),
            mqtt_use_ssl: doc.get_bool("mqtt_use_ssl").unwrap_or(false),
            mqtt_loop_timeout: seconds("mqtt_loop_timeout")
                .unwrap_or(Duration::from_secs_f64(DEFAULT_LOOP_TIMEOUT_SECS)),
            device_id: optional("device_id").unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
            sensor_pin: optional("sensor_pin").unwrap_or_else(|| DEFAULT_SENSOR_PIN.to_string()),
            sensor_type: optional("sensor_type").unwrap_or_else(|| DEFAULT_SENSOR_TYPE.to_string()),
            reading_interval: seconds("reading_interval_seconds")
                .unwrap_or(Duration::from_secs(DEFAULT_READING_INTERVAL_SECS as u64)),
        }
    }
}

// ==============================================================================
// token helpers
// ==============================================================================

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Floats always carry a `.` so they read back as floats.
fn format_float(value: f64) -> String {
    let text = value.to_string();
    if text.contains('.') || !value.is_finite() {
        text
    } else {
        format!("{}.0", text)
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Split `body"tail` at the first unescaped quote.
fn split_basic_string(inner: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in inner.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some((&inner[..i], &inner[i + 1..])),
            _ => {}
        }
    }
    None
}

fn is_blank_or_comment(tail: &str) -> bool {
    let tail = tail.trim_start();
    tail.is_empty() || tail.starts_with('#')
}

fn strip_trailing_comment(raw: &str) -> &str {
    let mut previous_is_space = false;
    for (i, c) in raw.char_indices() {
        if c == '#' && previous_is_space {
            return raw[..i].trim_end();
        }
        previous_is_space = c.is_whitespace();
    }
    raw
}

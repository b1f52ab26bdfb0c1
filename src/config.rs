//! ==============================================================================
//! config.rs - Host Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`, the operator-side configuration
//!     that is not editable over HTTP (where settings live, which port to
//!     serve on, how to log, how to restart).
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - SettingsConfig: path of the device settings document.
//!     - HttpConfig: bind address, port and request limits.
//!     - MqttConfig: broker connect timeout.
//!     - LoggingConfig: level, format and per-reading output.
//!     - HardwareConfig: status led pin and wifi interface.
//!     - LifecycleConfig: how a restart is carried out.
//!
//! ==============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Environment variable that points at an explicit host config file.
pub const CONFIG_ENV: &str = "CLIMATE_NODE_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    pub settings: SettingsConfig,
    pub http: HttpConfig,
    pub mqtt: MqttConfig,
    pub logging: LoggingConfig,
    pub hardware: HardwareConfig,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SettingsConfig {
    pub path: PathBuf,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("config").join("settings.toml") }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_address: String,
    pub port: u16,
    pub read_timeout_ms: u64,
    pub read_attempts: u32,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 80,
            read_timeout_ms: 200,
            read_attempts: 8,
            max_header_bytes: 4096,
            max_body_bytes: 8192,
        }
    }
}

impl HttpConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub connect_timeout_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self { connect_timeout_ms: 5000 }
    }
}

impl MqttConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub show_sensor_data: bool,
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            show_sensor_data: true,
            show_target: false,
        }
    }
}

/// Console output format for the tracing subscriber.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HardwareConfig {
    /// BCM pin of the status led; no led when absent
    pub status_led_pin: Option<u8>,
    pub wifi_interface: String,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self { status_led_pin: None, wifi_interface: "wlan0".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// e.g. `["sudo", "reboot"]`; when empty the process just exits
    pub restart_command: Vec<String>,
    /// exit code the service manager treats as "restart me"
    pub exit_code: i32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { restart_command: Vec::new(), exit_code: 3 }
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let config: HostConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// Load with default fallback.
    ///
    /// runs before logging is up, so problems go to stderr.
    pub fn load_or_default() -> Self {
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            match Self::load(&explicit) {
                Ok(config) => {
                    eprintln!("[CONFIG] Loaded from {}", explicit);
                    return config;
                }
                Err(e) => eprintln!("[CONFIG] Warning: Failed to load {}: {}", explicit, e),
            }
        }

        let paths = [
            PathBuf::from("config").join("host.toml"),
            PathBuf::from("..").join("config").join("host.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        eprintln!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        eprintln!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        eprintln!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// Log a configuration summary
    pub fn print_summary(&self) {
        tracing::info!(
            settings = %self.settings.path.display(),
            http = %format!("{}:{}", self.http.bind_address, self.http.port),
            log_level = %self.logging.level,
            log_format = ?self.logging.format,
            status_led = ?self.hardware.status_led_pin,
            wifi_interface = %self.hardware.wifi_interface,
            restart_exit_code = self.lifecycle.exit_code,
            "Host configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: HostConfig = toml::from_str(
            r#"
[http]
port = 8080

[logging]
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.http.max_body_bytes, 8192);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.settings.path, PathBuf::from("config").join("settings.toml"));
        assert_eq!(config.lifecycle.exit_code, 3);
    }

    #[test]
    fn test_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(
            &path,
            r#"
[settings]
path = "/var/lib/climate-node/settings.toml"

[hardware]
status_led_pin = 25
wifi_interface = "wlan1"

[lifecycle]
restart_command = ["sudo", "reboot"]
exit_code = 0
"#,
        )
        .unwrap();

        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.hardware.status_led_pin, Some(25));
        assert_eq!(config.hardware.wifi_interface, "wlan1");
        assert_eq!(config.lifecycle.restart_command, ["sudo", "reboot"]);
        assert_eq!(config.lifecycle.exit_code, 0);
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(&path, "[http]\nport = \"eighty\"\n").unwrap();
        assert!(HostConfig::load(&path).is_err());
        assert!(HostConfig::load(dir.path().join("missing.toml")).is_err());
    }
}

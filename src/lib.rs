//! ==============================================================================
//! lib.rs - climate-node crate root
//! ==============================================================================
//!
//! purpose:
//!     runtime core of a single-board temperature/humidity node: reads a dht
//!     sensor, publishes readings over mqtt and serves a small http interface
//!     for editing its settings. the binary in main.rs only wires these
//!     modules together.
//!
//! modules:
//!     - settings / store: the flat settings document and its persistence
//!     - network: wi-fi association and the transport factory
//!     - sensor: rate-limited dht acquisition
//!     - telemetry / mqtt: status and reading messages, rumqttc adapter
//!     - http: configuration web server
//!     - runtime: startup sequence and poll loop
//!     - hal / gpio / clock: hardware and time capabilities
//!     - config / logging / lifecycle: host-side ambient concerns
//!
//! ==============================================================================

pub mod clock;
pub mod config;
pub mod domain;
pub mod gpio;
pub mod hal;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod mqtt;
pub mod network;
pub mod runtime;
pub mod sensor;
pub mod settings;
pub mod store;
pub mod telemetry;

#[cfg(test)]
mod testing;

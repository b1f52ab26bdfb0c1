//! ==============================================================================
//! main.rs - climate node entry point
//! ==============================================================================
//!
//! purpose:
//!     loads the host configuration, installs logging, picks the hardware
//!     capabilities and hands control to the device runtime's poll loop.
//!
//! relationships:
//!     - uses: config.rs (host.toml), logging.rs (subscriber)
//!     - uses: hal.rs (mock or real capabilities, chosen at compile time)
//!     - uses: runtime.rs (bootstrap + run, never returns)
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                  DeviceRuntime (one thread)                  │
//!     │  ┌────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//!     │  │ mqtt       │  │ http config  │  │ sensor reader        │  │
//!     │  │ keep-alive │  │ server       │  │ (interval gated)     │  │
//!     │  └─────┬──────┘  └──────┬───────┘  └──────────┬───────────┘  │
//!     │        └────────────────┼─────────────────────┘              │
//!     │                   ┌─────┴─────┐                              │
//!     │                   │    hal    │ <- hal.rs                    │
//!     │                   └─────┬─────┘                              │
//!     └─────────────────────────┼────────────────────────────────────┘
//!                 ┌─────────────┼─────────────┐
//!                 ▼             ▼             ▼
//!             nmcli (wifi)   dht driver   status led
//!
//! ==============================================================================

use std::rc::Rc;

use anyhow::{Context, Result};

use climate_node::clock::SystemClock;
use climate_node::config::HostConfig;
use climate_node::hal::Hal;
use climate_node::logging;
use climate_node::runtime::DeviceRuntime;

fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Climate Node - temperature / humidity telemetry");
    println!("===========================================================");

    // step 1: load configuration
    let config = HostConfig::load_or_default();

    // step 2: logging
    logging::init(&config.logging).context("failed to initialize logging")?;
    config.print_summary();

    // step 3: capabilities
    let hal = Hal::new(&config.hardware);

    // step 4: bring up the subsystems and hand over to the poll loop
    let runtime = DeviceRuntime::bootstrap(&config, &hal, Rc::new(SystemClock));
    runtime.run(&config.lifecycle)
}

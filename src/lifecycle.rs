//! ==============================================================================
//! lifecycle.rs - reboot-to-apply
//! ==============================================================================
//!
//! purpose:
//!     persisted settings only take effect after a restart. handlers never
//!     restart anything themselves; they return a `RestartRequest` that travels
//!     back up to the runtime, which calls `restart_device` once the response
//!     has been written.
//!
//! ==============================================================================

use std::process::Command;

use tracing::{info, warn};

use crate::config::LifecycleConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    pub reason: String,
}

impl RestartRequest {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Run the configured restart command, then exit with the configured code so
/// the service manager brings the process back with the new settings.
pub fn restart_device(config: &LifecycleConfig, request: &RestartRequest) -> ! {
    info!(reason = %request.reason, "Restarting device");

    if let Some((program, args)) = config.restart_command.split_first() {
        match Command::new(program).args(args).status() {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(command = ?config.restart_command, %status, "Restart command failed"),
            Err(e) => warn!(command = ?config.restart_command, error = %e, "Restart command could not run"),
        }
    }

    std::process::exit(config.exit_code)
}

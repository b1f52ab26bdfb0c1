//! ==============================================================================
//! clock.rs - monotonic time and sleeping
//! ==============================================================================
//!
//! purpose:
//!     every suspension point of the runtime (connect retry backoff, sensor
//!     minimum interval, sensor retry backoff, loop pause) goes through the
//!     `Clock` trait so the whole poll loop can run on a fake clock in tests.
//!
//! ==============================================================================

use std::time::{Duration, Instant};

/// Source of monotonic time plus the ability to block the (only) thread.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Real wall clock, backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! Clock interface for testability.
//!
//! This packaging core is synchronous and single-threaded with no internal
//! scheduling or background threads, so there's no need for monotonic time,
//! sleeping, or `recv_timeout` here — just a source of wall-clock seconds
//! for `mvhd`/`tkhd`/`mdhd` creation and modification times, injectable so
//! tests get a fixed value instead of the real time.

use std::time::{SystemTime, UNIX_EPOCH};

/// Abstract interface to the wall clock, for testability.
pub trait Clocks: Send + Sync {
    /// Returns the current time as seconds since the Unix epoch.
    fn unix_time(&self) -> i64;
}

/// The real wall clock.
#[derive(Copy, Clone, Default)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn unix_time(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        }
    }
}

/// A fixed clock for tests, so a `moov`'s `mvhd`/`tkhd`/`mdhd` timestamps are
/// deterministic.
#[derive(Copy, Clone)]
pub struct SimulatedClocks(i64);

impl SimulatedClocks {
    pub fn new(unix_time: i64) -> Self {
        SimulatedClocks(unix_time)
    }
}

impl Clocks for SimulatedClocks {
    fn unix_time(&self) -> i64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_is_fixed() {
        let c = SimulatedClocks::new(1_700_000_000);
        assert_eq!(c.unix_time(), 1_700_000_000);
        assert_eq!(c.unix_time(), 1_700_000_000);
    }

    #[test]
    fn real_clock_is_plausible() {
        // Sometime in 2023 or later, comfortably before any 32-bit rollover.
        assert!(RealClocks.unix_time() > 1_700_000_000);
    }
}

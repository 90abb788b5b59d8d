//-----------------------------------------------------------------------------
// Module platform
// Thin platform abstraction: monotonic clock, thread/mutex aliases.
//
// Sockets are used directly from std::net at the transport layer; this module
// only isolates the bits that a future non-std target (or a test harness that
// wants to fake time) would need to swap out.

use std::time::Instant;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Resolution of the XCP DAQ clock exposed to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockUnit {
    /// 1 ns per tick
    Nanoseconds,
    /// 1 us per tick
    Microseconds,
}

impl ClockUnit {
    /// XCP `TIME_CORRELATION_PROPERTIES` unit encoding.
    pub fn xcp_unit_code(self) -> u8 {
        match self {
            ClockUnit::Nanoseconds => 0,
            ClockUnit::Microseconds => 3,
        }
    }
}

/// A free-running, monotonic, never-goes-backward clock with a 32-bit
/// rollover-safe counter in the configured unit.
///
/// Built on `std::time::Instant` as the monotonic basis.
pub struct Clock {
    epoch: Instant,
    unit: ClockUnit,
}

impl Clock {
    pub fn new(unit: ClockUnit) -> Clock {
        Clock { epoch: Instant::now(), unit }
    }

    pub fn unit(&self) -> ClockUnit {
        self.unit
    }

    /// Full 64-bit tick count since the clock was created, never decreasing.
    pub fn now_64(&self) -> u64 {
        let elapsed = self.epoch.elapsed();
        match self.unit {
            ClockUnit::Nanoseconds => elapsed.as_nanos() as u64,
            ClockUnit::Microseconds => elapsed.as_micros() as u64,
        }
    }

    /// 32-bit truncated tick count, as carried in DAQ timestamps.
    /// Rollover-safe: clients difference consecutive u32 values with wrapping
    /// arithmetic.
    pub fn now_32(&self) -> u32 {
        self.now_64() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn clock_is_monotonic_and_never_goes_backward() {
        let clock = Clock::new(ClockUnit::Microseconds);
        let mut last = clock.now_64();
        for _ in 0..50 {
            sleep(Duration::from_micros(50));
            let now = clock.now_64();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn clock_32_bit_truncation_matches_64_bit_low_word() {
        let clock = Clock::new(ClockUnit::Nanoseconds);
        let t64 = clock.now_64();
        let t32 = clock.now_32();
        assert_eq!(t32, t64 as u32);
    }
}

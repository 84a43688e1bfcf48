//! Monotonic millisecond clock.
//!
//! Release timestamps cross the wire as 32-bit milliseconds (both the
//! virtual-pointer and virtual-keyboard protocols take `uint` time fields),
//! so the clock measures from a process-start epoch instead of boot time.
//! That keeps values far below the 32-bit wrap for any plausible uptime; if
//! the daemon does run long enough to cross it, the only safe move is a
//! restart to rebase the epoch.

use std::time::Instant;

use thiserror::Error;

/// Largest millisecond value representable in the wire format.
pub const WIRE_TIME_LIMIT: i64 = u32::MAX as i64;

/// Clock errors.
#[derive(Error, Debug)]
pub enum ClockError {
    /// A timestamp no longer fits the 32-bit wire representation.
    #[error(
        "monotonic timestamp {0} ms exceeds the 32-bit wire format; \
         restart wayveil to rebase its clock"
    )]
    WireOverflow(i64),
}

/// Monotonic clock with a process-start epoch.
#[derive(Debug)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Creates a clock; the moment of creation defines timestamp zero.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the epoch. Non-decreasing across calls.
    pub fn now_ms(&self) -> i64 {
        let ms = self.epoch.elapsed().as_millis();
        // Saturate rather than wrap; the wire guard below catches the
        // overflow long before this bound is reachable.
        ms.min(i64::MAX as u128) as i64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a millisecond timestamp to the 32-bit wire representation.
pub fn wire_time(ms: i64) -> Result<u32, ClockError> {
    u32::try_from(ms).map_err(|_| ClockError::WireOverflow(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        let c = clock.now_ms();
        assert!(a <= b && b <= c);
    }

    #[test]
    fn test_epoch_starts_near_zero() {
        let clock = Clock::new();
        assert!(clock.now_ms() < 1000);
    }

    #[test]
    fn test_wire_time_in_range() {
        assert_eq!(wire_time(0).unwrap(), 0);
        assert_eq!(wire_time(WIRE_TIME_LIMIT).unwrap(), u32::MAX);
    }

    #[test]
    fn test_wire_time_overflow() {
        assert!(wire_time(WIRE_TIME_LIMIT + 1).is_err());
        assert!(wire_time(-1).is_err());
    }
}

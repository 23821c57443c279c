//! Monotonic time base for deadlines
//!
//! All deadlines inside the engine are nanoseconds since the first call
//! into this module, so scheduled-task ordering survives wall-clock
//! adjustments.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static START: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the engine's time base was initialized
#[inline]
pub fn now_ns() -> u64 {
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Deadline for `delay` from now
#[inline]
pub fn deadline_ns(delay: Duration) -> u64 {
    now_ns().saturating_add(delay.as_nanos() as u64)
}

/// Remaining time until `deadline`, `ZERO` if already due
#[inline]
pub fn until(deadline: u64) -> Duration {
    Duration::from_nanos(deadline.saturating_sub(now_ns()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_deadline_round_trip() {
        let d = deadline_ns(Duration::from_millis(50));
        let left = until(d);
        assert!(left <= Duration::from_millis(50));
        assert!(until(0) == Duration::ZERO);
    }
}

use std::time::Duration;
use libc::{clock_gettime, timespec, CLOCK_MONOTONIC};
use once_cell::sync::Lazy;

// Fallback origin when clock_gettime is unavailable.
static ORIGIN: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);

/// Monotonic clock in nanoseconds; used to stamp echo requests.
pub fn monotonic_ns() -> u128 {
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let ok = unsafe {
        let mut ts: timespec = std::mem::zeroed();
        if clock_gettime(CLOCK_MONOTONIC, &mut ts) == 0 {
            Some((ts.tv_sec as u128) * 1_000_000_000 + (ts.tv_nsec as u128))
        } else {
            None
        }
    };
    ok.unwrap_or_else(|| ORIGIN.elapsed().as_nanos())
}

/// Time elapsed since a `monotonic_ns()` stamp. Saturates at zero.
pub fn since(stamp_ns: u128) -> Duration {
    let nanos = monotonic_ns().saturating_sub(stamp_ns);
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_moves_forward() {
        let a = monotonic_ns();
        std::thread::sleep(Duration::from_millis(2));
        assert!(monotonic_ns() > a);
        assert!(since(a) >= Duration::from_millis(2));
    }

    #[test]
    fn future_stamp_saturates() {
        assert_eq!(since(monotonic_ns() + 1_000_000_000), Duration::ZERO);
    }
}

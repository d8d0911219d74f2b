use std::time::SystemTime;

/// A quarter of the 64 bit range counts as "ahead" for wrap tolerant comparisons.
const AHEAD_RANGE: u64 = 1 << 62;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns the current unix timestamp in milliseconds
#[inline]
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_millis() as u64
}

/// Wrap tolerant "strictly earlier than" on millisecond timestamps.
#[inline]
pub fn time_before(a: u64, b: u64) -> bool {
    let delta = b.wrapping_sub(a);
    delta != 0 && delta <= AHEAD_RANGE
}

/// Wrap tolerant "strictly later than" on millisecond timestamps.
#[inline]
pub fn time_after(a: u64, b: u64) -> bool {
    time_before(b, a)
}

/// Milliseconds elapsed between `earlier` and `later`, tolerant of wrapping.
#[inline]
pub fn time_since(later: u64, earlier: u64) -> u64 {
    later.wrapping_sub(earlier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ordering() {
        assert!(time_before(0, 1));
        assert!(time_before(100, 5000));
        assert!(!time_before(5000, 100));
        assert!(!time_before(42, 42));
        assert!(time_after(5000, 100));
    }

    #[test]
    fn test_wrapped_ordering() {
        // A timestamp just before the wrap is earlier than one just after it
        assert!(time_before(u64::max_value() - 10, 10));
        assert!(!time_before(10, u64::max_value() - 10));
    }

    #[test]
    fn test_ahead_boundary() {
        // Exactly a quarter of the range ahead still counts as later
        assert!(time_before(0, AHEAD_RANGE));
        // One past the quarter range flips the comparison
        assert!(!time_before(0, AHEAD_RANGE + 1));
    }

    #[test]
    fn test_time_since() {
        assert_eq!(time_since(1500, 1000), 500);
        assert_eq!(time_since(5, u64::max_value() - 4), 10);
    }
}

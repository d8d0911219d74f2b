/// A burst and period rate limiter.
///
/// The balance starts at `burst` units and refills continuously at `burst` units per
/// `period_ms`. Units can be bits of bandwidth or discrete events.
pub struct RateLimiter {
    burst: u64,
    period_ms: u64,
    balance: u64,
    refill_credit: u64,
    last_refill: u64,
}

impl RateLimiter {
    #[inline]
    pub fn new(burst: u64, period_ms: u64, now: u64) -> RateLimiter {
        if period_ms == 0 {
            panic!("Rate limiter period must be non-zero");
        }

        RateLimiter {
            burst,
            period_ms,
            balance: burst,
            refill_credit: 0,
            last_refill: now,
        }
    }

    /// Reconfigures the limiter. A zero burst disables limiting entirely.
    #[inline]
    pub fn reconfigure(&mut self, burst: u64, period_ms: u64, now: u64) {
        self.burst = burst;
        self.period_ms = period_ms.max(1);
        self.balance = burst;
        self.refill_credit = 0;
        self.last_refill = now;
    }

    /// Returns true if `amount` units fit into the current balance. A zero burst means
    /// the limiter is disabled and everything proceeds.
    #[inline]
    pub fn can_proceed(&mut self, amount: u64, now: u64) -> bool {
        if self.burst == 0 {
            return true;
        }

        self.refill(now);
        self.balance >= amount
    }

    /// Consumes `amount` units from the balance.
    #[inline]
    pub fn add_amount(&mut self, amount: u64) {
        if self.burst == 0 {
            return;
        }

        self.balance = self.balance.saturating_sub(amount);
    }

    #[inline]
    fn refill(&mut self, now: u64) {
        let elapsed = now.wrapping_sub(self.last_refill);
        self.last_refill = now;

        // Accumulate elapsed * burst in period-space so sub-period refills keep their fraction
        self.refill_credit = self
            .refill_credit
            .saturating_add(elapsed.saturating_mul(self.burst));

        let refill = self.refill_credit / self.period_ms;
        self.refill_credit %= self.period_ms;

        self.balance = (self.balance + refill).min(self.burst);
    }
}

/// A smoothed units-per-second estimate sampled over at least one second periods.
pub struct BandwidthTracker {
    total: u64,
    rate: u64,
    last_sample: u64,
}

impl BandwidthTracker {
    #[inline]
    pub fn new(now: u64) -> BandwidthTracker {
        BandwidthTracker {
            total: 0,
            rate: 0,
            last_sample: now,
        }
    }

    /// Record produced units.
    #[inline]
    pub fn add(&mut self, units: u64) {
        self.total = self.total.saturating_add(units);
    }

    /// Re-estimates the rate once a full second has passed; the sub-second residue
    /// carries over into the next period.
    #[inline]
    pub fn update(&mut self, now: u64) {
        let elapsed = now.wrapping_sub(self.last_sample);

        if elapsed < 1000 {
            return;
        }

        let frac_ms = elapsed % 1000;
        let whole_secs = elapsed / 1000;

        let residue = self.total.saturating_mul(frac_ms) / elapsed;
        self.rate = (self.total - residue) / whole_secs;

        self.total = residue;
        self.last_sample = now.wrapping_sub(frac_ms);
    }

    /// The most recent units-per-second estimate.
    #[inline]
    pub fn rate(&self) -> u64 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_burst_then_starve() {
        let mut limiter = RateLimiter::new(20, 1000, 0);

        for _ in 0..20 {
            assert!(limiter.can_proceed(1, 0));
            limiter.add_amount(1);
        }

        assert!(!limiter.can_proceed(1, 0));
    }

    #[test]
    fn test_limiter_refills_over_period() {
        let mut limiter = RateLimiter::new(20, 1000, 0);

        for _ in 0..20 {
            assert!(limiter.can_proceed(1, 0));
            limiter.add_amount(1);
        }

        // Half a period restores half the burst
        assert!(limiter.can_proceed(10, 500));
        assert!(!limiter.can_proceed(11, 500));

        // A full period from the start caps back at the burst ceiling
        assert!(limiter.can_proceed(20, 10_000));
        assert!(!limiter.can_proceed(21, 10_000));
    }

    #[test]
    fn test_limiter_sub_period_fractions_accumulate() {
        let mut limiter = RateLimiter::new(4, 1000, 0);
        limiter.add_amount(4);

        // 125 ms refills half a unit; four of them make two whole units
        assert!(!limiter.can_proceed(1, 125));
        assert!(!limiter.can_proceed(1, 249));
        assert!(limiter.can_proceed(1, 250));
        assert!(limiter.can_proceed(2, 500));
    }

    #[test]
    fn test_limiter_disabled() {
        let mut limiter = RateLimiter::new(0, 1000, 0);
        assert!(limiter.can_proceed(u64::max_value(), 0));
    }

    #[test]
    fn test_tracker_whole_seconds() {
        let mut tracker = BandwidthTracker::new(0);

        tracker.add(4000);
        tracker.update(999);
        assert_eq!(tracker.rate(), 0);

        tracker.update(2000);
        assert_eq!(tracker.rate(), 2000);
    }

    #[test]
    fn test_tracker_carries_residue() {
        let mut tracker = BandwidthTracker::new(0);

        tracker.add(1500);
        tracker.update(1500);

        // One whole second elapsed; a third of the units belong to the half second residue
        assert_eq!(tracker.rate(), 1000);

        tracker.add(500);
        tracker.update(2000);
        assert_eq!(tracker.rate(), 1000);
    }
}

// ABOUTME: Crash-loop hold for replacing workers that die right after launch
//
// Every crash of a worker younger than `min_uptime` extends a streak and holds
// replacements back for `min(base * 2^streak, max)`. One worker outliving
// `min_uptime` ends the streak.

use std::time::{Duration, Instant};

/// Holds back replacements while workers keep crashing young.
#[derive(Debug, Clone)]
pub struct CrashLoopBackoff {
    min_uptime: Duration,
    base: Duration,
    max: Duration,
    /// Consecutive early crashes
    streak: u32,
    hold_until: Option<Instant>,
}

impl CrashLoopBackoff {
    #[must_use]
    pub const fn new(min_uptime: Duration, base: Duration, max: Duration) -> Self {
        Self {
            min_uptime,
            base,
            max,
            streak: 0,
            hold_until: None,
        }
    }

    /// Record an unexpected exit after `uptime`.
    ///
    /// Returns the hold imposed on the replacement, or `None` when the worker
    /// lived long enough to end the streak.
    pub fn record_crash(&mut self, uptime: Duration, now: Instant) -> Option<Duration> {
        if uptime >= self.min_uptime {
            self.streak = 0;
            self.hold_until = None;
            return None;
        }

        let hold = self.hold_for(self.streak);
        self.streak = self.streak.saturating_add(1);
        self.hold_until = Some(now + hold);
        Some(hold)
    }

    /// Whether replacements must still wait at `now`. An expired hold is cleared.
    pub fn is_holding(&mut self, now: Instant) -> bool {
        match self.hold_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.hold_until = None;
                false
            }
            None => false,
        }
    }

    #[must_use]
    pub const fn hold_until(&self) -> Option<Instant> {
        self.hold_until
    }

    #[must_use]
    pub const fn streak(&self) -> u32 {
        self.streak
    }

    fn hold_for(&self, streak: u32) -> Duration {
        let factor = 1u32.checked_shl(streak).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).map_or(self.max, |hold| hold.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> CrashLoopBackoff {
        CrashLoopBackoff::new(
            Duration::from_secs(1),
            Duration::from_millis(100),
            Duration::from_millis(500),
        )
    }

    const YOUNG: Duration = Duration::from_millis(10);

    #[test]
    fn test_early_crashes_double_the_hold_until_capped() {
        let mut backoff = backoff();
        let now = Instant::now();

        let holds: Vec<_> = (0..5).map(|_| backoff.record_crash(YOUNG, now).unwrap()).collect();
        assert_eq!(
            holds,
            [100, 200, 400, 500, 500].map(Duration::from_millis).to_vec()
        );
        assert_eq!(backoff.streak(), 5);
    }

    #[test]
    fn test_long_lived_worker_ends_the_streak() {
        let mut backoff = backoff();
        let now = Instant::now();
        backoff.record_crash(YOUNG, now);
        backoff.record_crash(YOUNG, now);

        assert_eq!(backoff.record_crash(Duration::from_secs(5), now), None);
        assert_eq!(backoff.streak(), 0);
        assert!(!backoff.is_holding(now));
        assert_eq!(backoff.record_crash(YOUNG, now), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_hold_expires_and_clears() {
        let mut backoff = backoff();
        let now = Instant::now();
        backoff.record_crash(YOUNG, now);

        assert!(backoff.is_holding(now + Duration::from_millis(50)));
        assert!(!backoff.is_holding(now + Duration::from_millis(150)));
        assert_eq!(backoff.hold_until(), None);
        // The streak survives the hold; only a long-lived worker resets it
        assert_eq!(backoff.streak(), 1);
    }

    #[test]
    fn test_hold_never_overflows() {
        let mut backoff = CrashLoopBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(30),
        );
        let now = Instant::now();
        for _ in 0..200 {
            let hold = backoff.record_crash(YOUNG, now).unwrap();
            assert!(hold <= Duration::from_secs(30));
            assert!(hold > Duration::ZERO);
        }
    }
}

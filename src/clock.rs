use std::time::{Duration, Instant};

use rand::Rng;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

pub fn jittered(lo: Duration, hi: Duration) -> Duration {
    if hi <= lo {
        return lo;
    }
    let millis = rand::rng().random_range(lo.as_millis()..=hi.as_millis());
    Duration::from_millis(millis as u64)
}

/// Randomized pause between consecutive calls to the source site.
pub fn courtesy_pause(clock: &dyn Clock, range: (Duration, Duration)) {
    let delay = jittered(range.0, range.1);
    if !delay.is_zero() {
        clock.sleep(delay);
    }
}

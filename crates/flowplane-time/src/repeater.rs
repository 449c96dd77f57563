use std::time::{Duration, Instant};

/// Fires at most once per `interval`, tracked against an externally supplied
/// `now` rather than a global clock so callers can drive it from a
/// [`crate::Clock`] (real or fake).
#[derive(Clone, Copy, Debug)]
pub struct Repeater {
    interval: Duration,
    last_acted: Instant,
    forced: bool,
}

impl Repeater {
    pub fn every(interval: Duration, now: Instant) -> Self {
        Self { interval, last_acted: now, forced: false }
    }

    /// Returns `true` and resets the internal clock if `interval` has
    /// elapsed since the last fire (or construction).
    #[inline]
    pub fn fired(&mut self, now: Instant) -> bool {
        if std::mem::take(&mut self.forced) || now.duration_since(self.last_acted) >= self.interval
        {
            self.last_acted = now;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn reset(&mut self, now: Instant) {
        self.last_acted = now;
        self.forced = false;
    }

    /// Makes the next `fired` call return `true` regardless of `interval`.
    pub fn force_fire(&mut self) {
        self.forced = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_interval_elapses() {
        let t0 = Instant::now();
        let mut r = Repeater::every(Duration::from_secs(5), t0);
        assert!(!r.fired(t0 + Duration::from_secs(4)));
        assert!(r.fired(t0 + Duration::from_secs(5)));
        assert!(!r.fired(t0 + Duration::from_secs(6)));
        assert!(r.fired(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn force_fire_makes_next_call_true() {
        let t0 = Instant::now() + Duration::from_secs(1000);
        let mut r = Repeater::every(Duration::from_secs(5), t0);
        r.force_fire();
        assert!(r.fired(t0));
    }
}

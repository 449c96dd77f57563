use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Source of "now" for everything in flowplane that needs to measure
/// elapsed time: echo liveness, reconnection backoff, transaction sweeps.
///
/// Abstracted so tests can step time deterministically instead of sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The real wall clock. What every non-test caller uses.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only advances when told to, for deterministic tests of
/// liveness timeouts, reconnection backoff and transaction sweeps.
///
/// Stores an offset in nanoseconds from a fixed epoch instant rather than an
/// `Instant` directly, since `Instant` has no public "from nanos" constructor.
#[derive(Debug)]
pub struct FakeClock {
    epoch: Instant,
    offset_nanos: AtomicU64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now(), offset_nanos: AtomicU64::new(0) }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

/// Monotonic time in microseconds, and the clock capability the acquisition pipeline is
/// driven with.
use std::time::{Duration, Instant};

/// Microseconds on a monotonic time base, with conversion from [`Duration`] for convenience.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Micros(pub u64);

impl Micros {
    /// Time elapsed since `earlier`, zero if `earlier` lies in the future.
    pub fn since(self, earlier: Micros) -> Micros {
        Micros(self.0.saturating_sub(earlier.0))
    }

    pub fn millis(&self) -> f32 {
        self.0 as f32 / 1000.0
    }
}

impl From<Duration> for Micros {
    fn from(d: Duration) -> Self {
        Self(d.as_micros() as u64)
    }
}

impl std::ops::Add for Micros {
    type Output = Micros;

    fn add(self, rhs: Micros) -> Micros {
        Micros(self.0.saturating_add(rhs.0))
    }
}

/// Source of monotonic timestamps. Injected by the caller so acquisition pacing can be tested
/// against a controlled time base.
pub trait MonotonicClock {
    fn now(&self) -> Micros;
}

/// [`MonotonicClock`] counting from the moment it was created.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now(&self) -> Micros {
        self.origin.elapsed().into()
    }
}

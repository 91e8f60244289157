//! Process-wide clock pairing wall time with a monotonic reading.
//!
//! Token expiry and deadlines must never run backwards with the system
//! clock, and tests need a clock they can pin, so everything time-sensitive
//! takes a [`Clock`] instead of calling `Utc::now()` directly.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;

#[derive(Clone)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

struct ClockInner {
    started: Instant,
    /// Fixed epoch-milliseconds override for tests. `None` means system time.
    fixed_ms: Mutex<Option<u64>>,
}

impl Clock {
    pub fn system() -> Self {
        Self {
            inner: Arc::new(ClockInner {
                started: Instant::now(),
                fixed_ms: Mutex::new(None),
            }),
        }
    }

    /// A clock pinned to `epoch_ms`; advance it with [`Clock::advance_ms`].
    pub fn fixed(epoch_ms: u64) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                started: Instant::now(),
                fixed_ms: Mutex::new(Some(epoch_ms)),
            }),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.now_ms() as i64).unwrap_or_else(Utc::now)
    }

    pub fn now_ms(&self) -> u64 {
        let fixed = {
            let guard = match self.inner.fixed_ms.lock() {
                Ok(g) => *g,
                Err(poisoned) => *poisoned.into_inner(),
            };
            guard
        };
        match fixed {
            Some(ms) => ms,
            None => Utc::now().timestamp_millis().max(0) as u64,
        }
    }

    /// Monotonic milliseconds since this clock was created.
    pub fn monotonic_ms(&self) -> u64 {
        self.inner.started.elapsed().as_millis() as u64
    }

    pub fn advance_ms(&self, delta: u64) {
        let mut guard = match self.inner.fixed_ms.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(ms) = guard.as_mut() {
            *ms += delta;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_only_moves_when_advanced() {
        let clock = Clock::fixed(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
    }

    #[test]
    fn system_clock_is_monotonic_in_its_own_frame() {
        let clock = Clock::system();
        let a = clock.monotonic_ms();
        let b = clock.monotonic_ms();
        assert!(b >= a);
    }
}

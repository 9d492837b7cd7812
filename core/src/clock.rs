//! Injectable wall-clock abstraction.
//!
//! The faucet's policy engine is driven entirely by "now" — claim cooldowns,
//! the rolling rate window, and token buckets are all defined in terms of it.
//! Rather than reach for a process-wide mutable `now()` function, callers
//! hold a [`Clock`] and pass it through; tests use [`FakeClock`] to control
//! time deterministically.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

/// A source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock, backed by [`Utc::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock with a value tests can advance explicitly.
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        FakeClock {
            inner: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, d: chrono::Duration) {
        let mut t = self.inner.lock().expect("fake clock mutex poisoned");
        *t += d;
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.inner.lock().expect("fake clock mutex poisoned") = t;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock().expect("fake clock mutex poisoned")
    }
}

/// A shared, cheaply-cloneable handle to a [`Clock`].
pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

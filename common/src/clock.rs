//! Clock abstraction for time-based behavior.
//!
//! The reader restart scheduler asks a `Clock` for the current time
//! instead of calling `SystemTime::now()` directly, so tests can move
//! time forward explicitly with [`MockClock::advance`].

use std::sync::RwLock;
use std::time::{Duration, SystemTime};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct MockClock {
    now: RwLock<SystemTime>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            now: RwLock::new(SystemTime::now()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.now.write().unwrap() += duration;
    }
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.read().unwrap()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

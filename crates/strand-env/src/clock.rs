// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Monotonic clock subsystem.
//!
//! Time is a millisecond tick count. The wall clock caches its reading
//! and is refreshed once per driver busy cycle, so every task running in
//! the same cycle observes the same `now`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Monotonic time in milliseconds since the clock's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tick(u64);

impl Tick {
    /// Epoch zero, meaning "immediately" when used as a task deadline.
    pub const ZERO: Tick = Tick(0);

    pub const fn from_millis(ms: u64) -> Self {
        Tick(ms)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// This tick advanced by `ms` milliseconds, saturating.
    pub const fn after(self, ms: u64) -> Self {
        Tick(self.0.saturating_add(ms))
    }

    /// Time remaining from `now` until this tick. Zero if already due.
    pub fn duration_since(self, now: Tick) -> Duration {
        Duration::from_millis(self.0.saturating_sub(now.0))
    }
}

/// Source of monotonic ticks.
pub trait Clock: Send + Sync + 'static {
    /// Current tick. May be cached; see [`Clock::refresh`].
    fn now(&self) -> Tick;

    /// Re-read the underlying time source. No-op for manual clocks.
    fn refresh(&self) {}
}

/// Real-time clock backed by [`Instant`], with a cached reading.
pub struct WallClock {
    epoch: Instant,
    cached: Mutex<Tick>,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            cached: Mutex::new(Tick::ZERO),
        }
    }

    fn elapsed(&self) -> Tick {
        Tick(self.epoch.elapsed().as_millis() as u64)
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn now(&self) -> Tick {
        *self.cached.lock().unwrap()
    }

    fn refresh(&self) {
        *self.cached.lock().unwrap() = self.elapsed();
    }
}

/// Test clock advanced explicitly by the caller.
pub struct ManualClock {
    now: Mutex<Tick>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Tick::ZERO)
    }

    pub fn starting_at(tick: Tick) -> Self {
        Self {
            now: Mutex::new(tick),
        }
    }

    pub fn set(&self, tick: Tick) {
        *self.now.lock().unwrap() = tick;
    }

    pub fn advance(&self, ms: u64) {
        let mut now = self.now.lock().unwrap();
        *now = now.after(ms);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        *self.now.lock().unwrap()
    }
}

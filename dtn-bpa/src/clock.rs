// Copyright (C) 2023 Felix Huettner
//
// This file is part of DTRD.
//
// DTRD is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// DTRD is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Two independent clocks, as design note "Clock-less nodes" requires: a
//! monotonic one always available for timeouts and bundle age, and an
//! optional wall clock for creation timestamps and absolute expiry. Tests
//! substitute a fake implementation to drive scenarios deterministically.

use bp7::time::DtnTime;

pub trait Clock {
    /// Monotonic milliseconds since an arbitrary epoch. Always available.
    fn now_ms(&self) -> u64;

    /// Wall-clock DTN creation time, or `None` on a node with no accurate
    /// clock (such a node stamps creation_time = 0 and relies on a Bundle
    /// Age Block instead).
    fn dtn_now(&self) -> Option<DtnTime>;
}

/// The clock used outside of tests: `Instant`-based monotonic time, real
/// wall-clock creation timestamps.
pub struct SystemClock {
    start: std::time::Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock {
            start: std::time::Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn dtn_now(&self) -> Option<DtnTime> {
        Some(DtnTime::now())
    }
}

/// A clock-less node: no wall clock at all, only monotonic time. Every
/// originated bundle carries creation_time = 0 and a Bundle Age Block.
pub struct MonotonicOnlyClock {
    start: std::time::Instant,
}

impl Default for MonotonicOnlyClock {
    fn default() -> Self {
        MonotonicOnlyClock {
            start: std::time::Instant::now(),
        }
    }
}

impl Clock for MonotonicOnlyClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn dtn_now(&self) -> Option<DtnTime> {
        None
    }
}

/// Deterministic stand-in for driving scenarios by hand. Available to the
/// integration test suite (not just unit tests) via the `test-utils` feature,
/// the same way `cla::loopback` is unconditionally visible.
#[cfg(any(test, feature = "test-utils"))]
pub struct FakeClock {
    pub millis: std::cell::Cell<u64>,
    pub clockless: bool,
}

#[cfg(any(test, feature = "test-utils"))]
impl FakeClock {
    pub fn new(millis: u64, clockless: bool) -> Self {
        FakeClock {
            millis: std::cell::Cell::new(millis),
            clockless,
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.millis.set(self.millis.get() + delta_ms);
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.millis.get()
    }

    fn dtn_now(&self) -> Option<DtnTime> {
        if self.clockless {
            None
        } else {
            Some(DtnTime {
                timestamp: self.millis.get(),
            })
        }
    }
}

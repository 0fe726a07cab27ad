#![forbid(unsafe_code)]

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Monotonic time source for activity tracking.
pub trait Clock: Send + Sync + fmt::Debug {
	fn now(&self) -> Instant;
}

/// Wall-clock backed `Clock`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	#[inline]
	fn now(&self) -> Instant {
		Instant::now()
	}
}

/// Hand-driven clock for tests; only moves when `advance` is called.
#[derive(Debug)]
pub struct ManualClock {
	base: Instant,
	offset: Mutex<Duration>,
}

impl ManualClock {
	pub fn new() -> Self {
		Self {
			base: Instant::now(),
			offset: Mutex::new(Duration::ZERO),
		}
	}

	pub fn advance(&self, by: Duration) {
		let mut offset = self.offset.lock();
		*offset += by;
	}
}

impl Default for ManualClock {
	fn default() -> Self {
		Self::new()
	}
}

impl Clock for ManualClock {
	fn now(&self) -> Instant {
		self.base + *self.offset.lock()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn manual_clock_only_moves_when_advanced() {
		let clock = ManualClock::new();
		let t0 = clock.now();
		assert_eq!(clock.now(), t0);
		clock.advance(Duration::from_secs(5));
		assert_eq!(clock.now() - t0, Duration::from_secs(5));
	}
}

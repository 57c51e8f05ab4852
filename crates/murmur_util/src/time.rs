#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::ZERO)
		.as_millis() as i64
}

/// Unix seconds, as carried by token claims.
#[inline]
pub fn unix_secs_now() -> i64 {
	unix_ms_now() / 1000
}

/// A clock that never goes backwards, even if the wall clock does.
///
/// Message timestamps must be non-decreasing in id order, so every reading is clamped
/// to the previous one.
#[derive(Debug, Default)]
pub struct MonotonicMillis {
	last: i64,
}

impl MonotonicMillis {
	pub fn new() -> Self {
		Self::default()
	}

	/// Next reading from the wall clock.
	pub fn next(&mut self) -> i64 {
		self.observe(unix_ms_now())
	}

	/// Clamp `now` against previous readings.
	pub fn observe(&mut self, now: i64) -> i64 {
		self.last = self.last.max(now);
		self.last
	}
}

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

use murmur_domain::{ChatError, ConnectionId, ConversationId};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
	pub burst: u32,
	pub per_minute: u32,
}

impl RateLimit {
	/// A zero burst or rate disables the limit.
	pub const fn disabled() -> Self {
		Self {
			burst: 0,
			per_minute: 0,
		}
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(limit: RateLimit, now: Instant) -> Option<Self> {
		if limit.burst == 0 || limit.per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: limit.burst as f64,
			tokens: limit.burst as f64,
			refill_per_sec: limit.per_minute as f64 / 60.0,
			last: now,
		})
	}

	fn refill(&mut self, now: Instant) {
		let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
	}
}

#[derive(Debug)]
struct Buckets<K> {
	limit: RateLimit,
	max_keys: usize,
	by_key: HashMap<K, TokenBucket>,
}

impl<K: Eq + Hash + Clone> Buckets<K> {
	fn new(limit: RateLimit, max_keys: usize) -> Self {
		Self {
			limit,
			max_keys,
			by_key: HashMap::new(),
		}
	}

	/// Refilled bucket for `key`, or None when unlimited.
	fn bucket(&mut self, key: &K, now: Instant) -> Option<&mut TokenBucket> {
		if !self.by_key.contains_key(key) {
			let fresh = TokenBucket::new(self.limit, now)?;
			if self.by_key.len() >= self.max_keys {
				// A full bucket behaves exactly like a fresh one.
				self.by_key.retain(|_, b| {
					b.refill(now);
					b.tokens < b.capacity
				});
			}
			if self.by_key.len() >= self.max_keys
				&& let Some(stalest) = self.by_key.iter().min_by_key(|(_, b)| b.last).map(|(k, _)| k.clone())
			{
				self.by_key.remove(&stalest);
			}
			self.by_key.insert(key.clone(), fresh);
		}

		let bucket = self.by_key.get_mut(key)?;
		bucket.refill(now);
		Some(bucket)
	}
}

/// Send throttling per connection and per conversation.
///
/// A send must find a token in both buckets; a token is only taken when both have one.
#[derive(Debug)]
pub struct SendRateLimiter {
	inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
	per_connection: Buckets<ConnectionId>,
	per_conversation: Buckets<ConversationId>,
}

impl SendRateLimiter {
	pub fn new(per_connection: RateLimit, per_conversation: RateLimit) -> Self {
		Self::with_max_keys(per_connection, per_conversation, 65_536)
	}

	fn with_max_keys(per_connection: RateLimit, per_conversation: RateLimit, max_keys: usize) -> Self {
		Self {
			inner: Mutex::new(Inner {
				per_connection: Buckets::new(per_connection, max_keys),
				per_conversation: Buckets::new(per_conversation, max_keys),
			}),
		}
	}

	pub fn unlimited() -> Self {
		Self::new(RateLimit::disabled(), RateLimit::disabled())
	}

	pub fn check(&self, conn_id: ConnectionId, conversation_id: &ConversationId) -> Result<(), ChatError> {
		self.check_at(conn_id, conversation_id, Instant::now())
	}

	fn check_at(&self, conn_id: ConnectionId, conversation_id: &ConversationId, now: Instant) -> Result<(), ChatError> {
		let mut inner = self.inner.lock();
		let inner = &mut *inner;

		let conn = inner.per_connection.bucket(&conn_id, now);
		if conn.as_ref().is_some_and(|b| b.tokens < 1.0) {
			metrics::counter!("murmur_server_rate_limited_connection_total").increment(1);
			return Err(ChatError::RateLimited);
		}

		let conv = inner.per_conversation.bucket(conversation_id, now);
		if conv.as_ref().is_some_and(|b| b.tokens < 1.0) {
			metrics::counter!("murmur_server_rate_limited_conversation_total").increment(1);
			return Err(ChatError::RateLimited);
		}

		if let Some(b) = conv {
			b.tokens -= 1.0;
		}
		if let Some(b) = conn {
			b.tokens -= 1.0;
		}
		Ok(())
	}

	/// Drop a closed connection's bucket.
	pub fn forget(&self, conn_id: ConnectionId) {
		self.inner.lock().per_connection.by_key.remove(&conn_id);
	}
}

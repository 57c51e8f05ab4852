#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use murmur_domain::{ConnectionId, UserId};
use parking_lot::Mutex;

/// Which users are online, and through which connections.
///
/// Both indices live behind one lock so a register racing an unregister cannot lose
/// either update.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
	by_user: HashMap<UserId, HashSet<ConnectionId>>,
	by_connection: HashMap<ConnectionId, UserId>,
}

impl PresenceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Bind `connection_id` to `user_id`. Returns true when the user just came online.
	///
	/// A connection is bound once; re-registering it is a no-op.
	pub fn register(&self, user_id: &UserId, connection_id: ConnectionId) -> bool {
		let mut inner = self.inner.lock();
		if inner.by_connection.contains_key(&connection_id) {
			return false;
		}

		inner.by_connection.insert(connection_id, user_id.clone());
		let conns = inner.by_user.entry(user_id.clone()).or_default();
		conns.insert(connection_id);
		conns.len() == 1
	}

	/// Drop a connection. Returns the user when this was their last connection.
	pub fn unregister(&self, connection_id: ConnectionId) -> Option<UserId> {
		let mut inner = self.inner.lock();
		let user_id = inner.by_connection.remove(&connection_id)?;

		let now_offline = match inner.by_user.get_mut(&user_id) {
			Some(conns) => {
				conns.remove(&connection_id);
				conns.is_empty()
			}
			None => true,
		};

		if now_offline {
			inner.by_user.remove(&user_id);
			Some(user_id)
		} else {
			None
		}
	}

	pub fn connections_for(&self, user_id: &UserId) -> HashSet<ConnectionId> {
		self.inner.lock().by_user.get(user_id).cloned().unwrap_or_default()
	}

	pub fn user_for(&self, connection_id: ConnectionId) -> Option<UserId> {
		self.inner.lock().by_connection.get(&connection_id).cloned()
	}

	pub fn is_online(&self, user_id: &UserId) -> bool {
		self.inner.lock().by_user.contains_key(user_id)
	}

	pub fn online_users(&self) -> Vec<UserId> {
		let mut users: Vec<_> = self.inner.lock().by_user.keys().cloned().collect();
		users.sort();
		users
	}

	pub fn connection_count(&self) -> usize {
		self.inner.lock().by_connection.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(id: &str) -> UserId {
		UserId::new(id).unwrap()
	}

	#[test]
	fn multi_device_user_goes_offline_with_last_connection() {
		let presence = PresenceRegistry::new();
		let alice = user("alice");

		assert!(presence.register(&alice, ConnectionId(1)));
		assert!(!presence.register(&alice, ConnectionId(2)));
		assert!(!presence.register(&alice, ConnectionId(2)), "idempotent");
		assert_eq!(presence.connections_for(&alice).len(), 2);
		assert_eq!(presence.connection_count(), 2);

		assert_eq!(presence.unregister(ConnectionId(1)), None);
		assert!(presence.is_online(&alice));
		assert_eq!(presence.unregister(ConnectionId(2)), Some(alice.clone()));
		assert!(!presence.is_online(&alice));
		assert!(presence.connections_for(&alice).is_empty());
	}

	#[test]
	fn unregister_unknown_connection_is_noop() {
		let presence = PresenceRegistry::new();
		assert_eq!(presence.unregister(ConnectionId(7)), None);
		assert!(presence.online_users().is_empty());
	}

	#[test]
	fn connection_stays_bound_to_first_user() {
		let presence = PresenceRegistry::new();
		presence.register(&user("a"), ConnectionId(1));
		assert!(!presence.register(&user("b"), ConnectionId(1)));
		assert_eq!(presence.user_for(ConnectionId(1)), Some(user("a")));
		assert_eq!(presence.online_users(), vec![user("a")]);
	}

	#[test]
	fn concurrent_register_and_unregister_leave_consistent_indices() {
		let presence = PresenceRegistry::new();
		let handles: Vec<_> = (0..8u64)
			.map(|t| {
				let presence = presence.clone();
				std::thread::spawn(move || {
					for i in 0..200u64 {
						let conn = ConnectionId(t * 1_000 + i);
						let u = user(&format!("u{}", i % 5));
						presence.register(&u, conn);
						if i % 2 == 0 {
							presence.unregister(conn);
						}
					}
				})
			})
			.collect();
		for h in handles {
			h.join().unwrap();
		}

		assert_eq!(presence.connection_count(), 8 * 100);
		let total: usize = presence
			.online_users()
			.iter()
			.map(|u| presence.connections_for(u).len())
			.sum();
		assert_eq!(total, 8 * 100);
	}
}

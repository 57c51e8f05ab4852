#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use murmur_domain::{ConnectionId, ConversationId};
use murmur_protocol::pb;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

/// Event as handed to a connection's events writer. Shared between all members.
pub type RoomEvent = Arc<pb::Envelope>;

/// Receiving half of a connection's attachment to the router.
#[derive(Debug)]
pub struct Subscription {
	/// Bounded queue of events for rooms the connection has joined.
	pub events: mpsc::Receiver<RoomEvent>,
	/// Fires when the router gave up on this connection (queue full or closed).
	pub evicted: oneshot::Receiver<()>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
	pub delivered: usize,
	/// Members that could not take the event and were evicted.
	pub evicted: Vec<ConnectionId>,
}

#[derive(Debug)]
struct Subscriber {
	conn_id: ConnectionId,
	tx: mpsc::Sender<RoomEvent>,
	evicted: AtomicBool,
	evict_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl Subscriber {
	fn is_evicted(&self) -> bool {
		self.evicted.load(Ordering::Acquire)
	}

	fn evict(&self) {
		if self.evicted.swap(true, Ordering::AcqRel) {
			return;
		}
		if let Some(tx) = self.evict_tx.lock().take() {
			let _ = tx.send(());
		}
	}
}

#[derive(Debug, Default)]
struct Room {
	members: BTreeMap<ConnectionId, Arc<Subscriber>>,
}

#[derive(Debug, Default)]
struct Index {
	subscribers: HashMap<ConnectionId, Arc<Subscriber>>,
	rooms: HashMap<ConversationId, Arc<Mutex<Room>>>,
	joined: HashMap<ConnectionId, HashSet<ConversationId>>,
}

/// Groups connections by conversation and fans events out to room members.
///
/// Lock order is index, then room. Broadcast only takes the room lock.
#[derive(Debug, Clone)]
pub struct RoomRouter {
	index: Arc<Mutex<Index>>,
	queue_capacity: usize,
}

impl RoomRouter {
	pub fn new(queue_capacity: usize) -> Self {
		Self {
			index: Arc::new(Mutex::new(Index::default())),
			queue_capacity: queue_capacity.max(1),
		}
	}

	/// Register a connection's event queue. Re-attaching replaces the previous queue.
	pub async fn attach(&self, conn_id: ConnectionId) -> Subscription {
		let (tx, events) = mpsc::channel(self.queue_capacity);
		let (evict_tx, evicted) = oneshot::channel();
		let sub = Arc::new(Subscriber {
			conn_id,
			tx,
			evicted: AtomicBool::new(false),
			evict_tx: parking_lot::Mutex::new(Some(evict_tx)),
		});

		let mut index = self.index.lock().await;
		if index.subscribers.insert(conn_id, Arc::clone(&sub)).is_some() {
			let rooms = index.joined.get(&conn_id).cloned().unwrap_or_default();
			for conversation_id in rooms {
				if let Some(room) = index.rooms.get(&conversation_id) {
					room.lock().await.members.insert(conn_id, Arc::clone(&sub));
				}
			}
		}

		Subscription { events, evicted }
	}

	/// Leave every room and forget the connection's queue.
	pub async fn detach(&self, conn_id: ConnectionId) -> Vec<ConversationId> {
		let left = self.leave_all(conn_id).await;
		self.index.lock().await.subscribers.remove(&conn_id);
		left
	}

	/// Returns true when the connection was not yet a member.
	pub async fn join(&self, conn_id: ConnectionId, conversation_id: &ConversationId) -> bool {
		let mut index = self.index.lock().await;
		let Some(sub) = index.subscribers.get(&conn_id).cloned() else {
			warn!(conn_id = %conn_id, "room router: join for unattached connection");
			return false;
		};
		if sub.is_evicted() {
			return false;
		}

		let room = Arc::clone(index.rooms.entry(conversation_id.clone()).or_default());
		let newly = room.lock().await.members.insert(conn_id, sub).is_none();
		index.joined.entry(conn_id).or_default().insert(conversation_id.clone());

		if newly {
			debug!(conn_id = %conn_id, conversation_id = %conversation_id, "room router: joined");
		}
		newly
	}

	/// Returns true when the connection was a member.
	pub async fn leave(&self, conn_id: ConnectionId, conversation_id: &ConversationId) -> bool {
		let mut index = self.index.lock().await;
		let was_member = index
			.joined
			.get_mut(&conn_id)
			.is_some_and(|rooms| rooms.remove(conversation_id));
		if index.joined.get(&conn_id).is_some_and(HashSet::is_empty) {
			index.joined.remove(&conn_id);
		}

		remove_member(&mut index, conn_id, conversation_id).await;
		was_member
	}

	/// Leave every joined room, returning the rooms left.
	pub async fn leave_all(&self, conn_id: ConnectionId) -> Vec<ConversationId> {
		let mut index = self.index.lock().await;
		let rooms: Vec<_> = index.joined.remove(&conn_id).into_iter().flatten().collect();
		for conversation_id in &rooms {
			remove_member(&mut index, conn_id, conversation_id).await;
		}
		rooms
	}

	/// Deliver `event` to every member of the room except `exclude`.
	///
	/// Never waits on a member: a full or closed queue evicts that member instead, which keeps
	/// every remaining member's stream gap-free.
	pub async fn broadcast(
		&self,
		conversation_id: &ConversationId,
		event: RoomEvent,
		exclude: Option<ConnectionId>,
	) -> BroadcastReport {
		let room = {
			let index = self.index.lock().await;
			match index.rooms.get(conversation_id) {
				Some(room) => Arc::clone(room),
				None => return BroadcastReport::default(),
			}
		};

		let mut report = BroadcastReport::default();
		let mut room = room.lock().await;
		room.members.retain(|conn_id, sub| {
			if Some(*conn_id) == exclude {
				return true;
			}
			if sub.is_evicted() {
				return false;
			}

			match sub.tx.try_send(Arc::clone(&event)) {
				Ok(()) => {
					report.delivered += 1;
					true
				}
				Err(e) => {
					let reason = match e {
						mpsc::error::TrySendError::Full(_) => "queue full",
						mpsc::error::TrySendError::Closed(_) => "queue closed",
					};
					warn!(conn_id = %sub.conn_id, conversation_id = %conversation_id, reason, "room router: evicting member");
					sub.evict();
					report.evicted.push(*conn_id);
					false
				}
			}
		});
		drop(room);

		metrics::counter!("murmur_server_events_delivered_total").increment(report.delivered as u64);
		if !report.evicted.is_empty() {
			metrics::counter!("murmur_server_broadcast_evictions_total").increment(report.evicted.len() as u64);
		}
		report
	}

	/// Current members of a room, in connection id order.
	pub async fn members(&self, conversation_id: &ConversationId) -> Vec<ConnectionId> {
		let room = {
			let index = self.index.lock().await;
			match index.rooms.get(conversation_id) {
				Some(room) => Arc::clone(room),
				None => return Vec::new(),
			}
		};
		let room = room.lock().await;
		room.members
			.iter()
			.filter(|(_, sub)| !sub.is_evicted())
			.map(|(conn_id, _)| *conn_id)
			.collect()
	}

	pub async fn rooms_for(&self, conn_id: ConnectionId) -> Vec<ConversationId> {
		let index = self.index.lock().await;
		let mut rooms: Vec<_> = index.joined.get(&conn_id).into_iter().flatten().cloned().collect();
		rooms.sort();
		rooms
	}

	pub async fn room_count(&self) -> usize {
		self.index.lock().await.rooms.len()
	}
}

async fn remove_member(index: &mut Index, conn_id: ConnectionId, conversation_id: &ConversationId) {
	let Some(room) = index.rooms.get(conversation_id).cloned() else {
		return;
	};

	let mut room_guard = room.lock().await;
	room_guard.members.remove(&conn_id);
	if room_guard.members.is_empty() {
		drop(room_guard);
		index.rooms.remove(conversation_id);
	}
}

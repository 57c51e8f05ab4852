#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use murmur_domain::{ChatError, ConnectionId, ConversationId, Identity};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::server::auth::IdentityProvider;
use crate::server::directory::UserDirectory;
use crate::server::presence::PresenceRegistry;
use crate::server::room_router::{RoomRouter, Subscription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
	Connecting,
	Authenticated(Identity),
	Closed,
}

/// One client connection as seen by the gateway and the pipeline.
#[derive(Debug)]
pub struct Session {
	conn_id: ConnectionId,
	state: Mutex<SessionState>,
}

impl Session {
	fn new(conn_id: ConnectionId) -> Self {
		Self {
			conn_id,
			state: Mutex::new(SessionState::Connecting),
		}
	}

	pub fn connection_id(&self) -> ConnectionId {
		self.conn_id
	}

	/// The bound identity, or `Unauthenticated` before authentication and after close.
	pub fn identity(&self) -> Result<Identity, ChatError> {
		match &*self.state.lock() {
			SessionState::Authenticated(identity) => Ok(identity.clone()),
			SessionState::Connecting => Err(ChatError::Unauthenticated("authenticate first".into())),
			SessionState::Closed => Err(ChatError::Unauthenticated("session closed".into())),
		}
	}

	pub fn state(&self) -> SessionState {
		self.state.lock().clone()
	}

	pub fn is_closed(&self) -> bool {
		matches!(*self.state.lock(), SessionState::Closed)
	}
}

/// Connection lifecycle: authentication, room membership, teardown.
#[derive(Clone)]
pub struct SessionGateway {
	identity: Arc<dyn IdentityProvider>,
	directory: Arc<dyn UserDirectory>,
	presence: PresenceRegistry,
	router: RoomRouter,
	auth_grace: Duration,
}

impl SessionGateway {
	pub fn new(
		identity: Arc<dyn IdentityProvider>,
		directory: Arc<dyn UserDirectory>,
		presence: PresenceRegistry,
		router: RoomRouter,
		auth_grace: Duration,
	) -> Self {
		Self {
			identity,
			directory,
			presence,
			router,
			auth_grace,
		}
	}

	pub fn auth_grace(&self) -> Duration {
		self.auth_grace
	}

	pub fn presence(&self) -> &PresenceRegistry {
		&self.presence
	}

	pub fn router(&self) -> &RoomRouter {
		&self.router
	}

	/// Accept a new connection in the `Connecting` state and attach its event queue.
	pub async fn open(&self, conn_id: ConnectionId) -> (Arc<Session>, Subscription) {
		let subscription = self.router.attach(conn_id).await;
		debug!(conn_id = %conn_id, "session opened");
		(Arc::new(Session::new(conn_id)), subscription)
	}

	/// Verify `credential` and bind the identity to the session.
	pub async fn authenticate(&self, session: &Session, credential: &str) -> Result<Identity, ChatError> {
		match session.state() {
			SessionState::Connecting => {}
			SessionState::Authenticated(_) => {
				return Err(ChatError::InvalidArgument("session is already authenticated".into()));
			}
			SessionState::Closed => return Err(ChatError::Unauthenticated("session closed".into())),
		}

		let identity = match self.identity.verify(credential).await {
			Ok(identity) => identity,
			Err(e) => {
				metrics::counter!("murmur_server_auth_failures_total").increment(1);
				warn!(conn_id = %session.conn_id, error = %e, "credential rejected");
				return Err(e);
			}
		};
		let profile = self.directory.ensure(&identity).await?;

		let came_online = {
			let mut state = session.state.lock();
			match &*state {
				SessionState::Connecting => {}
				SessionState::Authenticated(_) => {
					return Err(ChatError::InvalidArgument("session is already authenticated".into()));
				}
				SessionState::Closed => return Err(ChatError::Unauthenticated("session closed".into())),
			}
			*state = SessionState::Authenticated(identity.clone());
			self.presence.register(&identity.user_id, session.conn_id)
		};

		metrics::counter!("murmur_server_auth_success_total").increment(1);
		info!(
			conn_id = %session.conn_id,
			user_id = %identity.user_id,
			display_name = %profile.display_name,
			"session authenticated"
		);
		if came_online {
			metrics::gauge!("murmur_server_online_users").increment(1.0);
			info!(user_id = %identity.user_id, "user online");
		}

		Ok(identity)
	}

	pub async fn join(&self, session: &Session, conversation_id: &str) -> Result<ConversationId, ChatError> {
		let identity = session.identity()?;
		let conversation_id = parse_conversation_id(conversation_id)?;

		if self.router.join(session.conn_id, &conversation_id).await {
			debug!(conn_id = %session.conn_id, user_id = %identity.user_id, conversation_id = %conversation_id, "joined room");
		}

		// a close that raced the join has already detached; undo the late membership
		if session.is_closed() {
			self.router.leave(session.conn_id, &conversation_id).await;
			return Err(ChatError::Unauthenticated("session closed".into()));
		}

		Ok(conversation_id)
	}

	pub async fn leave(&self, session: &Session, conversation_id: &str) -> Result<ConversationId, ChatError> {
		session.identity()?;
		let conversation_id = parse_conversation_id(conversation_id)?;
		self.router.leave(session.conn_id, &conversation_id).await;
		Ok(conversation_id)
	}

	/// Tear a session down. Only the first call does any work; later calls return false.
	pub async fn close(&self, session: &Session) -> bool {
		let previous = std::mem::replace(&mut *session.state.lock(), SessionState::Closed);
		if previous == SessionState::Closed {
			return false;
		}

		let rooms = self.router.detach(session.conn_id).await;

		if let SessionState::Authenticated(identity) = previous {
			if let Some(user_id) = self.presence.unregister(session.conn_id) {
				metrics::gauge!("murmur_server_online_users").decrement(1.0);
				info!(user_id = %user_id, "user offline");
			}
			info!(conn_id = %session.conn_id, user_id = %identity.user_id, rooms = rooms.len(), "session closed");
		} else {
			debug!(conn_id = %session.conn_id, "unauthenticated session closed");
		}

		true
	}
}

pub fn parse_conversation_id(raw: &str) -> Result<ConversationId, ChatError> {
	ConversationId::new(raw).map_err(|e| ChatError::InvalidArgument(format!("conversation_id: {e}")))
}

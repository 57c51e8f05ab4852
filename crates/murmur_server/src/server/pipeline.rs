#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use murmur_domain::{
	Attachment, ChatError, ConnectionId, ConversationId, MessageId, NewMessage, UserId, UserProfile, normalize_content,
};
use murmur_protocol::convert;
use murmur_protocol::pb;
use murmur_protocol::pb::event_envelope::Event;
use murmur_util::time::unix_ms_now;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::server::audit::{AuditAction, AuditService};
use crate::server::directory::UserDirectory;
use crate::server::gateway::{Session, parse_conversation_id};
use crate::server::rate_limit::SendRateLimiter;
use crate::server::room_router::RoomRouter;
use crate::server::store::MessageStore;

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
	pub max_content_chars: usize,
	/// Total attempts for a history read, including the first.
	pub list_retry_attempts: u32,
	pub list_retry_backoff: Duration,
}

impl Default for PipelineSettings {
	fn default() -> Self {
		Self {
			max_content_chars: murmur_domain::DEFAULT_MAX_CONTENT_CHARS,
			list_retry_attempts: 3,
			list_retry_backoff: Duration::from_millis(50),
		}
	}
}

/// One async mutex per conversation with a mutation in flight.
#[derive(Debug, Default)]
struct OrderingGates {
	by_conversation: Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl OrderingGates {
	fn acquire(&self, conversation_id: &ConversationId) -> Arc<tokio::sync::Mutex<()>> {
		Arc::clone(self.by_conversation.lock().entry(conversation_id.clone()).or_default())
	}

	fn release(&self, conversation_id: &ConversationId, gate: Arc<tokio::sync::Mutex<()>>) {
		let mut map = self.by_conversation.lock();
		drop(gate);
		// map entry plus no other holder
		if map.get(conversation_id).is_some_and(|g| Arc::strong_count(g) == 1) {
			map.remove(conversation_id);
		}
	}

	fn len(&self) -> usize {
		self.by_conversation.lock().len()
	}
}

/// Validates, persists and fans out message mutations.
///
/// Every mutation runs as a spawned task holding its conversation's gate, so the
/// commit and its broadcast finish even when the requesting connection goes away,
/// and events of one conversation leave in commit order.
#[derive(Clone)]
pub struct MessagePipeline {
	store: Arc<dyn MessageStore>,
	directory: Arc<dyn UserDirectory>,
	router: RoomRouter,
	audit: AuditService,
	limiter: Arc<SendRateLimiter>,
	gates: Arc<OrderingGates>,
	settings: PipelineSettings,
}

impl MessagePipeline {
	pub fn new(
		store: Arc<dyn MessageStore>,
		directory: Arc<dyn UserDirectory>,
		router: RoomRouter,
		audit: AuditService,
		limiter: Arc<SendRateLimiter>,
		settings: PipelineSettings,
	) -> Self {
		Self {
			store,
			directory,
			router,
			audit,
			limiter,
			gates: Arc::new(OrderingGates::default()),
			settings,
		}
	}

	pub fn limiter(&self) -> &SendRateLimiter {
		&self.limiter
	}

	pub async fn handle_send(&self, session: &Session, req: pb::SendMessage) -> Result<pb::MessageEvent, ChatError> {
		let identity = session.identity()?;
		let conversation_id = parse_conversation_id(&req.conversation_id)?;
		let attachment = req.attachment.map(Attachment::from);
		let content = normalize_content(&req.content, attachment.as_ref(), self.settings.max_content_chars)?;
		let sender = self.directory.profile(&identity.user_id).await?;
		self.limiter.check(session.connection_id(), &conversation_id)?;

		let new = NewMessage {
			sender_id: identity.user_id,
			conversation_id: conversation_id.clone(),
			content,
			attachment,
		};
		let origin = session.connection_id();
		let this = self.clone();
		let event = self
			.commit(conversation_id, async move {
				let message = this.store.append(new).await?;
				let event = convert::message_event(&message, &sender);
				this.publish(&message.conversation_id, Event::MessageCreated(event.clone()), Some(origin))
					.await;
				Ok(event)
			})
			.await?;

		metrics::counter!("murmur_server_messages_sent_total").increment(1);
		debug!(conn_id = %origin, message_id = event.message_id, conversation_id = %event.conversation_id, "message sent");
		Ok(event)
	}

	pub async fn handle_edit(&self, session: &Session, req: pb::EditMessage) -> Result<pb::MessageEvent, ChatError> {
		let identity = session.identity()?;
		let id = MessageId(req.message_id);
		let existing = self.store.get_by_id(id).await?;
		if existing.sender_id != identity.user_id {
			return Err(ChatError::Forbidden(format!("message {id} belongs to another user")));
		}
		if existing.deleted {
			return Err(ChatError::NotFound(format!("message {id}")));
		}
		let sender = self.directory.profile(&identity.user_id).await?;

		let origin = session.connection_id();
		let editor = identity.user_id;
		let this = self.clone();
		let event = self
			.commit(existing.conversation_id, async move {
				let message = this.store.edit_content(id, &editor, &req.content).await?;
				let event = convert::message_event(&message, &sender);
				this.publish(&message.conversation_id, Event::MessageUpdated(event.clone()), Some(origin))
					.await;
				this.record(AuditAction::Edit, id, &message.conversation_id, &editor).await;
				Ok(event)
			})
			.await?;

		metrics::counter!("murmur_server_messages_edited_total").increment(1);
		Ok(event)
	}

	/// Soft-delete a message. Deleting twice succeeds without a second event.
	pub async fn handle_delete(&self, session: &Session, req: pb::DeleteMessage) -> Result<MessageId, ChatError> {
		let identity = session.identity()?;
		let id = MessageId(req.message_id);
		let existing = self.store.get_by_id(id).await?;

		let origin = session.connection_id();
		let requester = identity.user_id;
		let this = self.clone();
		self.commit(existing.conversation_id, async move {
			let deletion = this.store.soft_delete(id, &requester).await?;
			if deletion.newly_deleted {
				let conversation_id = &deletion.message.conversation_id;
				this.publish(conversation_id, Event::MessageDeleted(convert::deleted_event(id)), Some(origin))
					.await;
				this.record(AuditAction::Delete, id, conversation_id, &requester).await;
				metrics::counter!("murmur_server_messages_deleted_total").increment(1);
			}
			Ok(id)
		})
		.await
	}

	/// Live history of a conversation, oldest first, with sender profiles.
	pub async fn list_messages(&self, session: &Session, conversation_id: &str) -> Result<Vec<pb::MessageEvent>, ChatError> {
		session.identity()?;
		let conversation_id = parse_conversation_id(conversation_id)?;

		let attempts = self.settings.list_retry_attempts.max(1);
		let mut attempt = 1;
		loop {
			match self.read_history(&conversation_id).await {
				Ok(events) => return Ok(events),
				Err(e) if e.is_transient() && attempt < attempts => {
					metrics::counter!("murmur_server_list_retries_total").increment(1);
					warn!(conversation_id = %conversation_id, attempt, error = %e, "history read failed; retrying");
					tokio::time::sleep(self.settings.list_retry_backoff * attempt).await;
					attempt += 1;
				}
				Err(e) => return Err(e),
			}
		}
	}

	async fn read_history(&self, conversation_id: &ConversationId) -> Result<Vec<pb::MessageEvent>, ChatError> {
		let messages = self.store.list_by_conversation(conversation_id, true).await?;

		let mut profiles: HashMap<UserId, UserProfile> = HashMap::new();
		let mut events = Vec::with_capacity(messages.len());
		for message in &messages {
			if !profiles.contains_key(&message.sender_id) {
				let profile = self.sender_profile(&message.sender_id).await?;
				profiles.insert(message.sender_id.clone(), profile);
			}
			if let Some(profile) = profiles.get(&message.sender_id) {
				events.push(convert::message_event(message, profile));
			}
		}
		Ok(events)
	}

	/// Users removed from the directory still show up in history under their id.
	async fn sender_profile(&self, user_id: &UserId) -> Result<UserProfile, ChatError> {
		match self.directory.profile(user_id).await {
			Ok(profile) => Ok(profile),
			Err(ChatError::NotFound(_)) => Ok(UserProfile {
				user_id: user_id.clone(),
				display_name: user_id.to_string(),
				avatar_url: None,
			}),
			Err(e) => Err(e),
		}
	}

	async fn commit<T, F>(&self, conversation_id: ConversationId, work: F) -> Result<T, ChatError>
	where
		T: Send + 'static,
		F: Future<Output = Result<T, ChatError>> + Send + 'static,
	{
		let gates = Arc::clone(&self.gates);
		let task = tokio::spawn(async move {
			let gate = gates.acquire(&conversation_id);
			let result = {
				let _turn = gate.lock().await;
				work.await
			};
			gates.release(&conversation_id, gate);
			result
		});

		match task.await {
			Ok(result) => result,
			Err(e) => {
				error!(error = %e, "commit task failed");
				Err(ChatError::Unavailable("commit task failed".into()))
			}
		}
	}

	async fn publish(&self, conversation_id: &ConversationId, event: Event, exclude: Option<ConnectionId>) {
		let envelope = convert::event_envelope(conversation_id.as_str(), unix_ms_now(), event);
		let report = self.router.broadcast(conversation_id, Arc::new(envelope), exclude).await;
		if !report.evicted.is_empty() {
			warn!(conversation_id = %conversation_id, evicted = report.evicted.len(), "slow members evicted");
		}
	}

	async fn record(&self, action: AuditAction, id: MessageId, conversation_id: &ConversationId, actor: &UserId) {
		if let Err(e) = self.audit.record_mutation(action, id, conversation_id, actor).await {
			metrics::counter!("murmur_server_audit_failures_total").increment(1);
			warn!(message_id = %id, action = action.as_str(), error = ?e, "failed to record audit entry");
		}
	}

	#[cfg(test)]
	pub(crate) fn open_gates(&self) -> usize {
		self.gates.len()
	}
}

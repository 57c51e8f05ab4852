#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use murmur_domain::{
	ChatError, ConnectionId, ConversationId, Identity, Message, MessageId, NewMessage, UserId, UserProfile,
};
use murmur_protocol::pb::{self, envelope::Msg, event_envelope::Event};
use murmur_util::time::unix_secs_now;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::server::audit::AuditService;
use crate::server::auth::{AuthClaims, HmacIdentityProvider, sign_token};
use crate::server::db::Database;
use crate::server::directory::{InMemoryUserDirectory, UserDirectory};
use crate::server::gateway::{Session, SessionGateway, SessionState};
use crate::server::pipeline::{MessagePipeline, PipelineSettings};
use crate::server::presence::PresenceRegistry;
use crate::server::rate_limit::{RateLimit, SendRateLimiter};
use crate::server::room_router::{RoomRouter, Subscription};
use crate::server::store::{Deletion, InMemoryMessageStore, MessageStore, SqlMessageStore};

const SECRET: &[u8] = b"pipeline-test-secret";

fn profile(id: &str, name: &str) -> UserProfile {
	UserProfile {
		user_id: UserId::new(id).unwrap(),
		display_name: name.to_string(),
		avatar_url: None,
	}
}

fn token(user: &str) -> String {
	sign_token(
		&AuthClaims {
			sub: user.to_string(),
			name: None,
			exp: unix_secs_now() + 3600,
		},
		SECRET,
	)
}

fn send(conversation: &str, content: &str) -> pb::SendMessage {
	pb::SendMessage {
		conversation_id: conversation.to_string(),
		content: content.to_string(),
		attachment: None,
	}
}

fn edit(message_id: u64, content: &str) -> pb::EditMessage {
	pb::EditMessage {
		message_id,
		content: content.to_string(),
	}
}

struct Client {
	session: Arc<Session>,
	sub: Subscription,
}

impl Client {
	async fn next_event(&mut self) -> Event {
		let envelope = timeout(Duration::from_millis(500), self.sub.events.recv())
			.await
			.expect("event in time")
			.expect("queue open");
		match &envelope.msg {
			Some(Msg::Event(pb::EventEnvelope { event: Some(event), .. })) => event.clone(),
			other => panic!("unexpected envelope: {other:?}"),
		}
	}

	async fn assert_quiet(&mut self) {
		let got = timeout(Duration::from_millis(50), self.sub.events.recv()).await;
		assert!(got.is_err(), "unexpected event: {got:?}");
	}
}

struct Harness {
	gateway: SessionGateway,
	pipeline: MessagePipeline,
	store: Arc<dyn MessageStore>,
	next_conn: AtomicU64,
}

impl Harness {
	fn new() -> Self {
		Self::with(
			Arc::new(InMemoryMessageStore::new(4000)),
			SendRateLimiter::unlimited(),
			AuditService::disabled(),
			PipelineSettings::default(),
		)
	}

	fn with(
		store: Arc<dyn MessageStore>,
		limiter: SendRateLimiter,
		audit: AuditService,
		settings: PipelineSettings,
	) -> Self {
		Self::with_directory(
			store,
			Arc::new(InMemoryUserDirectory::new([profile("alice", "Alice"), profile("bob", "Bob")])),
			limiter,
			audit,
			settings,
		)
	}

	fn with_directory(
		store: Arc<dyn MessageStore>,
		directory: Arc<dyn UserDirectory>,
		limiter: SendRateLimiter,
		audit: AuditService,
		settings: PipelineSettings,
	) -> Self {
		let router = RoomRouter::new(64);
		let gateway = SessionGateway::new(
			Arc::new(HmacIdentityProvider::new(SECRET)),
			Arc::clone(&directory),
			PresenceRegistry::new(),
			router.clone(),
			Duration::from_secs(5),
		);
		let pipeline = MessagePipeline::new(Arc::clone(&store), directory, router, audit, Arc::new(limiter), settings);

		Self {
			gateway,
			pipeline,
			store,
			next_conn: AtomicU64::new(1),
		}
	}

	async fn connect(&self, user: &str) -> Client {
		let conn_id = ConnectionId(self.next_conn.fetch_add(1, Ordering::SeqCst));
		let (session, sub) = self.gateway.open(conn_id).await;
		self.gateway.authenticate(&session, &token(user)).await.expect("authenticate");
		Client { session, sub }
	}

	async fn connect_to(&self, user: &str, conversation: &str) -> Client {
		let client = self.connect(user).await;
		self.gateway.join(&client.session, conversation).await.expect("join");
		client
	}
}

#[tokio::test]
async fn two_users_exchange_messages_in_a_room() {
	let h = Harness::new();
	let mut alice = h.connect_to("alice", "c1").await;
	let mut bob = h.connect_to("bob", "c1").await;

	let hi = h.pipeline.handle_send(&alice.session, send("c1", "hi")).await.unwrap();
	assert_eq!(hi.content, "hi");
	assert_eq!(hi.sender.as_ref().unwrap().display_name, "Alice");

	match bob.next_event().await {
		Event::MessageCreated(ev) => assert_eq!(ev, hi),
		other => panic!("unexpected event: {other:?}"),
	}
	alice.assert_quiet().await;

	let bye = h.pipeline.handle_send(&bob.session, send("c1", "bye")).await.unwrap();
	match alice.next_event().await {
		Event::MessageCreated(ev) => {
			assert_eq!(ev.content, "bye");
			assert_eq!(ev.sender.unwrap().user_id, "bob");
		}
		other => panic!("unexpected event: {other:?}"),
	}
	bob.assert_quiet().await;

	let history = h.pipeline.list_messages(&alice.session, "c1").await.unwrap();
	let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
	assert_eq!(contents, ["hi", "bye"]);
	assert!(hi.message_id < bye.message_id);
	assert!(hi.created_at_unix_ms <= bye.created_at_unix_ms);
}

#[tokio::test]
async fn invalid_content_is_rejected_and_nothing_is_stored() {
	let h = Harness::new();
	let alice = h.connect_to("alice", "c1").await;
	let mut bob = h.connect_to("bob", "c1").await;

	let err = h.pipeline.handle_send(&alice.session, send("c1", "   ")).await.unwrap_err();
	assert!(matches!(err, ChatError::InvalidArgument(_)), "got {err:?}");

	let too_long = "x".repeat(4001);
	let err = h.pipeline.handle_send(&alice.session, send("c1", &too_long)).await.unwrap_err();
	assert!(matches!(err, ChatError::InvalidArgument(_)), "got {err:?}");

	let err = h.pipeline.handle_send(&alice.session, send(" ", "hi")).await.unwrap_err();
	assert!(matches!(err, ChatError::InvalidArgument(_)), "got {err:?}");

	assert!(h.pipeline.list_messages(&alice.session, "c1").await.unwrap().is_empty());
	bob.assert_quiet().await;
}

#[tokio::test]
async fn attachment_only_message_is_delivered() {
	let h = Harness::new();
	let alice = h.connect_to("alice", "c1").await;
	let mut bob = h.connect_to("bob", "c1").await;

	let req = pb::SendMessage {
		conversation_id: "c1".into(),
		content: String::new(),
		attachment: Some(pb::Attachment {
			kind: "image".into(),
			url: "https://blobs.example/cat.png".into(),
			name: "cat.png".into(),
			size: 2048,
		}),
	};
	let sent = h.pipeline.handle_send(&alice.session, req).await.unwrap();

	match bob.next_event().await {
		Event::MessageCreated(ev) => {
			assert_eq!(ev.message_id, sent.message_id);
			assert_eq!(ev.attachment.unwrap().name, "cat.png");
		}
		other => panic!("unexpected event: {other:?}"),
	}
}

#[tokio::test]
async fn owner_edit_is_broadcast_and_seen_by_late_joiners() {
	let h = Harness::new();
	let alice = h.connect_to("alice", "c1").await;
	let mut bob = h.connect_to("bob", "c1").await;

	let sent = h.pipeline.handle_send(&alice.session, send("c1", "helo")).await.unwrap();
	let _ = bob.next_event().await;

	let edited = h.pipeline.handle_edit(&alice.session, edit(sent.message_id, "hello")).await.unwrap();
	assert_eq!(edited.content, "hello");
	assert!(edited.edited_at_unix_ms.is_some());

	match bob.next_event().await {
		Event::MessageUpdated(ev) => assert_eq!(ev, edited),
		other => panic!("unexpected event: {other:?}"),
	}

	let late = h.connect_to("bob", "c1").await;
	let history = h.pipeline.list_messages(&late.session, "c1").await.unwrap();
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].content, "hello");
	assert_eq!(history[0].edited_at_unix_ms, edited.edited_at_unix_ms);
	assert_eq!(history[0].created_at_unix_ms, sent.created_at_unix_ms);
}

#[tokio::test]
async fn only_the_sender_may_edit_or_delete() {
	let h = Harness::new();
	let alice = h.connect_to("alice", "c1").await;
	let mut bob = h.connect_to("bob", "c1").await;

	let sent = h.pipeline.handle_send(&alice.session, send("c1", "mine")).await.unwrap();
	let _ = bob.next_event().await;

	let err = h.pipeline.handle_edit(&bob.session, edit(sent.message_id, "yours")).await.unwrap_err();
	assert!(matches!(err, ChatError::Forbidden(_)), "got {err:?}");

	let err = h
		.pipeline
		.handle_delete(&bob.session, pb::DeleteMessage {
			message_id: sent.message_id,
		})
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Forbidden(_)), "got {err:?}");

	let history = h.pipeline.list_messages(&bob.session, "c1").await.unwrap();
	assert_eq!(history[0].content, "mine");
	assert_eq!(history[0].edited_at_unix_ms, None);
}

#[tokio::test]
async fn non_owners_are_forbidden_even_after_delete() {
	let h = Harness::new();
	let alice = h.connect_to("alice", "c1").await;
	let bob = h.connect_to("bob", "c1").await;

	let sent = h.pipeline.handle_send(&alice.session, send("c1", "short-lived")).await.unwrap();
	h.pipeline
		.handle_delete(&alice.session, pb::DeleteMessage {
			message_id: sent.message_id,
		})
		.await
		.unwrap();

	let err = h.pipeline.handle_edit(&bob.session, edit(sent.message_id, "mine now")).await.unwrap_err();
	assert!(matches!(err, ChatError::Forbidden(_)), "got {err:?}");
	let err = h.pipeline.handle_edit(&alice.session, edit(sent.message_id, "undo")).await.unwrap_err();
	assert!(matches!(err, ChatError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn unknown_message_is_not_found() {
	let h = Harness::new();
	let alice = h.connect_to("alice", "c1").await;

	let err = h.pipeline.handle_edit(&alice.session, edit(999, "x")).await.unwrap_err();
	assert!(matches!(err, ChatError::NotFound(_)));
	let err = h
		.pipeline
		.handle_delete(&alice.session, pb::DeleteMessage { message_id: 999 })
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::NotFound(_)));
}

#[tokio::test]
async fn repeated_delete_succeeds_without_a_second_event() {
	let h = Harness::new();
	let alice = h.connect_to("alice", "c1").await;
	let mut bob = h.connect_to("bob", "c1").await;

	let sent = h.pipeline.handle_send(&alice.session, send("c1", "oops")).await.unwrap();
	let _ = bob.next_event().await;

	let req = pb::DeleteMessage {
		message_id: sent.message_id,
	};
	assert_eq!(
		h.pipeline.handle_delete(&alice.session, req.clone()).await.unwrap(),
		MessageId(sent.message_id)
	);
	match bob.next_event().await {
		Event::MessageDeleted(d) => assert_eq!(d.message_id, sent.message_id),
		other => panic!("unexpected event: {other:?}"),
	}

	assert!(h.pipeline.handle_delete(&alice.session, req).await.is_ok());
	bob.assert_quiet().await;

	assert!(h.pipeline.list_messages(&bob.session, "c1").await.unwrap().is_empty());

	let err = h.pipeline.handle_edit(&alice.session, edit(sent.message_id, "back")).await.unwrap_err();
	assert!(matches!(err, ChatError::NotFound(_)), "deleted messages cannot be edited");
}

#[tokio::test]
async fn mutations_are_audited_when_persistence_is_on() {
	let db = Database::in_memory().await.unwrap();
	let store = SqlMessageStore::new(db.clone(), 4000).await.unwrap();
	let audit = AuditService::new(db);
	let h = Harness::with(Arc::new(store), SendRateLimiter::unlimited(), audit.clone(), PipelineSettings::default());
	let alice = h.connect_to("alice", "c1").await;

	let sent = h.pipeline.handle_send(&alice.session, send("c1", "draft")).await.unwrap();
	h.pipeline.handle_edit(&alice.session, edit(sent.message_id, "final")).await.unwrap();
	let req = pb::DeleteMessage {
		message_id: sent.message_id,
	};
	h.pipeline.handle_delete(&alice.session, req.clone()).await.unwrap();
	h.pipeline.handle_delete(&alice.session, req).await.unwrap();

	let history = audit.history(MessageId(sent.message_id)).await.unwrap();
	assert_eq!(
		history,
		vec![("alice".to_string(), "edit".to_string()), ("alice".to_string(), "delete".to_string())]
	);
}

#[tokio::test]
async fn requests_before_authentication_are_rejected() {
	let h = Harness::new();
	let (session, _sub) = h.gateway.open(ConnectionId(77)).await;

	let err = h.pipeline.handle_send(&session, send("c1", "hi")).await.unwrap_err();
	assert!(matches!(err, ChatError::Unauthenticated(_)));
	assert!(matches!(
		h.gateway.join(&session, "c1").await.unwrap_err(),
		ChatError::Unauthenticated(_)
	));
	assert!(matches!(
		h.pipeline.list_messages(&session, "c1").await.unwrap_err(),
		ChatError::Unauthenticated(_)
	));

	let err = h.gateway.authenticate(&session, "v1.bogus.token").await.unwrap_err();
	assert!(matches!(err, ChatError::Unauthenticated(_)));
	assert_eq!(session.state(), SessionState::Connecting);

	h.gateway.authenticate(&session, &token("alice")).await.unwrap();
	let err = h.gateway.authenticate(&session, &token("bob")).await.unwrap_err();
	assert!(matches!(err, ChatError::InvalidArgument(_)));
	assert_eq!(session.identity().unwrap().user_id.as_str(), "alice");
}

#[tokio::test]
async fn unknown_users_are_registered_on_authentication() {
	let h = Harness::new();
	let dave = h.connect_to("dave", "c1").await;
	let mut bob = h.connect_to("bob", "c1").await;

	h.pipeline.handle_send(&dave.session, send("c1", "new here")).await.unwrap();
	match bob.next_event().await {
		Event::MessageCreated(ev) => assert_eq!(ev.sender.unwrap().display_name, "dave"),
		other => panic!("unexpected event: {other:?}"),
	}
}

#[tokio::test]
async fn history_falls_back_to_user_id_for_unknown_senders() {
	let h = Harness::new();
	let alice = h.connect("alice").await;

	h.store
		.append(NewMessage {
			sender_id: UserId::new("ghost").unwrap(),
			conversation_id: ConversationId::new("c1").unwrap(),
			content: "boo".into(),
			attachment: None,
		})
		.await
		.unwrap();

	let history = h.pipeline.list_messages(&alice.session, "c1").await.unwrap();
	let sender = history[0].sender.clone().unwrap();
	assert_eq!(sender.user_id, "ghost");
	assert_eq!(sender.display_name, "ghost");
}

#[tokio::test]
async fn close_releases_rooms_and_presence_once() {
	let h = Harness::new();
	let alice = h.connect_to("alice", "c1").await;
	let second = h.connect_to("alice", "c2").await;
	let alice_id = UserId::new("alice").unwrap();
	let c1 = ConversationId::new("c1").unwrap();

	assert!(h.gateway.presence().is_online(&alice_id));
	assert_eq!(h.gateway.router().members(&c1).await, vec![alice.session.connection_id()]);

	assert!(h.gateway.close(&alice.session).await);
	assert!(!h.gateway.close(&alice.session).await, "second close is a no-op");
	assert!(h.gateway.router().members(&c1).await.is_empty());
	assert!(h.gateway.presence().is_online(&alice_id), "another connection is still open");

	let err = h.pipeline.handle_send(&alice.session, send("c1", "late")).await.unwrap_err();
	assert!(matches!(err, ChatError::Unauthenticated(_)));

	assert!(h.gateway.close(&second.session).await);
	assert!(!h.gateway.presence().is_online(&alice_id));
	assert_eq!(h.gateway.router().room_count().await, 0);
}

#[tokio::test]
async fn sender_keeps_talking_after_the_peer_disconnects() {
	let h = Harness::new();
	let a = h.connect_to("alice", "c1").await;
	let mut b = h.connect_to("bob", "c1").await;

	let hi = h.pipeline.handle_send(&a.session, send("c1", "hi")).await.unwrap();
	match b.next_event().await {
		Event::MessageCreated(m) => assert_eq!(m, hi),
		other => panic!("unexpected event: {other:?}"),
	}

	assert!(h.gateway.close(&b.session).await);
	let c1 = ConversationId::new("c1").unwrap();
	assert_eq!(h.gateway.router().members(&c1).await, vec![a.session.connection_id()]);

	h.pipeline.handle_send(&a.session, send("c1", "bye")).await.unwrap();

	let history = h.pipeline.list_messages(&a.session, "c1").await.unwrap();
	let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
	assert_eq!(contents, vec!["hi", "bye"]);
}

#[tokio::test]
async fn senders_other_devices_receive_the_broadcast() {
	let h = Harness::new();
	let mut phone = h.connect_to("alice", "c1").await;
	let mut laptop = h.connect_to("alice", "c1").await;
	let mut bob = h.connect_to("bob", "c1").await;

	let sent = h.pipeline.handle_send(&phone.session, send("c1", "from my phone")).await.unwrap();

	for device in [&mut laptop, &mut bob] {
		match device.next_event().await {
			Event::MessageCreated(m) => assert_eq!(m.message_id, sent.message_id),
			other => panic!("unexpected event: {other:?}"),
		}
	}
	phone.assert_quiet().await;
}

#[tokio::test]
async fn left_rooms_stop_receiving_events() {
	let h = Harness::new();
	let alice = h.connect_to("alice", "c1").await;
	let mut bob = h.connect_to("bob", "c1").await;

	h.gateway.leave(&bob.session, "c1").await.unwrap();
	h.pipeline.handle_send(&alice.session, send("c1", "anyone?")).await.unwrap();
	bob.assert_quiet().await;

	// history stays readable without membership
	assert_eq!(h.pipeline.list_messages(&bob.session, "c1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_sends_are_delivered_in_commit_order() {
	let h = Harness::new();
	let alice = h.connect_to("alice", "c1").await;
	let mut bob = h.connect_to("bob", "c1").await;

	let mut tasks = Vec::new();
	for i in 0..40 {
		let pipeline = h.pipeline.clone();
		let session = Arc::clone(&alice.session);
		tasks.push(tokio::spawn(async move {
			pipeline.handle_send(&session, send("c1", &format!("m{i}"))).await
		}));
	}
	for task in tasks {
		task.await.unwrap().unwrap();
	}

	let mut received = Vec::new();
	for _ in 0..40 {
		match bob.next_event().await {
			Event::MessageCreated(ev) => received.push((ev.message_id, ev.created_at_unix_ms)),
			other => panic!("unexpected event: {other:?}"),
		}
	}

	let history: Vec<_> = h
		.pipeline
		.list_messages(&bob.session, "c1")
		.await
		.unwrap()
		.into_iter()
		.map(|m| (m.message_id, m.created_at_unix_ms))
		.collect();
	assert_eq!(received, history);
	assert!(received.windows(2).all(|w| w[0].0 < w[1].0 && w[0].1 <= w[1].1));
	assert_eq!(h.pipeline.open_gates(), 0);
}

#[tokio::test]
async fn send_rate_limit_rejects_without_storing() {
	let limiter = SendRateLimiter::new(
		RateLimit {
			burst: 2,
			per_minute: 1,
		},
		RateLimit::disabled(),
	);
	let h = Harness::with(
		Arc::new(InMemoryMessageStore::new(4000)),
		limiter,
		AuditService::disabled(),
		PipelineSettings::default(),
	);
	let alice = h.connect_to("alice", "c1").await;

	h.pipeline.handle_send(&alice.session, send("c1", "one")).await.unwrap();
	h.pipeline.handle_send(&alice.session, send("c1", "two")).await.unwrap();
	let err = h.pipeline.handle_send(&alice.session, send("c1", "three")).await.unwrap_err();
	assert_eq!(err, ChatError::RateLimited);

	assert_eq!(h.pipeline.list_messages(&alice.session, "c1").await.unwrap().len(), 2);
}

/// Store whose history reads fail a fixed number of times.
struct FlakyStore {
	inner: InMemoryMessageStore,
	failures_left: AtomicU32,
}

#[async_trait]
impl MessageStore for FlakyStore {
	async fn append(&self, msg: NewMessage) -> Result<Message, ChatError> {
		self.inner.append(msg).await
	}

	async fn list_by_conversation(
		&self,
		conversation_id: &ConversationId,
		exclude_deleted: bool,
	) -> Result<Vec<Message>, ChatError> {
		let left = self.failures_left.load(Ordering::SeqCst);
		if left > 0 {
			self.failures_left.store(left - 1, Ordering::SeqCst);
			return Err(ChatError::Unavailable("database restarting".into()));
		}
		self.inner.list_by_conversation(conversation_id, exclude_deleted).await
	}

	async fn get_by_id(&self, id: MessageId) -> Result<Message, ChatError> {
		self.inner.get_by_id(id).await
	}

	async fn soft_delete(&self, id: MessageId, requester: &UserId) -> Result<Deletion, ChatError> {
		self.inner.soft_delete(id, requester).await
	}

	async fn edit_content(&self, id: MessageId, requester: &UserId, content: &str) -> Result<Message, ChatError> {
		self.inner.edit_content(id, requester, content).await
	}
}

fn flaky_harness(failures: u32) -> Harness {
	Harness::with(
		Arc::new(FlakyStore {
			inner: InMemoryMessageStore::new(4000),
			failures_left: AtomicU32::new(failures),
		}),
		SendRateLimiter::unlimited(),
		AuditService::disabled(),
		PipelineSettings {
			list_retry_attempts: 3,
			list_retry_backoff: Duration::from_millis(1),
			..PipelineSettings::default()
		},
	)
}

#[tokio::test]
async fn history_reads_retry_transient_failures() {
	let h = flaky_harness(2);
	let alice = h.connect("alice").await;
	h.pipeline.handle_send(&alice.session, send("c1", "still here")).await.unwrap();

	let history = h.pipeline.list_messages(&alice.session, "c1").await.unwrap();
	assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn history_reads_give_up_after_the_last_attempt() {
	let h = flaky_harness(3);
	let alice = h.connect("alice").await;

	let err = h.pipeline.list_messages(&alice.session, "c1").await.unwrap_err();
	assert!(err.is_transient(), "got {err:?}");
}

/// Directory that accepts every login but can never resolve a profile.
struct ForgetfulDirectory;

#[async_trait]
impl UserDirectory for ForgetfulDirectory {
	async fn profile(&self, user_id: &UserId) -> Result<UserProfile, ChatError> {
		Err(ChatError::NotFound(format!("user {user_id}")))
	}

	async fn upsert(&self, _profile: UserProfile) -> Result<(), ChatError> {
		Ok(())
	}

	async fn ensure(&self, identity: &Identity) -> Result<UserProfile, ChatError> {
		Ok(UserProfile {
			user_id: identity.user_id.clone(),
			display_name: identity.display_name.clone(),
			avatar_url: None,
		})
	}
}

#[tokio::test]
async fn unresolvable_sender_is_not_found_and_nothing_is_stored() {
	let limit = RateLimit {
		burst: 1,
		per_minute: 1,
	};
	let h = Harness::with_directory(
		Arc::new(InMemoryMessageStore::new(4000)),
		Arc::new(ForgetfulDirectory),
		SendRateLimiter::new(limit, limit),
		AuditService::disabled(),
		PipelineSettings::default(),
	);
	let alice = h.connect_to("alice", "c1").await;

	for _ in 0..3 {
		let err = h.pipeline.handle_send(&alice.session, send("c1", "hello?")).await.unwrap_err();
		assert!(matches!(err, ChatError::NotFound(_)), "failed lookups must not spend send budget: {err:?}");
	}

	let c1 = ConversationId::new("c1").unwrap();
	assert!(h.store.list_by_conversation(&c1, false).await.unwrap().is_empty());
}

/// Store whose appends wait until the test lets them through.
struct HeldStore {
	inner: InMemoryMessageStore,
	entered: Notify,
	release: Notify,
}

#[async_trait]
impl MessageStore for HeldStore {
	async fn append(&self, msg: NewMessage) -> Result<Message, ChatError> {
		self.entered.notify_one();
		self.release.notified().await;
		self.inner.append(msg).await
	}

	async fn list_by_conversation(
		&self,
		conversation_id: &ConversationId,
		exclude_deleted: bool,
	) -> Result<Vec<Message>, ChatError> {
		self.inner.list_by_conversation(conversation_id, exclude_deleted).await
	}

	async fn get_by_id(&self, id: MessageId) -> Result<Message, ChatError> {
		self.inner.get_by_id(id).await
	}

	async fn soft_delete(&self, id: MessageId, requester: &UserId) -> Result<Deletion, ChatError> {
		self.inner.soft_delete(id, requester).await
	}

	async fn edit_content(&self, id: MessageId, requester: &UserId, content: &str) -> Result<Message, ChatError> {
		self.inner.edit_content(id, requester, content).await
	}
}

#[tokio::test]
async fn cancelled_sender_still_commits_and_broadcasts() {
	let store = Arc::new(HeldStore {
		inner: InMemoryMessageStore::new(4000),
		entered: Notify::new(),
		release: Notify::new(),
	});
	let h = Arc::new(Harness::with(
		Arc::clone(&store) as Arc<dyn MessageStore>,
		SendRateLimiter::unlimited(),
		AuditService::disabled(),
		PipelineSettings::default(),
	));
	let alice = h.connect_to("alice", "c1").await;
	let mut bob = h.connect_to("bob", "c1").await;

	let caller = {
		let h = Arc::clone(&h);
		let session = Arc::clone(&alice.session);
		tokio::spawn(async move { h.pipeline.handle_send(&session, send("c1", "going, gone")).await })
	};

	timeout(Duration::from_millis(500), store.entered.notified())
		.await
		.expect("append started");
	caller.abort();
	assert!(caller.await.unwrap_err().is_cancelled());
	store.release.notify_one();

	match bob.next_event().await {
		Event::MessageCreated(m) => assert_eq!(m.content, "going, gone"),
		other => panic!("unexpected event: {other:?}"),
	}
	let history = h.pipeline.list_messages(&bob.session, "c1").await.unwrap();
	assert_eq!(history.len(), 1);
}

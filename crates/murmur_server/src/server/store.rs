#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use murmur_domain::{
	Attachment, ChatError, ConversationId, Message, MessageId, NewMessage, UserId, normalize_content,
};
use murmur_util::time::MonotonicMillis;
use tokio::sync::Mutex;

use crate::server::db::{Database, unavailable};

/// Outcome of a soft delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
	pub message: Message,
	/// False when the message was already deleted.
	pub newly_deleted: bool,
}

/// Durable, ordered, soft-deletable message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
	async fn append(&self, msg: NewMessage) -> Result<Message, ChatError>;

	/// Messages of a conversation, ascending by `created_at` then `id`.
	async fn list_by_conversation(
		&self,
		conversation_id: &ConversationId,
		exclude_deleted: bool,
	) -> Result<Vec<Message>, ChatError>;

	/// Soft-deleted messages are returned too, flagged `deleted`.
	async fn get_by_id(&self, id: MessageId) -> Result<Message, ChatError>;

	async fn soft_delete(&self, id: MessageId, requester: &UserId) -> Result<Deletion, ChatError>;

	async fn edit_content(&self, id: MessageId, requester: &UserId, content: &str) -> Result<Message, ChatError>;
}

fn not_found(id: MessageId) -> ChatError {
	ChatError::NotFound(format!("message {id}"))
}

fn ensure_owner(msg: &Message, requester: &UserId) -> Result<(), ChatError> {
	if &msg.sender_id != requester {
		return Err(ChatError::Forbidden(format!("message {} belongs to another user", msg.id)));
	}
	Ok(())
}

/// Ownership first: a non-owner gets `Forbidden` even for a deleted message.
fn ensure_editable(msg: &Message, requester: &UserId) -> Result<(), ChatError> {
	ensure_owner(msg, requester)?;
	if msg.deleted {
		return Err(not_found(msg.id));
	}
	Ok(())
}

#[derive(Debug, Default)]
struct MemInner {
	next_id: u64,
	clock: MonotonicMillis,
	by_id: HashMap<MessageId, Message>,
	/// Append order, which is already `(created_at, id)` order.
	by_conversation: HashMap<ConversationId, Vec<MessageId>>,
}

#[derive(Debug)]
pub struct InMemoryMessageStore {
	inner: Mutex<MemInner>,
	max_content_chars: usize,
}

impl InMemoryMessageStore {
	pub fn new(max_content_chars: usize) -> Self {
		Self {
			inner: Mutex::new(MemInner::default()),
			max_content_chars,
		}
	}
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
	async fn append(&self, msg: NewMessage) -> Result<Message, ChatError> {
		let content = normalize_content(&msg.content, msg.attachment.as_ref(), self.max_content_chars)?;

		let mut inner = self.inner.lock().await;
		inner.next_id += 1;
		let message = Message {
			id: MessageId(inner.next_id),
			sender_id: msg.sender_id,
			conversation_id: msg.conversation_id,
			content,
			attachment: msg.attachment,
			created_at: inner.clock.next(),
			edited_at: None,
			deleted: false,
		};

		inner
			.by_conversation
			.entry(message.conversation_id.clone())
			.or_default()
			.push(message.id);
		inner.by_id.insert(message.id, message.clone());
		Ok(message)
	}

	async fn list_by_conversation(
		&self,
		conversation_id: &ConversationId,
		exclude_deleted: bool,
	) -> Result<Vec<Message>, ChatError> {
		let inner = self.inner.lock().await;
		let Some(ids) = inner.by_conversation.get(conversation_id) else {
			return Ok(Vec::new());
		};

		Ok(ids
			.iter()
			.filter_map(|id| inner.by_id.get(id))
			.filter(|m| !(exclude_deleted && m.deleted))
			.cloned()
			.collect())
	}

	async fn get_by_id(&self, id: MessageId) -> Result<Message, ChatError> {
		let inner = self.inner.lock().await;
		inner.by_id.get(&id).cloned().ok_or_else(|| not_found(id))
	}

	async fn soft_delete(&self, id: MessageId, requester: &UserId) -> Result<Deletion, ChatError> {
		let mut inner = self.inner.lock().await;
		let msg = inner.by_id.get_mut(&id).ok_or_else(|| not_found(id))?;
		ensure_owner(msg, requester)?;

		let newly_deleted = !msg.deleted;
		msg.deleted = true;
		Ok(Deletion {
			message: msg.clone(),
			newly_deleted,
		})
	}

	async fn edit_content(&self, id: MessageId, requester: &UserId, content: &str) -> Result<Message, ChatError> {
		let mut guard = self.inner.lock().await;
		let inner = &mut *guard;

		let msg = inner.by_id.get_mut(&id).ok_or_else(|| not_found(id))?;
		ensure_editable(msg, requester)?;
		msg.content = normalize_content(content, msg.attachment.as_ref(), self.max_content_chars)?;
		msg.edited_at = Some(inner.clock.next());
		Ok(msg.clone())
	}
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
	id: i64,
	conversation_id: String,
	sender_id: String,
	content: String,
	attachment_kind: Option<String>,
	attachment_url: Option<String>,
	attachment_name: Option<String>,
	attachment_size: Option<i64>,
	created_at: i64,
	edited_at: Option<i64>,
	deleted: bool,
}

impl TryFrom<MessageRow> for Message {
	type Error = ChatError;

	fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
		let corrupt = |what: &str| ChatError::Unavailable(format!("corrupt message row {}: {what}", row.id));

		let attachment = row.attachment_url.map(|url| Attachment {
			kind: row.attachment_kind.unwrap_or_default(),
			url,
			name: row.attachment_name.unwrap_or_default(),
			size: row.attachment_size.unwrap_or(0).max(0) as u64,
		});

		Ok(Message {
			id: MessageId(u64::try_from(row.id).map_err(|_| corrupt("id"))?),
			sender_id: UserId::new(row.sender_id).map_err(|_| corrupt("sender_id"))?,
			conversation_id: ConversationId::new(row.conversation_id).map_err(|_| corrupt("conversation_id"))?,
			content: row.content,
			attachment,
			created_at: row.created_at,
			edited_at: row.edited_at,
			deleted: row.deleted,
		})
	}
}

fn into_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>, ChatError> {
	rows.into_iter().map(Message::try_from).collect()
}

fn db_id(id: MessageId) -> Result<i64, ChatError> {
	i64::try_from(id.get()).map_err(|_| not_found(id))
}

/// `sqlx`-backed store over SQLite or PostgreSQL.
///
/// Writes from this process are serialized so that `created_at` follows id order.
#[derive(Debug)]
pub struct SqlMessageStore {
	db: Database,
	max_content_chars: usize,
	writer: Mutex<MonotonicMillis>,
}

impl SqlMessageStore {
	pub async fn new(db: Database, max_content_chars: usize) -> anyhow::Result<Self> {
		let last: Option<i64> = match &db {
			Database::Sqlite(pool) => sqlx::query_scalar("SELECT MAX(created_at) FROM messages")
				.fetch_one(pool)
				.await?,
			Database::Postgres(pool) => sqlx::query_scalar("SELECT MAX(created_at) FROM messages")
				.fetch_one(pool)
				.await?,
		};

		let mut clock = MonotonicMillis::new();
		if let Some(last) = last {
			clock.observe(last);
		}

		Ok(Self {
			db,
			max_content_chars,
			writer: Mutex::new(clock),
		})
	}
}

#[async_trait]
impl MessageStore for SqlMessageStore {
	async fn append(&self, msg: NewMessage) -> Result<Message, ChatError> {
		let content = normalize_content(&msg.content, msg.attachment.as_ref(), self.max_content_chars)?;
		let attachment = msg.attachment.as_ref();
		let size = attachment.map(|a| a.size.min(i64::MAX as u64) as i64);

		let mut clock = self.writer.lock().await;
		let created_at = clock.next();

		let id: i64 = match &self.db {
			Database::Sqlite(pool) => sqlx::query_scalar(
				"INSERT INTO messages (conversation_id, sender_id, content, attachment_kind, attachment_url, \
				attachment_name, attachment_size, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
			)
			.bind(msg.conversation_id.as_str())
			.bind(msg.sender_id.as_str())
			.bind(content.as_str())
			.bind(attachment.map(|a| a.kind.as_str()))
			.bind(attachment.map(|a| a.url.as_str()))
			.bind(attachment.map(|a| a.name.as_str()))
			.bind(size)
			.bind(created_at)
			.fetch_one(pool)
			.await
			.map_err(unavailable("insert message (sqlite)"))?,
			Database::Postgres(pool) => sqlx::query_scalar(
				"INSERT INTO messages (conversation_id, sender_id, content, attachment_kind, attachment_url, \
				attachment_name, attachment_size, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
			)
			.bind(msg.conversation_id.as_str())
			.bind(msg.sender_id.as_str())
			.bind(content.as_str())
			.bind(attachment.map(|a| a.kind.as_str()))
			.bind(attachment.map(|a| a.url.as_str()))
			.bind(attachment.map(|a| a.name.as_str()))
			.bind(size)
			.bind(created_at)
			.fetch_one(pool)
			.await
			.map_err(unavailable("insert message (postgres)"))?,
		};
		drop(clock);

		Ok(Message {
			id: MessageId(id as u64),
			sender_id: msg.sender_id,
			conversation_id: msg.conversation_id,
			content,
			attachment: msg.attachment,
			created_at,
			edited_at: None,
			deleted: false,
		})
	}

	async fn list_by_conversation(
		&self,
		conversation_id: &ConversationId,
		exclude_deleted: bool,
	) -> Result<Vec<Message>, ChatError> {
		let rows: Vec<MessageRow> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(
				"SELECT * FROM messages WHERE conversation_id = ? AND (? = FALSE OR deleted = FALSE) \
				ORDER BY created_at ASC, id ASC",
			)
			.bind(conversation_id.as_str())
			.bind(exclude_deleted)
			.fetch_all(pool)
			.await
			.map_err(unavailable("list messages (sqlite)"))?,
			Database::Postgres(pool) => sqlx::query_as(
				"SELECT * FROM messages WHERE conversation_id = $1 AND ($2 = FALSE OR deleted = FALSE) \
				ORDER BY created_at ASC, id ASC",
			)
			.bind(conversation_id.as_str())
			.bind(exclude_deleted)
			.fetch_all(pool)
			.await
			.map_err(unavailable("list messages (postgres)"))?,
		};

		into_messages(rows)
	}

	async fn get_by_id(&self, id: MessageId) -> Result<Message, ChatError> {
		let key = db_id(id)?;
		let row: Option<MessageRow> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as("SELECT * FROM messages WHERE id = ?")
				.bind(key)
				.fetch_optional(pool)
				.await
				.map_err(unavailable("get message (sqlite)"))?,
			Database::Postgres(pool) => sqlx::query_as("SELECT * FROM messages WHERE id = $1")
				.bind(key)
				.fetch_optional(pool)
				.await
				.map_err(unavailable("get message (postgres)"))?,
		};

		row.ok_or_else(|| not_found(id))?.try_into()
	}

	async fn soft_delete(&self, id: MessageId, requester: &UserId) -> Result<Deletion, ChatError> {
		let key = db_id(id)?;
		let _writer = self.writer.lock().await;

		let mut message = match &self.db {
			Database::Sqlite(pool) => {
				let mut tx = pool.begin().await.map_err(unavailable("begin delete (sqlite)"))?;
				let row: Option<MessageRow> = sqlx::query_as("SELECT * FROM messages WHERE id = ?")
					.bind(key)
					.fetch_optional(&mut *tx)
					.await
					.map_err(unavailable("select message (sqlite)"))?;
				let message: Message = row.ok_or_else(|| not_found(id))?.try_into()?;
				ensure_owner(&message, requester)?;

				if !message.deleted {
					sqlx::query("UPDATE messages SET deleted = TRUE WHERE id = ?")
						.bind(key)
						.execute(&mut *tx)
						.await
						.map_err(unavailable("soft delete (sqlite)"))?;
				}
				tx.commit().await.map_err(unavailable("commit delete (sqlite)"))?;
				message
			}
			Database::Postgres(pool) => {
				let mut tx = pool.begin().await.map_err(unavailable("begin delete (postgres)"))?;
				let row: Option<MessageRow> = sqlx::query_as("SELECT * FROM messages WHERE id = $1 FOR UPDATE")
					.bind(key)
					.fetch_optional(&mut *tx)
					.await
					.map_err(unavailable("select message (postgres)"))?;
				let message: Message = row.ok_or_else(|| not_found(id))?.try_into()?;
				ensure_owner(&message, requester)?;

				if !message.deleted {
					sqlx::query("UPDATE messages SET deleted = TRUE WHERE id = $1")
						.bind(key)
						.execute(&mut *tx)
						.await
						.map_err(unavailable("soft delete (postgres)"))?;
				}
				tx.commit().await.map_err(unavailable("commit delete (postgres)"))?;
				message
			}
		};

		let newly_deleted = !message.deleted;
		message.deleted = true;
		Ok(Deletion {
			message,
			newly_deleted,
		})
	}

	async fn edit_content(&self, id: MessageId, requester: &UserId, content: &str) -> Result<Message, ChatError> {
		let key = db_id(id)?;
		let mut clock = self.writer.lock().await;

		match &self.db {
			Database::Sqlite(pool) => {
				let mut tx = pool.begin().await.map_err(unavailable("begin edit (sqlite)"))?;
				let row: Option<MessageRow> = sqlx::query_as("SELECT * FROM messages WHERE id = ?")
					.bind(key)
					.fetch_optional(&mut *tx)
					.await
					.map_err(unavailable("select message (sqlite)"))?;
				let mut message: Message = row.ok_or_else(|| not_found(id))?.try_into()?;
				ensure_editable(&message, requester)?;

				message.content = normalize_content(content, message.attachment.as_ref(), self.max_content_chars)?;
				let edited_at = clock.next();
				sqlx::query("UPDATE messages SET content = ?, edited_at = ? WHERE id = ?")
					.bind(message.content.as_str())
					.bind(edited_at)
					.bind(key)
					.execute(&mut *tx)
					.await
					.map_err(unavailable("edit message (sqlite)"))?;
				tx.commit().await.map_err(unavailable("commit edit (sqlite)"))?;

				message.edited_at = Some(edited_at);
				Ok(message)
			}
			Database::Postgres(pool) => {
				let mut tx = pool.begin().await.map_err(unavailable("begin edit (postgres)"))?;
				let row: Option<MessageRow> = sqlx::query_as("SELECT * FROM messages WHERE id = $1 FOR UPDATE")
					.bind(key)
					.fetch_optional(&mut *tx)
					.await
					.map_err(unavailable("select message (postgres)"))?;
				let mut message: Message = row.ok_or_else(|| not_found(id))?.try_into()?;
				ensure_editable(&message, requester)?;

				message.content = normalize_content(content, message.attachment.as_ref(), self.max_content_chars)?;
				let edited_at = clock.next();
				sqlx::query("UPDATE messages SET content = $1, edited_at = $2 WHERE id = $3")
					.bind(message.content.as_str())
					.bind(edited_at)
					.bind(key)
					.execute(&mut *tx)
					.await
					.map_err(unavailable("edit message (postgres)"))?;
				tx.commit().await.map_err(unavailable("commit edit (postgres)"))?;

				message.edited_at = Some(edited_at);
				Ok(message)
			}
		}
	}
}

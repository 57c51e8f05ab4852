#![forbid(unsafe_code)]

use anyhow::Context;
use murmur_domain::{ConversationId, MessageId, UserId};
use murmur_util::time::unix_ms_now;

use crate::server::db::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
	Edit,
	Delete,
}

impl AuditAction {
	pub const fn as_str(self) -> &'static str {
		match self {
			AuditAction::Edit => "edit",
			AuditAction::Delete => "delete",
		}
	}
}

/// Trail of message mutations, written to `message_audit` when persistence is on.
#[derive(Debug, Clone)]
pub struct AuditService {
	backend: Option<Database>,
}

impl AuditService {
	pub fn new(db: Database) -> Self {
		Self { backend: Some(db) }
	}

	pub fn disabled() -> Self {
		Self { backend: None }
	}

	pub async fn record_mutation(
		&self,
		action: AuditAction,
		message_id: MessageId,
		conversation_id: &ConversationId,
		actor_id: &UserId,
	) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		let message_id = i64::try_from(message_id.get()).context("message id out of range")?;
		match backend {
			Database::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO message_audit (message_id, conversation_id, actor_id, action, created_at) \
					VALUES (?, ?, ?, ?, ?)",
				)
				.bind(message_id)
				.bind(conversation_id.as_str())
				.bind(actor_id.as_str())
				.bind(action.as_str())
				.bind(unix_ms_now())
				.execute(pool)
				.await
				.context("insert message_audit (sqlite)")?;
			}
			Database::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO message_audit (message_id, conversation_id, actor_id, action, created_at) \
					VALUES ($1, $2, $3, $4, $5)",
				)
				.bind(message_id)
				.bind(conversation_id.as_str())
				.bind(actor_id.as_str())
				.bind(action.as_str())
				.bind(unix_ms_now())
				.execute(pool)
				.await
				.context("insert message_audit (postgres)")?;
			}
		}

		Ok(())
	}

	/// Actions recorded for one message, oldest first.
	pub async fn history(&self, message_id: MessageId) -> anyhow::Result<Vec<(String, String)>> {
		let Some(backend) = &self.backend else {
			return Ok(Vec::new());
		};

		let message_id = i64::try_from(message_id.get()).context("message id out of range")?;
		let rows = match backend {
			Database::Sqlite(pool) => sqlx::query_as(
				"SELECT actor_id, action FROM message_audit WHERE message_id = ? ORDER BY id ASC",
			)
			.bind(message_id)
			.fetch_all(pool)
			.await
			.context("select message_audit (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(
				"SELECT actor_id, action FROM message_audit WHERE message_id = $1 ORDER BY id ASC",
			)
			.bind(message_id)
			.fetch_all(pool)
			.await
			.context("select message_audit (postgres)")?,
		};
		Ok(rows)
	}
}

#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use murmur_domain::{ChatError, Identity, UserId, UserProfile};
use parking_lot::RwLock;

use crate::server::db::{Database, unavailable};

/// Resolves users to the profile shown next to their messages.
#[async_trait]
pub trait UserDirectory: Send + Sync {
	/// `NotFound` for unknown users, `Unavailable` when the backing service is down.
	async fn profile(&self, user_id: &UserId) -> Result<UserProfile, ChatError>;

	/// Insert or replace a profile.
	async fn upsert(&self, profile: UserProfile) -> Result<(), ChatError>;

	/// Make sure an authenticated identity is known, keeping any stored profile.
	async fn ensure(&self, identity: &Identity) -> Result<UserProfile, ChatError> {
		match self.profile(&identity.user_id).await {
			Ok(profile) => Ok(profile),
			Err(ChatError::NotFound(_)) => {
				let profile = UserProfile {
					user_id: identity.user_id.clone(),
					display_name: identity.display_name.clone(),
					avatar_url: None,
				};
				self.upsert(profile.clone()).await?;
				Ok(profile)
			}
			Err(e) => Err(e),
		}
	}
}

fn unknown(user_id: &UserId) -> ChatError {
	ChatError::NotFound(format!("user {user_id}"))
}

#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
	profiles: RwLock<HashMap<UserId, UserProfile>>,
}

impl InMemoryUserDirectory {
	pub fn new(seed: impl IntoIterator<Item = UserProfile>) -> Self {
		Self {
			profiles: RwLock::new(seed.into_iter().map(|p| (p.user_id.clone(), p)).collect()),
		}
	}
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
	async fn profile(&self, user_id: &UserId) -> Result<UserProfile, ChatError> {
		self.profiles.read().get(user_id).cloned().ok_or_else(|| unknown(user_id))
	}

	async fn upsert(&self, profile: UserProfile) -> Result<(), ChatError> {
		self.profiles.write().insert(profile.user_id.clone(), profile);
		Ok(())
	}
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
	id: String,
	display_name: String,
	avatar_url: Option<String>,
}

/// Directory backed by the `users` table.
#[derive(Debug, Clone)]
pub struct SqlUserDirectory {
	db: Database,
}

impl SqlUserDirectory {
	pub fn new(db: Database) -> Self {
		Self { db }
	}

	/// Upsert configured profiles, e.g. from `[[directory.users]]`.
	pub async fn seed(&self, profiles: &[UserProfile]) -> Result<(), ChatError> {
		for profile in profiles {
			self.upsert(profile.clone()).await?;
		}
		Ok(())
	}
}

#[async_trait]
impl UserDirectory for SqlUserDirectory {
	async fn profile(&self, user_id: &UserId) -> Result<UserProfile, ChatError> {
		let row: Option<UserRow> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as("SELECT id, display_name, avatar_url FROM users WHERE id = ?")
				.bind(user_id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(unavailable("select user (sqlite)"))?,
			Database::Postgres(pool) => sqlx::query_as("SELECT id, display_name, avatar_url FROM users WHERE id = $1")
				.bind(user_id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(unavailable("select user (postgres)"))?,
		};

		let row = row.ok_or_else(|| unknown(user_id))?;
		Ok(UserProfile {
			user_id: UserId::new(row.id).map_err(|_| ChatError::Unavailable("corrupt user row".into()))?,
			display_name: row.display_name,
			avatar_url: row.avatar_url,
		})
	}

	async fn upsert(&self, profile: UserProfile) -> Result<(), ChatError> {
		match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO users (id, display_name, avatar_url) VALUES (?, ?, ?) \
					ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name, avatar_url = excluded.avatar_url",
				)
				.bind(profile.user_id.as_str())
				.bind(profile.display_name.as_str())
				.bind(profile.avatar_url.as_deref())
				.execute(pool)
				.await
				.map_err(unavailable("upsert user (sqlite)"))?;
			}
			Database::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO users (id, display_name, avatar_url) VALUES ($1, $2, $3) \
					ON CONFLICT (id) DO UPDATE SET display_name = EXCLUDED.display_name, avatar_url = EXCLUDED.avatar_url",
				)
				.bind(profile.user_id.as_str())
				.bind(profile.display_name.as_str())
				.bind(profile.avatar_url.as_deref())
				.execute(pool)
				.await
				.map_err(unavailable("upsert user (postgres)"))?;
			}
		}
		Ok(())
	}
}

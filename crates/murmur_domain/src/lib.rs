#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default upper bound for message content, in characters.
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 4000;

/// Maximum length of user and conversation identifiers.
pub const MAX_ID_LEN: usize = 128;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("identifier too long: len={len} max={max}")]
	TooLong { len: usize, max: usize },
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(try_from = "String", into = "String")]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty, trimmed identifier.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				let trimmed = id.trim();
				if trimmed.is_empty() {
					return Err(ParseIdError::Empty);
				}
				if trimmed.len() > MAX_ID_LEN {
					return Err(ParseIdError::TooLong {
						len: trimmed.len(),
						max: MAX_ID_LEN,
					});
				}
				if trimmed.chars().any(char::is_control) {
					return Err(ParseIdError::InvalidFormat("control characters are not allowed".into()));
				}
				if trimmed.len() == id.len() {
					Ok(Self(id))
				} else {
					Ok(Self(trimmed.to_string()))
				}
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s.to_string())
			}
		}

		impl TryFrom<String> for $name {
			type Error = ParseIdError;

			fn try_from(s: String) -> Result<Self, Self::Error> {
				Self::new(s)
			}
		}

		impl From<$name> for String {
			fn from(id: $name) -> Self {
				id.0
			}
		}
	};
}

string_id! {
	/// Stable user identity, as issued by the identity provider.
	UserId
}

string_id! {
	/// Room/channel a message belongs to.
	ConversationId
}

/// Server-assigned message identifier; strictly increasing within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		s.parse::<u64>()
			.map(MessageId)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected unsigned integer, got {s:?}")))
	}
}

/// Identifier of one live transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Opaque reference to media held by blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
	pub kind: String,
	pub url: String,
	pub name: String,
	pub size: u64,
}

impl Attachment {
	/// An attachment is only meaningful when it points somewhere.
	pub fn validate(&self) -> Result<(), ChatError> {
		if self.url.trim().is_empty() {
			return Err(ChatError::InvalidArgument("attachment url is empty".into()));
		}
		Ok(())
	}
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub sender_id: UserId,
	pub conversation_id: ConversationId,
	pub content: String,
	pub attachment: Option<Attachment>,
	/// Unix time in milliseconds.
	pub created_at: i64,
	pub edited_at: Option<i64>,
	pub deleted: bool,
}

/// A message as submitted to the store, before id and timestamp assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
	pub sender_id: UserId,
	pub conversation_id: ConversationId,
	pub content: String,
	pub attachment: Option<Attachment>,
}

/// Lightweight profile used to enrich outgoing events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
	pub user_id: UserId,
	pub display_name: String,
	pub avatar_url: Option<String>,
}

/// Identity carried by a verified credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	pub user_id: UserId,
	pub display_name: String,
}

/// Error taxonomy shared by every component.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
	#[error("unauthenticated: {0}")]
	Unauthenticated(String),
	#[error("invalid argument: {0}")]
	InvalidArgument(String),
	#[error("not found: {0}")]
	NotFound(String),
	#[error("forbidden: {0}")]
	Forbidden(String),
	#[error("unavailable: {0}")]
	Unavailable(String),
	#[error("rate limited")]
	RateLimited,
}

impl ChatError {
	/// Stable wire code.
	pub const fn code(&self) -> &'static str {
		match self {
			ChatError::Unauthenticated(_) => "UNAUTHENTICATED",
			ChatError::InvalidArgument(_) => "INVALID_ARGUMENT",
			ChatError::NotFound(_) => "NOT_FOUND",
			ChatError::Forbidden(_) => "FORBIDDEN",
			ChatError::Unavailable(_) => "UNAVAILABLE",
			ChatError::RateLimited => "RATE_LIMITED",
		}
	}

	/// Only collaborator outages are worth retrying, and only for reads.
	pub const fn is_transient(&self) -> bool {
		matches!(self, ChatError::Unavailable(_))
	}
}

/// Trim and validate message content against the attachment rule and length limit.
pub fn normalize_content(content: &str, attachment: Option<&Attachment>, max_chars: usize) -> Result<String, ChatError> {
	if let Some(attachment) = attachment {
		attachment.validate()?;
	}

	let trimmed = content.trim();
	if trimmed.is_empty() && attachment.is_none() {
		return Err(ChatError::InvalidArgument("content is empty and no attachment is present".into()));
	}

	let chars = trimmed.chars().count();
	if chars > max_chars {
		return Err(ChatError::InvalidArgument(format!(
			"content too long: {chars} characters (max {max_chars})"
		)));
	}

	Ok(trimmed.to_string())
}

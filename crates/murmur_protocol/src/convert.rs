#![forbid(unsafe_code)]

//! Conversions between domain types and wire messages.

use murmur_domain::{Attachment, ChatError, Message, MessageId, UserProfile};

use crate::pb;
use crate::version::PROTOCOL_VERSION;

impl From<&Attachment> for pb::Attachment {
	fn from(a: &Attachment) -> Self {
		Self {
			kind: a.kind.clone(),
			url: a.url.clone(),
			name: a.name.clone(),
			size: a.size,
		}
	}
}

impl From<pb::Attachment> for Attachment {
	fn from(a: pb::Attachment) -> Self {
		Self {
			kind: a.kind,
			url: a.url,
			name: a.name,
			size: a.size,
		}
	}
}

impl From<&UserProfile> for pb::Sender {
	fn from(p: &UserProfile) -> Self {
		Self {
			user_id: p.user_id.to_string(),
			display_name: p.display_name.clone(),
			avatar_url: p.avatar_url.clone(),
		}
	}
}

impl From<&ChatError> for pb::Error {
	fn from(e: &ChatError) -> Self {
		let message = match e {
			ChatError::Unauthenticated(m)
			| ChatError::InvalidArgument(m)
			| ChatError::NotFound(m)
			| ChatError::Forbidden(m)
			| ChatError::Unavailable(m) => m.clone(),
			ChatError::RateLimited => "slow down".to_string(),
		};
		Self {
			code: e.code().to_string(),
			message,
		}
	}
}

/// Build the wire view of a stored message with its sender profile.
pub fn message_event(message: &Message, sender: &UserProfile) -> pb::MessageEvent {
	pb::MessageEvent {
		message_id: message.id.get(),
		conversation_id: message.conversation_id.to_string(),
		sender: Some(sender.into()),
		content: message.content.clone(),
		attachment: message.attachment.as_ref().map(Into::into),
		created_at_unix_ms: message.created_at,
		edited_at_unix_ms: message.edited_at,
	}
}

/// Wrap a message payload in a versioned envelope.
pub fn envelope(request_id: impl Into<String>, msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_VERSION,
		request_id: request_id.into(),
		msg: Some(msg),
	}
}

/// Error envelope answering `request_id`.
pub fn error_envelope(request_id: impl Into<String>, err: &ChatError) -> pb::Envelope {
	envelope(request_id, pb::envelope::Msg::Error(err.into()))
}

/// Events-stream envelope for one room event.
pub fn event_envelope(
	conversation_id: impl Into<String>,
	server_time_unix_ms: i64,
	event: pb::event_envelope::Event,
) -> pb::Envelope {
	envelope(
		String::new(),
		pb::envelope::Msg::Event(pb::EventEnvelope {
			conversation_id: conversation_id.into(),
			server_time_unix_ms,
			event: Some(event),
		}),
	)
}

pub fn deleted_event(message_id: MessageId) -> pb::MessageDeleted {
	pb::MessageDeleted {
		message_id: message_id.get(),
	}
}

#![forbid(unsafe_code)]

pub mod convert;
pub mod framing;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN, FrameDecoder, FramingError, encode_frame, encode_frame_into};

/// Generated wire types (`murmur.v1`), see `proto/murmur.proto`.
#[allow(clippy::large_enum_variant)]
pub mod pb {
	include!(concat!(env!("OUT_DIR"), "/murmur.v1.rs"));
}

/// Protocol version constants.
pub mod version {
	/// Current wire protocol version, carried in every [`crate::pb::Envelope`].
	pub const PROTOCOL_VERSION: u32 = 1;

	/// ALPN identifier negotiated by client and server.
	pub const ALPN: &[u8] = b"murmur-v1";
}

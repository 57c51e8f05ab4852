#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use thiserror::Error;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

/// Length prefix size (u32, big-endian).
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge { len: usize, max: usize },

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let mut out = BytesMut::new();
	encode_frame_into(&mut out, msg, max_frame_size)?;
	Ok(out.to_vec())
}

/// Append an encoded frame to `buf`.
pub fn encode_frame_into<M: Message>(buf: &mut BytesMut, msg: &M, max_frame_size: usize) -> Result<(), FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	buf.reserve(FRAME_HEADER_LEN + payload_len);
	buf.put_u32(payload_len as u32);
	msg.encode(buf)?;
	Ok(())
}

/// Incremental decoder for a byte stream carrying length-prefixed frames.
///
/// Bytes are fed with [`FrameDecoder::extend`] as they arrive from the transport and
/// complete frames are pulled with [`FrameDecoder::try_next`]. Leftover bytes of a
/// partially received frame stay buffered between calls.
#[derive(Debug)]
pub struct FrameDecoder {
	buf: BytesMut,
	max_frame_size: usize,
}

impl FrameDecoder {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(16 * 1024),
			max_frame_size,
		}
	}

	pub fn extend(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Number of buffered bytes not yet consumed by a decoded frame.
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	/// Decode the next complete frame, or `Ok(None)` when more bytes are needed.
	///
	/// An oversized length prefix is reported before the payload arrives so the
	/// caller can drop the stream instead of buffering it.
	pub fn try_next<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
		if self.buf.len() < FRAME_HEADER_LEN {
			return Ok(None);
		}

		let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
		if len > self.max_frame_size {
			return Err(FramingError::FrameTooLarge {
				len,
				max: self.max_frame_size,
			});
		}

		if self.buf.len() < FRAME_HEADER_LEN + len {
			return Ok(None);
		}

		self.buf.advance(FRAME_HEADER_LEN);
		let payload = self.buf.split_to(len);
		let msg = M::decode(payload.freeze())?;
		Ok(Some(msg))
	}
}

impl Default for FrameDecoder {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_FRAME_SIZE)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Clone, PartialEq, ::prost::Message)]
	struct TestMsg {
		#[prost(string, tag = "1")]
		s: String,
		#[prost(uint32, tag = "2")]
		n: u32,
	}

	#[test]
	fn header_carries_payload_len() {
		let msg = TestMsg {
			s: "hello".to_string(),
			n: 42,
		};

		let frame = encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode");
		let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
		assert_eq!(len, msg.encoded_len());
		assert_eq!(frame.len(), FRAME_HEADER_LEN + len);
	}

	#[test]
	fn decoder_waits_for_full_frame() {
		let msg = TestMsg { s: "x".repeat(10), n: 7 };
		let frame = encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode");

		let mut dec = FrameDecoder::default();
		dec.extend(&frame[..3]);
		assert!(dec.try_next::<TestMsg>().expect("ok").is_none());
		dec.extend(&frame[3..6]);
		assert!(dec.try_next::<TestMsg>().expect("ok").is_none());
		dec.extend(&frame[6..]);
		assert_eq!(dec.try_next::<TestMsg>().expect("ok"), Some(msg));
		assert_eq!(dec.buffered(), 0);
	}

	#[test]
	fn encode_rejects_too_large() {
		let msg = TestMsg {
			s: "a".repeat(10_000),
			n: 1,
		};

		match encode_frame(&msg, 32).unwrap_err() {
			FramingError::FrameTooLarge { len, max } => assert!(len > max),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn decoder_rejects_oversized_prefix_early() {
		let mut dec = FrameDecoder::new(16);
		dec.extend(&17u32.to_be_bytes());

		match dec.try_next::<TestMsg>().unwrap_err() {
			FramingError::FrameTooLarge { len: 17, max: 16 } => {}
			other => panic!("unexpected error: {other:?}"),
		}
	}
}

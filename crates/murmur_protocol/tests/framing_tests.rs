use bytes::BytesMut;
use murmur_protocol::pb::{self, envelope::Msg, event_envelope::Event};
use murmur_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, encode_frame, encode_frame_into};
use proptest::prelude::*;

fn send(conversation: &str, content: &str) -> pb::Envelope {
	murmur_protocol::convert::envelope(
		"req-1",
		Msg::SendMessage(pb::SendMessage {
			conversation_id: conversation.to_string(),
			content: content.to_string(),
			attachment: None,
		}),
	)
}

#[test]
fn several_frames_in_one_read_decode_in_order() {
	let mut buf = BytesMut::new();
	encode_frame_into(&mut buf, &send("c1", "one"), DEFAULT_MAX_FRAME_SIZE).expect("encode one");
	encode_frame_into(&mut buf, &send("c1", "two"), DEFAULT_MAX_FRAME_SIZE).expect("encode two");

	let mut dec = FrameDecoder::default();
	dec.extend(&buf);

	let first: pb::Envelope = dec.try_next().expect("decode").expect("first frame");
	let second: pb::Envelope = dec.try_next().expect("decode").expect("second frame");
	assert!(dec.try_next::<pb::Envelope>().expect("decode").is_none());

	let content = |env: pb::Envelope| match env.msg {
		Some(Msg::SendMessage(m)) => m.content,
		other => panic!("unexpected msg: {other:?}"),
	};
	assert_eq!(content(first), "one");
	assert_eq!(content(second), "two");
}

#[test]
fn event_envelope_survives_the_wire() {
	let event = murmur_protocol::convert::event_envelope(
		"c9",
		1_700_000_000_000,
		Event::MessageDeleted(pb::MessageDeleted { message_id: 42 }),
	);
	let frame = encode_frame(&event, DEFAULT_MAX_FRAME_SIZE).expect("encode");

	let mut dec = FrameDecoder::default();
	dec.extend(&frame);
	let decoded: pb::Envelope = dec.try_next().expect("decode").expect("frame");

	match decoded.msg {
		Some(Msg::Event(ev)) => {
			assert_eq!(ev.conversation_id, "c9");
			assert_eq!(ev.event, Some(Event::MessageDeleted(pb::MessageDeleted { message_id: 42 })));
		}
		other => panic!("unexpected msg: {other:?}"),
	}
}

#[test]
fn garbage_payload_is_a_decode_error() {
	let mut dec = FrameDecoder::default();
	dec.extend(&3u32.to_be_bytes());
	dec.extend(&[0xff, 0xff, 0xff]);

	match dec.try_next::<pb::Envelope>().unwrap_err() {
		FramingError::Decode(_) => {}
		other => panic!("unexpected error: {other:?}"),
	}
}

proptest! {
	#[test]
	fn arbitrary_chunking_yields_same_frames(content in "\\PC{0,64}", cut in 0usize..200) {
		let a = send("room", &content);
		let b = send("room", "tail");
		let mut wire = encode_frame(&a, DEFAULT_MAX_FRAME_SIZE).unwrap();
		wire.extend(encode_frame(&b, DEFAULT_MAX_FRAME_SIZE).unwrap());
		let cut = cut.min(wire.len());

		let mut dec = FrameDecoder::default();
		let mut out = Vec::new();
		for chunk in [&wire[..cut], &wire[cut..]] {
			dec.extend(chunk);
			while let Some(env) = dec.try_next::<pb::Envelope>().unwrap() {
				out.push(env);
			}
		}

		prop_assert_eq!(out, vec![a, b]);
		prop_assert_eq!(dec.buffered(), 0);
	}
}

#[test]
fn event_with_optional_fields_survives_the_wire() {
	let event = pb::MessageEvent {
		message_id: 7,
		conversation_id: "c1".to_string(),
		sender: Some(pb::Sender {
			user_id: "alice".to_string(),
			display_name: "Alice".to_string(),
			avatar_url: Some("https://cdn.example/a.png".to_string()),
		}),
		content: "edited".to_string(),
		attachment: None,
		created_at_unix_ms: 1_000,
		edited_at_unix_ms: Some(2_000),
	};
	let env = murmur_protocol::convert::envelope(
		"",
		Msg::Event(pb::EventEnvelope {
			conversation_id: "c1".to_string(),
			server_time_unix_ms: 2_001,
			event: Some(Event::MessageUpdated(event.clone())),
		}),
	);

	let mut dec = FrameDecoder::default();
	dec.extend(&encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode"));
	let decoded: pb::Envelope = dec.try_next().expect("decode").expect("frame");

	match decoded.msg {
		Some(Msg::Event(pb::EventEnvelope {
			event: Some(Event::MessageUpdated(got)),
			..
		})) => assert_eq!(got, event),
		other => panic!("unexpected message: {other:?}"),
	}
}

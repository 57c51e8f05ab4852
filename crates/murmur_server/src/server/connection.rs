#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context as _, anyhow};
use murmur_domain::{ChatError, ConnectionId};
use murmur_protocol::convert;
use murmur_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, encode_frame};
use murmur_protocol::pb;
use murmur_protocol::pb::envelope::Msg;
use murmur_util::time::unix_ms_now;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::gateway::{Session, SessionGateway};
use crate::server::pipeline::MessagePipeline;
use crate::server::room_router::{RoomEvent, Subscription};

/// QUIC application close codes.
pub mod close_code {
	pub const NORMAL: u32 = 0;
	pub const AUTH_FAILED: u32 = 1;
	pub const EVICTED: u32 = 2;
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	/// How long an evicted connection gets to flush queued events before it is closed.
	pub eviction_drain: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			eviction_drain: Duration::from_secs(1),
		}
	}
}

enum Exit {
	ClientGone,
	Evicted,
}

pub async fn handle_connection(
	conn_id: ConnectionId,
	connection: quinn::Connection,
	gateway: SessionGateway,
	pipeline: MessagePipeline,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("murmur_server_active_connections").decrement(1.0);
		}
	}

	metrics::counter!("murmur_server_connections_total").increment(1);
	metrics::gauge!("murmur_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	// The grace window covers opening the control stream as well as authenticating on it.
	let auth_deadline = tokio::time::Instant::now() + gateway.auth_grace();

	let (mut control_send, mut control_recv) = match tokio::time::timeout_at(auth_deadline, connection.accept_bi()).await
	{
		Ok(accepted) => accepted.context("accept control bidirectional stream")?,
		Err(_) => {
			metrics::counter!("murmur_server_auth_timeouts_total").increment(1);
			info!(conn_id = %conn_id, "closing connection that never opened a control stream");
			connection.close(close_code::AUTH_FAILED.into(), b"authentication timed out");
			return Ok(());
		}
	};

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let max_frame_bytes = settings.max_frame_bytes;
	let reader_task = tokio::spawn(async move {
		let mut decoder = FrameDecoder::new(max_frame_bytes);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("murmur_server_control_bytes_in_total").increment(n as u64);
			decoder.extend(&tmp[..n]);

			loop {
				match decoder.try_next::<pb::Envelope>() {
					Ok(Some(env)) => {
						metrics::counter!("murmur_server_envelopes_in_total").increment(1);
						if ctrl_tx.send(env).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("murmur_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let (session, subscription) = gateway.open(conn_id).await;
	let Subscription { events, mut evicted } = subscription;

	let mut auth_request_id = String::new();
	let authenticated = tokio::time::timeout_at(
		auth_deadline,
		authenticate(&gateway, &session, &mut ctrl_rx, &mut control_send, &mut auth_request_id),
	)
	.await;

	let refusal = match authenticated {
		Ok(Ok(true)) => None,
		Ok(Ok(false)) => Some(ChatError::Unauthenticated("control stream closed before authentication".into())),
		Ok(Err(e)) => Some(e),
		Err(_) => {
			metrics::counter!("murmur_server_auth_timeouts_total").increment(1);
			Some(ChatError::Unauthenticated("authentication timed out".into()))
		}
	};

	if let Some(e) = refusal {
		info!(conn_id = %conn_id, error = %e, "closing unauthenticated connection");
		let result = pb::AuthResult {
			ok: false,
			code: e.code().to_string(),
			detail: e.to_string(),
			connection_id: conn_id.0,
			..Default::default()
		};
		send_envelope(&mut control_send, convert::envelope(auth_request_id, Msg::AuthResult(result)))
			.await
			.ok();
		let _ = control_send.finish();
		// Closing discards unacknowledged stream data.
		let _ = tokio::time::timeout(settings.eviction_drain, control_send.stopped()).await;
		gateway.close(&session).await;
		reader_task.abort();
		connection.close(close_code::AUTH_FAILED.into(), b"unauthenticated");
		return Ok(());
	}

	let events_connection = connection.clone();
	let events_task = tokio::spawn(async move { run_events_writer(conn_id, events_connection, events).await });

	let exit = loop {
		tokio::select! {
			maybe_env = ctrl_rx.recv() => {
				let Some(env) = maybe_env else {
					break Exit::ClientGone;
				};
				let request_id = env.request_id;
				let Some(msg) = env.msg else {
					warn!(conn_id = %conn_id, "envelope without payload");
					continue;
				};

				let reply = dispatch(&gateway, &pipeline, &session, msg).await;
				if let Err(e) = send_envelope(&mut control_send, convert::envelope(request_id, reply)).await {
					debug!(conn_id = %conn_id, error = ?e, "control stream write failed");
					break Exit::ClientGone;
				}
			}

			Ok(()) = &mut evicted => {
				metrics::counter!("murmur_server_connections_evicted_total").increment(1);
				warn!(conn_id = %conn_id, "connection evicted: event queue overflowed");
				break Exit::Evicted;
			}

			reason = connection.closed() => {
				debug!(conn_id = %conn_id, reason = %reason, "connection closed by peer");
				break Exit::ClientGone;
			}
		}
	};

	gateway.close(&session).await;
	pipeline.limiter().forget(conn_id);

	match exit {
		Exit::ClientGone => {
			events_task.abort();
			connection.close(close_code::NORMAL.into(), b"bye");
		}
		Exit::Evicted => {
			// the router dropped our queue; let the writer flush what was already accepted
			let _ = tokio::time::timeout(settings.eviction_drain, events_task).await;
			connection.close(close_code::EVICTED.into(), b"evicted");
		}
	}

	match reader_task.await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => debug!(conn_id = %conn_id, error = ?e, "control reader ended with error"),
		Err(e) if e.is_cancelled() => {}
		Err(e) => warn!(conn_id = %conn_id, error = %e, "control reader panicked"),
	}

	info!(conn_id = %conn_id, "connection finished");
	Ok(())
}

/// Wait for a valid `Authenticate`. Returns false when the control stream ends first.
///
/// `auth_request_id` keeps the id of the last `Authenticate` so a refusal can answer it.
async fn authenticate(
	gateway: &SessionGateway,
	session: &Session,
	ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>,
	control_send: &mut quinn::SendStream,
	auth_request_id: &mut String,
) -> Result<bool, ChatError> {
	while let Some(env) = ctrl_rx.recv().await {
		let request_id = env.request_id;
		let reply = match env.msg {
			Some(Msg::Authenticate(auth)) => {
				auth_request_id.clone_from(&request_id);
				let identity = gateway.authenticate(session, &auth.credential).await?;
				info!(
					conn_id = %session.connection_id(),
					user_id = %identity.user_id,
					client_name = %auth.client_name,
					"client authenticated"
				);
				let result = pb::AuthResult {
					ok: true,
					user_id: identity.user_id.to_string(),
					display_name: identity.display_name,
					connection_id: session.connection_id().0,
					..Default::default()
				};
				send_envelope(control_send, convert::envelope(request_id, Msg::AuthResult(result)))
					.await
					.map_err(|e| ChatError::Unavailable(format!("{e:#}")))?;
				return Ok(true);
			}
			Some(Msg::Ping(ping)) => Msg::Pong(pong(ping)),
			_ => Msg::Error((&ChatError::Unauthenticated("authenticate first".into())).into()),
		};

		send_envelope(control_send, convert::envelope(request_id, reply))
			.await
			.map_err(|e| ChatError::Unavailable(format!("{e:#}")))?;
	}
	Ok(false)
}

async fn dispatch(gateway: &SessionGateway, pipeline: &MessagePipeline, session: &Session, msg: Msg) -> Msg {
	let result = match msg {
		Msg::JoinRoom(req) => gateway.join(session, &req.conversation_id).await.map(|conversation_id| {
			Msg::RoomResult(pb::RoomResult {
				conversation_id: conversation_id.into_string(),
				joined: true,
			})
		}),
		Msg::LeaveRoom(req) => gateway.leave(session, &req.conversation_id).await.map(|conversation_id| {
			Msg::RoomResult(pb::RoomResult {
				conversation_id: conversation_id.into_string(),
				joined: false,
			})
		}),
		Msg::SendMessage(req) => pipeline
			.handle_send(session, req)
			.await
			.map(|event| Msg::MessageAck(pb::MessageAck { event: Some(event) })),
		Msg::EditMessage(req) => pipeline
			.handle_edit(session, req)
			.await
			.map(|event| Msg::MessageAck(pb::MessageAck { event: Some(event) })),
		Msg::DeleteMessage(req) => pipeline
			.handle_delete(session, req)
			.await
			.map(|id| Msg::DeleteAck(convert::deleted_event(id))),
		Msg::ListMessages(req) => pipeline
			.list_messages(session, &req.conversation_id)
			.await
			.map(|messages| {
				Msg::MessageList(pb::MessageList {
					conversation_id: req.conversation_id,
					messages,
				})
			}),
		Msg::Ping(ping) => Ok(Msg::Pong(pong(ping))),
		Msg::Authenticate(_) => Err(ChatError::InvalidArgument("session is already authenticated".into())),
		other => {
			warn!(conn_id = %session.connection_id(), "unexpected control message: {:?}", other);
			Err(ChatError::InvalidArgument("not a client request".into()))
		}
	};

	match result {
		Ok(reply) => reply,
		Err(e) => {
			metrics::counter!("murmur_server_request_errors_total", "code" => e.code()).increment(1);
			debug!(conn_id = %session.connection_id(), code = e.code(), error = %e, "request failed");
			Msg::Error((&e).into())
		}
	}
}

fn pong(ping: pb::Ping) -> pb::Pong {
	pb::Pong {
		client_time_unix_ms: ping.client_time_unix_ms,
		server_time_unix_ms: unix_ms_now(),
	}
}

/// Accept the client-opened events stream and copy room events onto it until the queue closes.
async fn run_events_writer(
	conn_id: ConnectionId,
	connection: quinn::Connection,
	mut events: mpsc::Receiver<RoomEvent>,
) -> anyhow::Result<()> {
	debug!(conn_id = %conn_id, "waiting for client-opened events stream");
	let (mut events_send, _events_recv) = connection.accept_bi().await.context("accept events bidirectional stream")?;
	info!(conn_id = %conn_id, "events stream open (server will only write)");

	while let Some(event) = events.recv().await {
		let frame = encode_frame(&*event, DEFAULT_MAX_FRAME_SIZE)?;
		metrics::counter!("murmur_server_events_out_total").increment(1);
		metrics::counter!("murmur_server_events_bytes_out_total").increment(frame.len() as u64);
		events_send.write_all(&frame).await.context("events stream write")?;
	}

	let _ = events_send.finish();
	let _ = events_send.stopped().await;
	Ok(())
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	metrics::counter!("murmur_server_envelopes_out_total").increment(1);
	metrics::counter!("murmur_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}

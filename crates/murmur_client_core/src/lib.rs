#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use murmur_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, encode_frame};
use murmur_protocol::pb;
use murmur_protocol::pb::envelope::Msg;
use murmur_protocol::version::{ALPN, PROTOCOL_VERSION};
use murmur_util::endpoint::{DEFAULT_PORT, QuicEndpoint};
use quinn::{ClientConfig as QuinnClientConfig, Endpoint, TransportConfig, VarInt};
use tracing::{debug, info, warn};

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal), also used as TLS server name.
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Reported to the server in `Authenticate`.
	pub client_name: String,

	/// DER certificate to trust. Without it the server certificate is not verified (dev only).
	pub pinned_cert_der: Option<Vec<u8>>,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect and for each request/response round trip.
	pub request_timeout: Duration,
}

impl ClientConfig {
	/// Create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let e = QuicEndpoint::parse(endpoint).map_err(|e| ClientCoreError::Protocol(format!("invalid endpoint: {e}")))?;
		Ok(Self {
			server_addr: e.socket_addr().ok(),
			server_host: e.server_name().to_string(),
			server_port: e.port,
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: DEFAULT_PORT,
			server_addr: None,
			client_name: format!("murmur-client-core/{}", env!("CARGO_PKG_VERSION")),
			pinned_cert_der: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			request_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected message ordering/types).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server refused the credential.
	#[error("authentication rejected ({code}): {detail}")]
	Rejected { code: String, detail: String },

	/// The server answered a request with an `Error`.
	#[error("server error {code}: {message}")]
	Server { code: String, message: String },

	/// IO error.
	#[error("io error: {0}")]
	Io(String),

	/// Request timed out.
	#[error("timed out after {0:?}")]
	Timeout(Duration),
}

impl ClientCoreError {
	/// Wire error code for `Server` and `Rejected` errors.
	pub fn code(&self) -> Option<&str> {
		match self {
			ClientCoreError::Server { code, .. } | ClientCoreError::Rejected { code, .. } => Some(code),
			_ => None,
		}
	}
}

/// Control half of a session: requests and their responses.
pub struct SessionControl {
	conn: quinn::Connection,
	// Dropping the endpoint would tear down the connection.
	_endpoint: Endpoint,
	control_send: quinn::SendStream,
	control_recv: quinn::RecvStream,
	decoder: FrameDecoder,
	max_frame_bytes: usize,
	request_timeout: Duration,
	client_name: String,
	events_opened: bool,
}

/// Events reader half of a session.
pub struct SessionEvents {
	events_recv: quinn::RecvStream,
	// Keep the send half alive so the peer doesn't see an immediate FIN.
	_events_send_keepalive: quinn::SendStream,
	decoder: FrameDecoder,
}

impl SessionControl {
	/// Connect and open the control stream. Call [`SessionControl::authenticate`] next.
	pub async fn connect(cfg: ClientConfig) -> Result<Self, ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_client_config(cfg.pinned_cert_der.as_deref())
			.map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let timeout = cfg.request_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs: Vec<SocketAddr> = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?
					.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!("connect timeout after {timeout:?} (addr={server_addr}, sni={server_name})"));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (control_send, control_recv) = tokio::time::timeout(timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Timeout(timeout))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi(control) failed: {e}")))?;

		Ok(Self {
			conn,
			_endpoint: endpoint,
			control_send,
			control_recv,
			decoder: FrameDecoder::new(cfg.max_frame_bytes),
			max_frame_bytes: cfg.max_frame_bytes,
			request_timeout: timeout,
			client_name: cfg.client_name,
			events_opened: false,
		})
	}

	/// Present a credential. A refusal is returned as [`ClientCoreError::Rejected`].
	pub async fn authenticate(&mut self, credential: &str) -> Result<pb::AuthResult, ClientCoreError> {
		let auth = pb::Authenticate {
			credential: credential.to_string(),
			client_name: self.client_name.clone(),
		};
		match self.request(Msg::Authenticate(auth)).await? {
			Msg::AuthResult(r) if r.ok => {
				debug!(user_id = %r.user_id, connection_id = r.connection_id, "authenticated");
				Ok(r)
			}
			Msg::AuthResult(r) => Err(ClientCoreError::Rejected {
				code: r.code,
				detail: r.detail,
			}),
			other => Err(unexpected("AuthResult", other)),
		}
	}

	pub async fn join(&mut self, conversation_id: &str) -> Result<pb::RoomResult, ClientCoreError> {
		let req = pb::JoinRoom {
			conversation_id: conversation_id.to_string(),
		};
		match self.request(Msg::JoinRoom(req)).await? {
			Msg::RoomResult(r) => Ok(r),
			other => Err(unexpected("RoomResult", other)),
		}
	}

	pub async fn leave(&mut self, conversation_id: &str) -> Result<pb::RoomResult, ClientCoreError> {
		let req = pb::LeaveRoom {
			conversation_id: conversation_id.to_string(),
		};
		match self.request(Msg::LeaveRoom(req)).await? {
			Msg::RoomResult(r) => Ok(r),
			other => Err(unexpected("RoomResult", other)),
		}
	}

	/// Send a message and wait for the server's acknowledgment.
	pub async fn send(
		&mut self,
		conversation_id: &str,
		content: &str,
		attachment: Option<pb::Attachment>,
	) -> Result<pb::MessageEvent, ClientCoreError> {
		let req = pb::SendMessage {
			conversation_id: conversation_id.to_string(),
			content: content.to_string(),
			attachment,
		};
		self.expect_ack(Msg::SendMessage(req)).await
	}

	pub async fn edit(&mut self, message_id: u64, content: &str) -> Result<pb::MessageEvent, ClientCoreError> {
		let req = pb::EditMessage {
			message_id,
			content: content.to_string(),
		};
		self.expect_ack(Msg::EditMessage(req)).await
	}

	pub async fn delete(&mut self, message_id: u64) -> Result<u64, ClientCoreError> {
		match self.request(Msg::DeleteMessage(pb::DeleteMessage { message_id })).await? {
			Msg::DeleteAck(d) => Ok(d.message_id),
			other => Err(unexpected("DeleteAck", other)),
		}
	}

	/// Conversation history, oldest first.
	pub async fn list(&mut self, conversation_id: &str) -> Result<Vec<pb::MessageEvent>, ClientCoreError> {
		let req = pb::ListMessages {
			conversation_id: conversation_id.to_string(),
		};
		match self.request(Msg::ListMessages(req)).await? {
			Msg::MessageList(l) => Ok(l.messages),
			other => Err(unexpected("MessageList", other)),
		}
	}

	/// Send a keepalive ping and await the pong response.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<pb::Pong, ClientCoreError> {
		match self.request(Msg::Ping(pb::Ping { client_time_unix_ms })).await? {
			Msg::Pong(p) => Ok(p),
			other => Err(unexpected("Pong", other)),
		}
	}

	/// Open the events stream after authenticating.
	pub async fn open_events_stream(&mut self) -> Result<SessionEvents, ClientCoreError> {
		if self.events_opened {
			return Err(ClientCoreError::Protocol(
				"events stream already opened; reuse the existing SessionEvents".to_string(),
			));
		}

		debug!("opening events stream (client open_bi)");
		let (mut send, recv) = self
			.conn
			.open_bi()
			.await
			.map_err(|e| ClientCoreError::Io(format!("open_bi(events) failed: {e}")))?;

		// Force a STREAM frame so the server observes the stream promptly.
		send.write_all(&[0u8])
			.await
			.map_err(|e| ClientCoreError::Io(format!("failed to write events stream activation byte: {e}")))?;

		self.events_opened = true;

		Ok(SessionEvents {
			events_recv: recv,
			_events_send_keepalive: send,
			decoder: FrameDecoder::new(self.max_frame_bytes),
		})
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	/// Resolves when the server closes the connection, with its reason.
	pub async fn closed(&self) -> quinn::ConnectionError {
		self.conn.closed().await
	}

	async fn expect_ack(&mut self, msg: Msg) -> Result<pb::MessageEvent, ClientCoreError> {
		match self.request(msg).await? {
			Msg::MessageAck(pb::MessageAck { event: Some(event) }) => Ok(event),
			other => Err(unexpected("MessageAck", other)),
		}
	}

	/// Write one request and wait for the response carrying the same `request_id`.
	async fn request(&mut self, msg: Msg) -> Result<Msg, ClientCoreError> {
		let request_id = uuid::Uuid::new_v4().to_string();
		let env = pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id: request_id.clone(),
			msg: Some(msg),
		};
		write_envelope(&mut self.control_send, &env, self.max_frame_bytes).await?;

		let timeout = self.request_timeout;
		loop {
			let resp = tokio::time::timeout(timeout, read_envelope(&mut self.control_recv, &mut self.decoder))
				.await
				.map_err(|_| ClientCoreError::Timeout(timeout))??;

			if resp.request_id != request_id && !resp.request_id.is_empty() {
				warn!(expected = %request_id, got = %resp.request_id, "dropping response to another request");
				continue;
			}

			return match resp.msg {
				Some(Msg::Error(e)) => Err(ClientCoreError::Server {
					code: e.code,
					message: e.message,
				}),
				Some(msg) => Ok(msg),
				None => Err(ClientCoreError::Protocol("empty response envelope".to_string())),
			};
		}
	}
}

impl SessionEvents {
	/// Next room event, or `None` once the server closed the stream.
	pub async fn next_event(&mut self) -> Result<Option<pb::EventEnvelope>, ClientCoreError> {
		loop {
			let env = match read_envelope(&mut self.events_recv, &mut self.decoder).await {
				Ok(env) => env,
				Err(ClientCoreError::Protocol(_)) if self.decoder.buffered() == 0 => {
					info!("events stream closed");
					return Ok(None);
				}
				Err(e) => return Err(e),
			};

			match env.msg {
				Some(Msg::Event(ev)) => {
					debug!(
						conversation_id = %ev.conversation_id,
						event_kind = event_kind(&ev),
						"events stream decoded"
					);
					return Ok(Some(ev));
				}
				other => warn!("unexpected message on events stream: {:?}", other),
			}
		}
	}

	/// Run the events loop until EOF or error.
	pub async fn run_events_loop<F>(&mut self, mut on_event: F) -> Result<(), ClientCoreError>
	where
		F: FnMut(pb::EventEnvelope),
	{
		while let Some(ev) = self.next_event().await? {
			on_event(ev);
		}
		Ok(())
	}
}

fn unexpected(expected: &str, got: Msg) -> ClientCoreError {
	ClientCoreError::Protocol(format!("expected {expected}, got {got:?}"))
}

pub fn event_kind(ev: &pb::EventEnvelope) -> &'static str {
	match ev.event.as_ref() {
		Some(pb::event_envelope::Event::MessageCreated(_)) => "message_created",
		Some(pb::event_envelope::Event::MessageUpdated(_)) => "message_updated",
		Some(pb::event_envelope::Event::MessageDeleted(_)) => "message_deleted",
		None => "empty",
	}
}

async fn write_envelope(
	send: &mut quinn::SendStream,
	env: &pb::Envelope,
	max_frame_bytes: usize,
) -> Result<(), ClientCoreError> {
	let frame = encode_frame(env, max_frame_bytes)?;
	send.write_all(&frame).await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
	Ok(())
}

async fn read_envelope(recv: &mut quinn::RecvStream, decoder: &mut FrameDecoder) -> Result<pb::Envelope, ClientCoreError> {
	let mut tmp = [0u8; 8192];

	loop {
		// A previous read may already hold a full frame.
		if let Some(env) = decoder.try_next::<pb::Envelope>()? {
			return Ok(env);
		}

		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => {
				return Err(ClientCoreError::Protocol(
					"stream closed before receiving full message".to_string(),
				));
			}
			Err(e) => return Err(ClientCoreError::Io(e.to_string())),
		};

		decoder.extend(&tmp[..n]);
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from(([0, 0, 0, 0], 0));
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// TLS config trusting `pinned_cert_der`, or skipping server cert validation when absent (dev only).
fn make_client_config(pinned_cert_der: Option<&[u8]>) -> anyhow::Result<QuinnClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let mut tls = match pinned_cert_der {
		Some(der) => {
			let mut roots = rustls::RootCertStore::empty();
			roots
				.add(rustls::pki_types::CertificateDer::from(der.to_vec()))
				.context("add pinned certificate")?;
			rustls::ClientConfig::builder()
				.with_root_certificates(roots)
				.with_no_client_auth()
		}
		None => {
			let mut tls = rustls::ClientConfig::builder()
				.with_root_certificates(rustls::RootCertStore::empty())
				.with_no_client_auth();
			tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
			tls
		}
	};
	tls.alpn_protocols = vec![ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	let mut cfg = QuinnClientConfig::new(Arc::new(quic_tls));

	// control + events
	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(4));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	transport.keep_alive_interval(Some(Duration::from_secs(15)));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &rustls::pki_types::CertificateDer<'_>,
		_intermediates: &[rustls::pki_types::CertificateDer<'_>],
		_server_name: &rustls::pki_types::ServerName<'_>,
		_ocsp_response: &[u8],
		_now: rustls::pki_types::UnixTime,
	) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::danger::ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &rustls::pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Err(rustls::Error::General("TLS1.2 not supported".into()))
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &rustls::pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		vec![
			rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
			rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA256,
			rustls::SignatureScheme::RSA_PSS_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA512,
			rustls::SignatureScheme::ED25519,
		]
	}
}

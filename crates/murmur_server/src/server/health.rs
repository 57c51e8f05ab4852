#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::db::Database;
use crate::server::presence::PresenceRegistry;
use crate::server::room_router::RoomRouter;

#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	db: Option<Database>,
	presence: PresenceRegistry,
	router: RoomRouter,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
	pub connections: usize,
	pub online_users: usize,
	pub rooms: usize,
}

impl HealthState {
	pub fn new(db: Option<Database>, presence: PresenceRegistry, router: RoomRouter) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			db,
			presence,
			router,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	/// Ready once startup finished and the database, if any, answers.
	pub async fn is_ready(&self) -> bool {
		if !self.ready.load(Ordering::Relaxed) {
			return false;
		}
		match &self.db {
			Some(db) => db.ping().await,
			None => true,
		}
	}

	pub async fn stats(&self) -> Stats {
		Stats {
			connections: self.presence.connection_count(),
			online_users: self.presence.online_users().len(),
			rooms: self.router.room_count().await,
		}
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	Ok(route(&method, &path, &state).await)
}

async fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" => {
			if state.is_ready().await {
				respond(StatusCode::OK, Bytes::from_static(b"ready"))
			} else {
				respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready"))
			}
		}
		"/stats" => match serde_json::to_vec(&state.stats().await) {
			Ok(body) => {
				let mut resp = respond(StatusCode::OK, Bytes::from(body));
				resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
				resp
			}
			Err(e) => {
				warn!(error = %e, "failed to encode stats");
				respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
			}
		},
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	}
}

fn respond(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}

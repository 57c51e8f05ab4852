#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use murmur_domain::ConnectionId;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::server::audit::AuditService;
use crate::server::auth::{HmacIdentityProvider, IdentityProvider};
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::db::Database;
use crate::server::directory::{InMemoryUserDirectory, SqlUserDirectory, UserDirectory};
use crate::server::gateway::SessionGateway;
use crate::server::health::HealthState;
use crate::server::pipeline::{MessagePipeline, PipelineSettings};
use crate::server::presence::PresenceRegistry;
use crate::server::rate_limit::{RateLimit, SendRateLimiter};
use crate::server::room_router::RoomRouter;
use crate::server::store::{InMemoryMessageStore, MessageStore, SqlMessageStore};

/// Everything a connection needs, built once at startup.
#[derive(Clone)]
pub struct ChatServices {
	pub gateway: SessionGateway,
	pub pipeline: MessagePipeline,
	pub health: HealthState,
	pub connection: ConnectionSettings,
}

impl ChatServices {
	pub async fn from_config(cfg: &ServerConfig) -> anyhow::Result<Self> {
		let secret = cfg
			.server
			.auth_hmac_secret
			.as_ref()
			.context("server.auth_hmac_secret is required (or MURMUR_SERVER_AUTH_HMAC_SECRET)")?;
		let identity: Arc<dyn IdentityProvider> = Arc::new(HmacIdentityProvider::new(secret.expose()));

		let max_chars = cfg.server.max_content_chars;
		let (store, directory, audit, db): (Arc<dyn MessageStore>, Arc<dyn UserDirectory>, AuditService, Option<Database>) =
			match cfg.persistence.database_url.as_deref() {
				Some(url) if cfg.persistence.enabled => {
					let db = Database::connect(url).await?;
					info!(backend = db.kind(), "persistence enabled");
					let directory = SqlUserDirectory::new(db.clone());
					directory
						.seed(&cfg.directory.users)
						.await
						.context("seed directory users")?;
					(
						Arc::new(SqlMessageStore::new(db.clone(), max_chars).await?),
						Arc::new(directory),
						AuditService::new(db.clone()),
						Some(db),
					)
				}
				_ => {
					warn!("persistence disabled; messages are kept in memory only");
					(
						Arc::new(InMemoryMessageStore::new(max_chars)),
						Arc::new(InMemoryUserDirectory::new(cfg.directory.users.iter().cloned())),
						AuditService::disabled(),
						None,
					)
				}
			};

		let limiter = SendRateLimiter::new(
			RateLimit {
				burst: cfg.server.send_rate_limit_burst,
				per_minute: cfg.server.send_rate_limit_per_minute,
			},
			RateLimit {
				burst: cfg.server.conversation_rate_limit_burst,
				per_minute: cfg.server.conversation_rate_limit_per_minute,
			},
		);
		let settings = PipelineSettings {
			max_content_chars: max_chars,
			list_retry_attempts: cfg.persistence.list_retry_attempts,
			list_retry_backoff: cfg.persistence.list_retry_backoff,
		};

		Ok(Self::assemble(
			identity,
			store,
			directory,
			audit,
			db,
			limiter,
			settings,
			cfg,
		))
	}

	/// In-memory services for development and tests; persistence and rate limits in `cfg` are ignored.
	pub fn in_memory(secret: &[u8], cfg: &ServerConfig) -> Self {
		Self::assemble(
			Arc::new(HmacIdentityProvider::new(secret)),
			Arc::new(InMemoryMessageStore::new(cfg.server.max_content_chars)),
			Arc::new(InMemoryUserDirectory::new(cfg.directory.users.iter().cloned())),
			AuditService::disabled(),
			None,
			SendRateLimiter::unlimited(),
			PipelineSettings {
				max_content_chars: cfg.server.max_content_chars,
				..PipelineSettings::default()
			},
			cfg,
		)
	}

	#[allow(clippy::too_many_arguments)]
	fn assemble(
		identity: Arc<dyn IdentityProvider>,
		store: Arc<dyn MessageStore>,
		directory: Arc<dyn UserDirectory>,
		audit: AuditService,
		db: Option<Database>,
		limiter: SendRateLimiter,
		settings: PipelineSettings,
		cfg: &ServerConfig,
	) -> Self {
		let presence = PresenceRegistry::new();
		let router = RoomRouter::new(cfg.server.subscriber_queue_capacity);
		let gateway = SessionGateway::new(
			identity,
			Arc::clone(&directory),
			presence.clone(),
			router.clone(),
			cfg.server.auth_grace,
		);
		let pipeline = MessagePipeline::new(store, directory, router.clone(), audit, Arc::new(limiter), settings);

		Self {
			gateway,
			pipeline,
			health: HealthState::new(db, presence, router),
			connection: ConnectionSettings::default(),
		}
	}
}

/// Accept QUIC connections until the endpoint closes.
pub async fn serve(endpoint: quinn::Endpoint, services: ChatServices) -> anyhow::Result<()> {
	services.health.mark_ready();
	let mut next_conn_id: u64 = 1;

	while let Some(incoming) = endpoint.accept().await {
		let conn_id = ConnectionId(next_conn_id);
		next_conn_id += 1;

		let services = services.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					info!(conn_id = %conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) =
						handle_connection(conn_id, connection, services.gateway, services.pipeline, services.connection)
							.await
					{
						warn!(conn_id = %conn_id, error = ?e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id = %conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}

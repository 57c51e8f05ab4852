#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context, anyhow};
use murmur_domain::ChatError;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};

/// Shared connection pool for the SQL-backed components, migrated on connect.
#[derive(Debug, Clone)]
pub enum Database {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl Database {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		Self::connect_with(database_url, 10).await
	}

	pub async fn connect_with(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);

			let mut pool_opts = SqlitePoolOptions::new().max_connections(max_connections);
			if database_url.contains(":memory:") || database_url.contains("mode=memory") {
				// every connection to an in-memory database is its own database
				pool_opts = pool_opts.max_connections(1).idle_timeout(None).max_lifetime(None);
			}

			let pool = pool_opts.connect_with(opts).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			info!("persistence: connected to sqlite");
			Ok(Self::Sqlite(pool))
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			info!("persistence: connected to postgres");
			Ok(Self::Postgres(pool))
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	/// Throwaway migrated in-memory SQLite database.
	pub async fn in_memory() -> anyhow::Result<Self> {
		Self::connect_with("sqlite::memory:", 1).await
	}

	pub const fn kind(&self) -> &'static str {
		match self {
			Database::Sqlite(_) => "sqlite",
			Database::Postgres(_) => "postgres",
		}
	}

	/// Cheap round trip used by readiness checks.
	pub async fn ping(&self) -> bool {
		let res = match self {
			Database::Sqlite(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
			Database::Postgres(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
		};
		res.is_ok()
	}
}

/// Map a driver error to the domain taxonomy. Row-level misses are handled by callers.
pub(crate) fn unavailable(what: &'static str) -> impl FnOnce(sqlx::Error) -> ChatError {
	move |e| {
		warn!(error = %e, what, "database operation failed");
		metrics::counter!("murmur_server_db_errors_total").increment(1);
		ChatError::Unavailable(format!("{what}: database unavailable"))
	}
}

#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use murmur_domain::{DEFAULT_MAX_CONTENT_CHARS, UserId, UserProfile};
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.murmur/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".murmur").join("config.toml"))
}

/// Load the server config from `~/.murmur/config.toml` and env overrides.
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub directory: DirectorySettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret verifying client credentials. Required to start.
	pub auth_hmac_secret: Option<SecretString>,
	/// How long a fresh connection may take to authenticate.
	pub auth_grace: Duration,
	pub max_content_chars: usize,
	/// Send rate limiting: per-connection burst size.
	pub send_rate_limit_burst: u32,
	/// Send rate limiting: sustained sends per minute.
	pub send_rate_limit_per_minute: u32,
	/// Send rate limiting across all senders of one conversation.
	pub conversation_rate_limit_burst: u32,
	pub conversation_rate_limit_per_minute: u32,
	/// Bound of each connection's outgoing event queue.
	pub subscriber_queue_capacity: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			auth_grace: Duration::from_secs(10),
			max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
			send_rate_limit_burst: 20,
			send_rate_limit_per_minute: 120,
			conversation_rate_limit_burst: 100,
			conversation_rate_limit_per_minute: 600,
			subscriber_queue_capacity: 256,
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
	/// Attempts for history reads when the store is unavailable.
	pub list_retry_attempts: u32,
	pub list_retry_backoff: Duration,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			database_url: None,
			list_retry_attempts: 3,
			list_retry_backoff: Duration::from_millis(50),
		}
	}
}

/// Profiles seeded into the user directory at startup.
#[derive(Debug, Clone, Default)]
pub struct DirectorySettings {
	pub users: Vec<UserProfile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	directory: FileDirectorySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	auth_grace_secs: Option<u64>,
	max_content_chars: Option<usize>,
	send_rate_limit_burst: Option<u32>,
	send_rate_limit_per_minute: Option<u32>,
	conversation_rate_limit_burst: Option<u32>,
	conversation_rate_limit_per_minute: Option<u32>,
	subscriber_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
	list_retry_attempts: Option<u32>,
	list_retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDirectorySettings {
	#[serde(default)]
	users: Vec<FileDirectoryUser>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileDirectoryUser {
	id: String,
	display_name: Option<String>,
	avatar_url: Option<String>,
}

fn non_empty(s: Option<String>) -> Option<String> {
	s.filter(|s| !s.trim().is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ServerSettings::default();
		let persistence_defaults = PersistenceSettings::default();

		let users = file
			.directory
			.users
			.into_iter()
			.map(|u| {
				let user_id = UserId::new(u.id).context("directory user id")?;
				let display_name = non_empty(u.display_name).unwrap_or_else(|| user_id.to_string());
				Ok(UserProfile {
					user_id,
					display_name,
					avatar_url: non_empty(u.avatar_url),
				})
			})
			.collect::<anyhow::Result<Vec<_>>>()?;

		Ok(Self {
			server: ServerSettings {
				tls_cert_path: non_empty(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_empty(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				auth_hmac_secret: non_empty(file.server.auth_hmac_secret).map(SecretString::new),
				auth_grace: file
					.server
					.auth_grace_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.auth_grace),
				max_content_chars: file
					.server
					.max_content_chars
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_content_chars),
				send_rate_limit_burst: file.server.send_rate_limit_burst.unwrap_or(defaults.send_rate_limit_burst),
				send_rate_limit_per_minute: file
					.server
					.send_rate_limit_per_minute
					.unwrap_or(defaults.send_rate_limit_per_minute),
				conversation_rate_limit_burst: file
					.server
					.conversation_rate_limit_burst
					.unwrap_or(defaults.conversation_rate_limit_burst),
				conversation_rate_limit_per_minute: file
					.server
					.conversation_rate_limit_per_minute
					.unwrap_or(defaults.conversation_rate_limit_per_minute),
				subscriber_queue_capacity: file
					.server
					.subscriber_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.subscriber_queue_capacity),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_empty(file.persistence.database_url),
				list_retry_attempts: file
					.persistence
					.list_retry_attempts
					.filter(|v| *v > 0)
					.unwrap_or(persistence_defaults.list_retry_attempts),
				list_retry_backoff: file
					.persistence
					.list_retry_backoff_ms
					.map(Duration::from_millis)
					.unwrap_or(persistence_defaults.list_retry_backoff),
			},
			directory: DirectorySettings { users },
		})
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn env_string(key: &str) -> Option<String> {
	std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("MURMUR_SERVER_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = env_string("MURMUR_SERVER_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = env_string("MURMUR_SERVER_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = env_string("MURMUR_AUTH_GRACE_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.server.auth_grace = Duration::from_secs(secs);
		info!(secs, "server config: auth_grace overridden by env");
	}

	if let Some(v) = env_string("MURMUR_MAX_CONTENT_CHARS")
		&& let Ok(max) = v.parse::<usize>()
		&& max > 0
	{
		cfg.server.max_content_chars = max;
		info!(max, "server config: max_content_chars overridden by env");
	}

	if let Some(v) = env_string("MURMUR_SEND_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.parse::<u32>()
	{
		cfg.server.send_rate_limit_burst = burst;
		info!(burst, "server config: send_rate_limit_burst overridden by env");
	}

	if let Some(v) = env_string("MURMUR_SEND_RATE_LIMIT_PER_MINUTE")
		&& let Ok(rate) = v.parse::<u32>()
	{
		cfg.server.send_rate_limit_per_minute = rate;
		info!(rate, "server config: send_rate_limit_per_minute overridden by env");
	}

	if let Some(v) = env_string("MURMUR_CONVERSATION_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.parse::<u32>()
	{
		cfg.server.conversation_rate_limit_burst = burst;
		info!(burst, "server config: conversation_rate_limit_burst overridden by env");
	}

	if let Some(v) = env_string("MURMUR_CONVERSATION_RATE_LIMIT_PER_MINUTE")
		&& let Ok(rate) = v.parse::<u32>()
	{
		cfg.server.conversation_rate_limit_per_minute = rate;
		info!(rate, "server config: conversation_rate_limit_per_minute overridden by env");
	}

	if let Some(v) = env_string("MURMUR_SUBSCRIBER_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.subscriber_queue_capacity = capacity;
		info!(capacity, "server config: subscriber_queue_capacity overridden by env");
	}

	if let Some(v) = env_string("MURMUR_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("MURMUR_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = env_string("MURMUR_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = env_string("MURMUR_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = env_string("MURMUR_LIST_RETRY_ATTEMPTS")
		&& let Ok(attempts) = v.parse::<u32>()
		&& attempts > 0
	{
		cfg.persistence.list_retry_attempts = attempts;
		info!(attempts, "persistence: list_retry_attempts overridden by env");
	}

	if let Some(v) = env_string("MURMUR_LIST_RETRY_BACKOFF_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.persistence.list_retry_backoff = Duration::from_millis(ms);
		info!(ms, "persistence: list_retry_backoff overridden by env");
	}

	if cfg.persistence.enabled && cfg.persistence.database_url.is_none() {
		warn!("persistence: enabled without database_url; falling back to in-memory store");
		cfg.persistence.enabled = false;
	}
}

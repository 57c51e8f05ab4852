#![forbid(unsafe_code)]

use std::net::SocketAddr;

use thiserror::Error;

/// Default UDP port for the murmur QUIC listener.
pub const DEFAULT_PORT: u16 = 18_443;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
	#[error("endpoint must be non-empty (expected quic://host:port)")]
	Empty,
	#[error("invalid endpoint scheme (expected quic://host:port): {0}")]
	Scheme(String),
	#[error("endpoint must not carry a path, query or fragment: {0}")]
	Trailing(String),
	#[error("invalid endpoint host: {0}")]
	Host(String),
	#[error("IPv6 hosts must be bracketed like quic://[::1]:{DEFAULT_PORT}: {0}")]
	UnbracketedIpv6(String),
	#[error("invalid endpoint port (expected 1..=65535): {0}")]
	Port(String),
	#[error("host must be an IP literal: {0}")]
	NotIpLiteral(String),
}

/// Parsed `quic://host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuicEndpoint {
	pub host: String,
	pub port: u16,
}

impl QuicEndpoint {
	/// `host:port`, IPv6 hosts stay bracketed.
	pub fn hostport(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Host without IPv6 brackets, suitable as a TLS server name.
	pub fn server_name(&self) -> &str {
		self.host.trim_start_matches('[').trim_end_matches(']')
	}

	pub fn socket_addr(&self) -> Result<SocketAddr, EndpointError> {
		self.hostport()
			.parse()
			.map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))
	}

	/// Parse `quic://host:port`. A bare `host:port` is accepted as well.
	pub fn parse(s: &str) -> Result<Self, EndpointError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(EndpointError::Empty);
		}

		let rest = match s.split_once("://") {
			Some(("quic", rest)) => rest,
			Some(_) => return Err(EndpointError::Scheme(s.to_string())),
			None => s,
		};

		if rest.contains(['/', '?', '#']) {
			return Err(EndpointError::Trailing(s.to_string()));
		}

		let (host, port) = rest.rsplit_once(':').ok_or_else(|| EndpointError::Port(s.to_string()))?;
		let host = host.trim();
		if host.is_empty() {
			return Err(EndpointError::Host(s.to_string()));
		}
		if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
			return Err(EndpointError::UnbracketedIpv6(s.to_string()));
		}

		let port = match port.trim().parse::<u16>() {
			Ok(p) if p != 0 => p,
			_ => return Err(EndpointError::Port(s.to_string())),
		};

		Ok(Self {
			host: host.to_string(),
			port,
		})
	}
}

impl std::fmt::Display for QuicEndpoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "quic://{}", self.hostport())
	}
}

impl std::str::FromStr for QuicEndpoint {
	type Err = EndpointError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

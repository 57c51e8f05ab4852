#![forbid(unsafe_code)]

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use murmur_domain::{ChatError, Identity, UserId};
use murmur_util::time::unix_secs_now;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Verifies an opaque client credential and yields the identity it carries.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
	async fn verify(&self, credential: &str) -> Result<Identity, ChatError>;
}

/// Claims of a `v1.<payload>.<signature>` token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	#[serde(default)]
	pub name: Option<String>,
	/// Expiry, unix seconds.
	pub exp: i64,
}

/// Stateless HMAC-SHA256 tokens shared with the identity service.
#[derive(Clone)]
pub struct HmacIdentityProvider {
	secret: Vec<u8>,
}

impl HmacIdentityProvider {
	pub fn new(secret: impl AsRef<[u8]>) -> Self {
		Self {
			secret: secret.as_ref().to_vec(),
		}
	}
}

impl std::fmt::Debug for HmacIdentityProvider {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HmacIdentityProvider").finish_non_exhaustive()
	}
}

#[async_trait]
impl IdentityProvider for HmacIdentityProvider {
	async fn verify(&self, credential: &str) -> Result<Identity, ChatError> {
		let claims = verify_hmac_token(credential.trim(), &self.secret, unix_secs_now())?;
		let user_id = UserId::new(claims.sub).map_err(|e| ChatError::Unauthenticated(format!("invalid subject: {e}")))?;
		let display_name = claims
			.name
			.map(|n| n.trim().to_string())
			.filter(|n| !n.is_empty())
			.unwrap_or_else(|| user_id.to_string());

		Ok(Identity { user_id, display_name })
	}
}

pub fn verify_hmac_token(token: &str, secret: &[u8], now_secs: i64) -> Result<AuthClaims, ChatError> {
	let unauthenticated = |m: &str| ChatError::Unauthenticated(m.to_string());

	if token.is_empty() {
		return Err(unauthenticated("missing credential"));
	}

	let mut parts = token.split('.');
	let (Some("v1"), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(unauthenticated("invalid token format"));
	};

	let provided_sig = URL_SAFE_NO_PAD
		.decode(sig_b64)
		.map_err(|_| unauthenticated("invalid token signature"))?;
	if !constant_time_eq(&sign(payload_b64.as_bytes(), secret), &provided_sig) {
		return Err(unauthenticated("invalid token signature"));
	}

	let payload = URL_SAFE_NO_PAD
		.decode(payload_b64)
		.map_err(|_| unauthenticated("invalid token payload"))?;
	let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|_| unauthenticated("invalid token claims"))?;
	if claims.exp <= now_secs {
		return Err(unauthenticated("token expired"));
	}

	Ok(claims)
}

/// Issue a token for `claims`. Used by tooling and tests; production tokens come from the identity service.
pub fn sign_token(claims: &AuthClaims, secret: &[u8]) -> String {
	let payload = serde_json::to_vec(claims).unwrap_or_default();
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig_b64 = URL_SAFE_NO_PAD.encode(sign(payload_b64.as_bytes(), secret));
	format!("v1.{payload_b64}.{sig_b64}")
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	// HMAC accepts keys of any length.
	let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
		return Vec::new();
	};
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

//! Token lifecycle for a single device.

use std::{fmt, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::{
	api::{TransportError, UpsApi, AUTH_PATH},
	config::DeviceConfig,
};

/// Token lifetime assumed when the login reply carries no `expires_in`.
pub const DEFAULT_SESSION_LIFETIME_SECS: i64 = 300;

#[derive(Clone)]
pub struct Session {
	device: String,
	token_type: String,
	access_token: String,
	issued_at: DateTime<Utc>,
	expires_at: DateTime<Utc>,
}

impl fmt::Debug for Session {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Session")
			.field("device", &self.device)
			.field("token_type", &self.token_type)
			.field("access_token", &"<redacted>")
			.field("issued_at", &self.issued_at)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

impl Session {
	pub fn device(&self) -> &str {
		&self.device
	}

	/// Value of the `Authorization` header for reads made with this session.
	pub fn authorization(&self) -> String {
		format!("{} {}", self.token_type, self.access_token)
	}

	pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
		now >= self.expires_at
	}
}

#[cfg(test)]
impl Session {
	pub fn issued_at(&self) -> DateTime<Utc> {
		self.issued_at
	}

	pub fn expires_at(&self) -> DateTime<Utc> {
		self.expires_at
	}
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("login to {device} failed: {reason}")]
pub struct AuthError {
	pub device: String,
	pub reason: AuthFailure,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthFailure {
	#[error("login timeout > {} seconds", .0.as_secs())]
	Timeout(Duration),
	#[error("connection refused, host might be out of reach ({0})")]
	ConnectionRefused(String),
	#[error("invalid certificate, connection to host failed ({0})")]
	CertificateRejected(String),
	#[error("{0}")]
	Transport(String),
	#[error("credentials rejected (HTTP {status})")]
	Rejected { status: u16 },
	#[error("unexpected login response: {0}")]
	UnexpectedResponse(String),
}

#[derive(Deserialize)]
struct TokenGrant {
	token_type: String,
	access_token: String,
	#[serde(default)]
	expires_in: Option<u64>,
}

/// Holds the one session a device may have. Owned by that device's pipeline and never shared.
#[derive(Debug, Default)]
pub struct SessionManager {
	slot: Option<Session>,
}

impl SessionManager {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the cached session, logging in first when there is none or it has expired.
	pub async fn ensure_session<A: UpsApi>(&mut self, device: &DeviceConfig, api: &A) -> Result<&Session, AuthError> {
		self.ensure_session_at(device, api, Utc::now()).await
	}

	pub(crate) async fn ensure_session_at<A: UpsApi>(&mut self, device: &DeviceConfig, api: &A, now: DateTime<Utc>) -> Result<&Session, AuthError> {
		let session = match self.slot.take() {
			Some(session) if session.device == device.name && !session.is_expired_at(now) => session,
			stale => {
				if let Some(stale) = stale {
					debug!(ups_id = %device.name, issued_at = %stale.issued_at, "Session expired, logging in again");
				}
				login(device, api, now).await?
			},
		};
		Ok(&*self.slot.insert(session))
	}

	/// Drops the cached token; the next [`ensure_session`](Self::ensure_session) logs in again.
	pub fn invalidate(&mut self) {
		if let Some(session) = self.slot.take() {
			debug!(ups_id = %session.device, "Discarding session");
		}
	}

	#[cfg(test)]
	pub fn current(&self) -> Option<&Session> {
		self.slot.as_ref()
	}
}

async fn login<A: UpsApi>(device: &DeviceConfig, api: &A, now: DateTime<Utc>) -> Result<Session, AuthError> {
	let failed = |reason| AuthError {
		device: device.name.clone(),
		reason,
	};
	let body = json!({
		"grant_type": "password",
		"scope": "GUIAccess",
		"username": device.username,
		"password": device.password,
	});

	let reply = api.post_json(AUTH_PATH, &body, device.login_timeout).await.map_err(|error| {
		failed(match error {
			TransportError::Timeout => AuthFailure::Timeout(device.login_timeout),
			TransportError::Connect(reason) => AuthFailure::ConnectionRefused(reason),
			TransportError::Certificate(reason) => AuthFailure::CertificateRejected(reason),
			TransportError::Other(reason) => AuthFailure::Transport(reason),
		})
	})?;
	if matches!(reply.status, 401 | 403) {
		return Err(failed(AuthFailure::Rejected { status: reply.status }));
	}

	let value: Value =
		serde_json::from_str(&reply.body).map_err(|e| failed(AuthFailure::UnexpectedResponse(format!("HTTP {}: {e}", reply.status))))?;
	// The card answers bad credentials with a successful status and a body that lacks the token fields.
	let grant = TokenGrant::deserialize(&value).map_err(|e| {
		failed(if reply.is_success() {
			AuthFailure::Rejected { status: reply.status }
		} else {
			AuthFailure::UnexpectedResponse(format!("HTTP {}: {e}", reply.status))
		})
	})?;

	let default_lifetime = TimeDelta::seconds(DEFAULT_SESSION_LIFETIME_SECS);
	let (lifetime, expires_at) = grant
		.expires_in
		.and_then(|secs| i64::try_from(secs).ok())
		.and_then(TimeDelta::try_seconds)
		.and_then(|lifetime| Some((lifetime, now.checked_add_signed(lifetime)?)))
		.unwrap_or((default_lifetime, now + default_lifetime));
	debug!(ups_id = %device.name, token_type = %grant.token_type, lifetime_secs = lifetime.num_seconds(), "Authentication successful");

	Ok(Session {
		device: device.name.clone(),
		token_type: grant.token_type,
		access_token: grant.access_token,
		issued_at: now,
		expires_at,
	})
}

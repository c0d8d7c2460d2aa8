use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Why a session stopped being active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEndReason {
	/// No heartbeat within the idle threshold
	IdleTimeout,
	Revoked,
	/// A newer exchange from the same user and device replaced it
	Superseded,
	/// Heartbeat arrived after the license expiry
	LicenseExpired,
}

/// A content-key license bound to one device
///
/// Created by a successful key exchange, kept alive by heartbeats. Once
/// inactive it is never reactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrmSession {
	pub session_token: String,
	pub upload_id: i64,
	pub device_id: String,
	pub user_id: String,
	pub rights: Vec<String>,
	pub issued_at: DateTime<Utc>,
	pub last_heartbeat: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
	pub active: bool,
	pub ended_at: Option<DateTime<Utc>>,
	pub end_reason: Option<SessionEndReason>,
}

impl DrmSession {
	/// A fresh active session with a new opaque token
	pub fn issue(
		upload_id: i64,
		device_id: impl Into<String>,
		user_id: impl Into<String>,
		rights: Vec<String>,
		license_ttl: Duration,
		now: DateTime<Utc>,
	) -> Self {
		Self {
			session_token: uuid::Uuid::new_v4().simple().to_string(),
			upload_id,
			device_id: device_id.into(),
			user_id: user_id.into(),
			rights,
			issued_at: now,
			last_heartbeat: now,
			expires_at: now + license_ttl,
			active: true,
			ended_at: None,
			end_reason: None,
		}
	}

	/// Strictly older than the threshold; a session exactly at the boundary
	/// survives one more sweep.
	pub fn is_idle_at(&self, now: DateTime<Utc>, idle_threshold: Duration) -> bool {
		self.active && now - self.last_heartbeat > idle_threshold
	}

	pub fn is_license_expired_at(&self, now: DateTime<Utc>) -> bool {
		now > self.expires_at
	}

	/// Terminal transition. Returns false if the session was already inactive.
	pub fn deactivate(&mut self, now: DateTime<Utc>, reason: SessionEndReason) -> bool {
		if !self.active {
			return false;
		}
		self.active = false;
		self.ended_at = Some(now);
		self.end_reason = Some(reason);
		true
	}

	/// Short, non-secret prefix of the token for logs
	pub fn token_hint(&self) -> &str {
		let end = self.session_token.len().min(8);
		&self.session_token[..end]
	}
}

/// Client-facing view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
	pub session_token: String,
	pub upload_id: i64,
	pub device_id: String,
	pub active: bool,
	pub issued_at: DateTime<Utc>,
	pub last_heartbeat: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub end_reason: Option<SessionEndReason>,
}

impl From<&DrmSession> for SessionStatus {
	fn from(session: &DrmSession) -> Self {
		Self {
			session_token: session.session_token.clone(),
			upload_id: session.upload_id,
			device_id: session.device_id.clone(),
			active: session.active,
			issued_at: session.issued_at,
			last_heartbeat: session.last_heartbeat,
			expires_at: session.expires_at,
			end_reason: session.end_reason,
		}
	}
}

//! Entity types for DRM audit logging

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Audit record for a security-relevant DRM operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrmAuditEvent {
	pub event_type: DrmAuditEventType,
	pub user_id: Option<String>,
	pub upload_id: Option<i64>,
	pub operation: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<JsonValue>,
	pub succeeded: bool,
	pub error_message: Option<String>,
	pub timestamp: DateTime<Utc>,
}

/// Types of DRM audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrmAuditEventType {
	/// A server keypair was generated because none was persisted
	KeyGenerated,
	/// The server keypair was rotated
	KeyRotated,
	/// A document was encrypted and its content key wrapped
	ContentProtected,
	/// An active wrap was re-wrapped under the current keypair
	ContentKeyRewrapped,
	/// A content key was released to a client session
	ContentKeyIssued,
	/// Access control denied a caller
	AccessDenied,
	/// An AES-GCM tag failed to verify
	AuthenticationFailed,
	/// A content key could not be unwrapped
	ContentKeyUnavailable,
	/// A session was ended by the idle sweep
	SessionExpired,
	/// A session was ended explicitly
	SessionRevoked,
	/// A session was replaced by a newer exchange from the same device
	SessionSuperseded,
}

impl DrmAuditEventType {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::KeyGenerated => "KEY_GENERATED",
			Self::KeyRotated => "KEY_ROTATED",
			Self::ContentProtected => "CONTENT_PROTECTED",
			Self::ContentKeyRewrapped => "CONTENT_KEY_REWRAPPED",
			Self::ContentKeyIssued => "CONTENT_KEY_ISSUED",
			Self::AccessDenied => "ACCESS_DENIED",
			Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
			Self::ContentKeyUnavailable => "CONTENT_KEY_UNAVAILABLE",
			Self::SessionExpired => "SESSION_EXPIRED",
			Self::SessionRevoked => "SESSION_REVOKED",
			Self::SessionSuperseded => "SESSION_SUPERSEDED",
		}
	}

	/// Events that warrant operator attention
	pub fn is_security_event(&self) -> bool {
		matches!(
			self,
			Self::AccessDenied | Self::AuthenticationFailed | Self::ContentKeyUnavailable
		)
	}
}

impl std::str::FromStr for DrmAuditEventType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"KEY_GENERATED" => Self::KeyGenerated,
			"KEY_ROTATED" => Self::KeyRotated,
			"CONTENT_PROTECTED" => Self::ContentProtected,
			"CONTENT_KEY_REWRAPPED" => Self::ContentKeyRewrapped,
			"CONTENT_KEY_ISSUED" => Self::ContentKeyIssued,
			"ACCESS_DENIED" => Self::AccessDenied,
			"AUTHENTICATION_FAILED" => Self::AuthenticationFailed,
			"CONTENT_KEY_UNAVAILABLE" => Self::ContentKeyUnavailable,
			"SESSION_EXPIRED" => Self::SessionExpired,
			"SESSION_REVOKED" => Self::SessionRevoked,
			"SESSION_SUPERSEDED" => Self::SessionSuperseded,
			other => return Err(format!("unknown audit event type '{other}'")),
		})
	}
}

impl std::fmt::Display for DrmAuditEventType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_event_type_string_roundtrip() {
		for event in [
			DrmAuditEventType::KeyRotated,
			DrmAuditEventType::ContentKeyIssued,
			DrmAuditEventType::SessionSuperseded,
		] {
			assert_eq!(event.as_str().parse::<DrmAuditEventType>(), Ok(event));
		}
		assert!("NOT_A_THING".parse::<DrmAuditEventType>().is_err());
	}

	#[test]
	fn test_serde_matches_as_str() {
		let json = serde_json::to_string(&DrmAuditEventType::AccessDenied).unwrap();
		assert_eq!(json, "\"ACCESS_DENIED\"");
	}
}

//! Error taxonomy for the content-protection engine

use thiserror::Error;

/// Result type for DRM operations
pub type DrmResult<T> = Result<T, DrmError>;

/// Errors that can occur anywhere in the content-protection engine.
///
/// Variants that concern a document carry the upload id and the operation so
/// that audit logs are actionable. None of them ever carry key material.
#[derive(Debug, Error)]
pub enum DrmError {
	/// Persisted key material is unreadable or corrupt. Fatal at startup.
	#[error("Key store error: {0}")]
	KeyStore(String),

	/// Malformed ciphertext, bad padding, size mismatch
	#[error("Crypto error during {operation}: {message}")]
	Crypto {
		operation: &'static str,
		message: String,
	},

	/// An envelope is structurally invalid (checked before any crypto runs)
	#[error("Malformed envelope: {0}")]
	MalformedEnvelope(String),

	/// AES-GCM tag mismatch: tampered data or wrong passphrase
	#[error("Authentication failed during {operation}")]
	Authentication { operation: &'static str },

	/// The content key is missing, inactive, or could not be unwrapped
	#[error("Invalid content key for upload {upload_id} ({operation}): {reason}")]
	InvalidContentKey {
		upload_id: i64,
		operation: &'static str,
		reason: String,
	},

	/// The access-control collaborator denied the caller
	#[error("Access to upload {upload_id} denied for user {user_id}")]
	Forbidden { upload_id: i64, user_id: String },

	/// A session could not be persisted
	#[error("Failed to create session for upload {upload_id}: {message}")]
	SessionCreation { upload_id: i64, message: String },

	#[error("Session not found")]
	SessionNotFound,

	#[error("Session is no longer active")]
	SessionInactive,

	/// Storage collaborator failure
	#[error("Storage error for {path}: {message}")]
	Storage { path: String, message: String },

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

impl DrmError {
	pub fn crypto(operation: &'static str, message: impl Into<String>) -> Self {
		DrmError::Crypto {
			operation,
			message: message.into(),
		}
	}

	pub fn invalid_content_key(
		upload_id: i64,
		operation: &'static str,
		reason: impl Into<String>,
	) -> Self {
		DrmError::InvalidContentKey {
			upload_id,
			operation,
			reason: reason.into(),
		}
	}

	/// Only session persistence failures are safe to retry (once).
	pub fn is_retryable(&self) -> bool {
		matches!(self, DrmError::SessionCreation { .. })
	}

	/// Failures that must be logged as security events rather than plain errors
	pub fn is_security_event(&self) -> bool {
		matches!(
			self,
			DrmError::Authentication { .. } | DrmError::Forbidden { .. }
		)
	}

	/// Whether the failure belongs to the "cannot retrieve content" family that
	/// is reported to external callers without further distinction.
	pub fn is_content_unavailable(&self) -> bool {
		matches!(
			self,
			DrmError::InvalidContentKey { .. }
				| DrmError::Forbidden { .. }
				| DrmError::Authentication { .. }
				| DrmError::MalformedEnvelope(_)
				| DrmError::Crypto { .. }
				| DrmError::Storage { .. }
		)
	}
}

// Note: AEAD and RSA errors are converted with explicit `.map_err()` at the
// call sites so that each failure carries the operation it belongs to.

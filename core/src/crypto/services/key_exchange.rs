//! Key Exchange Service - the client-facing content-key protocol
//!
//! 1. The client fetches [`PublicKeyInfo`] and encrypts a fresh 32-byte
//!    ephemeral AES key under the server public key.
//! 2. [`KeyExchangeService::request_content_key`] recovers the ephemeral key,
//!    checks authorization, unwraps the document's content key and seals it
//!    under the ephemeral key. The raw content key never leaves the process.
//! 3. The returned session must be kept alive with heartbeats.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{
	errors::{DrmError, DrmResult},
	keypair::KeyPairManager,
	services::{
		access_control::AccessControl,
		audit::{AuditService, AuditSink},
		session_monitor::SessionLifecycleMonitor,
	},
	types::EphemeralKey,
	wrap::ContentKeyWrapper,
};

/// Public key descriptor handed to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyInfo {
	/// Base64 SubjectPublicKeyInfo DER
	pub public_key: String,
	pub key_id: String,
	pub created_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
	pub algorithm: String,
	pub key_size: usize,
}

/// Response to a successful key exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentKeyGrant {
	pub session_token: String,
	/// Base64 of `nonce(12) ‖ AES-256-GCM(content key)` under the ephemeral key
	pub encrypted_content_key: String,
	pub rights: Vec<String>,
	pub expiry_time: DateTime<Utc>,
}

pub struct KeyExchangeService {
	keypair: Arc<KeyPairManager>,
	wrapper: Arc<ContentKeyWrapper>,
	access: Arc<dyn AccessControl>,
	sessions: Arc<SessionLifecycleMonitor>,
	audit: Arc<dyn AuditSink>,
	rights: Vec<String>,
}

impl KeyExchangeService {
	pub fn new(
		wrapper: Arc<ContentKeyWrapper>,
		access: Arc<dyn AccessControl>,
		sessions: Arc<SessionLifecycleMonitor>,
		audit: Arc<dyn AuditSink>,
		rights: Vec<String>,
	) -> Self {
		Self {
			keypair: wrapper.keypair().clone(),
			wrapper,
			access,
			sessions,
			audit,
			rights,
		}
	}

	pub fn sessions(&self) -> &Arc<SessionLifecycleMonitor> {
		&self.sessions
	}

	/// Descriptor of the current server public key
	pub fn public_key_info(&self) -> DrmResult<PublicKeyInfo> {
		let ring = self.keypair.current();
		Ok(PublicKeyInfo {
			public_key: STANDARD.encode(ring.public_key_der()?),
			key_id: ring.key_id().to_string(),
			created_at: ring.created_at(),
			expires_at: ring.expires_at(),
			algorithm: "RSA".to_string(),
			key_size: ring.key_size(),
		})
	}

	/// Release the content key of `upload_id` to `user_id` on `device_id`.
	///
	/// # Arguments
	/// * `encrypted_client_key` - the client's 32-byte ephemeral AES key,
	///   encrypted under the current server public key
	///
	/// # Errors
	/// - `Crypto` when the client payload cannot be decrypted
	/// - `Forbidden` when access control denies the caller
	/// - `InvalidContentKey` when the upload has no usable active wrap
	/// - `SessionCreation` when the session cannot be stored (after one retry)
	pub async fn request_content_key(
		&self,
		user_id: &str,
		upload_id: i64,
		device_id: &str,
		encrypted_client_key: &[u8],
	) -> DrmResult<ContentKeyGrant> {
		let ephemeral = self
			.keypair
			.decrypt_with_private_key(encrypted_client_key)
			.and_then(|raw| EphemeralKey::from_slice(&raw))
			.map_err(|e| {
				tracing::warn!(upload_id, device_id, error = %e, "Rejected client key payload");
				e
			})?;

		if !self.access.may_access(user_id, upload_id).await? {
			AuditService::access_denied(user_id, upload_id, "request_content_key")
				.emit(self.audit.as_ref());
			return Err(DrmError::Forbidden {
				upload_id,
				user_id: user_id.to_string(),
			});
		}

		let content_key = match self.wrapper.active_content_key(upload_id).await {
			Ok(key) => key,
			Err(e) => {
				AuditService::content_key_unavailable(
					upload_id,
					"request_content_key",
					e.to_string(),
				)
				.emit(self.audit.as_ref());
				return Err(e);
			},
		};

		let encrypted_content_key = ephemeral.seal_content_key(&content_key)?;
		drop(content_key);

		let session = match self
			.sessions
			.issue_session(upload_id, device_id, user_id, self.rights.clone())
			.await
		{
			Err(e) if e.is_retryable() => {
				tracing::warn!(upload_id, error = %e, "Session creation failed, retrying once");
				self.sessions
					.issue_session(upload_id, device_id, user_id, self.rights.clone())
					.await?
			},
			other => other?,
		};

		AuditService::content_key_issued(user_id, upload_id, device_id, session.token_hint())
			.emit(self.audit.as_ref());

		Ok(ContentKeyGrant {
			session_token: session.session_token,
			encrypted_content_key,
			rights: session.rights,
			expiry_time: session.expires_at,
		})
	}

	/// Decrypt an RSA-encrypted payload for the holder of an active session
	pub async fn decrypt_client_payload(
		&self,
		session_token: &str,
		payload: &[u8],
	) -> DrmResult<Zeroizing<Vec<u8>>> {
		let session = self.sessions.require_active(session_token).await?;
		self.keypair.decrypt_with_private_key(payload).map_err(|e| {
			tracing::warn!(
				upload_id = session.upload_id,
				session = session.token_hint(),
				error = %e,
				"Failed to decrypt client payload"
			);
			e
		})
	}
}

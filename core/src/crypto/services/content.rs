//! Document Protection Service - upload and read paths for protected content
//!
//! Upload: mint a content key, encrypt the document into a staged envelope,
//! mark the new wrap active, then move the envelope into place. A failure
//! before the wrap is stored leaves the previous envelope and wrap untouched.
//! Read: authorize the caller, unwrap the active key, open the envelope.
//!
//! Uploads of one document are serialized against each other and against its
//! readers. A staged envelope left behind by a crash between the wrap write
//! and the final rename is promoted the next time the document is read.

use std::{
	collections::HashMap,
	fs::File,
	io::{BufReader, BufWriter},
	path::PathBuf,
	sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use zeroize::Zeroizing;

use crate::{
	crypto::{
		envelope::ContentEnvelopeCodec,
		errors::{DrmError, DrmResult},
		services::{
			access_control::AccessControl,
			audit::{AuditService, AuditSink},
			session_monitor::SessionLifecycleMonitor,
		},
		types::ContentKey,
		wrap::{ContentKeyRecord, ContentKeyWrapper},
	},
	filesystem::{envelope_path_for, staged_path_for, ContentStorage},
};

/// How new content keys are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyWrapMode {
	/// RSA under the current server keypair
	#[default]
	Asymmetric,
	/// Envelope under the configured master key
	Legacy,
}

/// Who is asking for decrypted bytes
#[derive(Debug, Clone)]
pub enum Caller {
	/// A trusted in-process collaborator (re-encryption, conversion jobs)
	Internal,
	/// A client holding a DRM session for the upload
	Session(String),
	/// A user checked against access control
	User(String),
}

/// Result of protecting one upload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedUpload {
	pub upload_id: i64,
	pub path: String,
	pub envelope_bytes: u64,
	pub wrap_id: String,
	pub key_id: Option<String>,
}

/// One reader-writer lock per upload, dropped once nobody holds it
#[derive(Default)]
struct UploadLocks {
	locks: parking_lot::Mutex<HashMap<i64, Arc<RwLock<()>>>>,
}

impl UploadLocks {
	fn lock_for(&self, upload_id: i64) -> Arc<RwLock<()>> {
		let mut locks = self.locks.lock();
		locks.retain(|_, lock| Arc::strong_count(lock) > 1);
		locks.entry(upload_id).or_default().clone()
	}

	async fn read(&self, upload_id: i64) -> OwnedRwLockReadGuard<()> {
		self.lock_for(upload_id).read_owned().await
	}

	async fn write(&self, upload_id: i64) -> OwnedRwLockWriteGuard<()> {
		self.lock_for(upload_id).write_owned().await
	}
}

/// Failures that a staged envelope left by an interrupted upload could explain
fn is_envelope_failure(e: &DrmError) -> bool {
	matches!(
		e,
		DrmError::Authentication { .. }
			| DrmError::MalformedEnvelope(_)
			| DrmError::Storage { .. }
			| DrmError::Io(_)
	)
}

pub struct DocumentProtectionService {
	wrapper: Arc<ContentKeyWrapper>,
	codec: ContentEnvelopeCodec,
	storage: Arc<dyn ContentStorage>,
	access: Arc<dyn AccessControl>,
	sessions: Arc<SessionLifecycleMonitor>,
	audit: Arc<dyn AuditSink>,
	wrap_mode: KeyWrapMode,
	locks: UploadLocks,
}

impl DocumentProtectionService {
	pub fn new(
		wrapper: Arc<ContentKeyWrapper>,
		codec: ContentEnvelopeCodec,
		storage: Arc<dyn ContentStorage>,
		access: Arc<dyn AccessControl>,
		sessions: Arc<SessionLifecycleMonitor>,
		audit: Arc<dyn AuditSink>,
		wrap_mode: KeyWrapMode,
	) -> Self {
		Self {
			wrapper,
			codec,
			storage,
			access,
			sessions,
			audit,
			wrap_mode,
			locks: UploadLocks::default(),
		}
	}

	fn wrap(&self, key: &ContentKey) -> DrmResult<ContentKeyRecord> {
		match self.wrap_mode {
			KeyWrapMode::Asymmetric => self.wrapper.wrap_for_storage(key),
			KeyWrapMode::Legacy => self.wrapper.wrap_legacy(key),
		}
	}

	/// Encrypt `plaintext` as the content of `upload_id`.
	///
	/// A previously protected upload gets a new key; the old wrap is kept as
	/// inactive history. On failure the previous content stays readable.
	pub async fn protect_upload(
		&self,
		upload_id: i64,
		plaintext: &[u8],
	) -> DrmResult<ProtectedUpload> {
		let _write = self.locks.write(upload_id).await;
		self.protect_locked(upload_id, plaintext).await
	}

	/// Caller must hold the upload's write lock.
	async fn protect_locked(
		&self,
		upload_id: i64,
		plaintext: &[u8],
	) -> DrmResult<ProtectedUpload> {
		let key = self.wrapper.mint_content_key();
		let record = self.wrap(&key)?;

		let envelope = self.codec.encrypt(plaintext, key.expose_secret())?;
		let staged = staged_path_for(upload_id);
		if let Err(e) = self.storage.write_bytes(&staged, &envelope).await {
			self.discard_staged(upload_id).await;
			return Err(e);
		}

		self.commit(upload_id, envelope.len() as u64, record).await
	}

	/// Streaming variant of [`Self::protect_upload`] for a document on disk.
	///
	/// Falls back to an in-memory pass when the storage has no local path.
	pub async fn protect_file(
		&self,
		upload_id: i64,
		source: PathBuf,
	) -> DrmResult<ProtectedUpload> {
		let _write = self.locks.write(upload_id).await;

		let Some(target) = self.storage.local_path(&staged_path_for(upload_id)) else {
			let plaintext = Zeroizing::new(tokio::fs::read(&source).await?);
			return self.protect_locked(upload_id, &plaintext).await;
		};

		let key = self.wrapper.mint_content_key();
		let record = self.wrap(&key)?;

		let codec = self.codec;
		let written = tokio::task::spawn_blocking(move || -> DrmResult<u64> {
			if let Some(parent) = target.parent() {
				std::fs::create_dir_all(parent)?;
			}
			let reader = BufReader::new(File::open(&source)?);
			let writer = BufWriter::new(File::create(&target)?);
			codec.encrypt_stream(reader, writer, key.expose_secret())
		})
		.await
		.map_err(|e| DrmError::crypto("protect_file", e.to_string()))
		.and_then(|result| result);

		match written {
			Ok(written) => self.commit(upload_id, written, record).await,
			Err(e) => {
				self.discard_staged(upload_id).await;
				Err(e)
			},
		}
	}

	/// Store the wrap for the staged envelope, then move the envelope into
	/// place. Caller must hold the upload's write lock.
	async fn commit(
		&self,
		upload_id: i64,
		envelope_bytes: u64,
		record: ContentKeyRecord,
	) -> DrmResult<ProtectedUpload> {
		let kind = record.kind();
		let row = match self.wrapper.mark_active(upload_id, record).await {
			Ok(row) => row,
			Err(e) => {
				self.discard_staged(upload_id).await;
				return Err(e);
			},
		};

		let path = envelope_path_for(upload_id);
		self.storage
			.rename(&staged_path_for(upload_id), &path)
			.await
			.inspect_err(|e| {
				tracing::error!(
					upload_id,
					error = %e,
					"New wrap is active but its envelope was not moved into place"
				)
			})?;

		AuditService::content_protected(upload_id, kind, envelope_bytes)
			.emit(self.audit.as_ref());

		Ok(ProtectedUpload {
			upload_id,
			path,
			envelope_bytes,
			key_id: row.key_id().map(str::to_string),
			wrap_id: row.id,
		})
	}

	async fn discard_staged(&self, upload_id: i64) {
		if let Err(e) = self.storage.remove(&staged_path_for(upload_id)).await {
			tracing::warn!(upload_id, error = %e, "Failed to remove staged envelope");
		}
	}

	/// Try to explain `failure` with a staged envelope. `Ok` means one was
	/// promoted and the read is worth repeating; otherwise `failure` is
	/// handed back. Caller must hold the upload's write lock.
	async fn recover_or(&self, upload_id: i64, failure: DrmError) -> DrmResult<()> {
		match self.recover_staged(upload_id).await {
			Ok(true) => Ok(()),
			Ok(false) => Err(failure),
			Err(e) => {
				tracing::warn!(upload_id, error = %e, "Could not check staged envelope");
				Err(failure)
			},
		}
	}

	/// Promote a staged envelope if it opens under the active key.
	///
	/// Caller must hold the upload's write lock. Returns whether an envelope
	/// was promoted.
	async fn recover_staged(&self, upload_id: i64) -> DrmResult<bool> {
		let staged = staged_path_for(upload_id);
		if !self.storage.exists(&staged).await? {
			return Ok(false);
		}

		let key = self.wrapper.active_content_key(upload_id).await?;
		let envelope = self.storage.read_bytes(&staged).await?;
		if self.codec.decrypt(&envelope, key.expose_secret()).is_err() {
			return Ok(false);
		}

		self.storage
			.rename(&staged, &envelope_path_for(upload_id))
			.await?;
		tracing::warn!(upload_id, "Promoted staged envelope left by an interrupted upload");
		Ok(true)
	}

	/// Re-encrypt an upload under a freshly minted content key
	pub async fn reencrypt_upload(&self, upload_id: i64) -> DrmResult<ProtectedUpload> {
		let _write = self.locks.write(upload_id).await;

		let plaintext = match self.open_envelope(upload_id).await {
			Err(e) if is_envelope_failure(&e) => match self.recover_or(upload_id, e).await {
				Ok(()) => self.open_envelope(upload_id).await,
				Err(e) => Err(e),
			},
			other => other,
		};
		let plaintext = self.audit_failure(upload_id, plaintext)?;

		self.protect_locked(upload_id, &plaintext).await
	}

	/// Decrypted document bytes for an authorized caller
	///
	/// # Errors
	/// - `Forbidden` when the caller may not read the upload
	/// - `SessionNotFound` / `SessionInactive` for a session caller
	/// - `InvalidContentKey` when no usable key is active
	/// - `Storage`, `MalformedEnvelope` or `Authentication` for bad envelopes
	pub async fn get_decrypted_bytes(
		&self,
		upload_id: i64,
		caller: &Caller,
	) -> DrmResult<Zeroizing<Vec<u8>>> {
		self.authorize(upload_id, caller).await?;

		let first = {
			let _read = self.locks.read(upload_id).await;
			self.open_envelope(upload_id).await
		};
		let result = match first {
			Err(e) if is_envelope_failure(&e) => {
				let _write = self.locks.write(upload_id).await;
				match self.recover_or(upload_id, e).await {
					Ok(()) => self.open_envelope(upload_id).await,
					Err(e) => Err(e),
				}
			},
			other => other,
		};

		self.audit_failure(upload_id, result)
	}

	/// Caller must hold one of the upload's locks.
	async fn open_envelope(&self, upload_id: i64) -> DrmResult<Zeroizing<Vec<u8>>> {
		let key = self.wrapper.active_content_key(upload_id).await?;
		let envelope = self
			.storage
			.read_bytes(&envelope_path_for(upload_id))
			.await?;
		self.codec.decrypt(&envelope, key.expose_secret())
	}

	fn audit_failure<T>(&self, upload_id: i64, result: DrmResult<T>) -> DrmResult<T> {
		if let Err(DrmError::Authentication { operation }) = &result {
			AuditService::authentication_failed(Some(upload_id), operation)
				.emit(self.audit.as_ref());
		}
		result
	}

	/// Check the stored envelope of `upload_id` against its active key without
	/// keeping any plaintext. Returns the plaintext length.
	pub async fn verify_upload(&self, upload_id: i64) -> DrmResult<u64> {
		let first = {
			let _read = self.locks.read(upload_id).await;
			self.verify_envelope(upload_id).await
		};
		let result = match first {
			Err(e) if is_envelope_failure(&e) => {
				let _write = self.locks.write(upload_id).await;
				match self.recover_or(upload_id, e).await {
					Ok(()) => self.verify_envelope(upload_id).await,
					Err(e) => Err(e),
				}
			},
			other => other,
		};

		self.audit_failure(upload_id, result)
	}

	/// Caller must hold one of the upload's locks.
	async fn verify_envelope(&self, upload_id: i64) -> DrmResult<u64> {
		let key = self.wrapper.active_content_key(upload_id).await?;
		let path = envelope_path_for(upload_id);
		let codec = self.codec;

		match self.storage.local_path(&path) {
			Some(local) => tokio::task::spawn_blocking(move || -> DrmResult<u64> {
				let reader = BufReader::new(File::open(&local)?);
				codec.decrypt_stream(reader, std::io::sink(), key.expose_secret())
			})
			.await
			.map_err(|e| DrmError::crypto("verify_upload", e.to_string()))?,
			None => {
				let envelope = self.storage.read_bytes(&path).await?;
				codec
					.decrypt(&envelope, key.expose_secret())
					.map(|plain| plain.len() as u64)
			},
		}
	}

	async fn authorize(&self, upload_id: i64, caller: &Caller) -> DrmResult<()> {
		match caller {
			Caller::Internal => Ok(()),
			Caller::Session(token) => {
				let session = self.sessions.require_active(token).await?;
				if session.upload_id != upload_id {
					AuditService::access_denied(&session.user_id, upload_id, "get_decrypted_bytes")
						.emit(self.audit.as_ref());
					return Err(DrmError::Forbidden {
						upload_id,
						user_id: session.user_id,
					});
				}
				Ok(())
			},
			Caller::User(user_id) => {
				if self.access.may_access(user_id, upload_id).await? {
					Ok(())
				} else {
					AuditService::access_denied(user_id, upload_id, "get_decrypted_bytes")
						.emit(self.audit.as_ref());
					Err(DrmError::Forbidden {
						upload_id,
						user_id: user_id.clone(),
					})
				}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use async_trait::async_trait;
	use secrecy::SecretString;
	use tempfile::TempDir;

	use super::*;
	use crate::{
		crypto::{
			keypair::tests::test_manager,
			services::{
				access_control::AccessControlService, audit::MemoryAuditSink,
				session_monitor::SessionPolicy,
			},
			sizes::{ENVELOPE_HEADER_SIZE, STREAM_CHUNK_SIZE},
		},
		db::{
			entity::{DrmAuditEventType, WrappedContentKey},
			query::{MemorySessionStore, MemoryWrappedKeyStore, WrappedKeyStore},
		},
		filesystem::LocalContentStorage,
	};

	/// Wrapped key store whose `fail_on`-th insert reports a full disk
	struct FailingKeyStore {
		inner: MemoryWrappedKeyStore,
		fail_on: usize,
		inserts: AtomicUsize,
	}

	impl FailingKeyStore {
		fn new(fail_on: usize) -> Self {
			Self {
				inner: MemoryWrappedKeyStore::new(),
				fail_on,
				inserts: AtomicUsize::new(0),
			}
		}
	}

	#[async_trait]
	impl WrappedKeyStore for FailingKeyStore {
		async fn insert_active(
			&self,
			upload_id: i64,
			record: ContentKeyRecord,
		) -> DrmResult<WrappedContentKey> {
			if self.inserts.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
				return Err(DrmError::Storage {
					path: format!("{upload_id}.keys.json"),
					message: "disk full".to_string(),
				});
			}
			self.inner.insert_active(upload_id, record).await
		}

		async fn insert_active_if(
			&self,
			upload_id: i64,
			expected_active_id: &str,
			record: ContentKeyRecord,
		) -> DrmResult<Option<WrappedContentKey>> {
			self.inner
				.insert_active_if(upload_id, expected_active_id, record)
				.await
		}

		async fn get_active(&self, upload_id: i64) -> DrmResult<Option<WrappedContentKey>> {
			self.inner.get_active(upload_id).await
		}

		async fn history(&self, upload_id: i64) -> DrmResult<Vec<WrappedContentKey>> {
			self.inner.history(upload_id).await
		}

		async fn list_active(&self) -> DrmResult<Vec<WrappedContentKey>> {
			self.inner.list_active().await
		}
	}

	struct Harness {
		service: DocumentProtectionService,
		wrapper: Arc<ContentKeyWrapper>,
		acl: Arc<AccessControlService>,
		sessions: Arc<SessionLifecycleMonitor>,
		audit: Arc<MemoryAuditSink>,
		dir: TempDir,
	}

	fn harness(wrap_mode: KeyWrapMode) -> Harness {
		harness_with(wrap_mode, Arc::new(MemoryWrappedKeyStore::new()))
	}

	fn harness_with(wrap_mode: KeyWrapMode, wraps: Arc<dyn WrappedKeyStore>) -> Harness {
		let dir = TempDir::new().unwrap();
		let audit = Arc::new(MemoryAuditSink::new(64));
		let codec = ContentEnvelopeCodec::new(1_000);
		let wrapper = Arc::new(ContentKeyWrapper::new(
			Arc::new(test_manager()),
			wraps,
			codec,
			Some(SecretString::new("master".to_string())),
		));
		let acl = Arc::new(AccessControlService::new());
		let sessions = Arc::new(SessionLifecycleMonitor::new(
			Arc::new(MemorySessionStore::new()),
			SessionPolicy::default(),
			audit.clone(),
		));
		let service = DocumentProtectionService::new(
			wrapper.clone(),
			codec,
			Arc::new(LocalContentStorage::new(dir.path())),
			acl.clone(),
			sessions.clone(),
			audit.clone(),
			wrap_mode,
		);
		Harness {
			service,
			wrapper,
			acl,
			sessions,
			audit,
			dir,
		}
	}

	#[tokio::test]
	async fn test_protect_and_read_back() {
		for mode in [KeyWrapMode::Asymmetric, KeyWrapMode::Legacy] {
			let h = harness(mode);
			let protected = h.service.protect_upload(42, b"lecture notes").await.unwrap();

			assert_eq!(protected.path, "42.enc");
			assert_eq!(protected.key_id.is_some(), mode == KeyWrapMode::Asymmetric);
			let on_disk = std::fs::read(h.dir.path().join("42.enc")).unwrap();
			assert_eq!(on_disk.len() as u64, protected.envelope_bytes);

			let plain = h
				.service
				.get_decrypted_bytes(42, &Caller::Internal)
				.await
				.unwrap();
			assert_eq!(plain.as_slice(), b"lecture notes");
			assert_eq!(h.audit.count(DrmAuditEventType::ContentProtected), 1);
		}
	}

	#[tokio::test]
	async fn test_reencrypt_supersedes_wrap() {
		let h = harness(KeyWrapMode::Asymmetric);
		let first = h.service.protect_upload(5, b"v1").await.unwrap();
		let second = h.service.reencrypt_upload(5).await.unwrap();

		assert_ne!(first.wrap_id, second.wrap_id);
		assert_eq!(h.wrapper.get_active(5).await.unwrap().id, second.wrap_id);
		let plain = h.service.get_decrypted_bytes(5, &Caller::Internal).await.unwrap();
		assert_eq!(plain.as_slice(), b"v1");
	}

	#[tokio::test]
	async fn test_user_and_session_callers() {
		let h = harness(KeyWrapMode::Asymmetric);
		h.service.protect_upload(8, b"chapter").await.unwrap();

		assert!(matches!(
			h.service
				.get_decrypted_bytes(8, &Caller::User("eve".into()))
				.await,
			Err(DrmError::Forbidden { .. })
		));
		h.acl.grant_access(8, "eve");
		assert!(h
			.service
			.get_decrypted_bytes(8, &Caller::User("eve".into()))
			.await
			.is_ok());

		let session = h
			.sessions
			.issue_session(8, "dev-1", "eve", vec![])
			.await
			.unwrap();
		let caller = Caller::Session(session.session_token.clone());
		assert!(h.service.get_decrypted_bytes(8, &caller).await.is_ok());
		assert!(matches!(
			h.service.get_decrypted_bytes(9, &caller).await,
			Err(DrmError::Forbidden { upload_id: 9, .. })
		));

		h.sessions.revoke(&session.session_token).await.unwrap();
		assert!(matches!(
			h.service.get_decrypted_bytes(8, &caller).await,
			Err(DrmError::SessionInactive)
		));
	}

	#[tokio::test]
	async fn test_tampered_envelope_is_audited() {
		let h = harness(KeyWrapMode::Asymmetric);
		h.service.protect_upload(3, b"do not touch").await.unwrap();

		let path = h.dir.path().join("3.enc");
		let mut bytes = std::fs::read(&path).unwrap();
		bytes[ENVELOPE_HEADER_SIZE] ^= 1;
		std::fs::write(&path, bytes).unwrap();

		assert!(matches!(
			h.service.get_decrypted_bytes(3, &Caller::Internal).await,
			Err(DrmError::Authentication { .. })
		));
		assert!(matches!(
			h.service.verify_upload(3).await,
			Err(DrmError::Authentication { .. })
		));
		assert_eq!(h.audit.count(DrmAuditEventType::AuthenticationFailed), 2);
	}

	#[tokio::test]
	async fn test_protect_file_streams_to_storage() {
		let h = harness(KeyWrapMode::Asymmetric);
		let source = h.dir.path().join("source.pdf");
		let document: Vec<u8> = (0..(STREAM_CHUNK_SIZE * 3 + 17))
			.map(|i| (i % 251) as u8)
			.collect();
		std::fs::write(&source, &document).unwrap();

		let protected = h.service.protect_file(77, source).await.unwrap();
		assert_eq!(
			protected.envelope_bytes as usize,
			document.len() + crate::crypto::sizes::ENVELOPE_MIN_SIZE
		);

		assert_eq!(h.service.verify_upload(77).await.unwrap() as usize, document.len());
		let plain = h.service.get_decrypted_bytes(77, &Caller::Internal).await.unwrap();
		assert_eq!(plain.as_slice(), document.as_slice());
	}

	#[tokio::test]
	async fn test_unknown_upload_has_no_key() {
		let h = harness(KeyWrapMode::Asymmetric);
		assert!(matches!(
			h.service.get_decrypted_bytes(1, &Caller::Internal).await,
			Err(DrmError::InvalidContentKey { upload_id: 1, .. })
		));
	}

	#[tokio::test]
	async fn test_failed_wrap_write_keeps_previous_content() {
		let h = harness_with(KeyWrapMode::Asymmetric, Arc::new(FailingKeyStore::new(2)));
		let first = h.service.protect_upload(5, b"original").await.unwrap();

		assert!(matches!(
			h.service.protect_upload(5, b"replacement").await,
			Err(DrmError::Storage { .. })
		));
		assert!(!h.dir.path().join("5.enc.staged").exists());
		assert_eq!(h.wrapper.get_active(5).await.unwrap().id, first.wrap_id);

		let plain = h.service.get_decrypted_bytes(5, &Caller::Internal).await.unwrap();
		assert_eq!(plain.as_slice(), b"original");
		assert_eq!(h.audit.count(DrmAuditEventType::AuthenticationFailed), 0);
		assert_eq!(h.audit.count(DrmAuditEventType::ContentProtected), 1);
	}

	#[tokio::test]
	async fn test_failed_wrap_write_on_streamed_upload() {
		let h = harness_with(KeyWrapMode::Asymmetric, Arc::new(FailingKeyStore::new(2)));
		let source = h.dir.path().join("source.txt");
		std::fs::write(&source, b"first draft").unwrap();
		h.service.protect_file(12, source.clone()).await.unwrap();

		std::fs::write(&source, b"second draft").unwrap();
		assert!(h.service.protect_file(12, source).await.is_err());
		assert!(!h.dir.path().join("12.enc.staged").exists());
		assert_eq!(h.service.verify_upload(12).await.unwrap(), 11);
	}

	#[tokio::test]
	async fn test_concurrent_reencrypts_stay_readable() {
		let wraps = Arc::new(MemoryWrappedKeyStore::new());
		let h = harness_with(KeyWrapMode::Asymmetric, wraps.clone());
		h.service.protect_upload(6, b"contended").await.unwrap();

		let (a, b, c) = tokio::join!(
			h.service.reencrypt_upload(6),
			h.service.reencrypt_upload(6),
			h.service.get_decrypted_bytes(6, &Caller::Internal),
		);
		assert!(a.is_ok() && b.is_ok());
		assert_eq!(c.unwrap().as_slice(), b"contended");

		let plain = h.service.get_decrypted_bytes(6, &Caller::Internal).await.unwrap();
		assert_eq!(plain.as_slice(), b"contended");
		let history = wraps.history(6).await.unwrap();
		assert_eq!(history.len(), 3);
		assert_eq!(history.iter().filter(|r| r.active).count(), 1);
		assert_eq!(h.audit.count(DrmAuditEventType::AuthenticationFailed), 0);
	}

	#[tokio::test]
	async fn test_staged_envelope_promoted_after_interrupted_upload() {
		let h = harness(KeyWrapMode::Asymmetric);
		h.service.protect_upload(4, b"v1").await.unwrap();

		// Crash after the new wrap was stored, before the envelope moved
		let key = h.wrapper.mint_content_key();
		let record = h.wrapper.wrap_for_storage(&key).unwrap();
		let envelope = ContentEnvelopeCodec::new(1_000)
			.encrypt(b"v2", key.expose_secret())
			.unwrap();
		std::fs::write(h.dir.path().join("4.enc.staged"), envelope).unwrap();
		h.wrapper.mark_active(4, record).await.unwrap();

		let plain = h.service.get_decrypted_bytes(4, &Caller::Internal).await.unwrap();
		assert_eq!(plain.as_slice(), b"v2");
		assert!(!h.dir.path().join("4.enc.staged").exists());
		assert_eq!(h.service.verify_upload(4).await.unwrap(), 2);
		assert_eq!(h.audit.count(DrmAuditEventType::AuthenticationFailed), 0);
	}

	#[tokio::test]
	async fn test_unrelated_staged_file_is_not_promoted() {
		let h = harness(KeyWrapMode::Asymmetric);
		h.service.protect_upload(2, b"keep me").await.unwrap();
		let path = h.dir.path().join("2.enc");
		let mut bytes = std::fs::read(&path).unwrap();
		bytes[ENVELOPE_HEADER_SIZE] ^= 1;
		std::fs::write(&path, bytes).unwrap();
		std::fs::write(h.dir.path().join("2.enc.staged"), b"not an envelope at all").unwrap();

		assert!(matches!(
			h.service.get_decrypted_bytes(2, &Caller::Internal).await,
			Err(DrmError::Authentication { .. })
		));
		assert!(h.dir.path().join("2.enc.staged").exists());
		assert_eq!(h.audit.count(DrmAuditEventType::AuthenticationFailed), 1);
	}
}

//! Content key wrapping
//!
//! Documents are always encrypted with their raw 256-bit content key through
//! the envelope codec. Only the key itself is protected with the slower
//! asymmetric primitive (or, for older records, the master-key envelope).
//! Both storage shapes are variants of one [`ContentKeyRecord`] with a single
//! unwrap path.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::{
	crypto::{
		envelope::ContentEnvelopeCodec,
		errors::{DrmError, DrmResult},
		keypair::{KeyPairManager, KeyRing},
		types::ContentKey,
	},
	db::{entity::WrappedContentKey, query::WrappedKeyStore},
};

/// Persisted form of a content key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentKeyRecord {
	/// Content envelope of the raw key under the configured master key
	Legacy {
		#[serde(with = "b64")]
		ciphertext: Vec<u8>,
	},
	/// RSA encryption of the raw key under the server keypair `key_id`
	Wrapped {
		key_id: String,
		#[serde(with = "b64")]
		ciphertext: Vec<u8>,
	},
}

impl ContentKeyRecord {
	pub fn key_id(&self) -> Option<&str> {
		match self {
			ContentKeyRecord::Legacy { .. } => None,
			ContentKeyRecord::Wrapped { key_id, .. } => Some(key_id),
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			ContentKeyRecord::Legacy { .. } => "legacy",
			ContentKeyRecord::Wrapped { .. } => "wrapped",
		}
	}
}

mod b64 {
	use base64::{engine::general_purpose::STANDARD, Engine};
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let encoded = String::deserialize(deserializer)?;
		STANDARD.decode(encoded).map_err(serde::de::Error::custom)
	}
}

/// Mints, wraps and unwraps per-document content keys and keeps the
/// one-active-wrap-per-upload bookkeeping.
pub struct ContentKeyWrapper {
	keypair: Arc<KeyPairManager>,
	store: Arc<dyn WrappedKeyStore>,
	codec: ContentEnvelopeCodec,
	master_key: Option<SecretString>,
}

impl ContentKeyWrapper {
	pub fn new(
		keypair: Arc<KeyPairManager>,
		store: Arc<dyn WrappedKeyStore>,
		codec: ContentEnvelopeCodec,
		master_key: Option<SecretString>,
	) -> Self {
		Self {
			keypair,
			store,
			codec,
			master_key,
		}
	}

	pub fn keypair(&self) -> &Arc<KeyPairManager> {
		&self.keypair
	}

	/// Fresh 256-bit key from the OS CSPRNG, zeroized on drop
	pub fn mint_content_key(&self) -> ContentKey {
		ContentKey::generate()
	}

	/// Wrap `key` under the current server keypair
	pub fn wrap_for_storage(&self, key: &ContentKey) -> DrmResult<ContentKeyRecord> {
		Self::wrap_with(&self.keypair.current(), self.keypair.padding(), key)
	}

	fn wrap_with(
		ring: &KeyRing,
		padding: crate::crypto::RsaPadding,
		key: &ContentKey,
	) -> DrmResult<ContentKeyRecord> {
		let ciphertext = ring.encrypt(padding, key.expose_secret())?;
		Ok(ContentKeyRecord::Wrapped {
			key_id: ring.key_id().to_string(),
			ciphertext,
		})
	}

	/// Wrap `key` with the master-key envelope used by older deployments
	///
	/// # Errors
	/// `KeyStore` when no master key is configured
	pub fn wrap_legacy(&self, key: &ContentKey) -> DrmResult<ContentKeyRecord> {
		let master = self.master_key.as_ref().ok_or_else(|| {
			DrmError::KeyStore("no master key configured for legacy wrapping".to_string())
		})?;
		let ciphertext = self
			.codec
			.encrypt(key.expose_secret(), master.expose_secret().as_bytes())?;
		Ok(ContentKeyRecord::Legacy { ciphertext })
	}

	/// Recover the raw content key from `record`.
	///
	/// Any failure is reported as `InvalidContentKey`. A record wrapped under a
	/// retired keypair generation fails here rather than being tried against
	/// the current key; [`Self::rewrap_active`] is the way to migrate it.
	pub fn unwrap(&self, upload_id: i64, record: &ContentKeyRecord) -> DrmResult<ContentKey> {
		Self::unwrap_with(
			&self.keypair.current(),
			self.keypair.padding(),
			&self.codec,
			self.master_key.as_ref(),
			upload_id,
			record,
		)
	}

	fn unwrap_with(
		ring: &KeyRing,
		padding: crate::crypto::RsaPadding,
		codec: &ContentEnvelopeCodec,
		master_key: Option<&SecretString>,
		upload_id: i64,
		record: &ContentKeyRecord,
	) -> DrmResult<ContentKey> {
		let result = match record {
			ContentKeyRecord::Wrapped { key_id, ciphertext } => {
				if key_id != ring.key_id() {
					return Err(DrmError::invalid_content_key(
						upload_id,
						"unwrap",
						format!(
							"wrapped under retired key {key_id}, current key is {}",
							ring.key_id()
						),
					));
				}
				ring.decrypt(padding, ciphertext)
					.and_then(|raw| ContentKey::from_slice(&raw))
			},
			ContentKeyRecord::Legacy { ciphertext } => {
				let Some(master) = master_key else {
					return Err(DrmError::invalid_content_key(
						upload_id,
						"unwrap_legacy",
						"no master key configured",
					));
				};
				codec
					.decrypt(ciphertext, master.expose_secret().as_bytes())
					.and_then(|raw| ContentKey::from_slice(&raw))
			},
		};

		result.map_err(|e| match e {
			DrmError::InvalidContentKey { .. } => e,
			other => DrmError::invalid_content_key(upload_id, "unwrap", other.to_string()),
		})
	}

	/// Make `record` the single active wrap for `upload_id`
	pub async fn mark_active(
		&self,
		upload_id: i64,
		record: ContentKeyRecord,
	) -> DrmResult<WrappedContentKey> {
		let row = self.store.insert_active(upload_id, record).await?;
		tracing::debug!(
			upload_id,
			wrap_id = %row.id,
			kind = row.record.kind(),
			"Marked content key wrap active"
		);
		Ok(row)
	}

	/// The active wrap for `upload_id`
	///
	/// # Errors
	/// `InvalidContentKey` when the upload has no active wrap
	pub async fn get_active(&self, upload_id: i64) -> DrmResult<WrappedContentKey> {
		self.store.get_active(upload_id).await?.ok_or_else(|| {
			DrmError::invalid_content_key(upload_id, "get_active", "no active content key")
		})
	}

	/// Active wraps across all uploads
	pub async fn list_active(&self) -> DrmResult<Vec<WrappedContentKey>> {
		self.store.list_active().await
	}

	/// Look up and unwrap the active content key for `upload_id`.
	///
	/// A wrap under a generation other than the one held here first makes the
	/// keypair catch up with the secret store, in case another process rotated.
	pub async fn active_content_key(&self, upload_id: i64) -> DrmResult<ContentKey> {
		let row = self.get_active(upload_id).await?;
		let current = self.keypair.current();
		if row.key_id().is_some_and(|id| id != current.key_id()) {
			self.sync_keypair().await?;
		}
		self.unwrap(upload_id, &row.record)
	}

	async fn sync_keypair(&self) -> DrmResult<bool> {
		let keypair = self.keypair.clone();
		tokio::task::spawn_blocking(move || keypair.sync_with_store())
			.await
			.map_err(|e| DrmError::KeyStore(format!("keypair sync panicked: {e}")))?
	}

	/// Re-wrap the wrap in `row` under the current keypair.
	///
	/// The generation `row` was wrapped under is looked up by key id, from
	/// this process or the secret store's archive. The new wrap is only stored
	/// while `row` is still the active wrap of its upload. Returns `None` when
	/// there was nothing to do: `row` is a legacy record, is already current,
	/// or was superseded in the meantime.
	pub async fn rewrap_active(
		&self,
		row: &WrappedContentKey,
	) -> DrmResult<Option<WrappedContentKey>> {
		let upload_id = row.upload_id;
		let current = self.keypair.current();
		let key_id = match row.key_id() {
			Some(key_id) if key_id != current.key_id() => key_id.to_string(),
			_ => return Ok(None),
		};

		let keypair = self.keypair.clone();
		let lookup = key_id.clone();
		let generation = tokio::task::spawn_blocking(move || keypair.generation(&lookup))
			.await
			.map_err(|e| DrmError::KeyStore(format!("keypair lookup panicked: {e}")))??
			.ok_or_else(|| {
				DrmError::invalid_content_key(
					upload_id,
					"rewrap",
					format!("keypair generation {key_id} is not available"),
				)
			})?;

		let key = Self::unwrap_with(
			&generation,
			self.keypair.padding(),
			&self.codec,
			self.master_key.as_ref(),
			upload_id,
			&row.record,
		)?;
		let record = Self::wrap_with(&current, self.keypair.padding(), &key)?;

		let stored = self.store.insert_active_if(upload_id, &row.id, record).await?;
		match &stored {
			Some(new_row) => tracing::debug!(
				upload_id,
				from = %key_id,
				to = %current.key_id(),
				wrap_id = %new_row.id,
				"Re-wrapped content key"
			),
			None => tracing::debug!(
				upload_id,
				wrap_id = %row.id,
				"Active wrap changed during re-wrap, leaving it in place"
			),
		}
		Ok(stored)
	}
}

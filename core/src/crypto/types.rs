//! Cryptographic type definitions with secure memory handling
//!
//! Type-safe wrappers for symmetric keys built on the `secrecy` and `zeroize`
//! crates so key bytes are wiped when dropped.

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{CryptoRng, RngCore};
use secrecy::{ExposeSecret, Secret};
use zeroize::Zeroize;

use crate::crypto::{
	errors::{DrmError, DrmResult},
	sizes::*,
};

/// Content key - one random 256-bit key per uploaded document
///
/// Used as the passphrase material for the document's content envelope. Only
/// ever persisted in wrapped form.
#[derive(Clone)]
pub struct ContentKey(Secret<[u8; AES_256_KEY_SIZE]>);

impl ContentKey {
	/// Mint a fresh key from the OS CSPRNG
	pub fn generate() -> Self {
		Self::generate_with(&mut rand::rngs::OsRng)
	}

	pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
		let mut bytes = [0u8; AES_256_KEY_SIZE];
		rng.fill_bytes(&mut bytes);
		Self::from_bytes(bytes)
	}

	pub fn from_bytes(mut bytes: [u8; AES_256_KEY_SIZE]) -> Self {
		let key = Self(Secret::new(bytes));
		bytes.zeroize();
		key
	}

	pub fn from_slice(bytes: &[u8]) -> DrmResult<Self> {
		if bytes.len() != AES_256_KEY_SIZE {
			return Err(DrmError::crypto(
				"content_key",
				format!(
					"expected {} key bytes, got {}",
					AES_256_KEY_SIZE,
					bytes.len()
				),
			));
		}

		let mut key_bytes = [0u8; AES_256_KEY_SIZE];
		key_bytes.copy_from_slice(bytes);
		Ok(Self::from_bytes(key_bytes))
	}

	pub fn expose_secret(&self) -> &[u8; AES_256_KEY_SIZE] {
		self.0.expose_secret()
	}
}

impl std::fmt::Debug for ContentKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("ContentKey([REDACTED])")
	}
}

/// Ephemeral key - the 256-bit key a client sends (RSA-encrypted) during key
/// exchange. The content key is re-encrypted under it before leaving the server.
pub struct EphemeralKey(Secret<[u8; AES_256_KEY_SIZE]>);

impl EphemeralKey {
	pub fn from_slice(bytes: &[u8]) -> DrmResult<Self> {
		if bytes.len() != AES_256_KEY_SIZE {
			return Err(DrmError::crypto(
				"ephemeral_key",
				format!(
					"expected {} key bytes, got {}",
					AES_256_KEY_SIZE,
					bytes.len()
				),
			));
		}

		let mut key_bytes = [0u8; AES_256_KEY_SIZE];
		key_bytes.copy_from_slice(bytes);
		let key = Self(Secret::new(key_bytes));
		key_bytes.zeroize();
		Ok(key)
	}

	pub fn expose_secret(&self) -> &[u8; AES_256_KEY_SIZE] {
		self.0.expose_secret()
	}

	/// Encrypt `key` for the holder of this ephemeral key.
	///
	/// Output is `nonce(12) ‖ ciphertext‖tag`, base64-encoded.
	pub fn seal_content_key(&self, key: &ContentKey) -> DrmResult<String> {
		use aes_gcm::{
			aead::{Aead, AeadCore, KeyInit, OsRng},
			Aes256Gcm,
		};

		let cipher = Aes256Gcm::new(self.expose_secret().into());
		let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

		let ciphertext = cipher
			.encrypt(&nonce, key.expose_secret().as_ref())
			.map_err(|e| DrmError::crypto("seal_content_key", e.to_string()))?;

		let mut sealed = Vec::with_capacity(AES_GCM_NONCE_SIZE + ciphertext.len());
		sealed.extend_from_slice(nonce.as_slice());
		sealed.extend_from_slice(&ciphertext);
		Ok(STANDARD.encode(sealed))
	}

	/// Inverse of [`EphemeralKey::seal_content_key`], as a client would run it
	pub fn open_content_key(&self, sealed_b64: &str) -> DrmResult<ContentKey> {
		use aes_gcm::{
			aead::{Aead, KeyInit},
			Aes256Gcm, Nonce,
		};

		let sealed = STANDARD
			.decode(sealed_b64)
			.map_err(|e| DrmError::crypto("open_content_key", e.to_string()))?;
		if sealed.len() < AES_GCM_NONCE_SIZE + AES_GCM_TAG_SIZE {
			return Err(DrmError::crypto("open_content_key", "sealed key too short"));
		}

		let (nonce, ciphertext) = sealed.split_at(AES_GCM_NONCE_SIZE);
		let cipher = Aes256Gcm::new(self.expose_secret().into());
		#[allow(deprecated)]
		let plaintext = zeroize::Zeroizing::new(
			cipher
				.decrypt(Nonce::from_slice(nonce), ciphertext)
				.map_err(|_| DrmError::Authentication {
					operation: "open_content_key",
				})?,
		);

		ContentKey::from_slice(&plaintext)
	}
}

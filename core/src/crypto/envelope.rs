//! Content envelope encryption and decryption
//!
//! Documents are stored as a single contiguous blob:
//!
//! ```text
//!  0..16   salt        PBKDF2 salt (random, per envelope)
//! 16..28   iv          AES-GCM nonce (random, per envelope)
//! 28..     ciphertext  AES-256-GCM output with the 16-byte tag appended
//! ```
//!
//! The encryption key is derived from the passphrase with PBKDF2-HMAC-SHA256.
//! For documents the passphrase is the raw 256-bit content key.

use std::io::{Read, Seek, Write};

use aes_gcm::{
	aead::{Aead, KeyInit},
	Aes256Gcm, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::{
	errors::{DrmError, DrmResult},
	sizes::*,
	stream,
	versions::PBKDF2_ITERATIONS,
};

/// Random per-envelope parameters. Split out so tests can pin them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct EnvelopeParams {
	pub salt: [u8; PBKDF2_SALT_SIZE],
	pub iv: [u8; AES_GCM_NONCE_SIZE],
}

impl EnvelopeParams {
	pub(crate) fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
		let mut salt = [0u8; PBKDF2_SALT_SIZE];
		rng.fill_bytes(&mut salt);
		let mut iv = [0u8; AES_GCM_NONCE_SIZE];
		rng.fill_bytes(&mut iv);
		Self { salt, iv }
	}

	/// Split the fixed-length header off an envelope.
	///
	/// Fails structurally, before any key derivation, when the envelope cannot
	/// even hold a header and a tag.
	pub(crate) fn parse(envelope: &[u8]) -> DrmResult<(Self, &[u8])> {
		if envelope.len() < ENVELOPE_MIN_SIZE {
			return Err(DrmError::MalformedEnvelope(format!(
				"envelope is {} bytes, need at least {}",
				envelope.len(),
				ENVELOPE_MIN_SIZE
			)));
		}

		let mut header = [0u8; ENVELOPE_HEADER_SIZE];
		header.copy_from_slice(&envelope[..ENVELOPE_HEADER_SIZE]);
		let (params, _) = Self::parse_header(&header);

		Ok((params, &envelope[ENVELOPE_HEADER_SIZE..]))
	}

	pub(crate) fn parse_header(header: &[u8; ENVELOPE_HEADER_SIZE]) -> (Self, usize) {
		let mut salt = [0u8; PBKDF2_SALT_SIZE];
		salt.copy_from_slice(&header[..PBKDF2_SALT_SIZE]);
		let mut iv = [0u8; AES_GCM_NONCE_SIZE];
		iv.copy_from_slice(&header[PBKDF2_SALT_SIZE..]);

		(Self { salt, iv }, ENVELOPE_HEADER_SIZE)
	}

	pub(crate) fn header(&self) -> [u8; ENVELOPE_HEADER_SIZE] {
		let mut header = [0u8; ENVELOPE_HEADER_SIZE];
		header[..PBKDF2_SALT_SIZE].copy_from_slice(&self.salt);
		header[PBKDF2_SALT_SIZE..].copy_from_slice(&self.iv);
		header
	}
}

/// Authenticated symmetric codec for document bytes
#[derive(Debug, Clone, Copy)]
pub struct ContentEnvelopeCodec {
	iterations: u32,
}

impl Default for ContentEnvelopeCodec {
	fn default() -> Self {
		Self {
			iterations: PBKDF2_ITERATIONS,
		}
	}
}

impl ContentEnvelopeCodec {
	pub fn new(iterations: u32) -> Self {
		Self {
			iterations: iterations.max(1),
		}
	}

	pub fn iterations(&self) -> u32 {
		self.iterations
	}

	/// Derive the 256-bit envelope key from `passphrase` and `salt`.
	///
	/// An empty passphrase is accepted; rejecting weak passphrases is a caller
	/// policy.
	pub(crate) fn derive_key(
		&self,
		passphrase: &[u8],
		salt: &[u8; PBKDF2_SALT_SIZE],
	) -> Zeroizing<[u8; AES_256_KEY_SIZE]> {
		let mut key = Zeroizing::new([0u8; AES_256_KEY_SIZE]);
		pbkdf2_hmac::<Sha256>(passphrase, salt, self.iterations, &mut key[..]);
		key
	}

	/// Encrypt `plaintext` into a new envelope with a fresh salt and IV
	pub fn encrypt(&self, plaintext: &[u8], passphrase: &[u8]) -> DrmResult<Vec<u8>> {
		self.encrypt_with_rng(&mut rand::rngs::OsRng, plaintext, passphrase)
	}

	pub fn encrypt_with_rng<R: RngCore + CryptoRng>(
		&self,
		rng: &mut R,
		plaintext: &[u8],
		passphrase: &[u8],
	) -> DrmResult<Vec<u8>> {
		let params = EnvelopeParams::generate(rng);
		self.encrypt_with_params(&params, plaintext, passphrase)
	}

	pub(crate) fn encrypt_with_params(
		&self,
		params: &EnvelopeParams,
		plaintext: &[u8],
		passphrase: &[u8],
	) -> DrmResult<Vec<u8>> {
		let key = self.derive_key(passphrase, &params.salt);
		let cipher = Aes256Gcm::new((&*key).into());
		#[allow(deprecated)]
		let nonce = Nonce::from_slice(&params.iv);

		let ciphertext = cipher
			.encrypt(nonce, plaintext)
			.map_err(|e| DrmError::crypto("envelope_encrypt", e.to_string()))?;

		let mut envelope = Vec::with_capacity(ENVELOPE_HEADER_SIZE + ciphertext.len());
		envelope.extend_from_slice(&params.header());
		envelope.extend_from_slice(&ciphertext);
		Ok(envelope)
	}

	/// Decrypt an envelope produced by [`ContentEnvelopeCodec::encrypt`]
	///
	/// # Errors
	/// - `MalformedEnvelope` when the blob is shorter than header + tag
	/// - `Authentication` when the GCM tag does not verify
	pub fn decrypt(
		&self,
		envelope: &[u8],
		passphrase: &[u8],
	) -> DrmResult<Zeroizing<Vec<u8>>> {
		let (params, ciphertext) = EnvelopeParams::parse(envelope)?;

		let key = self.derive_key(passphrase, &params.salt);
		let cipher = Aes256Gcm::new((&*key).into());
		#[allow(deprecated)]
		let nonce = Nonce::from_slice(&params.iv);

		let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| {
			tracing::warn!(
				target: "drm::audit",
				operation = "envelope_decrypt",
				"Envelope authentication tag did not verify"
			);
			DrmError::Authentication {
				operation: "envelope_decrypt",
			}
		})?;

		Ok(Zeroizing::new(plaintext))
	}

	/// Streaming counterpart of [`ContentEnvelopeCodec::encrypt`].
	///
	/// Reads `reader` in fixed-size chunks and writes the envelope to `writer`.
	/// Returns the number of envelope bytes written.
	pub fn encrypt_stream<R: Read, W: Write>(
		&self,
		reader: R,
		writer: W,
		passphrase: &[u8],
	) -> DrmResult<u64> {
		self.encrypt_stream_with_rng(&mut rand::rngs::OsRng, reader, writer, passphrase)
	}

	pub fn encrypt_stream_with_rng<G, R, W>(
		&self,
		rng: &mut G,
		reader: R,
		writer: W,
		passphrase: &[u8],
	) -> DrmResult<u64>
	where
		G: RngCore + CryptoRng,
		R: Read,
		W: Write,
	{
		let params = EnvelopeParams::generate(rng);
		let key = self.derive_key(passphrase, &params.salt);
		stream::encrypt(&key, &params, reader, writer)
	}

	/// Streaming counterpart of [`ContentEnvelopeCodec::decrypt`].
	///
	/// The tag is verified over the whole ciphertext before any plaintext is
	/// written, which is why the source must be seekable.
	pub fn decrypt_stream<R: Read + Seek, W: Write>(
		&self,
		reader: R,
		writer: W,
		passphrase: &[u8],
	) -> DrmResult<u64> {
		stream::decrypt(self, reader, writer, passphrase)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::{rngs::StdRng, SeedableRng};

	// Keep the unit tests fast; the production count is exercised separately.
	fn codec() -> ContentEnvelopeCodec {
		ContentEnvelopeCodec::new(1_000)
	}

	#[test]
	fn test_envelope_roundtrip() {
		let plaintext = b"Chapter 1. It was a bright cold day in April.";
		let envelope = codec().encrypt(plaintext, b"passphrase").unwrap();

		assert_eq!(
			envelope.len(),
			ENVELOPE_HEADER_SIZE + plaintext.len() + AES_GCM_TAG_SIZE
		);

		let decrypted = codec().decrypt(&envelope, b"passphrase").unwrap();
		assert_eq!(decrypted.as_slice(), plaintext);
	}

	#[test]
	fn test_default_iteration_count_roundtrip() {
		let codec = ContentEnvelopeCodec::default();
		assert_eq!(codec.iterations(), PBKDF2_ITERATIONS);

		let envelope = codec.encrypt(b"payload", b"k").unwrap();
		assert_eq!(codec.decrypt(&envelope, b"k").unwrap().as_slice(), b"payload");
	}

	#[test]
	fn test_empty_plaintext_and_empty_passphrase() {
		let envelope = codec().encrypt(b"", b"").unwrap();
		assert_eq!(envelope.len(), ENVELOPE_MIN_SIZE);

		let decrypted = codec().decrypt(&envelope, b"").unwrap();
		assert!(decrypted.is_empty());
	}

	#[test]
	fn test_wrong_passphrase_is_authentication_error() {
		let envelope = codec().encrypt(b"secret", b"right").unwrap();
		let result = codec().decrypt(&envelope, b"wrong");
		assert!(matches!(result, Err(DrmError::Authentication { .. })));
	}

	#[test]
	fn test_every_ciphertext_bit_flip_is_detected() {
		let plaintext = b"tamper target";
		let envelope = codec().encrypt(plaintext, b"pw").unwrap();

		for byte in ENVELOPE_HEADER_SIZE..envelope.len() {
			for bit in 0..8 {
				let mut tampered = envelope.clone();
				tampered[byte] ^= 1 << bit;
				let result = codec().decrypt(&tampered, b"pw");
				assert!(
					matches!(result, Err(DrmError::Authentication { .. })),
					"flip at byte {byte} bit {bit} was not detected"
				);
			}
		}
	}

	#[test]
	fn test_truncated_envelope_is_structural_error() {
		let envelope = codec().encrypt(b"data", b"pw").unwrap();

		for len in [0, 1, ENVELOPE_HEADER_SIZE - 1, ENVELOPE_HEADER_SIZE] {
			let result = codec().decrypt(&envelope[..len], b"pw");
			assert!(
				matches!(result, Err(DrmError::MalformedEnvelope(_))),
				"length {len} should be rejected structurally"
			);
		}
	}

	#[test]
	fn test_fresh_salt_and_iv_per_envelope() {
		let e1 = codec().encrypt(b"same", b"pw").unwrap();
		let e2 = codec().encrypt(b"same", b"pw").unwrap();
		assert_ne!(e1[..ENVELOPE_HEADER_SIZE], e2[..ENVELOPE_HEADER_SIZE]);
		assert_ne!(e1, e2);
	}

	#[test]
	fn test_seeded_rng_is_deterministic() {
		let e1 = codec()
			.encrypt_with_rng(&mut StdRng::seed_from_u64(1), b"doc", b"pw")
			.unwrap();
		let e2 = codec()
			.encrypt_with_rng(&mut StdRng::seed_from_u64(1), b"doc", b"pw")
			.unwrap();
		assert_eq!(e1, e2);
	}
}

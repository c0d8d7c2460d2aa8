//! # Content-protection cryptography
//!
//! Everything that touches key material lives under this module.
//!
//! ## Architecture Overview
//!
//! - **Server keypair**: RSA-2048, persisted through a [`SecretStore`], rotated
//!   periodically by the [`KeyPairManager`]
//! - **Content key**: 256-bit random key minted per uploaded document, stored
//!   only in wrapped form (RSA or legacy master-key envelope)
//! - **Content envelope**: `salt ‖ iv ‖ ciphertext‖tag`, AES-256-GCM under a key
//!   derived with PBKDF2-HMAC-SHA256
//!
//! ## Key Technologies
//!
//! - `rsa` with PKCS#1 v1.5 (default) or OAEP-SHA256 for key wrapping
//! - `aes-gcm` for single-shot envelopes, `aes`/`ctr`/`ghash` for streaming
//! - `pbkdf2` + `sha2` for passphrase derivation
//! - `zeroize` and `secrecy` crates for memory safety

pub mod envelope;
pub mod errors;
pub mod keypair;
pub mod secret_store;
pub mod services;
pub mod stream;
pub mod types;
pub mod wrap;

pub use envelope::ContentEnvelopeCodec;
pub use errors::{DrmError, DrmResult};
pub use keypair::{KeyPairManager, KeyRing, RotationOutcome, RsaPadding};
pub use secret_store::{FileSecretStore, KeyMaterial, MemorySecretStore, SecretStore};
pub use types::{ContentKey, EphemeralKey};
pub use wrap::{ContentKeyRecord, ContentKeyWrapper};

pub use secrecy::{ExposeSecret, Secret};
pub use zeroize::{Zeroize, Zeroizing};

/// Size constants for cryptographic keys, nonces and envelope fields
pub mod sizes {
	/// AES-256 key size (32 bytes)
	pub const AES_256_KEY_SIZE: usize = 32;

	/// AES-GCM nonce size (12 bytes)
	pub const AES_GCM_NONCE_SIZE: usize = 12;

	/// AES-GCM tag size (16 bytes)
	pub const AES_GCM_TAG_SIZE: usize = 16;

	/// PBKDF2 salt size (16 bytes)
	pub const PBKDF2_SALT_SIZE: usize = 16;

	/// Fixed envelope header: salt followed by IV
	pub const ENVELOPE_HEADER_SIZE: usize = PBKDF2_SALT_SIZE + AES_GCM_NONCE_SIZE;

	/// Smallest valid envelope (empty plaintext)
	pub const ENVELOPE_MIN_SIZE: usize = ENVELOPE_HEADER_SIZE + AES_GCM_TAG_SIZE;

	/// Chunk size used by the streaming codec (8 KiB, a multiple of the AES block)
	pub const STREAM_CHUNK_SIZE: usize = 8 * 1024;

	/// Default RSA modulus size in bits
	pub const RSA_KEY_BITS: usize = 2048;
}

/// Tunable parameters for cryptographic operations
pub mod versions {
	/// Default PBKDF2-HMAC-SHA256 iteration count
	pub const PBKDF2_ITERATIONS: u32 = 65_536;

	/// Default rotation period for the server keypair
	pub const KEY_ROTATION_DAYS: i64 = 90;
}

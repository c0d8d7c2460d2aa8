//! Chunked AES-256-GCM for large documents
//!
//! `aes-gcm` only offers one-shot AEAD, so the streaming path assembles GCM
//! from the same primitives it is built on (AES-CTR with a 32-bit big-endian
//! counter and GHASH). With a 96-bit IV the output is byte-identical to the
//! one-shot codec.
//!
//! Every chunk except the last is exactly `STREAM_CHUNK_SIZE` bytes, a multiple
//! of the AES block size, so padding GHASH input per chunk is equivalent to
//! padding the whole ciphertext once.

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use aes::{
	cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher},
	Aes256, Block,
};
use ghash::{universal_hash::UniversalHash, GHash};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypto::{
	envelope::{ContentEnvelopeCodec, EnvelopeParams},
	errors::{DrmError, DrmResult},
	sizes::*,
};

type Aes256Ctr32 = ctr::Ctr32BE<Aes256>;

/// Per-envelope GCM state: keystream, authenticator and the tag mask E(K, J0)
struct GcmState {
	keystream: Aes256Ctr32,
	ghash: GHash,
	tag_mask: Block,
	ciphertext_len: u64,
}

impl GcmState {
	fn new(key: &[u8; AES_256_KEY_SIZE], iv: &[u8; AES_GCM_NONCE_SIZE]) -> Self {
		let cipher = Aes256::new(key.into());

		let mut hash_key = Block::default();
		cipher.encrypt_block(&mut hash_key);

		// J0 = IV ‖ 0^31 ‖ 1
		let mut j0 = Block::default();
		j0[..AES_GCM_NONCE_SIZE].copy_from_slice(iv);
		j0[15] = 1;

		let mut tag_mask = j0;
		cipher.encrypt_block(&mut tag_mask);

		// Payload keystream starts at inc32(J0)
		let mut counter = j0;
		counter[15] = 2;

		Self {
			keystream: Aes256Ctr32::new(key.into(), &counter),
			ghash: <GHash as ghash::universal_hash::KeyInit>::new(&hash_key),
			tag_mask,
			ciphertext_len: 0,
		}
	}

	fn apply_keystream(&mut self, chunk: &mut [u8]) -> DrmResult<()> {
		self.keystream
			.try_apply_keystream(chunk)
			.map_err(|_| DrmError::crypto("stream_cipher", "keystream exhausted"))
	}

	fn authenticate(&mut self, ciphertext: &[u8]) {
		self.ghash.update_padded(ciphertext);
		self.ciphertext_len += ciphertext.len() as u64;
	}

	fn tag(mut self) -> [u8; AES_GCM_TAG_SIZE] {
		// No associated data: len(A) = 0, len(C) in bits
		let mut lengths = Block::default();
		lengths[8..].copy_from_slice(&(self.ciphertext_len * 8).to_be_bytes());
		self.ghash.update(&[lengths]);

		let s = self.ghash.finalize();
		let mut tag = [0u8; AES_GCM_TAG_SIZE];
		for (i, byte) in tag.iter_mut().enumerate() {
			*byte = s[i] ^ self.tag_mask[i];
		}
		tag
	}
}

/// Fill `buf` from `reader`, stopping early only at EOF.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
	let mut filled = 0;
	while filled < buf.len() {
		match reader.read(&mut buf[filled..]) {
			Ok(0) => break,
			Ok(n) => filled += n,
			Err(e) if e.kind() == ErrorKind::Interrupted => continue,
			Err(e) => return Err(e),
		}
	}
	Ok(filled)
}

pub(crate) fn encrypt<R: Read, W: Write>(
	key: &[u8; AES_256_KEY_SIZE],
	params: &EnvelopeParams,
	mut reader: R,
	mut writer: W,
) -> DrmResult<u64> {
	let mut state = GcmState::new(key, &params.iv);
	let mut buf = Zeroizing::new(vec![0u8; STREAM_CHUNK_SIZE]);

	writer.write_all(&params.header())?;
	let mut written = ENVELOPE_HEADER_SIZE as u64;

	loop {
		let n = read_chunk(&mut reader, &mut buf)?;
		if n == 0 {
			break;
		}

		let chunk = &mut buf[..n];
		state.apply_keystream(chunk)?;
		state.authenticate(chunk);
		writer.write_all(chunk)?;
		written += n as u64;

		if n < STREAM_CHUNK_SIZE {
			break;
		}
	}

	writer.write_all(&state.tag())?;
	writer.flush()?;

	Ok(written + AES_GCM_TAG_SIZE as u64)
}

pub(crate) fn decrypt<R: Read + Seek, W: Write>(
	codec: &ContentEnvelopeCodec,
	mut reader: R,
	mut writer: W,
	passphrase: &[u8],
) -> DrmResult<u64> {
	let start = reader.stream_position()?;
	let end = reader.seek(SeekFrom::End(0))?;
	let total = end.saturating_sub(start);

	if total < ENVELOPE_MIN_SIZE as u64 {
		return Err(DrmError::MalformedEnvelope(format!(
			"envelope is {} bytes, need at least {}",
			total, ENVELOPE_MIN_SIZE
		)));
	}

	reader.seek(SeekFrom::Start(start))?;
	let mut header = [0u8; ENVELOPE_HEADER_SIZE];
	reader.read_exact(&mut header)?;
	let (params, _) = EnvelopeParams::parse_header(&header);

	let ciphertext_len = total - ENVELOPE_MIN_SIZE as u64;
	let key = codec.derive_key(passphrase, &params.salt);
	let mut buf = Zeroizing::new(vec![0u8; STREAM_CHUNK_SIZE]);

	// Pass 1: authenticate everything before releasing any plaintext
	let mut state = GcmState::new(&key, &params.iv);
	let mut remaining = ciphertext_len;
	while remaining > 0 {
		let n = remaining.min(STREAM_CHUNK_SIZE as u64) as usize;
		reader.read_exact(&mut buf[..n])?;
		state.authenticate(&buf[..n]);
		remaining -= n as u64;
	}

	let mut stored_tag = [0u8; AES_GCM_TAG_SIZE];
	reader.read_exact(&mut stored_tag)?;

	if !bool::from(state.tag()[..].ct_eq(&stored_tag[..])) {
		tracing::warn!(
			target: "drm::audit",
			operation = "envelope_decrypt_stream",
			"Envelope authentication tag did not verify"
		);
		return Err(DrmError::Authentication {
			operation: "envelope_decrypt_stream",
		});
	}

	// Pass 2: decrypt
	reader.seek(SeekFrom::Start(start + ENVELOPE_HEADER_SIZE as u64))?;
	let mut state = GcmState::new(&key, &params.iv);
	let mut remaining = ciphertext_len;
	while remaining > 0 {
		let n = remaining.min(STREAM_CHUNK_SIZE as u64) as usize;
		let chunk = &mut buf[..n];
		reader.read_exact(chunk)?;
		state.apply_keystream(chunk)?;
		writer.write_all(chunk)?;
		remaining -= n as u64;
	}
	writer.flush()?;

	Ok(ciphertext_len)
}

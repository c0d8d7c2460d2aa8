use std::sync::Arc;

use drm_core::{config::DrmConfig, crypto::MemorySecretStore, CoreParts, DrmCore};
use secrecy::SecretString;
use tempfile::TempDir;

use crate::config::state::AppState;

pub(crate) const TEST_INTERNAL_TOKEN: &str = "internal-test-token";

/// Engine on a temp directory with a small keypair and a cheap KDF
pub(crate) async fn test_state() -> (AppState, TempDir) {
	let dir = TempDir::new().expect("create temp dir");
	let mut config = DrmConfig::new(dir.path());
	config.rsa_key_bits = 1024;
	config.pbkdf2_iterations = 1_000;
	config.internal_token = Some(SecretString::new(TEST_INTERNAL_TOKEN.to_string()));

	let parts = CoreParts {
		secret_store: Some(Arc::new(MemorySecretStore::new())),
		..Default::default()
	};
	let core = DrmCore::with_parts(config, parts)
		.await
		.expect("build test engine");

	(AppState::new(core.get_context()), dir)
}

//! Durable storage for the server keypair
//!
//! A [`SecretStore`] persists PEM-encoded key halves plus creation metadata
//! under an alias. Rotation archives the current generation under a suffix
//! before the replacement is saved; archived generations are never removed.

use std::{
	collections::HashMap,
	fs,
	io::Write,
	path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::errors::{DrmError, DrmResult};

/// Creation metadata persisted next to a keypair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
	pub alias: String,
	pub created_at: DateTime<Utc>,
	pub rotation_period_days: i64,
	pub key_size: usize,
}

/// One generation of the server keypair as it sits in storage
#[derive(Clone)]
pub struct KeyMaterial {
	/// PKCS#8 PEM, wiped from memory on drop
	pub private_key_pem: Zeroizing<String>,
	/// SubjectPublicKeyInfo PEM
	pub public_key_pem: String,
	pub metadata: KeyMetadata,
}

impl std::fmt::Debug for KeyMaterial {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KeyMaterial")
			.field("private_key_pem", &"[REDACTED]")
			.field("public_key_pem", &self.public_key_pem)
			.field("metadata", &self.metadata)
			.finish()
	}
}

/// Storage seam for the server keypair
///
/// Implementations must not regenerate or repair material: anything that
/// cannot be read back faithfully is reported as [`DrmError::KeyStore`].
pub trait SecretStore: Send + Sync {
	/// Load the current generation, `None` if nothing was ever saved
	fn load(&self, alias: &str) -> DrmResult<Option<KeyMaterial>>;

	/// Persist `material` as the current generation, replacing any previous one
	fn save(&self, alias: &str, material: &KeyMaterial) -> DrmResult<()>;

	/// Copy the current generation aside under `suffix`
	fn archive(&self, alias: &str, suffix: &str) -> DrmResult<()>;

	/// Suffixes of archived generations, oldest first
	fn archived(&self, alias: &str) -> DrmResult<Vec<String>>;

	/// Load the generation archived under `suffix`, `None` if there is none
	fn load_archived(&self, alias: &str, suffix: &str) -> DrmResult<Option<KeyMaterial>>;
}

fn keystore_err(path: &Path, e: impl std::fmt::Display) -> DrmError {
	DrmError::KeyStore(format!("{}: {}", path.display(), e))
}

#[cfg(unix)]
fn restrict_permissions(options: &mut fs::OpenOptions, private: bool) {
	use std::os::unix::fs::OpenOptionsExt;
	if private {
		options.mode(0o600);
	}
}

#[cfg(not(unix))]
fn restrict_permissions(_options: &mut fs::OpenOptions, _private: bool) {}

/// File-backed store: `{alias}.private.pem`, `{alias}.public.pem` and
/// `{alias}.meta.json` inside one directory
pub struct FileSecretStore {
	root: PathBuf,
}

impl FileSecretStore {
	pub fn new<P: AsRef<Path>>(root: P) -> DrmResult<Self> {
		let root = root.as_ref().to_path_buf();
		fs::create_dir_all(&root).map_err(|e| keystore_err(&root, e))?;
		Ok(Self { root })
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn paths_for(&self, stem: &str) -> [PathBuf; 3] {
		[
			self.root.join(format!("{stem}.private.pem")),
			self.root.join(format!("{stem}.public.pem")),
			self.root.join(format!("{stem}.meta.json")),
		]
	}

	/// Write via a temporary file and rename so readers never see a torn file.
	fn write_atomic(path: &Path, contents: &[u8], private: bool) -> DrmResult<()> {
		let tmp = path.with_extension("tmp");

		let mut options = fs::OpenOptions::new();
		options.write(true).create(true).truncate(true);
		restrict_permissions(&mut options, private);

		let mut file = options.open(&tmp).map_err(|e| keystore_err(&tmp, e))?;
		file.write_all(contents).map_err(|e| keystore_err(&tmp, e))?;
		file.sync_all().map_err(|e| keystore_err(&tmp, e))?;
		drop(file);

		fs::rename(&tmp, path).map_err(|e| keystore_err(path, e))
	}

	fn read_generation(&self, stem: &str) -> DrmResult<Option<KeyMaterial>> {
		let [private_path, public_path, meta_path] = self.paths_for(stem);

		let present = [&private_path, &public_path, &meta_path]
			.iter()
			.filter(|p| p.exists())
			.count();
		if present == 0 {
			return Ok(None);
		}
		if present != 3 {
			return Err(DrmError::KeyStore(format!(
				"incomplete key material for '{stem}' in {}",
				self.root.display()
			)));
		}

		let private_key_pem = Zeroizing::new(
			fs::read_to_string(&private_path).map_err(|e| keystore_err(&private_path, e))?,
		);
		let public_key_pem =
			fs::read_to_string(&public_path).map_err(|e| keystore_err(&public_path, e))?;
		let meta_raw =
			fs::read_to_string(&meta_path).map_err(|e| keystore_err(&meta_path, e))?;
		let metadata: KeyMetadata =
			serde_json::from_str(&meta_raw).map_err(|e| keystore_err(&meta_path, e))?;

		Ok(Some(KeyMaterial {
			private_key_pem,
			public_key_pem,
			metadata,
		}))
	}
}

impl SecretStore for FileSecretStore {
	fn load(&self, alias: &str) -> DrmResult<Option<KeyMaterial>> {
		self.read_generation(alias)
	}

	fn save(&self, alias: &str, material: &KeyMaterial) -> DrmResult<()> {
		let [private_path, public_path, meta_path] = self.paths_for(alias);
		let meta = serde_json::to_vec_pretty(&material.metadata)
			.map_err(|e| keystore_err(&meta_path, e))?;

		Self::write_atomic(&private_path, material.private_key_pem.as_bytes(), true)?;
		Self::write_atomic(&public_path, material.public_key_pem.as_bytes(), false)?;
		// Metadata last: a crash before this point leaves the store incomplete
		// rather than pairing new keys with stale timestamps.
		Self::write_atomic(&meta_path, &meta, false)?;

		tracing::debug!(alias, root = %self.root.display(), "Saved key material");
		Ok(())
	}

	fn archive(&self, alias: &str, suffix: &str) -> DrmResult<()> {
		let current = self.paths_for(alias);
		let archived = self.paths_for(&format!("{alias}.{suffix}"));

		for target in &archived {
			if target.exists() {
				return Err(DrmError::KeyStore(format!(
					"archive {} already exists",
					target.display()
				)));
			}
		}

		for (from, to) in current.iter().zip(archived.iter()) {
			if from.exists() {
				fs::copy(from, to).map_err(|e| keystore_err(to, e))?;
			}
		}

		tracing::info!(alias, suffix, "Archived key material");
		Ok(())
	}

	fn archived(&self, alias: &str) -> DrmResult<Vec<String>> {
		let prefix = format!("{alias}.");
		let mut suffixes = Vec::new();

		let entries = fs::read_dir(&self.root).map_err(|e| keystore_err(&self.root, e))?;
		for entry in entries {
			let entry = entry.map_err(|e| keystore_err(&self.root, e))?;
			let name = entry.file_name().to_string_lossy().into_owned();
			let Some(rest) = name.strip_prefix(&prefix) else {
				continue;
			};
			if let Some(suffix) = rest.strip_suffix(".meta.json") {
				if !suffix.is_empty() {
					suffixes.push(suffix.to_string());
				}
			}
		}

		suffixes.sort();
		Ok(suffixes)
	}

	fn load_archived(&self, alias: &str, suffix: &str) -> DrmResult<Option<KeyMaterial>> {
		if suffix.is_empty() || suffix.contains(['/', '\\']) {
			return Err(DrmError::KeyStore(format!("invalid archive suffix '{suffix}'")));
		}
		self.read_generation(&format!("{alias}.{suffix}"))
	}
}

/// In-memory store for tests and ephemeral deployments
#[derive(Default)]
pub struct MemorySecretStore {
	current: RwLock<HashMap<String, KeyMaterial>>,
	archive: RwLock<Vec<(String, String, KeyMaterial)>>,
}

impl MemorySecretStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl SecretStore for MemorySecretStore {
	fn load(&self, alias: &str) -> DrmResult<Option<KeyMaterial>> {
		Ok(self.current.read().get(alias).cloned())
	}

	fn save(&self, alias: &str, material: &KeyMaterial) -> DrmResult<()> {
		self.current
			.write()
			.insert(alias.to_string(), material.clone());
		Ok(())
	}

	fn archive(&self, alias: &str, suffix: &str) -> DrmResult<()> {
		let Some(material) = self.current.read().get(alias).cloned() else {
			return Ok(());
		};

		let mut archive = self.archive.write();
		if archive.iter().any(|(a, s, _)| a == alias && s == suffix) {
			return Err(DrmError::KeyStore(format!(
				"archive {alias}.{suffix} already exists"
			)));
		}
		archive.push((alias.to_string(), suffix.to_string(), material));
		Ok(())
	}

	fn archived(&self, alias: &str) -> DrmResult<Vec<String>> {
		Ok(self
			.archive
			.read()
			.iter()
			.filter(|(a, _, _)| a == alias)
			.map(|(_, s, _)| s.clone())
			.collect())
	}

	fn load_archived(&self, alias: &str, suffix: &str) -> DrmResult<Option<KeyMaterial>> {
		Ok(self
			.archive
			.read()
			.iter()
			.find(|(a, s, _)| a == alias && s == suffix)
			.map(|(_, _, material)| material.clone()))
	}
}

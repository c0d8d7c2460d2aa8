//! Storage collaborator for content envelopes
//!
//! The engine only hands opaque paths to a [`ContentStorage`]. Where files
//! live is the storage's business; [`LocalContentStorage`] keeps them under
//! one root directory.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::crypto::{DrmError, DrmResult};

/// Relative storage path of an upload's content envelope
pub fn envelope_path_for(upload_id: i64) -> String {
	format!("{upload_id}.enc")
}

/// Where a new envelope waits until its wrapped key has been stored
pub fn staged_path_for(upload_id: i64) -> String {
	format!("{upload_id}.enc.staged")
}

#[async_trait]
pub trait ContentStorage: Send + Sync {
	async fn read_bytes(&self, path: &str) -> DrmResult<Vec<u8>>;

	async fn write_bytes(&self, path: &str, bytes: &[u8]) -> DrmResult<()>;

	async fn exists(&self, path: &str) -> DrmResult<bool>;

	/// Move `from` over `to`, replacing it in one step
	async fn rename(&self, from: &str, to: &str) -> DrmResult<()>;

	/// Delete `path`. Deleting something that is not there is not an error.
	async fn remove(&self, path: &str) -> DrmResult<()>;

	/// Filesystem location backing `path`, for storages that have one.
	///
	/// Large documents are streamed through the codec when this is available.
	fn local_path(&self, _path: &str) -> Option<PathBuf> {
		None
	}
}

fn storage_err(path: &str, e: impl std::fmt::Display) -> DrmError {
	DrmError::Storage {
		path: path.to_string(),
		message: e.to_string(),
	}
}

/// Directory-backed storage
pub struct LocalContentStorage {
	root: PathBuf,
}

impl LocalContentStorage {
	pub fn new<P: AsRef<Path>>(root: P) -> Self {
		Self {
			root: root.as_ref().to_path_buf(),
		}
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Resolve `path` under the root, refusing anything that could escape it
	fn resolve(&self, path: &str) -> DrmResult<PathBuf> {
		let relative = Path::new(path);
		let is_plain = relative
			.components()
			.all(|c| matches!(c, Component::Normal(_)));
		if path.is_empty() || !is_plain {
			return Err(storage_err(path, "path must be relative and stay inside the content root"));
		}
		Ok(self.root.join(relative))
	}
}

#[async_trait]
impl ContentStorage for LocalContentStorage {
	async fn read_bytes(&self, path: &str) -> DrmResult<Vec<u8>> {
		let full = self.resolve(path)?;
		fs::read(&full).await.map_err(|e| storage_err(path, e))
	}

	async fn write_bytes(&self, path: &str, bytes: &[u8]) -> DrmResult<()> {
		let full = self.resolve(path)?;
		if let Some(parent) = full.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| storage_err(path, e))?;
		}

		let tmp = full.with_extension("partial");
		fs::write(&tmp, bytes).await.map_err(|e| storage_err(path, e))?;
		fs::rename(&tmp, &full)
			.await
			.map_err(|e| storage_err(path, e))?;

		tracing::trace!(path, bytes = bytes.len(), "Wrote content envelope");
		Ok(())
	}

	async fn exists(&self, path: &str) -> DrmResult<bool> {
		let full = self.resolve(path)?;
		fs::try_exists(&full).await.map_err(|e| storage_err(path, e))
	}

	async fn rename(&self, from: &str, to: &str) -> DrmResult<()> {
		let source = self.resolve(from)?;
		let target = self.resolve(to)?;
		fs::rename(&source, &target)
			.await
			.map_err(|e| storage_err(from, e))
	}

	async fn remove(&self, path: &str) -> DrmResult<()> {
		let full = self.resolve(path)?;
		match fs::remove_file(&full).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(storage_err(path, e)),
		}
	}

	fn local_path(&self, path: &str) -> Option<PathBuf> {
		self.resolve(path).ok()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[tokio::test]
	async fn test_write_then_read() {
		let dir = TempDir::new().unwrap();
		let storage = LocalContentStorage::new(dir.path());

		storage.write_bytes("42.enc", b"envelope").await.unwrap();
		assert_eq!(storage.read_bytes("42.enc").await.unwrap(), b"envelope");
		assert!(!dir.path().join("42.partial").exists());
	}

	#[tokio::test]
	async fn test_missing_file_is_storage_error() {
		let dir = TempDir::new().unwrap();
		let storage = LocalContentStorage::new(dir.path());
		assert!(matches!(
			storage.read_bytes("nope.enc").await,
			Err(DrmError::Storage { .. })
		));
	}

	#[tokio::test]
	async fn test_rejects_escaping_paths() {
		let dir = TempDir::new().unwrap();
		let storage = LocalContentStorage::new(dir.path());

		for path in ["../outside.enc", "/etc/passwd", "", "a/../../b"] {
			assert!(storage.write_bytes(path, b"x").await.is_err(), "{path}");
		}
		assert!(storage.local_path("../x").is_none());
		assert_eq!(storage.local_path("1.enc"), Some(dir.path().join("1.enc")));
	}

	#[tokio::test]
	async fn test_rename_and_remove() {
		let dir = TempDir::new().unwrap();
		let storage = LocalContentStorage::new(dir.path());

		storage.write_bytes("7.enc", b"old").await.unwrap();
		storage.write_bytes("7.enc.staged", b"new").await.unwrap();
		storage.rename("7.enc.staged", "7.enc").await.unwrap();

		assert_eq!(storage.read_bytes("7.enc").await.unwrap(), b"new");
		assert!(!storage.exists("7.enc.staged").await.unwrap());

		storage.remove("7.enc").await.unwrap();
		storage.remove("7.enc").await.unwrap();
		assert!(!storage.exists("7.enc").await.unwrap());
		assert!(storage.rename("7.enc", "8.enc").await.is_err());
	}

	#[test]
	fn test_envelope_path() {
		assert_eq!(envelope_path_for(42), "42.enc");
		assert_eq!(staged_path_for(42), "42.enc.staged");
	}
}

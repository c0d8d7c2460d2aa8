//! Storage of wrapped content keys (the document registry's key column)

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::fs;

use crate::{
	crypto::{ContentKeyRecord, DrmError, DrmResult},
	db::entity::WrappedContentKey,
};

/// Persistence for wrapped content keys
///
/// Implementations must make `insert_active` a single critical section per
/// upload: the previous active row is marked inactive and the new row inserted
/// together, so no reader ever sees two active rows or none.
#[async_trait]
pub trait WrappedKeyStore: Send + Sync {
	/// Store `record` as the active wrap for `upload_id`, superseding any
	/// previously active wrap.
	async fn insert_active(
		&self,
		upload_id: i64,
		record: ContentKeyRecord,
	) -> DrmResult<WrappedContentKey>;

	/// Like [`Self::insert_active`], but only while the active wrap of
	/// `upload_id` is still the row `expected_active_id`.
	///
	/// Returns `None` without writing anything when another wrap has become
	/// active in the meantime.
	async fn insert_active_if(
		&self,
		upload_id: i64,
		expected_active_id: &str,
		record: ContentKeyRecord,
	) -> DrmResult<Option<WrappedContentKey>>;

	async fn get_active(&self, upload_id: i64) -> DrmResult<Option<WrappedContentKey>>;

	/// Every wrap ever stored for `upload_id`, oldest first
	async fn history(&self, upload_id: i64) -> DrmResult<Vec<WrappedContentKey>>;

	/// Active wraps across all uploads
	async fn list_active(&self) -> DrmResult<Vec<WrappedContentKey>>;
}

#[derive(Default)]
pub struct MemoryWrappedKeyStore {
	rows: Mutex<HashMap<i64, Vec<WrappedContentKey>>>,
}

impl MemoryWrappedKeyStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl WrappedKeyStore for MemoryWrappedKeyStore {
	async fn insert_active(
		&self,
		upload_id: i64,
		record: ContentKeyRecord,
	) -> DrmResult<WrappedContentKey> {
		let mut rows = self.rows.lock();
		let history = rows.entry(upload_id).or_default();
		Ok(push_active(history, upload_id, record))
	}

	async fn insert_active_if(
		&self,
		upload_id: i64,
		expected_active_id: &str,
		record: ContentKeyRecord,
	) -> DrmResult<Option<WrappedContentKey>> {
		let mut rows = self.rows.lock();
		let Some(history) = rows.get_mut(&upload_id) else {
			return Ok(None);
		};
		if !is_active_row(history, expected_active_id) {
			return Ok(None);
		}
		Ok(Some(push_active(history, upload_id, record)))
	}

	async fn get_active(&self, upload_id: i64) -> DrmResult<Option<WrappedContentKey>> {
		Ok(self
			.rows
			.lock()
			.get(&upload_id)
			.and_then(|history| history.iter().find(|r| r.active).cloned()))
	}

	async fn history(&self, upload_id: i64) -> DrmResult<Vec<WrappedContentKey>> {
		Ok(self.rows.lock().get(&upload_id).cloned().unwrap_or_default())
	}

	async fn list_active(&self) -> DrmResult<Vec<WrappedContentKey>> {
		let rows = self.rows.lock();
		let mut active: Vec<_> = rows
			.values()
			.flat_map(|history| history.iter().filter(|r| r.active).cloned())
			.collect();
		active.sort_by_key(|r| r.upload_id);
		Ok(active)
	}
}

const KEYS_SUFFIX: &str = ".keys.json";

/// Supersede whatever is active in `history` and append `record` as the new
/// active row
fn push_active(
	history: &mut Vec<WrappedContentKey>,
	upload_id: i64,
	record: ContentKeyRecord,
) -> WrappedContentKey {
	let now = Utc::now();
	for previous in history.iter_mut().filter(|r| r.active) {
		previous.active = false;
		previous.superseded_at = Some(now);
	}
	let row = WrappedContentKey::new(upload_id, record, now);
	history.push(row.clone());
	row
}

fn is_active_row(history: &[WrappedContentKey], id: &str) -> bool {
	history.iter().any(|r| r.active && r.id == id)
}

/// Wrap history kept as one JSON sidecar per upload: `{upload_id}.keys.json`
pub struct FileWrappedKeyStore {
	root: PathBuf,
	write_lock: tokio::sync::Mutex<()>,
}

impl FileWrappedKeyStore {
	pub fn new<P: AsRef<Path>>(root: P) -> Self {
		Self {
			root: root.as_ref().to_path_buf(),
			write_lock: tokio::sync::Mutex::new(()),
		}
	}

	fn path_for(&self, upload_id: i64) -> PathBuf {
		self.root.join(format!("{upload_id}{KEYS_SUFFIX}"))
	}

	async fn write_history(&self, path: &Path, history: &[WrappedContentKey]) -> DrmResult<()> {
		let bytes = serde_json::to_vec_pretty(history).map_err(|e| DrmError::Storage {
			path: path.display().to_string(),
			message: e.to_string(),
		})?;
		fs::create_dir_all(&self.root).await?;
		let partial = path.with_extension("partial");
		fs::write(&partial, bytes).await?;
		fs::rename(&partial, path).await?;
		Ok(())
	}

	async fn read_history(&self, path: &Path) -> DrmResult<Vec<WrappedContentKey>> {
		match fs::read(path).await {
			Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| DrmError::Storage {
				path: path.display().to_string(),
				message: e.to_string(),
			}),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
			Err(e) => Err(e.into()),
		}
	}
}

#[async_trait]
impl WrappedKeyStore for FileWrappedKeyStore {
	async fn insert_active(
		&self,
		upload_id: i64,
		record: ContentKeyRecord,
	) -> DrmResult<WrappedContentKey> {
		let _guard = self.write_lock.lock().await;

		let path = self.path_for(upload_id);
		let mut history = self.read_history(&path).await?;
		let row = push_active(&mut history, upload_id, record);
		self.write_history(&path, &history).await?;

		Ok(row)
	}

	async fn insert_active_if(
		&self,
		upload_id: i64,
		expected_active_id: &str,
		record: ContentKeyRecord,
	) -> DrmResult<Option<WrappedContentKey>> {
		let _guard = self.write_lock.lock().await;

		let path = self.path_for(upload_id);
		let mut history = self.read_history(&path).await?;
		if !is_active_row(&history, expected_active_id) {
			return Ok(None);
		}
		let row = push_active(&mut history, upload_id, record);
		self.write_history(&path, &history).await?;

		Ok(Some(row))
	}

	async fn get_active(&self, upload_id: i64) -> DrmResult<Option<WrappedContentKey>> {
		let history = self.read_history(&self.path_for(upload_id)).await?;
		Ok(history.into_iter().find(|r| r.active))
	}

	async fn history(&self, upload_id: i64) -> DrmResult<Vec<WrappedContentKey>> {
		self.read_history(&self.path_for(upload_id)).await
	}

	async fn list_active(&self) -> DrmResult<Vec<WrappedContentKey>> {
		let mut entries = match fs::read_dir(&self.root).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(e.into()),
		};

		let mut active = Vec::new();
		while let Some(entry) = entries.next_entry().await? {
			let name = entry.file_name();
			let is_keys_file = name
				.to_str()
				.and_then(|n| n.strip_suffix(KEYS_SUFFIX))
				.is_some_and(|id| id.parse::<i64>().is_ok());
			if !is_keys_file {
				continue;
			}
			let history = self.read_history(&entry.path()).await?;
			active.extend(history.into_iter().filter(|r| r.active));
		}
		active.sort_by_key(|r| r.upload_id);
		Ok(active)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn legacy(tag: u8) -> ContentKeyRecord {
		ContentKeyRecord::Legacy {
			ciphertext: vec![tag; 4],
		}
	}

	#[tokio::test]
	async fn test_insert_supersedes_previous() {
		let store = MemoryWrappedKeyStore::new();

		let first = store.insert_active(7, legacy(1)).await.unwrap();
		let second = store.insert_active(7, legacy(2)).await.unwrap();

		let active = store.get_active(7).await.unwrap().unwrap();
		assert_eq!(active.id, second.id);

		let history = store.history(7).await.unwrap();
		assert_eq!(history.len(), 2);
		assert_eq!(history.iter().filter(|r| r.active).count(), 1);

		let old = history.iter().find(|r| r.id == first.id).unwrap();
		assert!(!old.active);
		assert!(old.superseded_at.is_some());
	}

	#[tokio::test]
	async fn test_file_store_persists_history() {
		let dir = tempfile::TempDir::new().unwrap();
		let store = FileWrappedKeyStore::new(dir.path());

		assert!(store.get_active(4).await.unwrap().is_none());
		assert!(store.list_active().await.unwrap().is_empty());

		store.insert_active(4, legacy(1)).await.unwrap();
		let second = store.insert_active(4, legacy(2)).await.unwrap();
		store.insert_active(11, legacy(3)).await.unwrap();
		std::fs::write(dir.path().join("4.enc"), b"not a key file").unwrap();

		let reopened = FileWrappedKeyStore::new(dir.path());
		assert_eq!(reopened.get_active(4).await.unwrap().unwrap(), second);
		assert_eq!(reopened.history(4).await.unwrap().len(), 2);

		let active = reopened.list_active().await.unwrap();
		assert_eq!(
			active.iter().map(|r| r.upload_id).collect::<Vec<_>>(),
			vec![4, 11]
		);
	}

	#[tokio::test]
	async fn test_file_store_rejects_corrupt_sidecar() {
		let dir = tempfile::TempDir::new().unwrap();
		std::fs::write(dir.path().join("9.keys.json"), b"{").unwrap();
		let store = FileWrappedKeyStore::new(dir.path());
		assert!(matches!(
			store.get_active(9).await,
			Err(DrmError::Storage { .. })
		));
	}

	#[tokio::test]
	async fn test_conditional_insert_skips_when_active_row_moved() {
		let dir = tempfile::TempDir::new().unwrap();
		let stores: [Box<dyn WrappedKeyStore>; 2] = [
			Box::new(MemoryWrappedKeyStore::new()),
			Box::new(FileWrappedKeyStore::new(dir.path())),
		];

		for store in stores {
			let first = store.insert_active(6, legacy(1)).await.unwrap();
			let second = store.insert_active(6, legacy(2)).await.unwrap();

			// A writer that still believes `first` is active loses
			let stale = store.insert_active_if(6, &first.id, legacy(3)).await.unwrap();
			assert!(stale.is_none());
			assert_eq!(store.get_active(6).await.unwrap().unwrap().id, second.id);
			assert_eq!(store.history(6).await.unwrap().len(), 2);

			let fresh = store
				.insert_active_if(6, &second.id, legacy(4))
				.await
				.unwrap()
				.unwrap();
			assert_eq!(store.get_active(6).await.unwrap().unwrap().id, fresh.id);

			assert!(store
				.insert_active_if(99, "no-such-row", legacy(5))
				.await
				.unwrap()
				.is_none());
			assert!(store.get_active(99).await.unwrap().is_none());
		}
	}

	#[tokio::test]
	async fn test_uploads_are_independent() {
		let store = MemoryWrappedKeyStore::new();
		store.insert_active(1, legacy(1)).await.unwrap();
		store.insert_active(2, legacy(2)).await.unwrap();
		store.insert_active(2, legacy(3)).await.unwrap();

		let active = store.list_active().await.unwrap();
		assert_eq!(active.len(), 2);
		assert_eq!(active[0].upload_id, 1);
		assert!(store.get_active(3).await.unwrap().is_none());
	}
}

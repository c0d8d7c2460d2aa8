//! Access Control - per-upload authorization checks
//!
//! The engine never decides who may read a document; it asks an
//! [`AccessControl`] collaborator. [`AccessControlService`] is the in-process
//! grant table the server ships with.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::crypto::errors::DrmResult;

/// Authorization collaborator consulted on every content-key exchange
#[async_trait]
pub trait AccessControl: Send + Sync {
	async fn may_access(&self, user_id: &str, upload_id: i64) -> DrmResult<bool>;
}

/// Grant table keyed by upload
///
/// With `open` set every caller is allowed, which is only meant for local
/// development.
#[derive(Default)]
pub struct AccessControlService {
	grants: RwLock<HashMap<i64, HashSet<String>>>,
	open: bool,
}

impl AccessControlService {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn open() -> Self {
		Self {
			open: true,
			..Default::default()
		}
	}

	/// Grant `user_id` access to `upload_id`. Returns false if already granted.
	pub fn grant_access(&self, upload_id: i64, user_id: &str) -> bool {
		let granted = self
			.grants
			.write()
			.entry(upload_id)
			.or_default()
			.insert(user_id.to_string());
		if granted {
			tracing::info!(upload_id, user_id, "Granted upload access");
		}
		granted
	}

	/// Revoke a grant. Existing sessions are not touched; they end through the
	/// normal idle sweep or an explicit session revoke.
	pub fn revoke_access(&self, upload_id: i64, user_id: &str) -> bool {
		let mut grants = self.grants.write();
		let Some(users) = grants.get_mut(&upload_id) else {
			return false;
		};
		let revoked = users.remove(user_id);
		if users.is_empty() {
			grants.remove(&upload_id);
		}
		if revoked {
			tracing::info!(upload_id, user_id, "Revoked upload access");
		}
		revoked
	}

	pub fn users_for(&self, upload_id: i64) -> Vec<String> {
		let mut users: Vec<_> = self
			.grants
			.read()
			.get(&upload_id)
			.map(|u| u.iter().cloned().collect())
			.unwrap_or_default();
		users.sort();
		users
	}
}

#[async_trait]
impl AccessControl for AccessControlService {
	async fn may_access(&self, user_id: &str, upload_id: i64) -> DrmResult<bool> {
		if self.open {
			return Ok(true);
		}
		Ok(self
			.grants
			.read()
			.get(&upload_id)
			.is_some_and(|users| users.contains(user_id)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_grant_and_revoke() {
		let acl = AccessControlService::new();
		assert!(!acl.may_access("alice", 1).await.unwrap());

		assert!(acl.grant_access(1, "alice"));
		assert!(!acl.grant_access(1, "alice"));
		assert!(acl.may_access("alice", 1).await.unwrap());
		assert!(!acl.may_access("alice", 2).await.unwrap());
		assert!(!acl.may_access("bob", 1).await.unwrap());

		assert!(acl.revoke_access(1, "alice"));
		assert!(!acl.revoke_access(1, "alice"));
		assert!(!acl.may_access("alice", 1).await.unwrap());
		assert!(acl.users_for(1).is_empty());
	}

	#[tokio::test]
	async fn test_open_mode_allows_everyone() {
		let acl = AccessControlService::open();
		assert!(acl.may_access("anyone", 99).await.unwrap());
	}
}

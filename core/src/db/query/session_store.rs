//! Storage of DRM sessions
//!
//! Each row carries its own lock. Heartbeats and the idle sweep both mutate a
//! session through [`SessionStore::modify`], which runs the caller's check and
//! update under that lock, so a heartbeat that lands while the sweep is
//! running is never lost to a stale read.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::{
	crypto::{DrmError, DrmResult},
	db::entity::DrmSession,
};

/// Row mutation run under the row lock. Returns whether it changed anything.
pub type SessionMutation<'a> = &'a (dyn Fn(&mut DrmSession) -> bool + Send + Sync);

#[async_trait]
pub trait SessionStore: Send + Sync {
	/// Persist a new session.
	///
	/// # Errors
	/// `SessionCreation` if the row cannot be written (including a token clash).
	async fn insert(&self, session: DrmSession) -> DrmResult<()>;

	async fn get(&self, token: &str) -> DrmResult<Option<DrmSession>>;

	/// Apply `mutation` atomically to the session identified by `token`.
	///
	/// Returns the row as it is after the mutation and whether it changed, or
	/// `None` when no such session exists.
	async fn modify(
		&self,
		token: &str,
		mutation: SessionMutation<'_>,
	) -> DrmResult<Option<(DrmSession, bool)>>;

	/// Tokens of all sessions currently marked active
	async fn active_tokens(&self) -> DrmResult<Vec<String>>;

	/// Tokens of active sessions for one user on one device for one upload
	async fn active_for_device(
		&self,
		upload_id: i64,
		device_id: &str,
		user_id: &str,
	) -> DrmResult<Vec<String>>;

	/// Delete sessions that ended before `ended_before`. Active sessions are
	/// never touched. Returns how many rows were removed.
	async fn purge_ended(&self, ended_before: DateTime<Utc>) -> DrmResult<usize>;
}

#[derive(Default)]
pub struct MemorySessionStore {
	rows: RwLock<HashMap<String, Arc<Mutex<DrmSession>>>>,
}

impl MemorySessionStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn row(&self, token: &str) -> Option<Arc<Mutex<DrmSession>>> {
		self.rows.read().get(token).cloned()
	}

	fn snapshot(&self) -> Vec<Arc<Mutex<DrmSession>>> {
		self.rows.read().values().cloned().collect()
	}

	/// Number of stored sessions, ended ones included
	pub fn len(&self) -> usize {
		self.rows.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.rows.read().is_empty()
	}
}

#[async_trait]
impl SessionStore for MemorySessionStore {
	async fn insert(&self, session: DrmSession) -> DrmResult<()> {
		let mut rows = self.rows.write();
		if rows.contains_key(&session.session_token) {
			return Err(DrmError::SessionCreation {
				upload_id: session.upload_id,
				message: "session token already in use".to_string(),
			});
		}
		rows.insert(
			session.session_token.clone(),
			Arc::new(Mutex::new(session)),
		);
		Ok(())
	}

	async fn get(&self, token: &str) -> DrmResult<Option<DrmSession>> {
		Ok(self.row(token).map(|row| row.lock().clone()))
	}

	async fn modify(
		&self,
		token: &str,
		mutation: SessionMutation<'_>,
	) -> DrmResult<Option<(DrmSession, bool)>> {
		let Some(row) = self.row(token) else {
			return Ok(None);
		};
		let mut session = row.lock();
		let changed = mutation(&mut *session);
		Ok(Some((session.clone(), changed)))
	}

	async fn active_tokens(&self) -> DrmResult<Vec<String>> {
		Ok(self
			.snapshot()
			.into_iter()
			.filter_map(|row| {
				let session = row.lock();
				if session.active {
					Some(session.session_token.clone())
				} else {
					None
				}
			})
			.collect())
	}

	async fn active_for_device(
		&self,
		upload_id: i64,
		device_id: &str,
		user_id: &str,
	) -> DrmResult<Vec<String>> {
		Ok(self
			.snapshot()
			.into_iter()
			.filter_map(|row| {
				let s = row.lock();
				let matches = s.active
					&& s.upload_id == upload_id
					&& s.device_id == device_id
					&& s.user_id == user_id;
				if matches {
					Some(s.session_token.clone())
				} else {
					None
				}
			})
			.collect())
	}

	async fn purge_ended(&self, ended_before: DateTime<Utc>) -> DrmResult<usize> {
		let mut rows = self.rows.write();
		let before = rows.len();
		rows.retain(|_, row| {
			let s = row.lock();
			s.active || s.ended_at.map_or(true, |ended| ended >= ended_before)
		});
		Ok(before - rows.len())
	}
}

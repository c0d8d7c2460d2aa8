use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::ContentKeyRecord;

/// Persisted wrap of one document's content key
///
/// At most one row per `upload_id` is active. Superseded rows stay in place,
/// marked inactive, so history survives re-encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedContentKey {
	pub id: String,
	pub upload_id: i64,
	pub record: ContentKeyRecord,
	pub active: bool,
	pub created_at: DateTime<Utc>,
	pub superseded_at: Option<DateTime<Utc>>,
}

impl WrappedContentKey {
	pub fn new(upload_id: i64, record: ContentKeyRecord, created_at: DateTime<Utc>) -> Self {
		Self {
			id: uuid::Uuid::new_v4().to_string(),
			upload_id,
			record,
			active: true,
			created_at,
			superseded_at: None,
		}
	}

	/// Server key generation this record was wrapped under, `None` for legacy
	pub fn key_id(&self) -> Option<&str> {
		self.record.key_id()
	}
}

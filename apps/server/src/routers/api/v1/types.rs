//! Request and response bodies for the DRM endpoints

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KeyExchangeRequest {
	/// Base64 of the client's ephemeral AES key, RSA-encrypted under the
	/// current server public key
	pub encrypted_client_key: String,
	pub upload_id: i64,
	pub device_id: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GrantResponse {
	pub upload_id: i64,
	pub user_id: String,
	/// Whether the call changed anything
	pub changed: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VerifyResponse {
	pub upload_id: i64,
	pub plaintext_bytes: u64,
}

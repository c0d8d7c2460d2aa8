use axum::{
	http::StatusCode,
	response::{IntoResponse, Response},
	Json,
};
use drm_core::{config::ConfigError, crypto::DrmError};
use serde_json::json;
use thiserror::Error;

pub type ServerResult<T> = Result<T, ServerError>;
pub type APIResult<T> = Result<T, APIError>;

#[derive(Debug, Error)]
pub enum EntryError {
	#[error("Invalid configuration: {0}")]
	InvalidConfig(String),
	#[error("{0}")]
	ServerError(#[from] ServerError),
}

impl From<ConfigError> for EntryError {
	fn from(error: ConfigError) -> Self {
		EntryError::InvalidConfig(error.to_string())
	}
}

#[derive(Debug, Error)]
pub enum ServerError {
	#[error("Server failed to start: {0}")]
	ServerStartError(String),
	#[error("Command failed: {0}")]
	CommandError(String),
}

impl From<DrmError> for ServerError {
	fn from(error: DrmError) -> Self {
		ServerError::ServerStartError(error.to_string())
	}
}

/// Machine-readable codes carried in the `error` field of every error body
pub mod drm_error_codes {
	pub const BAD_REQUEST: &str = "bad_request";
	pub const UNAUTHORIZED: &str = "unauthorized";
	pub const FORBIDDEN: &str = "forbidden";
	pub const CONTENT_UNAVAILABLE: &str = "content_unavailable";
	pub const SESSION_NOT_FOUND: &str = "session_not_found";
	pub const SESSION_INACTIVE: &str = "session_inactive";
	pub const SERVICE_UNAVAILABLE: &str = "service_unavailable";
	pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Message returned for every content-key failure, whatever the cause
pub const CONTENT_UNAVAILABLE_MESSAGE: &str = "Cannot retrieve content";

#[derive(Debug, Error)]
pub enum APIError {
	#[error("{0}")]
	BadRequest(String),
	#[error("{0}")]
	Unauthorized(String),
	#[error("{0}")]
	Forbidden(String),
	#[error("{0}")]
	InternalServerError(String),
	#[error(transparent)]
	Drm(#[from] DrmError),
}

impl APIError {
	/// Failures while storing content are server faults, not missing content
	pub fn write_failure(error: DrmError) -> Self {
		if error.is_content_unavailable() {
			APIError::InternalServerError(error.to_string())
		} else {
			APIError::Drm(error)
		}
	}

	fn status_and_body(&self) -> (StatusCode, &'static str, String) {
		use drm_error_codes::*;

		match self {
			APIError::BadRequest(msg) => (StatusCode::BAD_REQUEST, BAD_REQUEST, msg.clone()),
			APIError::Unauthorized(msg) => {
				(StatusCode::UNAUTHORIZED, UNAUTHORIZED, msg.clone())
			},
			APIError::Forbidden(msg) => (StatusCode::FORBIDDEN, FORBIDDEN, msg.clone()),
			APIError::InternalServerError(_) => (
				StatusCode::INTERNAL_SERVER_ERROR,
				INTERNAL_ERROR,
				"Internal server error".to_string(),
			),
			APIError::Drm(e) if e.is_content_unavailable() => (
				StatusCode::NOT_FOUND,
				CONTENT_UNAVAILABLE,
				CONTENT_UNAVAILABLE_MESSAGE.to_string(),
			),
			APIError::Drm(DrmError::SessionNotFound) => (
				StatusCode::NOT_FOUND,
				SESSION_NOT_FOUND,
				"Session not found".to_string(),
			),
			APIError::Drm(DrmError::SessionInactive) => (
				StatusCode::GONE,
				SESSION_INACTIVE,
				"Session is no longer active".to_string(),
			),
			APIError::Drm(DrmError::SessionCreation { .. }) => (
				StatusCode::SERVICE_UNAVAILABLE,
				SERVICE_UNAVAILABLE,
				"Session could not be created, try again".to_string(),
			),
			APIError::Drm(_) => (
				StatusCode::INTERNAL_SERVER_ERROR,
				INTERNAL_ERROR,
				"Internal server error".to_string(),
			),
		}
	}
}

impl IntoResponse for APIError {
	fn into_response(self) -> Response {
		match &self {
			APIError::Drm(e) if e.is_security_event() => {
				tracing::warn!(target: "drm::audit", error = %e, "Request rejected")
			},
			APIError::Drm(e) if e.is_content_unavailable() => {
				tracing::warn!(error = %e, "Content unavailable")
			},
			APIError::Drm(DrmError::SessionNotFound | DrmError::SessionInactive) => {
				tracing::debug!(error = %self, "Session rejected")
			},
			APIError::Drm(e) => tracing::error!(error = %e, "Request failed"),
			APIError::InternalServerError(msg) => tracing::error!(error = %msg, "Request failed"),
			_ => tracing::debug!(error = %self, "Bad request"),
		}

		let (status, code, message) = self.status_and_body();
		(status, Json(json!({ "error": code, "message": message }))).into_response()
	}
}

#[cfg(test)]
mod tests {
	use axum::body::to_bytes;

	use super::*;

	async fn body_of(error: APIError) -> (StatusCode, serde_json::Value) {
		let response = error.into_response();
		let status = response.status();
		let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		(status, serde_json::from_slice(&bytes).unwrap())
	}

	#[tokio::test]
	async fn content_failures_share_one_generic_body() {
		let causes = vec![
			DrmError::invalid_content_key(3, "unwrap", "wrapped under retired key abc"),
			DrmError::Forbidden {
				upload_id: 3,
				user_id: "mallory".into(),
			},
			DrmError::Authentication { operation: "decrypt" },
			DrmError::MalformedEnvelope("too short".into()),
		];

		for cause in causes {
			let (status, body) = body_of(APIError::from(cause)).await;
			assert_eq!(status, StatusCode::NOT_FOUND);
			assert_eq!(
				body,
				json!({"error": "content_unavailable", "message": "Cannot retrieve content"})
			);
		}
	}

	#[tokio::test]
	async fn session_errors_are_distinguishable() {
		let (status, body) = body_of(DrmError::SessionInactive.into()).await;
		assert_eq!(status, StatusCode::GONE);
		assert_eq!(body["error"], "session_inactive");

		let (status, _) = body_of(DrmError::SessionNotFound.into()).await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn internal_details_are_not_leaked() {
		let (status, body) =
			body_of(APIError::Drm(DrmError::KeyStore("/etc/keys unreadable".into()))).await;
		assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
		assert!(!body.to_string().contains("/etc/keys"));
	}

	#[tokio::test]
	async fn write_failures_are_server_errors() {
		let causes = vec![
			DrmError::Storage {
				path: "7.enc.staged".into(),
				message: "disk full".into(),
			},
			DrmError::Crypto {
				operation: "wrap",
				message: "rsa failure".into(),
			},
		];

		for cause in causes {
			let (status, body) = body_of(APIError::write_failure(cause)).await;
			assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
			assert_eq!(body["error"], "internal_error");
			assert!(!body.to_string().contains("7.enc"));
		}

		let (status, _) = body_of(APIError::write_failure(DrmError::SessionNotFound)).await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}
}

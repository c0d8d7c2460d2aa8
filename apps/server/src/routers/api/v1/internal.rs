//! Service-to-service endpoints
//!
//! Called by the upload pipeline and the document registry, never by
//! clients. Every route requires the internal service token.

use axum::{
	body::Bytes,
	extract::{Path, State},
	middleware,
	routing::{get, put},
	Json, Router,
};
use drm_core::crypto::services::ProtectedUpload;

use crate::{
	config::state::AppState,
	errors::{APIError, APIResult},
	middleware::auth::internal_middleware,
};

use super::types::{GrantResponse, VerifyResponse};

pub(crate) fn mount(app_state: AppState) -> Router<AppState> {
	Router::new()
		.route("/internal/uploads/{id}/content", put(put_content))
		.route("/internal/uploads/{id}/verify", get(verify_content))
		.route(
			"/internal/uploads/{id}/grants/{user_id}",
			put(grant_access).delete(revoke_access),
		)
		.layer(middleware::from_fn_with_state(app_state, internal_middleware))
}

/// Encrypt the raw request body as the content of upload `id`
pub(crate) async fn put_content(
	Path(upload_id): Path<i64>,
	State(ctx): State<AppState>,
	body: Bytes,
) -> APIResult<Json<ProtectedUpload>> {
	let protected = ctx
		.content
		.protect_upload(upload_id, &body)
		.await
		.map_err(APIError::write_failure)?;
	tracing::info!(
		upload_id,
		envelope_bytes = protected.envelope_bytes,
		"Protected uploaded content"
	);
	Ok(Json(protected))
}

/// Check the stored envelope of upload `id` against its active key
pub(crate) async fn verify_content(
	Path(upload_id): Path<i64>,
	State(ctx): State<AppState>,
) -> APIResult<Json<VerifyResponse>> {
	let plaintext_bytes = ctx.content.verify_upload(upload_id).await?;
	Ok(Json(VerifyResponse {
		upload_id,
		plaintext_bytes,
	}))
}

pub(crate) async fn grant_access(
	Path((upload_id, user_id)): Path<(i64, String)>,
	State(ctx): State<AppState>,
) -> APIResult<Json<GrantResponse>> {
	let changed = ctx.access.grant_access(upload_id, &user_id);
	Ok(Json(GrantResponse {
		upload_id,
		user_id,
		changed,
	}))
}

pub(crate) async fn revoke_access(
	Path((upload_id, user_id)): Path<(i64, String)>,
	State(ctx): State<AppState>,
) -> APIResult<Json<GrantResponse>> {
	let changed = ctx.access.revoke_access(upload_id, &user_id);
	Ok(Json(GrantResponse {
		upload_id,
		user_id,
		changed,
	}))
}

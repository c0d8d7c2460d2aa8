//! Client-facing DRM endpoints
//!
//! - Public key descriptor
//! - Content-key exchange
//! - Session heartbeat, status and revoke

use axum::{
	extract::{Path, State},
	middleware,
	routing::{get, post},
	Extension, Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use drm_core::{
	crypto::services::{ContentKeyGrant, PublicKeyInfo},
	db::entity::SessionStatus,
};

use crate::{
	config::state::AppState,
	errors::{APIError, APIResult},
	middleware::auth::{auth_middleware, RequestContext},
};

use super::types::KeyExchangeRequest;

pub(crate) fn mount(app_state: AppState) -> Router<AppState> {
	let authenticated = Router::new()
		.route("/drm/key-exchange", post(key_exchange))
		.route("/drm/sessions/{token}/heartbeat", post(heartbeat))
		.route(
			"/drm/sessions/{token}",
			get(get_session).delete(revoke_session),
		)
		.layer(middleware::from_fn_with_state(app_state, auth_middleware));

	Router::new()
		.route("/drm/public-key", get(get_public_key))
		.merge(authenticated)
}

/// Current server public key. Clients encrypt their ephemeral key under it.
pub(crate) async fn get_public_key(
	State(ctx): State<AppState>,
) -> APIResult<Json<PublicKeyInfo>> {
	Ok(Json(ctx.key_exchange.public_key_info()?))
}

/// Exchange an encrypted ephemeral key for the document's content key
pub(crate) async fn key_exchange(
	State(ctx): State<AppState>,
	Extension(req): Extension<RequestContext>,
	Json(payload): Json<KeyExchangeRequest>,
) -> APIResult<Json<ContentKeyGrant>> {
	let encrypted_client_key = STANDARD
		.decode(payload.encrypted_client_key.trim())
		.map_err(|_| APIError::BadRequest("encryptedClientKey must be base64".to_string()))?;
	if payload.device_id.trim().is_empty() {
		return Err(APIError::BadRequest("deviceId is required".to_string()));
	}

	let grant = ctx
		.key_exchange
		.request_content_key(
			req.user_id(),
			payload.upload_id,
			&payload.device_id,
			&encrypted_client_key,
		)
		.await?;

	Ok(Json(grant))
}

pub(crate) async fn heartbeat(
	Path(token): Path<String>,
	State(ctx): State<AppState>,
) -> APIResult<Json<SessionStatus>> {
	Ok(Json(ctx.sessions.heartbeat(&token).await?))
}

pub(crate) async fn get_session(
	Path(token): Path<String>,
	State(ctx): State<AppState>,
) -> APIResult<Json<SessionStatus>> {
	Ok(Json(ctx.sessions.status(&token).await?))
}

/// End a session. Revoking an ended session returns its final state.
pub(crate) async fn revoke_session(
	Path(token): Path<String>,
	State(ctx): State<AppState>,
	Extension(req): Extension<RequestContext>,
) -> APIResult<Json<SessionStatus>> {
	let status = ctx.sessions.revoke(&token).await?;
	tracing::info!(
		user_id = req.user_id(),
		upload_id = status.upload_id,
		"Session revoked by client"
	);
	Ok(Json(status))
}

#[cfg(test)]
mod tests {
	use drm_core::crypto::{DrmError, EphemeralKey};

	use super::*;
	use crate::routers::api::v1::test_support::test_state;

	const CLIENT_KEY: [u8; 32] = [3u8; 32];

	fn exchange_request(state: &AppState, upload_id: i64) -> KeyExchangeRequest {
		let encrypted = state
			.keypair
			.encrypt_with_public_key(&CLIENT_KEY)
			.unwrap();
		KeyExchangeRequest {
			encrypted_client_key: STANDARD.encode(encrypted),
			upload_id,
			device_id: "dev-1".to_string(),
		}
	}

	#[tokio::test]
	async fn public_key_is_base64_der() {
		let (state, _dir) = test_state().await;
		let Json(info) = get_public_key(State(state.clone())).await.unwrap();

		assert_eq!(info.algorithm, "RSA");
		assert_eq!(info.key_id, state.keypair.current().key_id());
		assert_eq!(
			STANDARD.decode(&info.public_key).unwrap(),
			state.keypair.current().public_key_der().unwrap()
		);
	}

	#[tokio::test]
	async fn key_exchange_then_heartbeat_and_revoke() {
		let (state, _dir) = test_state().await;
		state.content.protect_upload(42, b"book").await.unwrap();
		state.access.grant_access(42, "alice");

		let Json(grant) = key_exchange(
			State(state.clone()),
			Extension(RequestContext::new("alice")),
			Json(exchange_request(&state, 42)),
		)
		.await
		.unwrap();

		let key = EphemeralKey::from_slice(&CLIENT_KEY)
			.unwrap()
			.open_content_key(&grant.encrypted_content_key)
			.unwrap();
		assert_eq!(
			key.expose_secret(),
			state.wrapper.active_content_key(42).await.unwrap().expose_secret()
		);

		let Json(status) = heartbeat(Path(grant.session_token.clone()), State(state.clone()))
			.await
			.unwrap();
		assert!(status.active);

		let Json(status) = revoke_session(
			Path(grant.session_token.clone()),
			State(state.clone()),
			Extension(RequestContext::new("alice")),
		)
		.await
		.unwrap();
		assert!(!status.active);

		let result = heartbeat(Path(grant.session_token), State(state)).await;
		assert!(matches!(result, Err(APIError::Drm(DrmError::SessionInactive))));
	}

	#[tokio::test]
	async fn key_exchange_rejects_bad_input() {
		let (state, _dir) = test_state().await;
		state.content.protect_upload(1, b"x").await.unwrap();

		let mut request = exchange_request(&state, 1);
		request.encrypted_client_key = "%%%".to_string();
		let result = key_exchange(
			State(state.clone()),
			Extension(RequestContext::new("alice")),
			Json(request),
		)
		.await;
		assert!(matches!(result, Err(APIError::BadRequest(_))));

		let result = key_exchange(
			State(state.clone()),
			Extension(RequestContext::new("alice")),
			Json(exchange_request(&state, 1)),
		)
		.await;
		assert!(matches!(
			result,
			Err(APIError::Drm(DrmError::Forbidden { upload_id: 1, .. }))
		));
	}

	#[tokio::test]
	async fn unknown_session_is_not_found() {
		let (state, _dir) = test_state().await;
		let result = get_session(Path("missing".to_string()), State(state)).await;
		assert!(matches!(result, Err(APIError::Drm(DrmError::SessionNotFound))));
	}
}

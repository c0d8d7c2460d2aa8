//! Request identity
//!
//! Authentication happens upstream. The gateway forwards the authenticated
//! user in `X-User-Id`; internal collaborators present the shared service
//! token in `X-Internal-Token`.

use axum::{
	body::Body,
	extract::{Request, State},
	http::HeaderMap,
	middleware::Next,
	response::Response,
};
use secrecy::ExposeSecret;
use subtle::ConstantTimeEq;

use crate::{
	config::state::AppState,
	errors::{APIError, APIResult},
};

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const INTERNAL_TOKEN_HEADER: &str = "X-Internal-Token";

/// Identity of the caller, inserted as a request extension
#[derive(Debug, Clone)]
pub struct RequestContext {
	user_id: String,
}

impl RequestContext {
	pub fn new(user_id: impl Into<String>) -> Self {
		Self {
			user_id: user_id.into(),
		}
	}

	pub fn user_id(&self) -> &str {
		&self.user_id
	}

	pub fn from_headers(headers: &HeaderMap) -> APIResult<Self> {
		let user_id = headers
			.get(USER_ID_HEADER)
			.and_then(|v| v.to_str().ok())
			.map(str::trim)
			.filter(|v| !v.is_empty())
			.ok_or_else(|| {
				APIError::Unauthorized(format!("Missing {USER_ID_HEADER} header"))
			})?;
		Ok(Self::new(user_id))
	}
}

pub async fn auth_middleware(
	State(_ctx): State<AppState>,
	mut request: Request<Body>,
	next: Next,
) -> APIResult<Response> {
	let req_ctx = RequestContext::from_headers(request.headers())?;
	request.extensions_mut().insert(req_ctx);
	Ok(next.run(request).await)
}

/// Check `X-Internal-Token` against the configured token in constant time.
///
/// With no token configured the internal routes are closed.
pub fn verify_internal_token(ctx: &AppState, headers: &HeaderMap) -> APIResult<()> {
	let Some(expected) = ctx.config.internal_token.as_ref() else {
		return Err(APIError::Forbidden(
			"Internal endpoints are disabled".to_string(),
		));
	};

	let presented = headers
		.get(INTERNAL_TOKEN_HEADER)
		.map(|v| v.as_bytes())
		.ok_or_else(|| {
			APIError::Unauthorized(format!("Missing {INTERNAL_TOKEN_HEADER} header"))
		})?;

	if bool::from(presented.ct_eq(expected.expose_secret().as_bytes())) {
		Ok(())
	} else {
		tracing::warn!(target: "drm::audit", "Rejected internal request with a bad service token");
		Err(APIError::Unauthorized("Invalid service token".to_string()))
	}
}

pub async fn internal_middleware(
	State(ctx): State<AppState>,
	request: Request<Body>,
	next: Next,
) -> APIResult<Response> {
	verify_internal_token(&ctx, request.headers())?;
	Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
	use axum::http::HeaderValue;

	use super::*;

	#[test]
	fn user_id_header_is_required() {
		let mut headers = HeaderMap::new();
		assert!(matches!(
			RequestContext::from_headers(&headers),
			Err(APIError::Unauthorized(_))
		));

		headers.insert(USER_ID_HEADER, HeaderValue::from_static("  "));
		assert!(RequestContext::from_headers(&headers).is_err());

		headers.insert(USER_ID_HEADER, HeaderValue::from_static("alice"));
		assert_eq!(
			RequestContext::from_headers(&headers).unwrap().user_id(),
			"alice"
		);
	}
}

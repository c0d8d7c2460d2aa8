use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::config::state::AppState;

pub(crate) mod drm;
pub(crate) mod internal;
pub(crate) mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub(crate) fn mount(app_state: AppState) -> Router<AppState> {
	Router::new()
		.merge(drm::mount(app_state.clone()))
		.merge(internal::mount(app_state))
		.route("/ping", get(ping))
		.route("/version", get(version))
}

async fn ping() -> &'static str {
	"pong"
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VersionResponse {
	pub semver: String,
	pub rev: Option<String>,
}

async fn version() -> Json<VersionResponse> {
	Json(VersionResponse {
		semver: env!("CARGO_PKG_VERSION").to_string(),
		rev: option_env!("GIT_REV").map(str::to_string),
	})
}

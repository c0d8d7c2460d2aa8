use axum::Router;

use crate::config::state::AppState;

pub(crate) mod api;

pub(crate) fn mount(app_state: AppState) -> Router<AppState> {
	Router::new().nest("/api", api::mount(app_state))
}

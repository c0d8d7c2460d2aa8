use std::net::SocketAddr;

use axum::Router;
use drm_core::{config::DrmConfig, DrmCore};
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;

use crate::{
	config::state::AppState,
	errors::{ServerError, ServerResult},
	routers,
	utils::shutdown_signal_with_cleanup,
};

/// The full application router
pub fn app(app_state: AppState) -> Router {
	Router::new()
		.merge(routers::mount(app_state.clone()))
		.with_state(app_state)
		.layer(TraceLayer::new_for_http())
}

pub async fn run_http_server(config: DrmConfig) -> ServerResult<()> {
	// A keypair that exists but cannot be read aborts startup here
	let core = DrmCore::new(config.clone()).await.map_err(|e| {
		tracing::error!(error = %e, "Failed to initialize the DRM engine");
		ServerError::ServerStartError(e.to_string())
	})?;

	let ctx = core.get_context();
	let key = ctx.keypair.current();
	tracing::info!(
		key_id = %key.key_id(),
		expires_at = %key.expires_at(),
		padding = %ctx.keypair.padding(),
		"Server keypair ready"
	);
	if config.internal_token.is_none() {
		tracing::warn!("No internal token configured; internal upload endpoints are disabled");
	}

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let background = core.spawn_background_tasks(shutdown_rx);

	let router = app(AppState::new(ctx));

	let cleanup = || async move {
		tracing::info!("Initializing graceful shutdown...");
		let _ = shutdown_tx.send(true);
		for handle in background {
			if let Err(e) = handle.await {
				tracing::error!(error = %e, "Background task ended abnormally");
			}
		}
	};

	let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
	let listener = TcpListener::bind(&addr)
		.await
		.map_err(|e| ServerError::ServerStartError(e.to_string()))?;

	tracing::info!("DRM HTTP server starting on http://{}", addr);

	axum::serve(listener, router.into_make_service())
		.with_graceful_shutdown(shutdown_signal_with_cleanup(Some(cleanup)))
		.await
		.map_err(|e| ServerError::ServerStartError(e.to_string()))?;

	Ok(())
}

use std::future::Future;

use tokio::signal;

/// Resolve on Ctrl+C or SIGTERM, after running `cleanup` if one is given
pub(crate) async fn shutdown_signal_with_cleanup<F, Fut>(cleanup: Option<F>)
where
	F: FnOnce() -> Fut,
	Fut: Future<Output = ()>,
{
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			tracing::error!(error = %e, "Failed to install Ctrl+C handler");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut stream) => {
				stream.recv().await;
			},
			Err(e) => {
				tracing::error!(error = %e, "Failed to install SIGTERM handler");
				std::future::pending::<()>().await;
			},
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}

	tracing::info!("Shutdown signal received");
	if let Some(cleanup) = cleanup {
		cleanup().await;
	}
}

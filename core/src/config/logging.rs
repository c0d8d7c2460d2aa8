use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::DrmConfig;

/// Map the configured verbosity to a default filter directive
pub fn verbosity_directive(verbosity: u64) -> &'static str {
	match verbosity {
		0 => "warn,drm::audit=info",
		1 => "info",
		2 => "debug",
		_ => "trace",
	}
}

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// verbosity when set.
///
/// Audit events are emitted on the `drm::audit` target and stay visible at
/// every verbosity.
pub fn init_tracing(config: &DrmConfig) {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(verbosity_directive(config.verbosity)));

	let result = tracing_subscriber::registry()
		.with(fmt::layer().with_target(true))
		.with(filter)
		.try_init();

	if let Err(e) = result {
		eprintln!("Tracing subscriber already installed: {e}");
	}
}

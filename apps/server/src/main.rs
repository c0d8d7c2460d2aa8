use clap::Parser;
use drm_core::{bootstrap_config_dir, config::logging::init_tracing, DrmCore};
use drm_server::{
	cli::{handle_command, Cli, Commands},
	run_http_server, EntryError,
};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), EntryError> {
	// Get DRM_CONFIG_DIR to bootstrap startup
	let config_dir = bootstrap_config_dir();

	let config = DrmCore::init_config(config_dir)?;

	let cli = Cli::parse();

	// Merge CLI overrides into config
	let config = cli.config.merge_drm_config(config);

	// Note: init_tracing after loading the environment so the correct verbosity
	// level is used for logging.
	init_tracing(&config);

	if config.verbosity >= 3 {
		tracing::trace!(?config, "App config");
	}

	// If a subcommand other than serve was provided, handle it and exit
	match cli.command {
		Some(Commands::Serve) | None => {},
		Some(cmd) => {
			handle_command(cmd, &config).await?;
			return Ok(());
		},
	}

	Ok(run_http_server(config).await?)
}

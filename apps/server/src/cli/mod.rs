//! Command-line interface for DRM server administration

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use drm_core::{
	config::DrmConfig,
	crypto::{services::RotationReport, RotationOutcome},
	DrmCore,
};

use crate::errors::ServerError;

/// DRM Server - content protection for uploaded documents
#[derive(Parser)]
#[command(name = "drm_server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
	#[command(flatten)]
	pub config: CliConfig,

	#[command(subcommand)]
	pub command: Option<Commands>,
}

/// Flags that override the loaded configuration
#[derive(Args, Debug, Default)]
pub struct CliConfig {
	/// Port to listen on
	#[arg(long)]
	pub port: Option<u16>,

	/// Increase logging verbosity (repeatable)
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Directory holding the server keypair
	#[arg(long)]
	pub key_dir: Option<PathBuf>,

	/// Directory holding content envelopes and their wrapped keys
	#[arg(long)]
	pub content_dir: Option<PathBuf>,
}

impl CliConfig {
	pub fn merge_drm_config(self, mut config: DrmConfig) -> DrmConfig {
		if let Some(port) = self.port {
			config.port = port;
		}
		if self.verbose > 0 {
			config.verbosity = u64::from(self.verbose);
		}
		if let Some(key_dir) = self.key_dir {
			config.key_dir = key_dir;
		}
		if let Some(content_dir) = self.content_dir {
			config.content_dir = content_dir;
		}
		config
	}
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Start the HTTP server (default)
	Serve,
	/// Print the current server public key descriptor
	KeyInfo,
	/// Rotate the server keypair if due and re-wrap content keys
	RotateKeys {
		/// Rotate even if the current keypair is not due
		#[arg(long)]
		force: bool,
	},
	/// Encrypt a document on disk as the content of an upload
	Protect {
		#[arg(long)]
		upload_id: i64,
		#[arg(long)]
		input: PathBuf,
	},
	/// Check an upload's stored envelope against its active key
	Verify {
		#[arg(long)]
		upload_id: i64,
	},
}

/// Run a one-shot administrative command. `Serve` is handled by the caller.
pub async fn handle_command(command: Commands, config: &DrmConfig) -> Result<(), ServerError> {
	let core = DrmCore::new(config.clone()).await?;
	let ctx = core.get_context();

	match command {
		Commands::Serve => Ok(()),
		Commands::KeyInfo => {
			let info = ctx.key_exchange.public_key_info()?;
			print_json(&info)
		},
		Commands::RotateKeys { force } => {
			let report = if force {
				ctx.rotation.force_rotate().await?
			} else {
				ctx.rotation.check_and_rotate().await?
			};
			println!("{}", describe_rotation(&report));
			Ok(())
		},
		Commands::Protect { upload_id, input } => {
			if !input.is_file() {
				return Err(ServerError::CommandError(format!(
					"{} is not a file",
					input.display()
				)));
			}
			let protected = ctx.content.protect_file(upload_id, input).await?;
			print_json(&protected)
		},
		Commands::Verify { upload_id } => {
			let bytes = ctx.content.verify_upload(upload_id).await?;
			println!("upload {upload_id}: envelope verified, {bytes} plaintext bytes");
			Ok(())
		},
	}
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), ServerError> {
	let rendered = serde_json::to_string_pretty(value)
		.map_err(|e| ServerError::CommandError(e.to_string()))?;
	println!("{rendered}");
	Ok(())
}

fn describe_rotation(report: &RotationReport) -> String {
	match &report.outcome {
		RotationOutcome::NotDue => "Keypair rotation not due".to_string(),
		RotationOutcome::Rotated {
			previous_key_id,
			key_id,
		} => format!(
			"Rotated keypair {previous_key_id} -> {key_id}; re-wrapped {} content keys ({} failed)",
			report.rewrapped, report.failed
		),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cli_flags_override_config() {
		let cli = Cli::parse_from([
			"drm_server",
			"--port",
			"9100",
			"-vv",
			"--content-dir",
			"/data/content",
			"protect",
			"--upload-id",
			"7",
			"--input",
			"/tmp/doc.pdf",
		]);

		let config = cli.config.merge_drm_config(DrmConfig::new("/etc/drm"));
		assert_eq!(config.port, 9100);
		assert_eq!(config.verbosity, 2);
		assert_eq!(config.content_dir, PathBuf::from("/data/content"));
		assert_eq!(config.key_dir, PathBuf::from("/etc/drm/keys"));
		assert!(matches!(
			cli.command,
			Some(Commands::Protect { upload_id: 7, .. })
		));
	}

	#[test]
	fn rotation_summary_names_both_keys() {
		let report = RotationReport {
			outcome: RotationOutcome::Rotated {
				previous_key_id: "aaaa".into(),
				key_id: "bbbb".into(),
			},
			rewrapped: 3,
			failed: 0,
		};
		let text = describe_rotation(&report);
		assert!(text.contains("aaaa -> bbbb"));
		assert!(text.contains("re-wrapped 3"));
	}
}

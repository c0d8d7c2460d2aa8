//! Engine configuration
//!
//! Values are resolved in three layers: built-in defaults, then `Drm.toml` in
//! the config directory, then `DRM_*` environment variables. CLI flags are
//! merged on top by the server binary.

pub mod logging;

use std::{
	fmt,
	path::{Path, PathBuf},
	str::FromStr,
	time::Duration,
};

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use crate::crypto::{
	keypair::KeyPairOptions,
	services::{KeyWrapMode, SessionPolicy},
	sizes::RSA_KEY_BITS,
	versions::{KEY_ROTATION_DAYS, PBKDF2_ITERATIONS},
	RsaPadding,
};

pub const CONFIG_FILE_NAME: &str = "Drm.toml";

pub mod env_keys {
	pub const CONFIG_DIR: &str = "DRM_CONFIG_DIR";
	pub const PORT: &str = "DRM_PORT";
	pub const VERBOSITY: &str = "DRM_VERBOSITY";
	pub const KEY_DIR: &str = "DRM_KEY_DIR";
	pub const CONTENT_DIR: &str = "DRM_CONTENT_DIR";
	pub const KEY_ALIAS: &str = "DRM_KEY_ALIAS";
	pub const KEY_ROTATION_DAYS: &str = "DRM_KEY_ROTATION_DAYS";
	pub const RSA_KEY_BITS: &str = "DRM_RSA_KEY_BITS";
	pub const RSA_PADDING: &str = "DRM_RSA_PADDING";
	pub const PBKDF2_ITERATIONS: &str = "DRM_PBKDF2_ITERATIONS";
	pub const SESSION_IDLE_SECS: &str = "DRM_SESSION_IDLE_SECS";
	pub const SESSION_SWEEP_SECS: &str = "DRM_SESSION_SWEEP_SECS";
	pub const SESSION_RETENTION_SECS: &str = "DRM_SESSION_RETENTION_SECS";
	pub const LICENSE_TTL_HOURS: &str = "DRM_LICENSE_TTL_HOURS";
	pub const ROTATION_CHECK_SECS: &str = "DRM_ROTATION_CHECK_SECS";
	pub const RIGHTS: &str = "DRM_RIGHTS";
	pub const OPEN_ACCESS: &str = "DRM_OPEN_ACCESS";
	pub const WRAP_MODE: &str = "DRM_WRAP_MODE";
	pub const MASTER_KEY: &str = "DRM_MASTER_KEY";
	pub const INTERNAL_TOKEN: &str = "DRM_INTERNAL_TOKEN";
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("Failed to read config file {path}: {source}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("Failed to parse config file {path}: {source}")]
	Parse {
		path: PathBuf,
		source: toml::de::Error,
	},
	#[error("Invalid value for {key}: {message}")]
	InvalidValue { key: &'static str, message: String },
}

/// The config directory from `DRM_CONFIG_DIR`, else `$HOME/.drm`, else `./.drm`
pub fn bootstrap_config_dir() -> PathBuf {
	if let Ok(dir) = std::env::var(env_keys::CONFIG_DIR) {
		return PathBuf::from(dir);
	}
	std::env::var("HOME")
		.map(PathBuf::from)
		.unwrap_or_else(|_| PathBuf::from("."))
		.join(".drm")
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DrmConfig {
	pub port: u16,
	pub verbosity: u64,
	pub config_dir: PathBuf,
	/// Where the server keypair and its archives live
	pub key_dir: PathBuf,
	/// Where content envelopes are written
	pub content_dir: PathBuf,
	pub key_alias: String,
	pub key_rotation_days: i64,
	pub rsa_key_bits: usize,
	pub rsa_padding: RsaPadding,
	pub pbkdf2_iterations: u32,
	pub session_idle_secs: u64,
	pub session_sweep_secs: u64,
	/// How long an ended session is kept for status lookups before the sweep
	/// deletes it
	pub session_retention_secs: u64,
	pub license_ttl_hours: u64,
	pub rotation_check_secs: u64,
	/// Rights attached to every issued content key
	pub rights: Vec<String>,
	/// Skip access control entirely. Local development only.
	pub open_access: bool,
	pub wrap_mode: KeyWrapMode,
	/// Passphrase for legacy content-key wraps
	pub master_key: Option<SecretString>,
	/// Shared secret for the internal upload endpoints
	pub internal_token: Option<SecretString>,
}

impl Default for DrmConfig {
	fn default() -> Self {
		Self::new(bootstrap_config_dir())
	}
}

impl fmt::Debug for DrmConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DrmConfig")
			.field("port", &self.port)
			.field("verbosity", &self.verbosity)
			.field("config_dir", &self.config_dir)
			.field("key_dir", &self.key_dir)
			.field("content_dir", &self.content_dir)
			.field("key_alias", &self.key_alias)
			.field("key_rotation_days", &self.key_rotation_days)
			.field("rsa_key_bits", &self.rsa_key_bits)
			.field("rsa_padding", &self.rsa_padding)
			.field("pbkdf2_iterations", &self.pbkdf2_iterations)
			.field("session_idle_secs", &self.session_idle_secs)
			.field("session_sweep_secs", &self.session_sweep_secs)
			.field("session_retention_secs", &self.session_retention_secs)
			.field("license_ttl_hours", &self.license_ttl_hours)
			.field("rotation_check_secs", &self.rotation_check_secs)
			.field("rights", &self.rights)
			.field("open_access", &self.open_access)
			.field("wrap_mode", &self.wrap_mode)
			.field("master_key", &self.master_key.as_ref().map(|_| "[REDACTED]"))
			.field(
				"internal_token",
				&self.internal_token.as_ref().map(|_| "[REDACTED]"),
			)
			.finish()
	}
}

impl DrmConfig {
	/// Defaults rooted at `config_dir`
	pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
		let config_dir = config_dir.as_ref().to_path_buf();
		Self {
			port: 10801,
			verbosity: 1,
			key_dir: config_dir.join("keys"),
			content_dir: config_dir.join("content"),
			config_dir,
			key_alias: "drm-server".to_string(),
			key_rotation_days: KEY_ROTATION_DAYS,
			rsa_key_bits: RSA_KEY_BITS,
			rsa_padding: RsaPadding::default(),
			pbkdf2_iterations: PBKDF2_ITERATIONS,
			session_idle_secs: 180,
			session_sweep_secs: 120,
			session_retention_secs: 3600,
			license_ttl_hours: 24,
			rotation_check_secs: 3600,
			rights: vec!["VIEW".to_string()],
			open_access: false,
			wrap_mode: KeyWrapMode::default(),
			master_key: None,
			internal_token: None,
		}
	}

	/// Load `Drm.toml` from `config_dir` (if present) and apply the environment
	pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
		let config_dir = config_dir.as_ref();
		let mut config = Self::from_file(config_dir)?;
		config.apply_overrides(|key| std::env::var(key).ok())?;
		config.validate()?;
		Ok(config)
	}

	fn from_file(config_dir: &Path) -> Result<Self, ConfigError> {
		let path = config_dir.join(CONFIG_FILE_NAME);
		if !path.exists() {
			tracing::debug!(?path, "No config file found, using defaults");
			return Ok(Self::new(config_dir));
		}

		let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
			path: path.clone(),
			source,
		})?;
		let mut config: Self =
			toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })?;

		// Directories not named in the file follow the actual config dir
		let defaults = Self::new(config_dir);
		let stale = Self::default();
		config.config_dir = config_dir.to_path_buf();
		if config.key_dir == stale.key_dir {
			config.key_dir = defaults.key_dir;
		}
		if config.content_dir == stale.content_dir {
			config.content_dir = defaults.content_dir;
		}
		Ok(config)
	}

	/// Apply `DRM_*` overrides from `lookup`
	pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		use env_keys::*;

		if let Some(v) = lookup(PORT) {
			self.port = parse(PORT, &v)?;
		}
		if let Some(v) = lookup(VERBOSITY) {
			self.verbosity = parse(VERBOSITY, &v)?;
		}
		if let Some(v) = lookup(KEY_DIR) {
			self.key_dir = PathBuf::from(v);
		}
		if let Some(v) = lookup(CONTENT_DIR) {
			self.content_dir = PathBuf::from(v);
		}
		if let Some(v) = lookup(KEY_ALIAS) {
			self.key_alias = v;
		}
		if let Some(v) = lookup(KEY_ROTATION_DAYS) {
			self.key_rotation_days = parse(KEY_ROTATION_DAYS, &v)?;
		}
		if let Some(v) = lookup(RSA_KEY_BITS) {
			self.rsa_key_bits = parse(RSA_KEY_BITS, &v)?;
		}
		if let Some(v) = lookup(RSA_PADDING) {
			self.rsa_padding = parse(RSA_PADDING, &v)?;
		}
		if let Some(v) = lookup(PBKDF2_ITERATIONS) {
			self.pbkdf2_iterations = parse(PBKDF2_ITERATIONS, &v)?;
		}
		if let Some(v) = lookup(SESSION_IDLE_SECS) {
			self.session_idle_secs = parse(SESSION_IDLE_SECS, &v)?;
		}
		if let Some(v) = lookup(SESSION_SWEEP_SECS) {
			self.session_sweep_secs = parse(SESSION_SWEEP_SECS, &v)?;
		}
		if let Some(v) = lookup(SESSION_RETENTION_SECS) {
			self.session_retention_secs = parse(SESSION_RETENTION_SECS, &v)?;
		}
		if let Some(v) = lookup(LICENSE_TTL_HOURS) {
			self.license_ttl_hours = parse(LICENSE_TTL_HOURS, &v)?;
		}
		if let Some(v) = lookup(ROTATION_CHECK_SECS) {
			self.rotation_check_secs = parse(ROTATION_CHECK_SECS, &v)?;
		}
		if let Some(v) = lookup(RIGHTS) {
			self.rights = v
				.split(',')
				.map(str::trim)
				.filter(|r| !r.is_empty())
				.map(str::to_string)
				.collect();
		}
		if let Some(v) = lookup(OPEN_ACCESS) {
			self.open_access = parse(OPEN_ACCESS, &v)?;
		}
		if let Some(v) = lookup(WRAP_MODE) {
			self.wrap_mode = match v.to_ascii_lowercase().as_str() {
				"asymmetric" => KeyWrapMode::Asymmetric,
				"legacy" => KeyWrapMode::Legacy,
				other => {
					return Err(ConfigError::InvalidValue {
						key: WRAP_MODE,
						message: format!("unknown wrap mode '{other}'"),
					})
				},
			};
		}
		if let Some(v) = lookup(MASTER_KEY) {
			self.master_key = Some(SecretString::new(v));
		}
		if let Some(v) = lookup(INTERNAL_TOKEN) {
			self.internal_token = Some(SecretString::new(v));
		}
		Ok(())
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.rsa_key_bits < RSA_KEY_BITS {
			return Err(ConfigError::InvalidValue {
				key: env_keys::RSA_KEY_BITS,
				message: format!("{} bits is below the 2048-bit minimum", self.rsa_key_bits),
			});
		}
		if self.pbkdf2_iterations == 0 {
			return Err(ConfigError::InvalidValue {
				key: env_keys::PBKDF2_ITERATIONS,
				message: "must be positive".to_string(),
			});
		}
		if self.key_rotation_days <= 0 {
			return Err(ConfigError::InvalidValue {
				key: env_keys::KEY_ROTATION_DAYS,
				message: "must be positive".to_string(),
			});
		}
		if self.session_sweep_secs == 0 || self.rotation_check_secs == 0 {
			return Err(ConfigError::InvalidValue {
				key: env_keys::SESSION_SWEEP_SECS,
				message: "background intervals must be positive".to_string(),
			});
		}
		if self.wrap_mode == KeyWrapMode::Legacy && self.master_key.is_none() {
			return Err(ConfigError::InvalidValue {
				key: env_keys::WRAP_MODE,
				message: "legacy wrapping requires a master key".to_string(),
			});
		}
		Ok(())
	}

	pub fn keypair_options(&self) -> KeyPairOptions {
		KeyPairOptions {
			alias: self.key_alias.clone(),
			key_bits: self.rsa_key_bits,
			rotation_period_days: self.key_rotation_days,
			padding: self.rsa_padding,
		}
	}

	pub fn session_policy(&self) -> SessionPolicy {
		SessionPolicy {
			idle_threshold: chrono::Duration::seconds(self.session_idle_secs as i64),
			sweep_interval: Duration::from_secs(self.session_sweep_secs),
			retention: chrono::Duration::seconds(self.session_retention_secs as i64),
			license_ttl: chrono::Duration::hours(self.license_ttl_hours as i64),
		}
	}

	pub fn rotation_check_interval(&self) -> Duration {
		Duration::from_secs(self.rotation_check_secs)
	}
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
	T: FromStr,
	T::Err: fmt::Display,
{
	value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
		key,
		message: e.to_string(),
	})
}

//! Content-protection engine for uploaded documents.
//!
//! [`DrmCore`] wires the keypair, the content-key wrapper, the services and
//! their stores from a [`DrmConfig`]. Consumers (the HTTP server, the CLI,
//! tests) work against the resulting [`Ctx`].

pub mod config;
pub mod crypto;
pub mod db;
pub mod filesystem;

use std::{path::PathBuf, sync::Arc};

use tokio::{sync::watch, task::JoinHandle};

use crate::{
	config::{ConfigError, DrmConfig},
	crypto::{
		services::{
			AccessControlService, AuditSink, DocumentProtectionService,
			KeyExchangeService, KeyRotationJob, SessionLifecycleMonitor, TracingAuditSink,
		},
		ContentEnvelopeCodec, ContentKeyWrapper, DrmError, DrmResult, FileSecretStore,
		KeyPairManager, SecretStore,
	},
	db::query::{FileWrappedKeyStore, MemorySessionStore, SessionStore, WrappedKeyStore},
	filesystem::{ContentStorage, LocalContentStorage},
};

pub use config::bootstrap_config_dir;

/// Shared handles to every engine service
pub struct Ctx {
	pub config: Arc<DrmConfig>,
	pub keypair: Arc<KeyPairManager>,
	pub wrapper: Arc<ContentKeyWrapper>,
	pub access: Arc<AccessControlService>,
	pub sessions: Arc<SessionLifecycleMonitor>,
	pub key_exchange: Arc<KeyExchangeService>,
	pub content: Arc<DocumentProtectionService>,
	pub rotation: Arc<KeyRotationJob>,
	pub audit: Arc<dyn AuditSink>,
}

/// Collaborators the engine can be built with. Anything left unset falls back
/// to the file-backed or in-memory default.
#[derive(Default)]
pub struct CoreParts {
	pub secret_store: Option<Arc<dyn SecretStore>>,
	pub wrapped_keys: Option<Arc<dyn WrappedKeyStore>>,
	pub sessions: Option<Arc<dyn SessionStore>>,
	pub storage: Option<Arc<dyn ContentStorage>>,
	pub audit: Option<Arc<dyn AuditSink>>,
}

pub struct DrmCore {
	ctx: Arc<Ctx>,
}

impl DrmCore {
	/// Load the configuration from `config_dir` and the environment
	pub fn init_config(config_dir: impl Into<PathBuf>) -> Result<DrmConfig, ConfigError> {
		DrmConfig::load(config_dir.into())
	}

	/// Build the engine with the keypair under `config.key_dir`, and envelopes
	/// plus their wrapped keys under `config.content_dir`.
	///
	/// Active wraps still under a retired generation are migrated before this
	/// returns; failures there are logged and audited but not fatal.
	///
	/// # Errors
	/// `KeyStore` when persisted key material is unusable. This is fatal: the
	/// server must not start on a keypair it cannot read.
	pub async fn new(config: DrmConfig) -> DrmResult<Self> {
		Self::with_parts(config, CoreParts::default()).await
	}

	pub async fn with_parts(config: DrmConfig, parts: CoreParts) -> DrmResult<Self> {
		let secret_store: Arc<dyn SecretStore> = match parts.secret_store {
			Some(store) => store,
			None => Arc::new(FileSecretStore::new(&config.key_dir)?),
		};
		let wrapped_keys = parts
			.wrapped_keys
			.unwrap_or_else(|| Arc::new(FileWrappedKeyStore::new(&config.content_dir)));
		let session_store = parts
			.sessions
			.unwrap_or_else(|| Arc::new(MemorySessionStore::new()));
		let storage = parts
			.storage
			.unwrap_or_else(|| Arc::new(LocalContentStorage::new(&config.content_dir)));
		let audit = parts.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));

		let options = config.keypair_options();
		let keypair_audit = audit.clone();
		let keypair = tokio::task::spawn_blocking(move || {
			KeyPairManager::initialize(secret_store, options, keypair_audit)
		})
		.await
		.map_err(|e| DrmError::KeyStore(format!("keypair initialization panicked: {e}")))?
		.inspect_err(|e| tracing::error!(error = %e, "Failed to initialize server keypair"))?;
		let keypair = Arc::new(keypair);

		let codec = ContentEnvelopeCodec::new(config.pbkdf2_iterations);
		let wrapper = Arc::new(ContentKeyWrapper::new(
			keypair.clone(),
			wrapped_keys,
			codec,
			config.master_key.clone(),
		));

		let access = Arc::new(if config.open_access {
			tracing::warn!("Access control is open; every caller may read every upload");
			AccessControlService::open()
		} else {
			AccessControlService::new()
		});

		let sessions = Arc::new(SessionLifecycleMonitor::new(
			session_store,
			config.session_policy(),
			audit.clone(),
		));

		let key_exchange = Arc::new(KeyExchangeService::new(
			wrapper.clone(),
			access.clone(),
			sessions.clone(),
			audit.clone(),
			config.rights.clone(),
		));

		let content = Arc::new(DocumentProtectionService::new(
			wrapper.clone(),
			codec,
			storage,
			access.clone(),
			sessions.clone(),
			audit.clone(),
			config.wrap_mode,
		));

		let rotation = Arc::new(KeyRotationJob::new(
			wrapper.clone(),
			audit.clone(),
			config.rotation_check_interval(),
		));

		// Wraps left under a retired generation by an interrupted rotation
		if let Err(e) = rotation.rewrap_stale().await {
			tracing::error!(error = %e, "Failed to re-wrap stale content keys at startup");
		}

		let ctx = Ctx {
			config: Arc::new(config),
			keypair,
			wrapper,
			access,
			sessions,
			key_exchange,
			content,
			rotation,
			audit,
		};

		Ok(Self { ctx: Arc::new(ctx) })
	}

	pub fn get_context(&self) -> Arc<Ctx> {
		self.ctx.clone()
	}

	/// Start the session sweeper and the rotation job. Both stop once
	/// `shutdown` carries `true`.
	pub fn spawn_background_tasks(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
		vec![
			self.ctx.sessions.clone().spawn_sweeper(shutdown.clone()),
			self.ctx.rotation.clone().spawn(shutdown),
		]
	}
}

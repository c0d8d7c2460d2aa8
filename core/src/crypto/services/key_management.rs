//! Key Management - scheduled rotation of the server keypair
//!
//! Every check ends by re-wrapping each active content key that is not under
//! the current generation, whether this check rotated or not. That also picks
//! up wraps stranded by a crash mid-rotation or by a rotation done in another
//! process.

use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};

use crate::crypto::{
	errors::{DrmError, DrmResult},
	keypair::RotationOutcome,
	services::audit::{AuditService, AuditSink},
	wrap::ContentKeyWrapper,
};

/// Summary of one rotation check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
	pub outcome: RotationOutcome,
	pub rewrapped: usize,
	pub failed: usize,
}

/// Summary of one re-wrap pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewrapReport {
	pub rewrapped: usize,
	pub failed: usize,
}

pub struct KeyRotationJob {
	wrapper: Arc<ContentKeyWrapper>,
	audit: Arc<dyn AuditSink>,
	interval: Duration,
}

impl KeyRotationJob {
	pub fn new(
		wrapper: Arc<ContentKeyWrapper>,
		audit: Arc<dyn AuditSink>,
		interval: Duration,
	) -> Self {
		Self {
			wrapper,
			audit,
			interval,
		}
	}

	/// Rotate the keypair if it is due and re-wrap stale content keys
	pub async fn check_and_rotate(&self) -> DrmResult<RotationReport> {
		self.run(false).await
	}

	/// Rotate unconditionally and re-wrap stale content keys
	pub async fn force_rotate(&self) -> DrmResult<RotationReport> {
		self.run(true).await
	}

	async fn run(&self, force: bool) -> DrmResult<RotationReport> {
		let keypair = self.wrapper.keypair().clone();

		// RSA generation is CPU bound
		let outcome = tokio::task::spawn_blocking(move || {
			if force {
				keypair.force_rotate()
			} else {
				keypair.rotate()
			}
		})
		.await
		.map_err(|e| DrmError::crypto("rotate", e.to_string()))??;

		let RewrapReport { rewrapped, failed } = self.rewrap_stale().await?;
		Ok(RotationReport {
			outcome,
			rewrapped,
			failed,
		})
	}

	/// Re-wrap every active content key wrapped under a generation other than
	/// the current one.
	///
	/// A wrap that cannot be migrated is counted and audited, and the pass
	/// carries on with the rest.
	pub async fn rewrap_stale(&self) -> DrmResult<RewrapReport> {
		let keypair = self.wrapper.keypair().clone();
		tokio::task::spawn_blocking(move || keypair.sync_with_store())
			.await
			.map_err(|e| DrmError::KeyStore(format!("keypair sync panicked: {e}")))??;

		let current = self.wrapper.keypair().current();
		let stale: Vec<_> = self
			.wrapper
			.list_active()
			.await?
			.into_iter()
			.filter(|row| row.key_id().is_some_and(|id| id != current.key_id()))
			.collect();

		let mut report = RewrapReport::default();
		for row in stale {
			match self.wrapper.rewrap_active(&row).await {
				Ok(Some(new_row)) => {
					report.rewrapped += 1;
					AuditService::content_key_rewrapped(
						row.upload_id,
						row.key_id().unwrap_or_default(),
						new_row.key_id().unwrap_or_default(),
					)
					.emit(self.audit.as_ref());
				},
				Ok(None) => {},
				Err(e) => {
					report.failed += 1;
					AuditService::content_key_unavailable(row.upload_id, "rewrap", e.to_string())
						.emit(self.audit.as_ref());
				},
			}
		}

		if report.rewrapped > 0 || report.failed > 0 {
			tracing::info!(
				key_id = %current.key_id(),
				rewrapped = report.rewrapped,
				failed = report.failed,
				"Re-wrapped stale content keys"
			);
		}
		Ok(report)
	}

	/// Check for rotation every `interval` until `shutdown` flips to true
	pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(self.interval);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					_ = ticker.tick() => {
						if let Err(e) = self.check_and_rotate().await {
							tracing::error!(error = %e, "Keypair rotation check failed");
						}
					}
					changed = shutdown.changed() => {
						if changed.is_err() || *shutdown.borrow() {
							tracing::debug!("Key rotation job stopping");
							break;
						}
					}
				}
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use secrecy::SecretString;

	use super::*;
	use crate::{
		crypto::{
			envelope::ContentEnvelopeCodec,
			keypair::tests::{manager_on, test_manager},
			services::audit::MemoryAuditSink,
			FileSecretStore, SecretStore,
		},
		db::{
			entity::DrmAuditEventType,
			query::{MemoryWrappedKeyStore, WrappedKeyStore},
		},
	};

	fn job() -> (KeyRotationJob, Arc<ContentKeyWrapper>, Arc<MemoryAuditSink>) {
		let audit = Arc::new(MemoryAuditSink::new(64));
		let wrapper = Arc::new(ContentKeyWrapper::new(
			Arc::new(test_manager()),
			Arc::new(MemoryWrappedKeyStore::new()),
			ContentEnvelopeCodec::new(1_000),
			Some(SecretString::new("master".to_string())),
		));
		let job = KeyRotationJob::new(wrapper.clone(), audit.clone(), Duration::from_secs(60));
		(job, wrapper, audit)
	}

	#[tokio::test]
	async fn test_fresh_keypair_is_not_rotated() {
		let (job, _, _) = job();
		let report = job.check_and_rotate().await.unwrap();
		assert_eq!(report.outcome, RotationOutcome::NotDue);
		assert_eq!(report.rewrapped, 0);
	}

	#[tokio::test]
	async fn test_forced_rotation_rewraps_active_keys() {
		let (job, wrapper, audit) = job();

		let key = wrapper.mint_content_key();
		let record = wrapper.wrap_for_storage(&key).unwrap();
		wrapper.mark_active(1, record).await.unwrap();
		let legacy = wrapper.wrap_legacy(&wrapper.mint_content_key()).unwrap();
		wrapper.mark_active(2, legacy).await.unwrap();

		let report = job.force_rotate().await.unwrap();
		assert!(matches!(report.outcome, RotationOutcome::Rotated { .. }));
		assert_eq!(report.rewrapped, 1);
		assert_eq!(report.failed, 0);

		let current = wrapper.keypair().current();
		assert_eq!(
			wrapper.get_active(1).await.unwrap().key_id(),
			Some(current.key_id())
		);
		let unwrapped = wrapper.active_content_key(1).await.unwrap();
		assert_eq!(unwrapped.expose_secret(), key.expose_secret());
		assert!(wrapper.active_content_key(2).await.is_ok());
		assert_eq!(audit.count(DrmAuditEventType::ContentKeyRewrapped), 1);
	}

	#[tokio::test]
	async fn test_check_migrates_wraps_left_by_interrupted_rotation() {
		let (job, wrapper, audit) = job();
		let key = wrapper.mint_content_key();
		wrapper
			.mark_active(3, wrapper.wrap_for_storage(&key).unwrap())
			.await
			.unwrap();

		// Rotated, then stopped before re-wrapping
		wrapper.keypair().force_rotate().unwrap();
		assert!(wrapper.active_content_key(3).await.is_err());

		let report = job.check_and_rotate().await.unwrap();
		assert_eq!(report.outcome, RotationOutcome::NotDue);
		assert_eq!(report.rewrapped, 1);
		assert_eq!(
			wrapper.active_content_key(3).await.unwrap().expose_secret(),
			key.expose_secret()
		);
		assert_eq!(audit.count(DrmAuditEventType::ContentKeyRewrapped), 1);

		assert_eq!(job.rewrap_stale().await.unwrap(), RewrapReport::default());
	}

	#[tokio::test]
	async fn test_unknown_generation_is_reported_not_fatal() {
		let dir = tempfile::TempDir::new().unwrap();
		let secrets: Arc<dyn SecretStore> =
			Arc::new(FileSecretStore::new(dir.path()).unwrap());
		let audit = Arc::new(MemoryAuditSink::new(16));
		let wraps = Arc::new(MemoryWrappedKeyStore::new());
		let wrapper = Arc::new(ContentKeyWrapper::new(
			Arc::new(manager_on(secrets)),
			wraps.clone(),
			ContentEnvelopeCodec::new(1_000),
			None,
		));
		let job = KeyRotationJob::new(wrapper.clone(), audit.clone(), Duration::from_secs(60));

		wraps
			.insert_active(
				9,
				crate::crypto::ContentKeyRecord::Wrapped {
					key_id: "feedfacefeedface".into(),
					ciphertext: vec![0; 128],
				},
			)
			.await
			.unwrap();

		let report = job.rewrap_stale().await.unwrap();
		assert_eq!(report, RewrapReport { rewrapped: 0, failed: 1 });
		assert_eq!(audit.count(DrmAuditEventType::ContentKeyUnavailable), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_spawned_job_stops_on_shutdown() {
		let (job, _, _) = job();
		let (tx, rx) = watch::channel(false);
		let handle = Arc::new(job).spawn(rx);

		tokio::time::sleep(Duration::from_secs(61)).await;
		tx.send(true).unwrap();
		handle.await.unwrap();
	}
}

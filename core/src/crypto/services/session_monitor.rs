//! Session Lifecycle Monitor - DRM session tracking and idle eviction
//!
//! ```text
//! ACTIVE --heartbeat--> ACTIVE
//! ACTIVE --idle > threshold (observed by sweep)--> INACTIVE   (terminal)
//! ACTIVE --revoke | superseded | license expired--> INACTIVE
//! ```
//!
//! Eviction is deliberately lax: the sweep runs on a fixed interval, so a
//! session can stay nominally active for up to one interval past the idle
//! threshold, and a heartbeat that arrives in that window still succeeds.
//!
//! Ended sessions stay queryable for a retention window, after which the
//! sweep deletes them.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};

use crate::{
	crypto::{
		errors::{DrmError, DrmResult},
		services::audit::{AuditService, AuditSink},
	},
	db::{
		entity::{DrmAuditEventType, DrmSession, SessionEndReason, SessionStatus},
		query::SessionStore,
	},
};

/// Timing knobs for session tracking
#[derive(Debug, Clone)]
pub struct SessionPolicy {
	/// A session whose last heartbeat is older than this is evicted
	pub idle_threshold: Duration,
	/// How often the sweep runs
	pub sweep_interval: std::time::Duration,
	/// How long an ended session is kept before the sweep deletes it
	pub retention: Duration,
	/// Lifetime of the license granted with a session
	pub license_ttl: Duration,
}

impl Default for SessionPolicy {
	fn default() -> Self {
		Self {
			idle_threshold: Duration::seconds(180),
			sweep_interval: std::time::Duration::from_secs(120),
			retention: Duration::hours(1),
			license_ttl: Duration::hours(24),
		}
	}
}

/// Outcome of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
	pub scanned: usize,
	pub deactivated: usize,
	/// Ended sessions deleted for being past retention
	pub purged: usize,
}

pub struct SessionLifecycleMonitor {
	store: Arc<dyn SessionStore>,
	policy: SessionPolicy,
	audit: Arc<dyn AuditSink>,
}

impl SessionLifecycleMonitor {
	pub fn new(
		store: Arc<dyn SessionStore>,
		policy: SessionPolicy,
		audit: Arc<dyn AuditSink>,
	) -> Self {
		Self {
			store,
			policy,
			audit,
		}
	}

	pub fn policy(&self) -> &SessionPolicy {
		&self.policy
	}

	/// Create a session for a successful key exchange.
	///
	/// Any earlier active session of the same user on the same device for the
	/// same upload is superseded once the new one is stored.
	pub async fn issue_session(
		&self,
		upload_id: i64,
		device_id: &str,
		user_id: &str,
		rights: Vec<String>,
	) -> DrmResult<DrmSession> {
		let now = Utc::now();
		let session = DrmSession::issue(
			upload_id,
			device_id,
			user_id,
			rights,
			self.policy.license_ttl,
			now,
		);

		let earlier = self
			.store
			.active_for_device(upload_id, device_id, user_id)
			.await
			.map_err(|e| DrmError::SessionCreation {
				upload_id,
				message: e.to_string(),
			})?;

		self.store.insert(session.clone()).await?;

		for token in earlier {
			self.end(&token, now, SessionEndReason::Superseded).await?;
		}

		tracing::debug!(
			upload_id,
			device_id,
			session = session.token_hint(),
			"Issued DRM session"
		);
		Ok(session)
	}

	pub async fn heartbeat(&self, token: &str) -> DrmResult<SessionStatus> {
		self.heartbeat_at(token, Utc::now()).await
	}

	/// Record a heartbeat at `now`.
	///
	/// # Errors
	/// - `SessionNotFound` for an unknown token
	/// - `SessionInactive` if the session already ended, or ends here because
	///   its license has expired
	pub async fn heartbeat_at(
		&self,
		token: &str,
		now: DateTime<Utc>,
	) -> DrmResult<SessionStatus> {
		let (session, changed) = self
			.store
			.modify(token, &|s| {
				if !s.active {
					false
				} else if s.is_license_expired_at(now) {
					s.deactivate(now, SessionEndReason::LicenseExpired)
				} else {
					if now > s.last_heartbeat {
						s.last_heartbeat = now;
					}
					true
				}
			})
			.await?
			.ok_or(DrmError::SessionNotFound)?;

		if !session.active {
			if changed {
				AuditService::session_ended(
					DrmAuditEventType::SessionExpired,
					&session.user_id,
					session.upload_id,
					session.token_hint(),
				)
				.details(serde_json::json!({ "reason": "license_expired" }))
				.emit(self.audit.as_ref());
			}
			return Err(DrmError::SessionInactive);
		}

		Ok(SessionStatus::from(&session))
	}

	pub async fn status(&self, token: &str) -> DrmResult<SessionStatus> {
		self.store
			.get(token)
			.await?
			.map(|s| SessionStatus::from(&s))
			.ok_or(DrmError::SessionNotFound)
	}

	/// The session behind `token`, provided it is still active
	pub async fn require_active(&self, token: &str) -> DrmResult<DrmSession> {
		let session = self.store.get(token).await?.ok_or(DrmError::SessionNotFound)?;
		if !session.active {
			return Err(DrmError::SessionInactive);
		}
		Ok(session)
	}

	/// End a session explicitly. Revoking an already inactive session is not
	/// an error; its original end reason is kept.
	pub async fn revoke(&self, token: &str) -> DrmResult<SessionStatus> {
		let session = self
			.end(token, Utc::now(), SessionEndReason::Revoked)
			.await?
			.ok_or(DrmError::SessionNotFound)?;
		Ok(SessionStatus::from(&session))
	}

	async fn end(
		&self,
		token: &str,
		now: DateTime<Utc>,
		reason: SessionEndReason,
	) -> DrmResult<Option<DrmSession>> {
		let Some((session, changed)) = self
			.store
			.modify(token, &|s| s.deactivate(now, reason))
			.await?
		else {
			return Ok(None);
		};

		if changed {
			let event_type = match reason {
				SessionEndReason::Revoked => DrmAuditEventType::SessionRevoked,
				SessionEndReason::Superseded => DrmAuditEventType::SessionSuperseded,
				SessionEndReason::IdleTimeout | SessionEndReason::LicenseExpired => {
					DrmAuditEventType::SessionExpired
				},
			};
			AuditService::session_ended(
				event_type,
				&session.user_id,
				session.upload_id,
				session.token_hint(),
			)
			.emit(self.audit.as_ref());
		}

		Ok(Some(session))
	}

	pub async fn sweep(&self) -> DrmResult<SweepReport> {
		self.sweep_at(Utc::now()).await
	}

	/// Deactivate every active session idle for longer than the threshold,
	/// then delete sessions that ended more than the retention window ago.
	///
	/// The idle check is repeated under the row lock, so a heartbeat that
	/// landed after the scan keeps its session alive.
	pub async fn sweep_at(&self, now: DateTime<Utc>) -> DrmResult<SweepReport> {
		let tokens = self.store.active_tokens().await?;
		let threshold = self.policy.idle_threshold;
		let mut report = SweepReport {
			scanned: tokens.len(),
			..Default::default()
		};

		for token in tokens {
			let outcome = self
				.store
				.modify(&token, &|s| {
					s.is_idle_at(now, threshold)
						&& s.deactivate(now, SessionEndReason::IdleTimeout)
				})
				.await?;

			if let Some((session, true)) = outcome {
				report.deactivated += 1;
				AuditService::session_ended(
					DrmAuditEventType::SessionExpired,
					&session.user_id,
					session.upload_id,
					session.token_hint(),
				)
				.details(serde_json::json!({ "reason": "idle_timeout" }))
				.emit(self.audit.as_ref());
			}
		}

		report.purged = self.store.purge_ended(now - self.policy.retention).await?;

		if report.deactivated > 0 || report.purged > 0 {
			tracing::info!(
				scanned = report.scanned,
				deactivated = report.deactivated,
				purged = report.purged,
				"Session sweep completed"
			);
		} else {
			tracing::trace!(scanned = report.scanned, "Session sweep completed");
		}

		Ok(report)
	}

	/// Run the sweep every `sweep_interval` until `shutdown` flips to true.
	///
	/// The first sweep runs one full interval after spawning.
	pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(self.policy.sweep_interval);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			ticker.tick().await;

			loop {
				tokio::select! {
					_ = ticker.tick() => {
						if let Err(e) = self.sweep().await {
							tracing::error!(error = %e, "Session sweep failed");
						}
					}
					changed = shutdown.changed() => {
						if changed.is_err() || *shutdown.borrow() {
							tracing::debug!("Session sweeper stopping");
							break;
						}
					}
				}
			}
		})
	}
}

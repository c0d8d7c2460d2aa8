//! Audit Service - Security audit logging
//!
//! Every event is written to the `drm::audit` tracing target. Security events
//! (denials, tag failures, unusable keys) go out at `warn`, everything else at
//! `info`. An [`AuditSink`] can additionally retain the structured records.

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;

use crate::db::entity::{DrmAuditEvent, DrmAuditEventType};

/// Destination for structured audit records
pub trait AuditSink: Send + Sync {
	fn record(&self, event: &DrmAuditEvent);
}

/// Sink that keeps nothing beyond the tracing output
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
	fn record(&self, _event: &DrmAuditEvent) {}
}

/// Bounded in-memory sink holding the most recent records
pub struct MemoryAuditSink {
	events: Mutex<VecDeque<DrmAuditEvent>>,
	capacity: usize,
}

impl MemoryAuditSink {
	pub fn new(capacity: usize) -> Self {
		Self {
			events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
			capacity: capacity.max(1),
		}
	}

	pub fn events(&self) -> Vec<DrmAuditEvent> {
		self.events.lock().iter().cloned().collect()
	}

	pub fn count(&self, event_type: DrmAuditEventType) -> usize {
		self.events
			.lock()
			.iter()
			.filter(|e| e.event_type == event_type)
			.count()
	}
}

impl AuditSink for MemoryAuditSink {
	fn record(&self, event: &DrmAuditEvent) {
		let mut events = self.events.lock();
		if events.len() == self.capacity {
			events.pop_front();
		}
		events.push_back(event.clone());
	}
}

/// Audit log entry builder
pub struct AuditLogBuilder {
	event_type: DrmAuditEventType,
	user_id: Option<String>,
	upload_id: Option<i64>,
	operation: Option<String>,
	details: Option<serde_json::Value>,
	succeeded: bool,
	error_message: Option<String>,
}

impl AuditLogBuilder {
	pub fn new(event_type: DrmAuditEventType) -> Self {
		Self {
			event_type,
			user_id: None,
			upload_id: None,
			operation: None,
			details: None,
			succeeded: true,
			error_message: None,
		}
	}

	pub fn user(mut self, user_id: impl Into<String>) -> Self {
		self.user_id = Some(user_id.into());
		self
	}

	pub fn upload(mut self, upload_id: i64) -> Self {
		self.upload_id = Some(upload_id);
		self
	}

	pub fn operation(mut self, operation: impl Into<String>) -> Self {
		self.operation = Some(operation.into());
		self
	}

	pub fn details(mut self, details: serde_json::Value) -> Self {
		self.details = Some(details);
		self
	}

	pub fn failed(mut self, error_message: impl Into<String>) -> Self {
		self.succeeded = false;
		self.error_message = Some(error_message.into());
		self
	}

	pub fn build(self) -> DrmAuditEvent {
		DrmAuditEvent {
			event_type: self.event_type,
			user_id: self.user_id,
			upload_id: self.upload_id,
			operation: self.operation,
			details: self.details,
			succeeded: self.succeeded,
			error_message: self.error_message,
			timestamp: Utc::now(),
		}
	}

	/// Log the event on the audit target and hand it to `sink`
	pub fn emit(self, sink: &dyn AuditSink) -> DrmAuditEvent {
		let event = self.build();
		let details = event.details.as_ref().map(|d| d.to_string());

		if event.event_type.is_security_event() || !event.succeeded {
			tracing::warn!(
				target: "drm::audit",
				event = %event.event_type,
				user_id = event.user_id.as_deref(),
				upload_id = event.upload_id,
				operation = event.operation.as_deref(),
				details = details.as_deref(),
				error = event.error_message.as_deref(),
				"DRM security event"
			);
		} else {
			tracing::info!(
				target: "drm::audit",
				event = %event.event_type,
				user_id = event.user_id.as_deref(),
				upload_id = event.upload_id,
				operation = event.operation.as_deref(),
				details = details.as_deref(),
				"DRM audit event"
			);
		}

		sink.record(&event);
		event
	}
}

/// Constructors for the audit events the engine emits
pub struct AuditService;

impl AuditService {
	pub fn key_generated(alias: &str, key_id: &str, key_size: usize) -> AuditLogBuilder {
		AuditLogBuilder::new(DrmAuditEventType::KeyGenerated)
			.operation("initialize")
			.details(json!({
				"alias": alias,
				"key_id": key_id,
				"key_size": key_size,
			}))
	}

	/// `archive` is `None` when the new generation was adopted from the secret
	/// store rather than rotated here
	pub fn key_rotated(
		previous_key_id: &str,
		key_id: &str,
		archive: Option<&str>,
	) -> AuditLogBuilder {
		AuditLogBuilder::new(DrmAuditEventType::KeyRotated)
			.operation(if archive.is_some() { "rotate" } else { "adopt" })
			.details(json!({
				"previous_key_id": previous_key_id,
				"key_id": key_id,
				"archive": archive,
			}))
	}

	pub fn content_protected(upload_id: i64, key_kind: &str, bytes: u64) -> AuditLogBuilder {
		AuditLogBuilder::new(DrmAuditEventType::ContentProtected)
			.upload(upload_id)
			.details(json!({
				"key_kind": key_kind,
				"envelope_bytes": bytes,
			}))
	}

	pub fn content_key_rewrapped(upload_id: i64, from_key_id: &str, to_key_id: &str) -> AuditLogBuilder {
		AuditLogBuilder::new(DrmAuditEventType::ContentKeyRewrapped)
			.upload(upload_id)
			.details(json!({
				"from_key_id": from_key_id,
				"to_key_id": to_key_id,
			}))
	}

	pub fn content_key_issued(
		user_id: &str,
		upload_id: i64,
		device_id: &str,
		token_hint: &str,
	) -> AuditLogBuilder {
		AuditLogBuilder::new(DrmAuditEventType::ContentKeyIssued)
			.user(user_id)
			.upload(upload_id)
			.details(json!({
				"device_id": device_id,
				"session": token_hint,
			}))
	}

	pub fn access_denied(user_id: &str, upload_id: i64, operation: &str) -> AuditLogBuilder {
		AuditLogBuilder::new(DrmAuditEventType::AccessDenied)
			.user(user_id)
			.upload(upload_id)
			.operation(operation)
			.failed("access control denied the caller")
	}

	pub fn authentication_failed(upload_id: Option<i64>, operation: &str) -> AuditLogBuilder {
		let builder = AuditLogBuilder::new(DrmAuditEventType::AuthenticationFailed)
			.operation(operation)
			.failed("authentication tag did not verify");
		match upload_id {
			Some(id) => builder.upload(id),
			None => builder,
		}
	}

	pub fn content_key_unavailable(
		upload_id: i64,
		operation: &str,
		reason: impl Into<String>,
	) -> AuditLogBuilder {
		AuditLogBuilder::new(DrmAuditEventType::ContentKeyUnavailable)
			.upload(upload_id)
			.operation(operation)
			.failed(reason)
	}

	pub fn session_ended(
		event_type: DrmAuditEventType,
		user_id: &str,
		upload_id: i64,
		token_hint: &str,
	) -> AuditLogBuilder {
		AuditLogBuilder::new(event_type)
			.user(user_id)
			.upload(upload_id)
			.details(json!({ "session": token_hint }))
	}
}

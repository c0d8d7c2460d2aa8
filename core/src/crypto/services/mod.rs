//! High-level content-protection services
//!
//! This module provides the service layer on top of the key wrapper and the
//! envelope codec: document protection, key exchange, session tracking,
//! keypair rotation, access control and audit logging.

pub mod access_control;
pub mod audit;
pub mod content;
pub mod key_exchange;
pub mod key_management;
pub mod session_monitor;

pub use access_control::{AccessControl, AccessControlService};
pub use audit::{AuditLogBuilder, AuditService, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use content::{Caller, DocumentProtectionService, KeyWrapMode, ProtectedUpload};
pub use key_exchange::{ContentKeyGrant, KeyExchangeService, PublicKeyInfo};
pub use key_management::{KeyRotationJob, RewrapReport, RotationReport};
pub use session_monitor::{SessionLifecycleMonitor, SessionPolicy, SweepReport};

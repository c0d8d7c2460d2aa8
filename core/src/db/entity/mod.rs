mod crypto_audit;
mod drm_session;
mod wrapped_key;

pub use crypto_audit::{DrmAuditEvent, DrmAuditEventType};
pub use drm_session::{DrmSession, SessionEndReason, SessionStatus};
pub use wrapped_key::WrappedContentKey;

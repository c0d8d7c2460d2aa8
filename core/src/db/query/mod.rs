pub mod session_store;
pub mod wrapped_key_store;

pub use session_store::{MemorySessionStore, SessionStore};
pub use wrapped_key_store::{FileWrappedKeyStore, MemoryWrappedKeyStore, WrappedKeyStore};

use std::ops::Deref;
use std::sync::Arc;

use drm_core::Ctx;

/// Application state that wraps the engine context
#[derive(Clone)]
pub struct AppState {
	pub ctx: Arc<Ctx>,
}

impl AppState {
	pub fn new(ctx: Arc<Ctx>) -> Self {
		Self { ctx }
	}
}

// Handlers reach the engine services directly through the state
impl Deref for AppState {
	type Target = Ctx;

	fn deref(&self) -> &Self::Target {
		&self.ctx
	}
}

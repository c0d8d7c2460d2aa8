#![warn(clippy::dbg_macro)]

pub mod cli;
pub mod config;
mod errors;
mod http_server;
pub mod middleware;
mod routers;
mod utils;

pub use errors::{APIError, EntryError, ServerError};
pub use http_server::{app, run_http_server};

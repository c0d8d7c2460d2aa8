//! Persistence seams for wrapped content keys and DRM sessions
//!
//! The engine only talks to the traits in [`query`]; the in-memory
//! implementations there are what the server ships with and what the tests use.

pub mod entity;
pub mod query;

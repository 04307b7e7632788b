//! # Rally Gateway
//!
//! HTTP API over the campaign engine: start, advance, cancel and complete
//! operations, and hand ready messages to an external sender.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};

//! REST API for the chat front end.
//!
//! Submit, poll and cancel downloads, search mirrors and inspect accounts.

pub mod error;
pub mod routes;
pub mod server;
pub mod signed;

pub use server::{ApiServer, ApiServerConfig, AppState, build_router};

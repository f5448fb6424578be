//! movie-relay library crate.
//!
//! Turns on-demand movie requests into delivered files: mirror resolution,
//! extraction, conversion and upload through a pool of delivery accounts,
//! with bounded concurrency and a pollable status per job.

pub mod api;
pub mod catalog;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod external;
pub mod ledger;
pub mod logging;
pub mod panic_hook;
pub mod pipeline;
pub mod poller;
pub mod resolver;

pub use error::{Error, Result};

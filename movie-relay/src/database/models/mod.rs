//! Row models mapping the SQLite schema.

pub mod account;
pub mod delivered;

pub use account::*;
pub use delivered::*;

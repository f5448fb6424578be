//! Repository layer for database access.

pub mod account;
pub mod delivered;

pub use account::SqlxAccountRepository;
pub use delivered::SqlxDeliveredRepository;

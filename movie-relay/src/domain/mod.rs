//! Domain layer for movie-relay.
//!
//! This module contains the core entities and value objects shared by the
//! ledger, resolver, pipeline and poller.

pub mod account;
pub mod delivery;
pub mod job;
pub mod mirror;
pub mod movie;
pub mod value_objects;

pub use account::{Capability, DeliveryAccount};
pub use delivery::{DeliveredContent, PartRef, ResultRef, normalize_source_url};
pub use job::{DownloadJob, ErrorKind, JobError, JobId, JobState};
pub use mirror::{MirrorCandidate, MirrorHit, SearchFilters};
pub use movie::{MovieKey, UserId, normalize_title};
pub use value_objects::*;

//! Mirror resolver: fan-out search, ranking and de-duplication.

mod ranking;
mod resilience;
mod service;

pub use ranking::{compare_candidates, rank, score_hit, title_confidence};
pub use resilience::{CircuitBreaker, CircuitState, SourceBreakers};
pub use service::{
    MirrorResolver, RankedCandidates, ResolverConfig, SearchOutcome, SourceFailure, deduplicate,
    deduplicate_against,
};

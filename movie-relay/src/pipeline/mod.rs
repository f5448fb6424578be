//! Download pipeline: admission, job state machine and workers.
//!
//! - `job_store` keeps every live job plus the duplicate and queue indexes
//! - `admission` applies the per-user and global limits
//! - `runner` drives one job through its stages with the retry policy
//! - `worker_pool` runs jobs, one per worker at a time
//! - `purge` expires overdue jobs and evicts finished ones

pub mod admission;
pub mod job_store;
mod manager;
mod progress;
pub mod purge;
pub mod runner;
pub mod worker_pool;

pub use admission::{
    AdmissionConfig, AdmissionController, QueueDepthStatus, QueueStats, SubmitOutcome,
    SubmitRequest, UserLimits,
};
pub use job_store::{Admission, FinishReport, JobOutcome, JobStore, SlotCounts};
pub use manager::{CancelAck, MirrorSearch, PipelineManager, PipelineManagerConfig};
pub use progress::ProgressReporter;
pub use purge::{JobSweeper, PurgeConfig, SweepReport};
pub use runner::{CancelRegistry, Collaborators, JobRunner, RunnerConfig, StageTimeouts};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};

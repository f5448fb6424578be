//! Background sweeper for overdue and long-finished jobs.
//!
//! Expires non-terminal jobs past their wall-clock deadline and evicts
//! terminal jobs once the grace period has passed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::admission::AdmissionController;
use super::job_store::JobOutcome;
use super::runner::CancelRegistry;
use crate::poller::StatusPoller;

/// Configuration for job sweeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// How long a terminal job stays pollable.
    #[serde(default = "default_terminal_grace_secs")]
    pub terminal_grace_secs: u64,

    /// Interval between sweeps in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_terminal_grace_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            terminal_grace_secs: default_terminal_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl PurgeConfig {
    pub fn with_terminal_grace_secs(mut self, secs: u64) -> Self {
        self.terminal_grace_secs = secs;
        self
    }

    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
    pub tokens_pruned: usize,
}

pub struct JobSweeper {
    admission: Arc<AdmissionController>,
    cancellations: Arc<CancelRegistry>,
    poller: Option<Arc<StatusPoller>>,
    config: PurgeConfig,
}

impl JobSweeper {
    pub fn new(
        admission: Arc<AdmissionController>,
        cancellations: Arc<CancelRegistry>,
        config: PurgeConfig,
    ) -> Self {
        Self {
            admission,
            cancellations,
            poller: None,
            config,
        }
    }

    /// Also prune stale poll tokens on every sweep.
    pub fn with_poller(mut self, poller: Arc<StatusPoller>) -> Self {
        self.poller = Some(poller);
        self
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for id in self.admission.store().overdue(now) {
            match self.admission.finish(&id, JobOutcome::Expired, now) {
                Ok(Some(_)) => {
                    self.cancellations.cancel(&id);
                    info!(job_id = %id, "Job expired");
                    report.expired += 1;
                }
                Ok(None) => {}
                Err(e) => error!(job_id = %id, error = %e, "Failed to expire job"),
            }
        }

        let grace = chrono::Duration::seconds(self.config.terminal_grace_secs as i64);
        let evicted = self.admission.store().evict_finished_before(now - grace);
        report.evicted = evicted.len();

        if let Some(poller) = &self.poller {
            report.tokens_pruned = poller.prune(now);
        }

        if report != SweepReport::default() {
            debug!(
                expired = report.expired,
                evicted = report.evicted,
                tokens_pruned = report.tokens_pruned,
                "Sweep finished"
            );
        }
        report
    }

    pub fn start(self, cancellation_token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.config.sweep_interval_secs,
                grace_secs = self.config.terminal_grace_secs,
                "Job sweeper started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Job sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_at(Utc::now());
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryDeliveredStore;
    use crate::domain::JobState;
    use crate::pipeline::admission::{AdmissionConfig, SubmitRequest};
    use crate::pipeline::job_store::JobStore;

    #[tokio::test]
    async fn test_sweep_expires_then_evicts() {
        let admission = Arc::new(AdmissionController::new(
            Arc::new(JobStore::new(1)),
            Arc::new(InMemoryDeliveredStore::new()),
            AdmissionConfig::default(),
            chrono::Duration::minutes(10),
        ));
        let registry = Arc::new(CancelRegistry::new());
        let sweeper = JobSweeper::new(admission.clone(), registry.clone(), PurgeConfig::default());

        let t0 = Utc::now();
        let outcome = admission
            .submit_at(SubmitRequest::new(1, "Heat", "en"), t0)
            .await
            .unwrap();
        let queued = admission
            .submit_at(SubmitRequest::new(2, "Heat", "en"), t0)
            .await
            .unwrap();
        let id = outcome.job_id().unwrap().clone();
        let token = registry.register(&id);

        assert_eq!(sweeper.sweep_at(t0 + chrono::Duration::minutes(5)).expired, 0);

        let later = t0 + chrono::Duration::minutes(11);
        let report = sweeper.sweep_at(later);
        assert_eq!(report.expired, 2);
        assert!(token.is_cancelled());
        assert_eq!(admission.store().get(&id).unwrap().state, JobState::Expired);
        assert_eq!(
            admission.store().get(queued.job_id().unwrap()).unwrap().state,
            JobState::Expired
        );

        let report = sweeper.sweep_at(later + chrono::Duration::hours(2));
        assert_eq!(report.evicted, 2);
        assert!(admission.store().get(&id).is_none());
    }
}

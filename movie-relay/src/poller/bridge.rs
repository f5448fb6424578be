//! Polling bridge between the stateless front end and running jobs.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::status::{JobStatus, PollToken, PollerConfig};
use crate::domain::JobId;
use crate::pipeline::{AdmissionController, CancelRegistry, JobOutcome};

pub struct StatusPoller {
    admission: Arc<AdmissionController>,
    cancellations: Arc<CancelRegistry>,
    tokens: DashMap<JobId, PollToken>,
    config: PollerConfig,
}

impl StatusPoller {
    pub fn new(
        admission: Arc<AdmissionController>,
        cancellations: Arc<CancelRegistry>,
        config: PollerConfig,
    ) -> Self {
        Self {
            admission,
            cancellations,
            tokens: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.token_ttl_secs.max(1) as i64)
    }

    /// Start a polling session for `job_id`, replacing any earlier one.
    pub fn issue(&self, job_id: &JobId, now: DateTime<Utc>) -> PollToken {
        let token = PollToken::issue(now, self.ttl());
        self.tokens.insert(job_id.clone(), token);
        token
    }

    pub fn token(&self, job_id: &JobId) -> Option<PollToken> {
        self.tokens.get(job_id).map(|t| *t)
    }

    pub fn poll(&self, job_id: &JobId) -> Option<JobStatus> {
        self.poll_at(job_id, Utc::now())
    }

    /// Current status, or `None` for an id this process never saw.
    ///
    /// The only side effect is expiring a job found past its deadline.
    pub fn poll_at(&self, job_id: &JobId, now: DateTime<Utc>) -> Option<JobStatus> {
        let token = self.token(job_id);
        let Some(job) = self.admission.store().get(job_id) else {
            return token.map(|_| JobStatus::Expired {
                job_id: job_id.clone(),
            });
        };

        if token.is_some_and(|t| t.is_expired(now)) {
            debug!(%job_id, "Poll token expired");
            return Some(JobStatus::Expired {
                job_id: job_id.clone(),
            });
        }

        if job.is_overdue(now) {
            match self.admission.finish(job_id, JobOutcome::Expired, now) {
                Ok(Some(_)) => {
                    self.cancellations.cancel(job_id);
                    info!(%job_id, "Job expired on poll");
                }
                Ok(None) => {}
                Err(e) => error!(%job_id, error = %e, "Failed to expire job on poll"),
            }
            return Some(JobStatus::Expired {
                job_id: job_id.clone(),
            });
        }

        Some(JobStatus::from_job(&job, now, &self.config))
    }

    /// Drop tokens whose job was evicted and that expired more than one
    /// TTL ago. Returns how many.
    ///
    /// A token outlives its job so a late poll still answers `Expired`.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.ttl();
        let store = self.admission.store();
        let before = self.tokens.len();
        self.tokens
            .retain(|job_id, token| token.expires_at > cutoff || store.get(job_id).is_some());
        before - self.tokens.len()
    }
}

//! Pipeline Manager: the single owner of job state and background services.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::admission::{AdmissionConfig, AdmissionController, QueueStats, SubmitOutcome, SubmitRequest};
use super::job_store::JobStore;
use super::purge::{JobSweeper, PurgeConfig};
use super::runner::{CancelRegistry, Collaborators, JobRunner, RunnerConfig};
use super::worker_pool::{WorkerPool, WorkerPoolConfig};
use crate::domain::{DeliveryAccount, JobId, JobState, MirrorCandidate, SearchFilters};
use crate::ledger::{AccountProbe, LedgerError};
use crate::poller::{JobStatus, PollerConfig, StatusPoller};
use crate::resolver::{SearchOutcome, SourceFailure, deduplicate_against};
use crate::{Error, Result};

/// Configuration for the Pipeline Manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineManagerConfig {
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub workers: WorkerPoolConfig,
    #[serde(default)]
    pub purge: PurgeConfig,
    #[serde(default)]
    pub poller: PollerConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelAck {
    pub job_id: JobId,
    /// False when the job had already finished.
    pub cancelled: bool,
    pub state: JobState,
}

/// Result of a front-end mirror search.
#[derive(Debug, Clone)]
pub enum MirrorSearch {
    Candidates(Vec<MirrorCandidate>),
    NoResults(Vec<SourceFailure>),
}

pub struct PipelineManager {
    admission: Arc<AdmissionController>,
    runner: Arc<JobRunner>,
    poller: Arc<StatusPoller>,
    cancellations: Arc<CancelRegistry>,
    collaborators: Collaborators,
    worker_pool: WorkerPool,
    purge_config: PurgeConfig,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineManager {
    pub fn new(config: PipelineManagerConfig, collaborators: Collaborators) -> Self {
        let store = Arc::new(JobStore::new(config.admission.max_active_jobs));
        let admission = Arc::new(AdmissionController::new(
            store,
            collaborators.catalog.clone(),
            config.admission.clone(),
            config.runner.job_deadline(),
        ));
        let cancellations = Arc::new(CancelRegistry::new());
        let runner = Arc::new(JobRunner::new(
            admission.clone(),
            collaborators.clone(),
            config.runner.clone(),
            cancellations.clone(),
        ));
        let poller = Arc::new(StatusPoller::new(
            admission.clone(),
            cancellations.clone(),
            config.poller.clone(),
        ));

        Self {
            admission,
            runner,
            poller,
            cancellations,
            collaborators,
            worker_pool: WorkerPool::new(
                config.workers.clone(),
                config.admission.max_active_jobs,
            ),
            purge_config: config.purge,
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Start workers, the sweeper and the account probe.
    pub fn start(&self) {
        info!("Starting pipeline manager");
        self.worker_pool.start(self.admission.clone(), self.runner.clone());

        let sweeper = JobSweeper::new(
            self.admission.clone(),
            self.cancellations.clone(),
            self.purge_config.clone(),
        )
        .with_poller(self.poller.clone());
        let probe = AccountProbe::new(
            self.collaborators.ledger.clone(),
            self.collaborators.delivery.clone(),
            self.collaborators.ledger.config().probe_interval_secs,
        );

        let mut tasks = self.tasks.lock();
        tasks.push(sweeper.start(self.cancellation_token.child_token()));
        tasks.push(probe.start(self.cancellation_token.child_token()));
    }

    pub async fn stop(&self) {
        info!("Stopping pipeline manager");
        self.cancellation_token.cancel();
        self.worker_pool.stop().await;

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Pipeline manager stopped");
    }

    /// Admit a request and open a polling session for the resulting job.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        let outcome = self.admission.submit(request).await?;
        if let Some(id) = outcome.job_id() {
            self.poller.issue(id, Utc::now());
        }
        Ok(outcome)
    }

    pub fn poll(&self, job_id: &JobId) -> Option<JobStatus> {
        self.poller.poll(job_id)
    }

    /// Mark a job terminal and signal its worker at the next checkpoint.
    pub fn cancel(&self, job_id: &JobId) -> Result<CancelAck> {
        let report = self.admission.cancel(job_id, Utc::now())?;
        let cancelled = report.is_some();
        if cancelled {
            self.cancellations.cancel(job_id);
        }
        let state = self
            .admission
            .store()
            .get(job_id)
            .map(|j| j.state)
            .ok_or_else(|| Error::not_found("DownloadJob", job_id.as_str()))?;
        Ok(CancelAck {
            job_id: job_id.clone(),
            cancelled,
            state,
        })
    }

    pub fn stats(&self) -> QueueStats {
        self.admission.stats()
    }

    pub async fn accounts(&self) -> Result<Vec<DeliveryAccount>> {
        self.collaborators
            .ledger
            .accounts()
            .await
            .map_err(|e| match e {
                LedgerError::Store(e) => e,
                other => Error::Other(other.to_string()),
            })
    }

    /// Ranked candidates minus sources that already delivered the dub.
    pub async fn search_mirrors(
        &self,
        title: &str,
        filters: &SearchFilters,
        alternate_dub: bool,
    ) -> Result<MirrorSearch> {
        match self.collaborators.resolver.search(title, filters).await {
            SearchOutcome::NoResults { failures } => Ok(MirrorSearch::NoResults(failures)),
            SearchOutcome::Found(ranked) => {
                let candidates = deduplicate_against(
                    self.collaborators.catalog.as_ref(),
                    ranked.collect(),
                    filters.dub.as_deref(),
                    alternate_dub,
                )
                .await?;
                Ok(MirrorSearch::Candidates(candidates))
            }
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn poller(&self) -> &Arc<StatusPoller> {
        &self.poller
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }
}

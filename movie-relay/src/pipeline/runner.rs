//! Drives one job through resolve, extract, convert and upload.
//!
//! Each stage runs under `min(stage timeout, time left before the deadline)`.
//! Transient errors retry the same stage with backoff until the stage-local
//! budget runs out; resource exhaustion waits without spending the budget.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::admission::AdmissionController;
use super::job_store::{JobOutcome, JobStore};
use super::progress::ProgressReporter;
use crate::catalog::DeliveredStore;
use crate::domain::{
    Capability, DeliveredContent, DownloadJob, ErrorKind, JobError, JobId, JobState,
    MirrorCandidate, ResultRef, RetryPolicy, SearchFilters,
};
use crate::external::{
    ConvertedAsset, DeliveryChannel, Extractor, ExternalError, RawStream, Transcoder,
};
use crate::ledger::{AccountLedger, LedgerError};
use crate::resolver::{MirrorResolver, SearchOutcome};

/// Upper bound on each stage attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    #[serde(default = "default_resolve_secs")]
    pub resolve_secs: u64,
    #[serde(default = "default_extract_secs")]
    pub extract_secs: u64,
    #[serde(default = "default_convert_secs")]
    pub convert_secs: u64,
    #[serde(default = "default_upload_secs")]
    pub upload_secs: u64,
}

fn default_resolve_secs() -> u64 {
    60
}

fn default_extract_secs() -> u64 {
    300
}

fn default_convert_secs() -> u64 {
    3600
}

fn default_upload_secs() -> u64 {
    3600
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            resolve_secs: default_resolve_secs(),
            extract_secs: default_extract_secs(),
            convert_secs: default_convert_secs(),
            upload_secs: default_upload_secs(),
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: JobState) -> Duration {
        let secs = match stage {
            JobState::Resolving => self.resolve_secs,
            JobState::Extracting => self.extract_secs,
            JobState::Converting => self.convert_secs,
            JobState::Uploading => self.upload_secs,
            _ => 0,
        };
        Duration::from_secs(secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub timeouts: StageTimeouts,
    /// Wall-clock budget of a job from admission.
    #[serde(default = "default_job_deadline_secs")]
    pub job_deadline_secs: u64,
    /// Pause before asking the ledger again after `NoAccountAvailable`.
    #[serde(default = "default_account_wait_ms")]
    pub account_wait_ms: u64,
    /// Candidates scoring below this are ignored.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Assets larger than this need a `LargeFile` account.
    #[serde(default = "default_large_file_bytes")]
    pub large_file_bytes: u64,
}

fn default_job_deadline_secs() -> u64 {
    7200
}

fn default_account_wait_ms() -> u64 {
    30_000
}

fn default_min_confidence() -> f32 {
    0.6
}

fn default_large_file_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeouts: StageTimeouts::default(),
            job_deadline_secs: default_job_deadline_secs(),
            account_wait_ms: default_account_wait_ms(),
            min_confidence: default_min_confidence(),
            large_file_bytes: default_large_file_bytes(),
        }
    }
}

impl RunnerConfig {
    pub fn job_deadline(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.job_deadline_secs.max(1) as i64)
    }
}

/// Everything outside the process a job talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<MirrorResolver>,
    pub extractor: Arc<dyn Extractor>,
    pub transcoder: Arc<dyn Transcoder>,
    pub delivery: Arc<dyn DeliveryChannel>,
    pub ledger: Arc<AccountLedger>,
    pub catalog: Arc<dyn DeliveredStore>,
}

/// Cancellation tokens of jobs owned by a worker.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: DashMap<JobId, CancellationToken>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &JobId) -> CancellationToken {
        self.tokens.entry(id.clone()).or_default().clone()
    }

    /// Signal the worker owning `id`. Returns whether one was running.
    pub fn cancel(&self, id: &JobId) -> bool {
        match self.tokens.remove(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn release(&self, id: &JobId) {
        self.tokens.remove(id);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Per-attempt state carried across stages.
#[derive(Default)]
struct JobContext {
    candidate: Option<MirrorCandidate>,
    stream: Option<RawStream>,
    asset: Option<ConvertedAsset>,
    result_ref: Option<ResultRef>,
}

pub struct JobRunner {
    admission: Arc<AdmissionController>,
    collaborators: Collaborators,
    config: RunnerConfig,
    cancellations: Arc<CancelRegistry>,
}

impl JobRunner {
    pub fn new(
        admission: Arc<AdmissionController>,
        collaborators: Collaborators,
        config: RunnerConfig,
        cancellations: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            admission,
            collaborators,
            config,
            cancellations,
        }
    }

    fn store(&self) -> &Arc<JobStore> {
        self.admission.store()
    }

    /// Run `job` to a terminal state and release its slot.
    pub async fn run(&self, job: DownloadJob) {
        let cancel = self.cancellations.register(&job.id);
        let started = tokio::time::Instant::now();
        info!(job_id = %job.id, title = %job.title, key = %job.movie_key, "Job processing started");

        let outcome = self.drive(&job, &cancel).await;
        self.cancellations.release(&job.id);

        let label = match &outcome {
            JobOutcome::Ready(_) => "ready".to_string(),
            JobOutcome::Failed(e) => format!("failed ({})", e.kind),
            JobOutcome::Expired => "expired".to_string(),
        };
        match self.admission.finish(&job.id, outcome, Utc::now()) {
            Ok(Some(report)) => info!(
                job_id = %job.id,
                outcome = %label,
                elapsed_secs = started.elapsed().as_secs(),
                promoted = report.promoted.len(),
                "Job finished"
            ),
            Ok(None) => debug!(job_id = %job.id, "Job was already finished elsewhere"),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to record job outcome"),
        }
    }

    async fn drive(&self, job: &DownloadJob, cancel: &CancellationToken) -> JobOutcome {
        if self.store().get(&job.id).is_none_or(|j| j.is_terminal()) {
            return cancelled_outcome();
        }
        let mut ctx = JobContext::default();
        let stages = [
            JobState::Resolving,
            JobState::Extracting,
            JobState::Converting,
            JobState::Uploading,
        ];

        let mut result = Ok(());
        for (index, stage) in stages.into_iter().enumerate() {
            if index > 0 {
                if let Err(e) = self.store().advance_stage(&job.id, stage, Utc::now()) {
                    // A cancel or the sweeper finished the job in between.
                    result = Err(JobOutcome::Failed(JobError::new(
                        ErrorKind::Internal,
                        e.to_string(),
                    )));
                    break;
                }
                debug!(job_id = %job.id, %stage, "Stage entered");
            }
            result = self.run_stage(job, stage, &mut ctx, cancel).await;
            if result.is_err() {
                break;
            }
        }

        if let Some(asset) = ctx.asset.take() {
            self.collaborators.transcoder.cleanup(&asset).await;
        }

        match (result, ctx.result_ref) {
            (Ok(()), Some(result_ref)) => JobOutcome::Ready(result_ref),
            (Ok(()), None) => JobOutcome::Failed(JobError::new(
                ErrorKind::Internal,
                "upload finished without a result reference",
            )),
            (Err(outcome), _) => outcome,
        }
    }

    /// Run one stage with its retry policy. `Err` carries the terminal outcome.
    async fn run_stage(
        &self,
        job: &DownloadJob,
        stage: JobState,
        ctx: &mut JobContext,
        cancel: &CancellationToken,
    ) -> Result<(), JobOutcome> {
        let policy = &self.config.retry;
        let stage_timeout = self.config.timeouts.for_stage(stage);

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled_outcome());
            }
            let Some(remaining) = remaining_until_deadline(job) else {
                return Err(JobOutcome::Expired);
            };
            let deadline_bound = remaining <= stage_timeout;
            let limit = remaining.min(stage_timeout);

            let attempt = tokio::select! {
                _ = cancel.cancelled() => Err(ExternalError::cancelled()),
                result = tokio::time::timeout(limit, self.attempt(job, stage, ctx, cancel)) => match result {
                    Ok(result) => result,
                    Err(_) if deadline_bound => return Err(JobOutcome::Expired),
                    Err(_) => Err(ExternalError::transient(format!(
                        "{stage} timed out after {}s",
                        limit.as_secs()
                    ))),
                },
            };

            let error = match attempt {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            match error.kind {
                ErrorKind::Cancelled => return Err(cancelled_outcome()),
                ErrorKind::ResourceExhausted => {
                    debug!(job_id = %job.id, %stage, error = %error, "Waiting for resources");
                    self.store().note_error(&job.id, error.into(), Utc::now());
                    let wait = Duration::from_millis(self.config.account_wait_ms.max(1));
                    self.pause(job, wait, cancel).await?;
                }
                kind if kind.consumes_retry() => {
                    let Some(attempts) =
                        self.store().record_attempt(&job.id, error.clone().into(), Utc::now())
                    else {
                        return Err(cancelled_outcome());
                    };
                    if !policy.allows_another(attempts) {
                        warn!(job_id = %job.id, %stage, attempts, error = %error, "Retry budget exhausted");
                        return Err(JobOutcome::Failed(error.into()));
                    }
                    let delay = policy.backoff_after(attempts);
                    info!(
                        job_id = %job.id,
                        %stage,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying stage"
                    );
                    self.pause(job, delay, cancel).await?;
                }
                _ => {
                    warn!(job_id = %job.id, %stage, error = %error, "Stage failed");
                    return Err(JobOutcome::Failed(error.into()));
                }
            }
        }
    }

    /// Sleep, cut short by cancellation or the deadline.
    async fn pause(
        &self,
        job: &DownloadJob,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), JobOutcome> {
        let Some(remaining) = remaining_until_deadline(job) else {
            return Err(JobOutcome::Expired);
        };
        let expires = remaining <= wait;
        tokio::select! {
            _ = cancel.cancelled() => Err(cancelled_outcome()),
            _ = tokio::time::sleep(wait.min(remaining)) => {
                if expires { Err(JobOutcome::Expired) } else { Ok(()) }
            }
        }
    }

    async fn attempt(
        &self,
        job: &DownloadJob,
        stage: JobState,
        ctx: &mut JobContext,
        cancel: &CancellationToken,
    ) -> Result<(), ExternalError> {
        match stage {
            JobState::Resolving => {
                ctx.candidate = Some(self.resolve(job).await?);
            }
            JobState::Extracting => {
                let candidate = ctx
                    .candidate
                    .as_ref()
                    .ok_or_else(|| internal("extraction without a candidate"))?;
                let stream = self
                    .collaborators
                    .extractor
                    .extract(candidate, job.movie_key.dub.as_deref(), cancel)
                    .await?;
                ctx.stream = Some(stream);
            }
            JobState::Converting => {
                let stream = ctx
                    .stream
                    .as_ref()
                    .ok_or_else(|| internal("conversion without a stream"))?;
                let progress =
                    ProgressReporter::new(job.id.clone(), JobState::Converting, self.store().clone());
                let asset = self
                    .collaborators
                    .transcoder
                    .convert(&job.id, stream, &progress, cancel)
                    .await?;
                ctx.asset = Some(asset);
            }
            JobState::Uploading => {
                let asset = ctx
                    .asset
                    .as_ref()
                    .ok_or_else(|| internal("upload without a converted asset"))?;
                let result_ref = self.upload(job, asset, cancel).await?;
                self.remember(job, ctx, &result_ref).await;
                ctx.result_ref = Some(result_ref);
            }
            other => return Err(internal(format!("no work defined for {other}"))),
        }
        Ok(())
    }

    async fn resolve(&self, job: &DownloadJob) -> Result<MirrorCandidate, ExternalError> {
        let filters = SearchFilters::default()
            .with_lang(job.movie_key.lang.clone())
            .with_dub(job.movie_key.dub.clone())
            .with_source(job.source_hint.clone());

        match self.collaborators.resolver.search(&job.title, &filters).await {
            SearchOutcome::NoResults { failures } => Err(ExternalError::transient(format!(
                "no mirror source answered ({} failed)",
                failures.len()
            ))),
            SearchOutcome::Found(ranked) => {
                let found = ranked.len();
                match ranked.best_above(self.config.min_confidence) {
                    Some(candidate) => {
                        info!(
                            job_id = %job.id,
                            source = %candidate.source,
                            url = %candidate.source_url,
                            confidence = candidate.confidence,
                            "Mirror candidate chosen"
                        );
                        Ok(candidate)
                    }
                    None => Err(ExternalError::no_match(format!(
                        "no candidate above confidence {} among {found}",
                        self.config.min_confidence
                    ))),
                }
            }
        }
    }

    async fn upload(
        &self,
        job: &DownloadJob,
        asset: &ConvertedAsset,
        cancel: &CancellationToken,
    ) -> Result<ResultRef, ExternalError> {
        let capability = if asset_size(asset).await > self.config.large_file_bytes {
            Capability::LargeFile
        } else {
            Capability::Any
        };

        let ledger = &self.collaborators.ledger;
        let account = ledger.select_account(capability).await.map_err(|e| match e {
            LedgerError::NoAccountAvailable(_) => ExternalError::exhausted(e.to_string()),
            LedgerError::Store(e) => internal(e.to_string()),
        })?;

        let caption = match &job.movie_key.dub {
            Some(dub) => format!("{} [{}]", job.title, dub),
            None => job.title.clone(),
        };
        let progress = ProgressReporter::new(job.id.clone(), JobState::Uploading, self.store().clone());

        match self
            .collaborators
            .delivery
            .upload(&account, asset, &caption, &progress, cancel)
            .await
        {
            Ok(result_ref) => {
                if let Err(e) = ledger.record_success(&account).await {
                    error!(session = %account.session_name(), error = %e, "Failed to record upload");
                }
                Ok(result_ref)
            }
            Err(e) => {
                if e.kind != ErrorKind::Cancelled
                    && let Err(store_err) = ledger.record_failure(&account, &e.message).await
                {
                    error!(session = %account.session_name(), error = %store_err, "Failed to record upload failure");
                }
                Err(e)
            }
        }
    }

    /// Add the delivered asset to the catalog. Failures only cost a future re-run.
    async fn remember(&self, job: &DownloadJob, ctx: &JobContext, result_ref: &ResultRef) {
        let content = DeliveredContent {
            movie_key: job.movie_key.clone(),
            quality: ctx.stream.as_ref().and_then(|s| s.quality.clone()),
            source_url: ctx.candidate.as_ref().map(|c| c.source_url.clone()),
            title: Some(job.title.clone()),
            result_ref: result_ref.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.collaborators.catalog.record(&content).await {
            warn!(job_id = %job.id, error = %e, "Failed to record delivered content");
        }
    }
}

fn cancelled_outcome() -> JobOutcome {
    JobOutcome::Failed(JobError::new(ErrorKind::Cancelled, "cancelled by user"))
}

fn internal(message: impl Into<String>) -> ExternalError {
    ExternalError::new(ErrorKind::Internal, message)
}

fn remaining_until_deadline(job: &DownloadJob) -> Option<Duration> {
    (job.deadline_at - Utc::now())
        .to_std()
        .ok()
        .filter(|d| !d.is_zero())
}

async fn asset_size(asset: &ConvertedAsset) -> u64 {
    let mut total = 0;
    for file in &asset.files {
        if let Ok(meta) = tokio::fs::metadata(file).await {
            total += meta.len();
        }
    }
    total
}

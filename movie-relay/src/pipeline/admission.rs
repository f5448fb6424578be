//! Admission control: duplicate detection, per-user limits and queueing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::job_store::{Admission, FinishReport, JobOutcome, JobStore};
use crate::catalog::DeliveredStore;
use crate::domain::{
    DownloadJob, ErrorKind, JobError, JobId, MovieKey, UserId, normalize_title,
};
use crate::{Error, Result};

/// Configuration for admission and the wait queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Global cap on jobs holding an active slot.
    #[serde(default = "default_max_active_jobs")]
    pub max_active_jobs: usize,
    /// Non-terminal jobs allowed per regular user.
    #[serde(default = "default_user_limit")]
    pub default_user_limit: u32,
    /// Non-terminal jobs allowed per premium user.
    #[serde(default = "default_premium_user_limit")]
    pub premium_user_limit: u32,
    #[serde(default)]
    pub premium_users: BTreeSet<UserId>,
    /// Warning threshold for queue depth.
    #[serde(default = "default_queue_warning_threshold")]
    pub queue_warning_threshold: usize,
    /// Critical threshold for queue depth.
    #[serde(default = "default_queue_critical_threshold")]
    pub queue_critical_threshold: usize,
}

fn default_max_active_jobs() -> usize {
    2
}

fn default_user_limit() -> u32 {
    1
}

fn default_premium_user_limit() -> u32 {
    3
}

fn default_queue_warning_threshold() -> usize {
    50
}

fn default_queue_critical_threshold() -> usize {
    200
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_active_jobs: default_max_active_jobs(),
            default_user_limit: default_user_limit(),
            premium_user_limit: default_premium_user_limit(),
            premium_users: BTreeSet::new(),
            queue_warning_threshold: default_queue_warning_threshold(),
            queue_critical_threshold: default_queue_critical_threshold(),
        }
    }
}

/// Per-user cap on non-terminal jobs.
#[derive(Debug, Clone)]
pub struct UserLimits {
    default_limit: u32,
    premium_limit: u32,
    premium_users: BTreeSet<UserId>,
}

impl UserLimits {
    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self {
            default_limit: config.default_user_limit.max(1),
            premium_limit: config.premium_user_limit.max(1),
            premium_users: config.premium_users.clone(),
        }
    }

    pub fn limit_for(&self, user_id: UserId) -> u32 {
        if self.premium_users.contains(&user_id) {
            self.premium_limit
        } else {
            self.default_limit
        }
    }
}

/// A front-end download request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub user_id: UserId,
    pub title: String,
    /// External catalog id. The normalized title is used when absent.
    #[serde(default)]
    pub content_id: Option<String>,
    pub lang: String,
    #[serde(default)]
    pub dub: Option<String>,
    #[serde(default)]
    pub source_hint: Option<String>,
    #[serde(default)]
    pub alternate_dub: bool,
}

impl SubmitRequest {
    pub fn new(user_id: UserId, title: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            user_id,
            title: title.into(),
            content_id: None,
            lang: lang.into(),
            dub: None,
            source_hint: None,
            alternate_dub: false,
        }
    }

    pub fn with_dub(mut self, dub: impl Into<String>) -> Self {
        self.dub = Some(dub.into());
        self
    }

    pub fn with_content_id(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = Some(content_id.into());
        self
    }

    pub fn with_source_hint(mut self, source: impl Into<String>) -> Self {
        self.source_hint = Some(source.into());
        self
    }

    /// Reject malformed requests before they reach the state machine.
    pub fn validate(&self) -> Result<()> {
        if self.user_id <= 0 {
            return Err(Error::validation("user_id must be positive"));
        }
        if normalize_title(&self.title).is_empty() {
            return Err(Error::validation("title must not be empty"));
        }
        let lang = self.lang.trim();
        if lang.is_empty()
            || lang.len() > 8
            || !lang.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::validation(format!("invalid language code '{}'", self.lang)));
        }
        if let Some(content_id) = &self.content_id
            && content_id.trim().is_empty()
        {
            return Err(Error::validation("content_id must not be blank"));
        }
        Ok(())
    }

    pub fn movie_key(&self) -> MovieKey {
        match &self.content_id {
            Some(id) => MovieKey::new(id, &self.lang, self.dub.clone()),
            None => MovieKey::from_title(&self.title, &self.lang, self.dub.clone()),
        }
    }
}

/// What the front end learns from a submit.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Started(DownloadJob),
    Queued(DownloadJob),
    /// A non-terminal job for the same user and movie already exists.
    Duplicate(DownloadJob),
    /// The content was delivered before; the job is created `Ready`.
    Ready(DownloadJob),
    LimitExceeded { user_limit: u32, active: u32 },
}

impl SubmitOutcome {
    pub fn job(&self) -> Option<&DownloadJob> {
        match self {
            Self::Started(job) | Self::Queued(job) | Self::Duplicate(job) | Self::Ready(job) => {
                Some(job)
            }
            Self::LimitExceeded { .. } => None,
        }
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job().map(|j| &j.id)
    }
}

/// Status of queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDepthStatus {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
    pub max_active: usize,
    pub depth_status: QueueDepthStatus,
}

/// Front door of the pipeline.
pub struct AdmissionController {
    store: Arc<JobStore>,
    catalog: Arc<dyn DeliveredStore>,
    limits: UserLimits,
    config: AdmissionConfig,
    job_deadline: chrono::Duration,
    notifier: Arc<Notify>,
}

impl AdmissionController {
    pub fn new(
        store: Arc<JobStore>,
        catalog: Arc<dyn DeliveredStore>,
        config: AdmissionConfig,
        job_deadline: chrono::Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            limits: UserLimits::from_config(&config),
            config,
            job_deadline,
            notifier: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Signalled whenever a job becomes ready for a worker.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notifier.clone()
    }

    pub fn limits(&self) -> &UserLimits {
        &self.limits
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        self.submit_at(request, Utc::now()).await
    }

    /// Admit `request` as of `now`. Idempotent for a pending `(user, movie)` pair.
    pub async fn submit_at(
        &self,
        request: SubmitRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        request.validate()?;
        let key = request.movie_key();

        let job = DownloadJob::new(
            request.user_id,
            request.title.trim(),
            key.clone(),
            request.source_hint.clone(),
            now,
            self.job_deadline,
        )
        .with_alternate_dub(request.alternate_dub);

        match self.catalog.find(&key).await {
            Ok(Some(delivered)) => {
                let job = job.delivered(delivered.result_ref, now);
                self.store.insert_finished(job.clone())?;
                info!(job_id = %job.id, key = %key, "Served from delivered catalog");
                return Ok(SubmitOutcome::Ready(job));
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Catalog lookup failed, running pipeline"),
        }

        let user_limit = self.limits.limit_for(request.user_id);
        let outcome = match self.store.admit(job, user_limit, now) {
            Admission::Started(job) => {
                info!(job_id = %job.id, user_id = job.user_id, key = %key, "Job started");
                self.notifier.notify_one();
                SubmitOutcome::Started(job)
            }
            Admission::Queued(job) => {
                info!(
                    job_id = %job.id,
                    user_id = job.user_id,
                    position = job.queue_position,
                    "Job queued"
                );
                SubmitOutcome::Queued(job)
            }
            Admission::Duplicate(job) => {
                debug!(job_id = %job.id, key = %key, "Duplicate submit, returning existing job");
                SubmitOutcome::Duplicate(job)
            }
            Admission::LimitExceeded { user_limit, active } => {
                info!(user_id = request.user_id, user_limit, active, "User limit reached");
                SubmitOutcome::LimitExceeded { user_limit, active }
            }
        };
        Ok(outcome)
    }

    /// End a job, releasing its slot. `Ok(None)` when it had already finished.
    pub fn finish(
        &self,
        id: &JobId,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<FinishReport>> {
        let report = self.store.finish(id, outcome, now)?;
        if let Some(report) = &report {
            for promoted in &report.promoted {
                debug!(job_id = %promoted.id, "Queued job promoted to an active slot");
                self.notifier.notify_one();
            }
        }
        Ok(report)
    }

    /// Mark a job cancelled by its user.
    pub fn cancel(&self, id: &JobId, now: DateTime<Utc>) -> Result<Option<FinishReport>> {
        let report = self.finish(
            id,
            JobOutcome::Failed(JobError::new(ErrorKind::Cancelled, "cancelled by user")),
            now,
        )?;
        if report.is_some() {
            info!(job_id = %id, "Job cancelled");
        }
        Ok(report)
    }

    pub fn depth_status(&self, depth: usize) -> QueueDepthStatus {
        if depth >= self.config.queue_critical_threshold {
            QueueDepthStatus::Critical
        } else if depth >= self.config.queue_warning_threshold {
            QueueDepthStatus::Warning
        } else {
            QueueDepthStatus::Normal
        }
    }

    pub fn stats(&self) -> QueueStats {
        let counts = self.store.counts();
        QueueStats {
            queued: counts.queued,
            active: counts.active,
            max_active: self.config.max_active_jobs,
            depth_status: self.depth_status(counts.queued),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryDeliveredStore;
    use crate::domain::{DeliveredContent, JobState, ResultRef};

    fn controller(config: AdmissionConfig) -> (AdmissionController, Arc<InMemoryDeliveredStore>) {
        let catalog = Arc::new(InMemoryDeliveredStore::new());
        let store = Arc::new(JobStore::new(config.max_active_jobs));
        (
            AdmissionController::new(store, catalog.clone(), config, chrono::Duration::hours(2)),
            catalog,
        )
    }

    #[test]
    fn test_user_limits() {
        let config = AdmissionConfig {
            premium_users: [42].into_iter().collect(),
            ..AdmissionConfig::default()
        };
        let limits = UserLimits::from_config(&config);
        assert_eq!(limits.limit_for(42), 3);
        assert_eq!(limits.limit_for(7), 1);
    }

    #[test]
    fn test_request_validation() {
        assert!(SubmitRequest::new(1, "Heat", "en").validate().is_ok());
        assert!(SubmitRequest::new(1, "  !!  ", "en").validate().is_err());
        assert!(SubmitRequest::new(1, "Heat", "").validate().is_err());
        assert!(SubmitRequest::new(1, "Heat", "e n").validate().is_err());
        assert!(SubmitRequest::new(0, "Heat", "en").validate().is_err());
    }

    #[test]
    fn test_movie_key_prefers_content_id() {
        let by_title = SubmitRequest::new(1, "The Matrix!", "EN").movie_key();
        assert_eq!(by_title.content_id, "the matrix");
        let by_id = SubmitRequest::new(1, "The Matrix", "en")
            .with_content_id("603")
            .movie_key();
        assert_eq!(by_id.content_id, "603");
    }

    #[tokio::test]
    async fn test_three_jobs_two_slots() {
        let (admission, _) = controller(AdmissionConfig::default());
        let now = Utc::now();

        let first = admission
            .submit_at(SubmitRequest::new(1, "Heat", "en"), now)
            .await
            .unwrap();
        let second = admission
            .submit_at(SubmitRequest::new(2, "Heat", "en"), now)
            .await
            .unwrap();
        let third = admission
            .submit_at(SubmitRequest::new(3, "Heat", "en"), now)
            .await
            .unwrap();

        assert!(matches!(first, SubmitOutcome::Started(_)));
        assert!(matches!(second, SubmitOutcome::Started(_)));
        let SubmitOutcome::Queued(queued) = third else {
            panic!("expected third job to queue");
        };
        assert_eq!(queued.queue_position, Some(1));

        let first_id = first.job_id().unwrap().clone();
        let report = admission
            .finish(
                &first_id,
                JobOutcome::Failed(JobError::new(ErrorKind::Fatal, "boom")),
                now,
            )
            .unwrap()
            .unwrap();
        assert_eq!(report.promoted.len(), 1);

        let promoted = admission.store().get(&queued.id).unwrap();
        assert_eq!(promoted.state, JobState::Resolving);
        assert_eq!(promoted.queue_position, None);
        assert_eq!(admission.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_duplicate_keeps_queue_length() {
        let (admission, _) = controller(AdmissionConfig {
            max_active_jobs: 1,
            ..AdmissionConfig::default()
        });
        let now = Utc::now();
        admission
            .submit_at(SubmitRequest::new(1, "Heat", "en"), now)
            .await
            .unwrap();
        let queued = admission
            .submit_at(SubmitRequest::new(2, "Heat", "en").with_dub("LostFilm"), now)
            .await
            .unwrap();
        let again = admission
            .submit_at(SubmitRequest::new(2, "heat", "EN").with_dub("LostFilm"), now)
            .await
            .unwrap();

        assert!(matches!(again, SubmitOutcome::Duplicate(_)));
        assert_eq!(again.job_id(), queued.job_id());
        assert_eq!(admission.stats().queued, 1);
    }

    #[tokio::test]
    async fn test_limit_exceeded_is_hard_reject() {
        let (admission, _) = controller(AdmissionConfig::default());
        let now = Utc::now();
        admission
            .submit_at(SubmitRequest::new(1, "Heat", "en"), now)
            .await
            .unwrap();
        let rejected = admission
            .submit_at(SubmitRequest::new(1, "Ronin", "en"), now)
            .await
            .unwrap();
        assert!(matches!(
            rejected,
            SubmitOutcome::LimitExceeded {
                user_limit: 1,
                active: 1
            }
        ));
        assert_eq!(admission.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_catalog_hit_is_ready_without_slot() {
        let (admission, catalog) = controller(AdmissionConfig::default());
        let request = SubmitRequest::new(1, "Heat", "en").with_dub("LostFilm");
        catalog
            .record(&DeliveredContent {
                movie_key: request.movie_key(),
                quality: Some("1080p".into()),
                source_url: Some("https://m/heat".into()),
                title: Some("Heat".into()),
                result_ref: ResultRef::single("@store", "a", "f1"),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let outcome = admission.submit(request).await.unwrap();
        let SubmitOutcome::Ready(job) = outcome else {
            panic!("expected catalog hit");
        };
        assert_eq!(job.state, JobState::Ready);
        assert_eq!(job.result_ref.unwrap().parts[0].file_ref, "f1");
        assert_eq!(admission.stats().active, 0);

        let later = admission
            .submit(SubmitRequest::new(1, "Ronin", "en"))
            .await
            .unwrap();
        assert!(matches!(later, SubmitOutcome::Started(_)));
    }

    #[tokio::test]
    async fn test_cancel_twice() {
        let (admission, _) = controller(AdmissionConfig::default());
        let outcome = admission
            .submit(SubmitRequest::new(1, "Heat", "en"))
            .await
            .unwrap();
        let id = outcome.job_id().unwrap().clone();

        assert!(admission.cancel(&id, Utc::now()).unwrap().is_some());
        assert!(admission.cancel(&id, Utc::now()).unwrap().is_none());
        let job = admission.store().get(&id).unwrap();
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submits_share_one_job() {
        let (admission, _) = controller(AdmissionConfig::default());
        let admission = Arc::new(admission);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let admission = admission.clone();
            handles.push(tokio::spawn(async move {
                admission
                    .submit(SubmitRequest::new(11, "Heat", "en"))
                    .await
                    .unwrap()
            }));
        }

        let mut started = 0;
        let mut ids = Vec::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            match &outcome {
                SubmitOutcome::Started(_) => started += 1,
                SubmitOutcome::Duplicate(_) => {}
                other => panic!("unexpected outcome {other:?}"),
            }
            ids.push(outcome.job_id().unwrap().clone());
        }

        assert_eq!(started, 1);
        assert!(ids.iter().all(|id| id == &ids[0]));
        assert_eq!(admission.store().counts().total, 1);
    }

    #[test]
    fn test_depth_status_thresholds() {
        let (admission, _) = controller(AdmissionConfig::default());
        assert_eq!(admission.depth_status(0), QueueDepthStatus::Normal);
        assert_eq!(admission.depth_status(50), QueueDepthStatus::Warning);
        assert_eq!(admission.depth_status(200), QueueDepthStatus::Critical);
    }
}

use chrono::Utc;
use std::sync::Arc;

use super::job_store::JobStore;
use crate::domain::{JobId, JobState};

/// Stage-scoped progress sink handed to external collaborators.
///
/// Updates for a stage the job has already left are dropped, so a slow
/// transcoder cannot move progress after the job moved on.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    stage: JobState,
    store: Option<Arc<JobStore>>,
}

impl ProgressReporter {
    pub fn new(job_id: JobId, stage: JobState, store: Arc<JobStore>) -> Self {
        Self {
            job_id,
            stage,
            store: Some(store),
        }
    }

    pub fn noop(job_id: JobId) -> Self {
        Self {
            job_id,
            stage: JobState::Queued,
            store: None,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Report a percentage; values above 100 are clamped.
    pub fn report(&self, percent: u8) {
        if let Some(store) = &self.store {
            store.advance_progress(&self.job_id, self.stage, percent, Utc::now());
        }
    }

    /// Report `done` out of `total` units.
    pub fn report_fraction(&self, done: u64, total: u64) {
        if total == 0 {
            return;
        }
        let percent = (done.min(total) * 100 / total) as u8;
        self.report(percent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DownloadJob, MovieKey};
    use crate::pipeline::job_store::Admission;

    #[test]
    fn test_reports_only_for_current_stage() {
        let store = Arc::new(JobStore::new(1));
        let now = Utc::now();
        let job = DownloadJob::new(
            1,
            "x",
            MovieKey::new("x", "en", None),
            None,
            now,
            chrono::Duration::hours(1),
        );
        let Admission::Started(job) = store.admit(job, 1, now) else {
            panic!("expected start");
        };
        store.advance_stage(&job.id, JobState::Extracting, now).unwrap();
        store.advance_stage(&job.id, JobState::Converting, now).unwrap();

        let converting = ProgressReporter::new(job.id.clone(), JobState::Converting, store.clone());
        converting.report_fraction(30, 60);
        assert_eq!(store.get(&job.id).unwrap().progress, 50);
        converting.report(20);
        assert_eq!(store.get(&job.id).unwrap().progress, 50);

        store.advance_stage(&job.id, JobState::Uploading, now).unwrap();
        converting.report(90);
        assert_eq!(store.get(&job.id).unwrap().progress, 0);
    }
}

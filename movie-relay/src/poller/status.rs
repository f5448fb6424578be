//! Typed job status returned to the front end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DownloadJob, ErrorKind, JobId, JobState, ResultRef};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// A job pending this long after submission yields a "still working" hint.
    #[serde(default = "default_still_working_after_secs")]
    pub still_working_after_secs: u64,
    /// A job older than this yields a "taking too long" hint.
    #[serde(default = "default_too_long_after_secs")]
    pub too_long_after_secs: u64,
    /// Lifetime of a poll token from its issue.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

fn default_still_working_after_secs() -> u64 {
    30
}

fn default_too_long_after_secs() -> u64 {
    300
}

fn default_token_ttl_secs() -> u64 {
    3600
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            still_working_after_secs: default_still_working_after_secs(),
            too_long_after_secs: default_too_long_after_secs(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

/// UX pacing hint layered over the raw state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollHint {
    StillWorking,
    /// The user may want to restart the flow.
    TooLong,
}

/// Derive the hint for a pending job. Terminal jobs get none.
pub fn poll_hint(job: &DownloadJob, now: DateTime<Utc>, config: &PollerConfig) -> Option<PollHint> {
    if job.is_terminal() {
        return None;
    }
    let since_submit = (now - job.created_at).num_seconds().max(0) as u64;
    if since_submit >= config.too_long_after_secs {
        Some(PollHint::TooLong)
    } else if since_submit >= config.still_working_after_secs {
        Some(PollHint::StillWorking)
    } else {
        None
    }
}

/// Identity of one polling session. Reissued on every submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollToken {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PollToken {
    pub fn issue(now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            issued_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Queued {
        job_id: JobId,
        position: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<PollHint>,
    },
    Processing {
        job_id: JobId,
        stage: JobState,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<PollHint>,
    },
    Ready {
        job_id: JobId,
        result: ResultRef,
    },
    Failed {
        job_id: JobId,
        reason: ErrorKind,
        message: String,
        restart_suggested: bool,
    },
    /// The job or its poll token ran out of time; the flow must restart.
    Expired { job_id: JobId },
}

impl JobStatus {
    pub fn from_job(job: &DownloadJob, now: DateTime<Utc>, config: &PollerConfig) -> Self {
        let job_id = job.id.clone();
        let hint = poll_hint(job, now, config);
        match job.state {
            JobState::Queued => Self::Queued {
                job_id,
                position: job.queue_position.unwrap_or(1),
                hint,
            },
            JobState::Resolving
            | JobState::Extracting
            | JobState::Converting
            | JobState::Uploading => Self::Processing {
                job_id,
                stage: job.state,
                progress: job.progress,
                hint,
            },
            JobState::Ready => match &job.result_ref {
                Some(result) => Self::Ready {
                    job_id,
                    result: result.clone(),
                },
                None => Self::Failed {
                    job_id,
                    reason: ErrorKind::Internal,
                    message: "ready without a result".to_string(),
                    restart_suggested: true,
                },
            },
            JobState::Failed => {
                let (reason, message) = match &job.last_error {
                    Some(e) => (e.kind, e.message.clone()),
                    None => (ErrorKind::Internal, "failed".to_string()),
                };
                Self::Failed {
                    job_id,
                    reason,
                    message,
                    // Repeating a search that found nothing will not help.
                    restart_suggested: reason != ErrorKind::NoMatch,
                }
            }
            JobState::Expired => Self::Expired { job_id },
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Queued { job_id, .. }
            | Self::Processing { job_id, .. }
            | Self::Ready { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Expired { job_id } => job_id,
        }
    }

    pub fn hint(&self) -> Option<PollHint> {
        match self {
            Self::Queued { hint, .. } | Self::Processing { hint, .. } => *hint,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobError, MovieKey};

    fn job(now: DateTime<Utc>) -> DownloadJob {
        DownloadJob::new(
            1,
            "Heat",
            MovieKey::new("949", "en", None),
            None,
            now,
            chrono::Duration::hours(2),
        )
    }

    #[test]
    fn test_hint_thresholds() {
        let config = PollerConfig::default();
        let t0 = Utc::now();
        let job = job(t0);
        assert_eq!(poll_hint(&job, t0 + chrono::Duration::seconds(10), &config), None);
        assert_eq!(
            poll_hint(&job, t0 + chrono::Duration::seconds(40), &config),
            Some(PollHint::StillWorking)
        );
        assert_eq!(
            poll_hint(&job, t0 + chrono::Duration::minutes(5), &config),
            Some(PollHint::TooLong)
        );
    }

    #[test]
    fn test_failed_status_json() {
        let t0 = Utc::now();
        let mut job = job(t0);
        job.transition(JobState::Failed, t0).unwrap();
        job.last_error = Some(JobError::new(ErrorKind::NoMatch, "nothing found"));

        let status = JobStatus::from_job(&job, t0, &PollerConfig::default());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason"], "no-match");
        assert_eq!(json["restart_suggested"], false);
    }

    #[test]
    fn test_token_expiry() {
        let t0 = Utc::now();
        let token = PollToken::issue(t0, chrono::Duration::seconds(60));
        assert!(!token.is_expired(t0 + chrono::Duration::seconds(59)));
        assert!(token.is_expired(t0 + chrono::Duration::seconds(60)));
    }
}

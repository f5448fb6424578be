//! Download job entity and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::delivery::ResultRef;
use super::movie::{MovieKey, UserId};
use crate::{Error, Result};

/// Opaque job identifier, stable for the job's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a download job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Resolving,
    Extracting,
    Converting,
    Uploading,
    Ready,
    Failed,
    Expired,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Expired)
    }

    /// Active jobs hold a global slot.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != Self::Queued
    }

    /// The stage that follows this one on success.
    pub fn next_stage(self) -> Option<Self> {
        match self {
            Self::Queued => Some(Self::Resolving),
            Self::Resolving => Some(Self::Extracting),
            Self::Extracting => Some(Self::Converting),
            Self::Converting => Some(Self::Uploading),
            Self::Uploading => Some(Self::Ready),
            Self::Ready | Self::Failed | Self::Expired => None,
        }
    }

    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(to, Self::Failed | Self::Expired) || self.next_stage() == Some(to)
    }
}

/// Classification of pipeline errors.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// Network or timeout talking to an external collaborator.
    TransientExternal,
    /// No delivery account available or queue full.
    ResourceExhausted,
    /// The resolver found nothing usable.
    NoMatch,
    /// Malformed request.
    InvalidInput,
    /// Missing records or broken invariants mid-processing.
    Internal,
    /// Unrecoverable external error.
    Fatal,
    /// Cancelled by the user.
    Cancelled,
    /// Wall-clock deadline passed.
    Expired,
}

impl ErrorKind {
    /// Whether a bounded retry of the same stage may help.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientExternal | Self::ResourceExhausted)
    }

    /// Resource exhaustion waits without spending the retry budget.
    pub fn consumes_retry(self) -> bool {
        matches!(self, Self::TransientExternal)
    }
}

/// Last error recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One user request's passage through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: JobId,
    pub user_id: UserId,
    /// Title used for mirror search.
    pub title: String,
    pub movie_key: MovieKey,
    /// Mirror/provider chosen by the user.
    pub source_hint: Option<String>,
    /// The user explicitly asked for a dub other than the delivered one.
    pub alternate_dub: bool,
    pub state: JobState,
    /// 1-based position, set only while queued.
    pub queue_position: Option<u32>,
    /// Retries consumed in the current stage.
    pub attempt_count: u32,
    /// Stage-scoped progress, 0-100.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state_entered_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_ref: Option<ResultRef>,
    pub last_error: Option<JobError>,
}

impl DownloadJob {
    pub fn new(
        user_id: UserId,
        title: impl Into<String>,
        movie_key: MovieKey,
        source_hint: Option<String>,
        now: DateTime<Utc>,
        deadline: chrono::Duration,
    ) -> Self {
        Self {
            id: JobId::generate(),
            user_id,
            title: title.into(),
            movie_key,
            source_hint,
            alternate_dub: false,
            state: JobState::Queued,
            queue_position: None,
            attempt_count: 0,
            progress: 0,
            created_at: now,
            updated_at: now,
            state_entered_at: now,
            deadline_at: now + deadline,
            finished_at: None,
            result_ref: None,
            last_error: None,
        }
    }

    /// Already-delivered content: the job starts and ends in `Ready`.
    pub fn delivered(mut self, result_ref: ResultRef, now: DateTime<Utc>) -> Self {
        self.state = JobState::Ready;
        self.progress = 100;
        self.result_ref = Some(result_ref);
        self.finished_at = Some(now);
        self.updated_at = now;
        self.state_entered_at = now;
        self
    }

    pub fn with_alternate_dub(mut self, alternate_dub: bool) -> Self {
        self.alternate_dub = alternate_dub;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && now >= self.deadline_at
    }

    /// Move to `to`, validating the transition and resetting stage-scoped fields.
    pub fn transition(&mut self, to: JobState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::invalid_transition(self.state, to));
        }
        self.state = to;
        self.updated_at = now;
        self.state_entered_at = now;
        if to != JobState::Queued {
            self.queue_position = None;
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
        } else {
            self.attempt_count = 0;
            self.progress = 0;
        }
        Ok(())
    }

    /// Raise progress; values below the current one are ignored.
    pub fn advance_progress(&mut self, percent: u8, now: DateTime<Utc>) -> bool {
        let percent = percent.min(100);
        if percent > self.progress {
            self.progress = percent;
            self.updated_at = now;
            true
        } else {
            false
        }
    }
}

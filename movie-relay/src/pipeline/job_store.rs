//! In-memory job table with the admission indexes.
//!
//! Holds every live `DownloadJob` together with the `(user_id, movie_key)`
//! index used for duplicate detection, the FIFO wait queue and the slot count.
//! All check-and-set operations run under one write lock; readers receive
//! cloned snapshots.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

use crate::domain::{
    DownloadJob, ErrorKind, JobError, JobId, JobState, MovieKey, ResultRef, UserId,
};
use crate::{Error, Result};

/// Result of [`JobStore::admit`].
#[derive(Debug, Clone)]
pub enum Admission {
    /// A slot was free; the job is already `Resolving` and awaits a worker.
    Started(DownloadJob),
    /// Every slot is taken; the job waits at `queue_position`.
    Queued(DownloadJob),
    /// A non-terminal job for the same user and movie exists.
    Duplicate(DownloadJob),
    /// The user already holds `user_limit` non-terminal jobs.
    LimitExceeded { user_limit: u32, active: u32 },
}

/// How a job ends.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Ready(ResultRef),
    Failed(JobError),
    Expired,
}

impl JobOutcome {
    fn target_state(&self) -> JobState {
        match self {
            Self::Ready(_) => JobState::Ready,
            Self::Failed(_) => JobState::Failed,
            Self::Expired => JobState::Expired,
        }
    }
}

/// A finished job and the queued jobs that took its slot.
#[derive(Debug, Clone)]
pub struct FinishReport {
    pub job: DownloadJob,
    pub promoted: Vec<DownloadJob>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotCounts {
    pub queued: usize,
    pub active: usize,
    pub total: usize,
}

struct JobTable {
    jobs: HashMap<JobId, DownloadJob>,
    active_keys: HashMap<(UserId, MovieKey), JobId>,
    /// Jobs waiting for a slot, in enqueue order.
    queue: VecDeque<JobId>,
    /// Jobs holding a slot that no worker has picked up yet.
    dispatch: VecDeque<JobId>,
    active: usize,
    max_active: usize,
}

impl JobTable {
    fn user_open_jobs(&self, user_id: UserId) -> u32 {
        self.active_keys.keys().filter(|(u, _)| *u == user_id).count() as u32
    }

    fn recompute_positions(&mut self) {
        for (index, id) in self.queue.iter().enumerate() {
            if let Some(job) = self.jobs.get_mut(id) {
                job.queue_position = Some(index as u32 + 1);
            }
        }
    }

    /// Move queue heads into free slots, FIFO.
    fn promote(&mut self, now: DateTime<Utc>) -> Vec<DownloadJob> {
        let mut promoted = Vec::new();
        while self.active < self.max_active {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.transition(JobState::Resolving, now).is_err() {
                continue;
            }
            self.active += 1;
            self.dispatch.push_back(id);
            promoted.push(job.clone());
        }
        self.recompute_positions();
        promoted
    }
}

pub struct JobStore {
    inner: RwLock<JobTable>,
}

impl JobStore {
    pub fn new(max_active: usize) -> Self {
        Self {
            inner: RwLock::new(JobTable {
                jobs: HashMap::new(),
                active_keys: HashMap::new(),
                queue: VecDeque::new(),
                dispatch: VecDeque::new(),
                active: 0,
                max_active: max_active.max(1),
            }),
        }
    }

    /// Duplicate check, per-user limit and slot assignment in one step.
    pub fn admit(&self, mut job: DownloadJob, user_limit: u32, now: DateTime<Utc>) -> Admission {
        let mut table = self.inner.write();
        let key = (job.user_id, job.movie_key.clone());

        if let Some(existing) = table
            .active_keys
            .get(&key)
            .and_then(|id| table.jobs.get(id))
        {
            return Admission::Duplicate(existing.clone());
        }

        let open = table.user_open_jobs(job.user_id);
        if open >= user_limit {
            return Admission::LimitExceeded {
                user_limit,
                active: open,
            };
        }

        let id = job.id.clone();
        table.active_keys.insert(key, id.clone());

        if table.active < table.max_active {
            // Only Queued -> Resolving is possible for a fresh job.
            let _ = job.transition(JobState::Resolving, now);
            table.active += 1;
            table.dispatch.push_back(id.clone());
            table.jobs.insert(id, job.clone());
            Admission::Started(job)
        } else {
            job.queue_position = Some(table.queue.len() as u32 + 1);
            table.queue.push_back(id.clone());
            table.jobs.insert(id, job.clone());
            Admission::Queued(job)
        }
    }

    /// Store a job that is already terminal (catalog hit). Takes no slot.
    pub fn insert_finished(&self, job: DownloadJob) -> Result<()> {
        if !job.is_terminal() {
            return Err(Error::validation("insert_finished requires a terminal job"));
        }
        self.inner.write().jobs.insert(job.id.clone(), job);
        Ok(())
    }

    /// Next job holding a slot that still needs a worker.
    pub fn take_dispatch(&self) -> Option<DownloadJob> {
        let mut table = self.inner.write();
        while let Some(id) = table.dispatch.pop_front() {
            if let Some(job) = table.jobs.get(&id)
                && job.state == JobState::Resolving
            {
                return Some(job.clone());
            }
        }
        None
    }

    pub fn get(&self, id: &JobId) -> Option<DownloadJob> {
        self.inner.read().jobs.get(id).cloned()
    }

    /// Advance a job to its next non-terminal stage.
    pub fn advance_stage(
        &self,
        id: &JobId,
        to: JobState,
        now: DateTime<Utc>,
    ) -> Result<DownloadJob> {
        if to.is_terminal() || to == JobState::Queued {
            return Err(Error::validation(format!(
                "advance_stage cannot target {to}"
            )));
        }
        let mut table = self.inner.write();
        let job = table
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("DownloadJob", id.as_str()))?;
        job.transition(to, now)?;
        Ok(job.clone())
    }

    /// End a job and hand its slot to the queue head.
    ///
    /// Returns `Ok(None)` when the job is already terminal, so racing
    /// finishers (worker, cancel, sweeper) release the slot exactly once.
    pub fn finish(
        &self,
        id: &JobId,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<FinishReport>> {
        let mut guard = self.inner.write();
        let table = &mut *guard;

        let (snapshot, was_active, was_queued) = {
            let job = table
                .jobs
                .get_mut(id)
                .ok_or_else(|| Error::not_found("DownloadJob", id.as_str()))?;
            if job.is_terminal() {
                return Ok(None);
            }
            let was_active = job.state.is_active();
            let was_queued = job.state == JobState::Queued;
            job.transition(outcome.target_state(), now)?;
            match outcome {
                JobOutcome::Ready(result_ref) => {
                    job.progress = 100;
                    job.result_ref = Some(result_ref);
                }
                JobOutcome::Failed(error) => job.last_error = Some(error),
                JobOutcome::Expired => {
                    job.last_error = Some(JobError::new(
                        ErrorKind::Expired,
                        "job deadline exceeded",
                    ));
                }
            }
            (job.clone(), was_active, was_queued)
        };

        let key = (snapshot.user_id, snapshot.movie_key.clone());
        if table.active_keys.get(&key) == Some(id) {
            table.active_keys.remove(&key);
        }
        if was_active {
            table.active = table.active.saturating_sub(1);
        }
        if was_queued {
            table.queue.retain(|queued| queued != id);
        }

        let promoted = table.promote(now);
        Ok(Some(FinishReport {
            job: snapshot,
            promoted,
        }))
    }

    /// Count one retry of the current stage. Returns the new attempt count.
    pub fn record_attempt(&self, id: &JobId, error: JobError, now: DateTime<Utc>) -> Option<u32> {
        let mut table = self.inner.write();
        let job = table.jobs.get_mut(id).filter(|j| !j.is_terminal())?;
        job.attempt_count += 1;
        job.last_error = Some(error);
        job.updated_at = now;
        Some(job.attempt_count)
    }

    /// Record an error without spending the retry budget.
    pub fn note_error(&self, id: &JobId, error: JobError, now: DateTime<Utc>) {
        let mut table = self.inner.write();
        if let Some(job) = table.jobs.get_mut(id).filter(|j| !j.is_terminal()) {
            job.last_error = Some(error);
            job.updated_at = now;
        }
    }

    /// Raise progress if the job is still in `stage`.
    pub fn advance_progress(
        &self,
        id: &JobId,
        stage: JobState,
        percent: u8,
        now: DateTime<Utc>,
    ) -> bool {
        let mut table = self.inner.write();
        match table.jobs.get_mut(id) {
            Some(job) if job.state == stage => job.advance_progress(percent, now),
            _ => false,
        }
    }

    pub fn counts(&self) -> SlotCounts {
        let table = self.inner.read();
        SlotCounts {
            queued: table.queue.len(),
            active: table.active,
            total: table.jobs.len(),
        }
    }

    /// Queued job ids in FIFO order.
    pub fn queue_order(&self) -> Vec<JobId> {
        self.inner.read().queue.iter().cloned().collect()
    }

    pub fn jobs_for_user(&self, user_id: UserId) -> Vec<DownloadJob> {
        let mut jobs: Vec<DownloadJob> = self
            .inner
            .read()
            .jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Non-terminal jobs whose wall-clock deadline has passed.
    pub fn overdue(&self, now: DateTime<Utc>) -> Vec<JobId> {
        self.inner
            .read()
            .jobs
            .values()
            .filter(|j| j.is_overdue(now))
            .map(|j| j.id.clone())
            .collect()
    }

    /// Drop terminal jobs that finished before `cutoff`.
    pub fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> Vec<JobId> {
        let mut table = self.inner.write();
        let evicted: Vec<JobId> = table
            .jobs
            .values()
            .filter(|j| j.is_terminal() && j.finished_at.is_some_and(|at| at < cutoff))
            .map(|j| j.id.clone())
            .collect();
        for id in &evicted {
            table.jobs.remove(id);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(user: UserId, content: &str) -> DownloadJob {
        DownloadJob::new(
            user,
            content,
            MovieKey::new(content, "en", None),
            None,
            Utc::now(),
            chrono::Duration::hours(2),
        )
    }

    fn assert_position_invariant(store: &JobStore) {
        let table = store.inner.read();
        for job in table.jobs.values() {
            assert_eq!(
                job.queue_position.is_some(),
                job.state == JobState::Queued,
                "job {} in {:?} has position {:?}",
                job.id,
                job.state,
                job.queue_position
            );
        }
        let positions: Vec<u32> = table
            .queue
            .iter()
            .filter_map(|id| table.jobs.get(id).and_then(|j| j.queue_position))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_third_job_queues_then_promotes_on_finish() {
        let store = JobStore::new(2);
        let now = Utc::now();
        let Admission::Started(j1) = store.admit(job(1, "a"), 5, now) else {
            panic!("expected start");
        };
        assert!(matches!(store.admit(job(2, "b"), 5, now), Admission::Started(_)));
        let Admission::Queued(j3) = store.admit(job(3, "c"), 5, now) else {
            panic!("expected queue");
        };
        assert_eq!(j3.queue_position, Some(1));
        assert_position_invariant(&store);

        let report = store
            .finish(&j1.id, JobOutcome::Failed(JobError::new(ErrorKind::Fatal, "x")), now)
            .unwrap()
            .unwrap();
        assert_eq!(report.promoted.len(), 1);
        let j3 = store.get(&j3.id).unwrap();
        assert_eq!(j3.state, JobState::Resolving);
        assert_eq!(j3.queue_position, None);
        assert_position_invariant(&store);
    }

    #[test]
    fn test_duplicate_returns_existing_job() {
        let store = JobStore::new(1);
        let now = Utc::now();
        let Admission::Started(first) = store.admit(job(7, "heat"), 3, now) else {
            panic!("expected start");
        };
        let before = store.counts();
        let Admission::Duplicate(dup) = store.admit(job(7, "heat"), 3, now) else {
            panic!("expected duplicate");
        };
        assert_eq!(dup.id, first.id);
        assert_eq!(store.counts(), before);
    }

    #[test]
    fn test_user_limit_is_a_hard_reject() {
        let store = JobStore::new(1);
        let now = Utc::now();
        store.admit(job(7, "a"), 2, now);
        store.admit(job(7, "b"), 2, now);
        match store.admit(job(7, "c"), 2, now) {
            Admission::LimitExceeded { user_limit, active } => {
                assert_eq!(user_limit, 2);
                assert_eq!(active, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.counts().queued, 1);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let store = JobStore::new(1);
        let now = Utc::now();
        let Admission::Started(j) = store.admit(job(1, "a"), 1, now) else {
            panic!("expected start");
        };
        assert!(store.finish(&j.id, JobOutcome::Expired, now).unwrap().is_some());
        assert!(store.finish(&j.id, JobOutcome::Expired, now).unwrap().is_none());
        assert_eq!(store.counts().active, 0);
    }

    #[test]
    fn test_cancel_queued_job_recomputes_positions() {
        let store = JobStore::new(1);
        let now = Utc::now();
        store.admit(job(1, "a"), 5, now);
        let Admission::Queued(q1) = store.admit(job(2, "b"), 5, now) else {
            panic!()
        };
        let Admission::Queued(q2) = store.admit(job(3, "c"), 5, now) else {
            panic!()
        };
        assert_eq!(q2.queue_position, Some(2));

        let cancelled = JobOutcome::Failed(JobError::new(ErrorKind::Cancelled, "user"));
        let report = store.finish(&q1.id, cancelled, now).unwrap().unwrap();
        assert!(report.promoted.is_empty());
        assert_eq!(store.get(&q2.id).unwrap().queue_position, Some(1));
        assert_eq!(store.counts().active, 1);
        assert_position_invariant(&store);
    }

    #[test]
    fn test_key_freed_after_terminal_allows_restart() {
        let store = JobStore::new(1);
        let now = Utc::now();
        let Admission::Started(j) = store.admit(job(1, "a"), 1, now) else {
            panic!()
        };
        store
            .finish(&j.id, JobOutcome::Failed(JobError::new(ErrorKind::NoMatch, "none")), now)
            .unwrap();
        let Admission::Started(again) = store.admit(job(1, "a"), 1, now) else {
            panic!("expected fresh job")
        };
        assert_ne!(again.id, j.id);
    }

    #[test]
    fn test_ready_requires_uploading() {
        let store = JobStore::new(1);
        let now = Utc::now();
        let Admission::Started(j) = store.admit(job(1, "a"), 1, now) else {
            panic!()
        };
        let result = ResultRef::single("o", "s", "f");
        assert!(store.finish(&j.id, JobOutcome::Ready(result.clone()), now).is_err());

        for stage in [JobState::Extracting, JobState::Converting, JobState::Uploading] {
            store.advance_stage(&j.id, stage, now).unwrap();
        }
        let report = store.finish(&j.id, JobOutcome::Ready(result), now).unwrap().unwrap();
        assert_eq!(report.job.progress, 100);
        assert!(report.job.result_ref.is_some());
    }

    #[test]
    fn test_dispatch_skips_finished_jobs() {
        let store = JobStore::new(2);
        let now = Utc::now();
        let Admission::Started(a) = store.admit(job(1, "a"), 1, now) else {
            panic!()
        };
        let Admission::Started(b) = store.admit(job(2, "b"), 1, now) else {
            panic!()
        };
        store.finish(&a.id, JobOutcome::Expired, now).unwrap();
        assert_eq!(store.take_dispatch().map(|j| j.id), Some(b.id));
        assert!(store.take_dispatch().is_none());
    }

    #[test]
    fn test_evict_finished_before() {
        let store = JobStore::new(1);
        let now = Utc::now();
        let Admission::Started(j) = store.admit(job(1, "a"), 1, now) else {
            panic!()
        };
        store.finish(&j.id, JobOutcome::Expired, now).unwrap();
        assert!(store.evict_finished_before(now).is_empty());
        let evicted = store.evict_finished_before(now + chrono::Duration::seconds(1));
        assert_eq!(evicted, vec![j.id.clone()]);
        assert!(store.get(&j.id).is_none());
    }
}

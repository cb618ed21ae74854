//! In-memory backend for tests/dev.
//!
//! All queues share one `RwLock`, so every operation is atomic with respect to
//! every other. The backend can simulate an outage (`set_available(false)`) and
//! a replica failover (`set_read_only(true)`) to exercise the connection layer.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use pdfgen_core::{from_millis, millis_after, JobId, LockToken};

use super::{
    AddOutcome, Backend, BackendError, BackendResult, Completion, FINISHED_OUTCOME_TTL, Failure,
    FinishedOutcome, STALLED_TOO_MANY_TIMES, StalledOutcome, StalledRecovery, waiting_rank,
};
use crate::jobs::{Job, JobCounts, JobState, Lease};

#[derive(Debug, Default)]
struct QueueData {
    seq: u64,
    jobs: HashMap<JobId, Job>,
    /// rank → id; see [`waiting_rank`].
    waiting: BTreeMap<u64, JobId>,
    /// (ready_at_ms, seq, id)
    delayed: BTreeSet<(i64, u64, JobId)>,
    active: HashSet<JobId>,
    /// Oldest first.
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    /// Outcomes of jobs evicted by retention: id → (expires_at_ms, outcome).
    finished: HashMap<JobId, (i64, FinishedOutcome)>,
}

impl QueueData {
    fn push_waiting(&mut self, job: &mut Job) {
        job.state = JobState::Waiting;
        self.waiting
            .insert(waiting_rank(job.priority, job.seq), job.id.clone());
    }

    fn push_delayed(&mut self, job: &mut Job, ready_at_ms: i64) {
        job.state = JobState::Delayed;
        job.ready_at = Some(from_millis(ready_at_ms));
        self.delayed.insert((ready_at_ms, job.seq, job.id.clone()));
    }

    fn promote_due(&mut self, now_ms: i64) {
        while let Some(first) = self.delayed.first().cloned() {
            if first.0 > now_ms {
                break;
            }
            self.delayed.remove(&first);
            let (_, _, id) = first;
            if let Some(mut job) = self.jobs.remove(&id) {
                self.push_waiting(&mut job);
                self.jobs.insert(id, job);
            }
        }
    }

    fn remove_everywhere(&mut self, id: &JobId) -> Option<Job> {
        let job = self.jobs.remove(id)?;
        self.waiting.remove(&waiting_rank(job.priority, job.seq));
        self.delayed.retain(|(_, _, d)| d != id);
        self.active.remove(id);
        self.completed.retain(|c| c != id);
        self.failed.retain(|f| f != id);
        Some(job)
    }

    /// Move an active job to a terminal list and apply retention.
    fn finish(&mut self, id: &JobId, state: JobState, keep: Option<u32>, now_ms: i64) {
        self.finished.retain(|_, (expires_at, _)| *expires_at > now_ms);

        let list = match state {
            JobState::Completed => &mut self.completed,
            _ => &mut self.failed,
        };
        list.push_back(id.clone());

        let Some(keep) = keep else {
            return;
        };
        let mut evicted = Vec::new();
        while list.len() > keep as usize {
            if let Some(old) = list.pop_front() {
                evicted.push(old);
            }
        }
        let expires_at = millis_after(now_ms, FINISHED_OUTCOME_TTL);
        for old in evicted {
            let Some(job) = self.jobs.remove(&old) else {
                continue;
            };
            let outcome = match job.state {
                JobState::Completed => {
                    FinishedOutcome::Completed(job.result.unwrap_or(serde_json::Value::Null))
                }
                _ => FinishedOutcome::Failed(job.error.unwrap_or_default()),
            };
            self.finished.insert(old, (expires_at, outcome));
        }
    }

    /// Take the job out of `active` if `token` holds its lease.
    fn release(&mut self, id: &JobId, token: LockToken) -> Option<Job> {
        let holds = self.jobs.get(id).is_some_and(|job| {
            job.state == JobState::Active && job.lease.is_some_and(|l| l.token == token)
        });
        if !holds {
            return None;
        }
        self.active.remove(id);
        let mut job = self.jobs.remove(id)?;
        job.lease = None;
        Some(job)
    }
}

#[derive(Debug, Default)]
struct Store {
    queues: HashMap<String, QueueData>,
}

/// In-memory broker backend.
#[derive(Debug)]
pub struct InMemoryBackend {
    store: RwLock<Store>,
    available: AtomicBool,
    read_only: AtomicBool,
    loading: AtomicBool,
    connected: AtomicBool,
    connects: AtomicU64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(Store::default()),
            available: AtomicBool::new(true),
            read_only: AtomicBool::new(false),
            loading: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connects: AtomicU64::new(0),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate the server going away (`false`) or coming back (`true`).
    ///
    /// Going away also drops the current connection, like a real socket reset.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Simulate a failover to a replica that still refuses writes.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Simulate a server that accepts connections but still answers `PING` with
    /// `LOADING`.
    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::SeqCst);
    }

    /// Drop every queue and job, like `FLUSHALL` on a real server.
    pub fn flush_all(&self) {
        if let Ok(mut store) = self.store.write() {
            store.queues.clear();
        }
    }

    /// Number of successful `connect` calls so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    fn check(&self, write: bool) -> BackendResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            return Err(BackendError::Connection(
                "in-memory broker unavailable".to_string(),
            ));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BackendError::Connection("not connected".to_string()));
        }
        if write && self.read_only.load(Ordering::SeqCst) {
            return Err(BackendError::ReadOnly(
                "READONLY You can't write against a read only replica.".to_string(),
            ));
        }
        Ok(())
    }

    fn read(&self) -> BackendResult<RwLockReadGuard<'_, Store>> {
        self.check(false)?;
        self.store
            .read()
            .map_err(|_| BackendError::Command("store lock poisoned".to_string()))
    }

    fn write(&self) -> BackendResult<RwLockWriteGuard<'_, Store>> {
        self.check(true)?;
        self.store
            .write()
            .map_err(|_| BackendError::Command("store lock poisoned".to_string()))
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown_queue(queue: &str) -> BackendError {
    BackendError::Command(format!("queue `{queue}` does not exist"))
}

impl Backend for InMemoryBackend {
    fn connect(&self) -> BackendResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Connection(
                "connection refused (in-memory broker unavailable)".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn ping(&self) -> BackendResult<()> {
        self.check(false)?;
        if self.loading.load(Ordering::SeqCst) {
            return Err(BackendError::Connection(
                "LOADING Redis is loading the dataset in memory".to_string(),
            ));
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn ensure_queue(&self, queue: &str) -> BackendResult<()> {
        let mut store = self.write()?;
        store.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    fn queue_exists(&self, queue: &str) -> BackendResult<bool> {
        Ok(self.read()?.queues.contains_key(queue))
    }

    fn add_job(&self, job: &Job, now_ms: i64) -> BackendResult<AddOutcome> {
        let mut store = self.write()?;
        let data = store
            .queues
            .get_mut(&job.queue)
            .ok_or_else(|| unknown_queue(&job.queue))?;

        data.finished.remove(&job.id);
        if let Some(existing) = data.jobs.get(&job.id) {
            if !existing.is_terminal() {
                return Ok(AddOutcome::Duplicate(existing.clone()));
            }
            data.remove_everywhere(&job.id);
        }

        data.seq += 1;
        let mut job = job.clone();
        job.seq = data.seq;

        match job.ready_at.map(|at| at.timestamp_millis()) {
            Some(ready_ms) if ready_ms > now_ms => data.push_delayed(&mut job, ready_ms),
            _ => data.push_waiting(&mut job),
        }

        data.jobs.insert(job.id.clone(), job.clone());
        Ok(AddOutcome::Added(job))
    }

    fn claim_next(
        &self,
        queue: &str,
        token: LockToken,
        now_ms: i64,
        lock_ms: u64,
    ) -> BackendResult<Option<Job>> {
        let mut store = self.write()?;
        let data = store
            .queues
            .get_mut(queue)
            .ok_or_else(|| unknown_queue(queue))?;

        data.promote_due(now_ms);

        let Some((_, id)) = data.waiting.pop_first() else {
            return Ok(None);
        };
        let Some(job) = data.jobs.get_mut(&id) else {
            return Err(BackendError::Corrupt(format!(
                "waiting entry {id} has no job record"
            )));
        };

        job.state = JobState::Active;
        job.attempts += 1;
        job.processed_at = Some(from_millis(now_ms));
        job.lease = Some(Lease {
            token,
            expires_at: from_millis(millis_after(now_ms, Duration::from_millis(lock_ms))),
        });
        let claimed = job.clone();
        data.active.insert(id);

        Ok(Some(claimed))
    }

    fn renew_lease(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        until_ms: i64,
    ) -> BackendResult<bool> {
        let mut store = self.write()?;
        let Some(job) = store
            .queues
            .get_mut(queue)
            .and_then(|data| data.jobs.get_mut(job_id))
        else {
            return Ok(false);
        };

        match job.lease.as_mut() {
            Some(lease) if job.state == JobState::Active && lease.token == token => {
                lease.expires_at = from_millis(until_ms);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        completion: &Completion,
    ) -> BackendResult<bool> {
        let mut store = self.write()?;
        let data = store
            .queues
            .get_mut(queue)
            .ok_or_else(|| unknown_queue(queue))?;

        let Some(mut job) = data.release(job_id, token) else {
            return Ok(false);
        };
        job.state = JobState::Completed;
        job.result = Some(completion.result.clone());
        job.finished_at = Some(from_millis(completion.finished_at_ms));
        job.history = completion.history.clone();

        data.jobs.insert(job_id.clone(), job);
        data.finish(
            job_id,
            JobState::Completed,
            completion.keep,
            completion.finished_at_ms,
        );
        Ok(true)
    }

    fn fail(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        failure: &Failure,
    ) -> BackendResult<bool> {
        let mut store = self.write()?;
        let data = store
            .queues
            .get_mut(queue)
            .ok_or_else(|| unknown_queue(queue))?;

        let Some(mut job) = data.release(job_id, token) else {
            return Ok(false);
        };
        job.error = Some(failure.error.clone());
        job.history = failure.history.clone();

        match failure.retry_at_ms {
            Some(retry_at) if retry_at > failure.finished_at_ms => {
                data.push_delayed(&mut job, retry_at);
                data.jobs.insert(job_id.clone(), job);
            }
            Some(_) => {
                job.ready_at = None;
                data.push_waiting(&mut job);
                data.jobs.insert(job_id.clone(), job);
            }
            None => {
                job.state = JobState::Failed;
                job.finished_at = Some(from_millis(failure.finished_at_ms));
                data.jobs.insert(job_id.clone(), job);
                data.finish(job_id, JobState::Failed, failure.keep, failure.finished_at_ms);
            }
        }
        Ok(true)
    }

    fn recover_stalled(
        &self,
        queue: &str,
        now_ms: i64,
        max_stalled_count: u32,
    ) -> BackendResult<Vec<StalledRecovery>> {
        let mut store = self.write()?;
        let data = store
            .queues
            .get_mut(queue)
            .ok_or_else(|| unknown_queue(queue))?;

        let mut expired: Vec<(i64, u64, JobId)> = data
            .active
            .iter()
            .filter_map(|id| data.jobs.get(id))
            .filter_map(|job| {
                let expires = job.lease?.expires_at.timestamp_millis();
                (expires < now_ms).then(|| (expires, job.seq, job.id.clone()))
            })
            .collect();
        expired.sort();

        let mut recovered = Vec::with_capacity(expired.len());
        for (_, _, id) in expired {
            data.active.remove(&id);
            let Some(mut job) = data.jobs.remove(&id) else {
                continue;
            };
            job.lease = None;

            let outcome = if job.stalled_count < max_stalled_count {
                job.stalled_count += 1;
                job.attempts = job.attempts.saturating_sub(1);
                data.push_waiting(&mut job);
                StalledOutcome::Requeued
            } else {
                job.state = JobState::Failed;
                job.error = Some(STALLED_TOO_MANY_TIMES.to_string());
                job.finished_at = Some(from_millis(now_ms));
                StalledOutcome::Failed
            };

            recovered.push(StalledRecovery {
                job_id: id.clone(),
                job_name: job.name.clone(),
                attempts: job.attempts,
                stalled_count: job.stalled_count,
                outcome,
            });

            let keep = job.settings.remove_on_fail;
            data.jobs.insert(id.clone(), job);
            if outcome == StalledOutcome::Failed {
                data.finish(&id, JobState::Failed, keep, now_ms);
            }
        }

        Ok(recovered)
    }

    fn get_job(&self, queue: &str, job_id: &JobId) -> BackendResult<Option<Job>> {
        let store = self.read()?;
        Ok(store
            .queues
            .get(queue)
            .and_then(|data| data.jobs.get(job_id))
            .cloned())
    }

    fn finished_outcome(
        &self,
        queue: &str,
        job_id: &JobId,
        now_ms: i64,
    ) -> BackendResult<Option<FinishedOutcome>> {
        let store = self.read()?;
        Ok(store
            .queues
            .get(queue)
            .and_then(|data| data.finished.get(job_id))
            .filter(|(expires_at, _)| *expires_at > now_ms)
            .map(|(_, outcome)| outcome.clone()))
    }

    fn counts(&self, queue: &str) -> BackendResult<JobCounts> {
        let store = self.read()?;
        let data = store.queues.get(queue).ok_or_else(|| unknown_queue(queue))?;
        Ok(JobCounts {
            waiting: data.waiting.len(),
            active: data.active.len(),
            delayed: data.delayed.len(),
            completed: data.completed.len(),
            failed: data.failed.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::jobs::{Backoff, JobSettings};

    const QUEUE: &str = "pdf";

    fn connected() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        backend.connect().unwrap();
        backend.ensure_queue(QUEUE).unwrap();
        backend
    }

    fn job(id: &str, priority: u8, keep: Option<u32>) -> Job {
        Job::new(
            JobId::custom(id).unwrap(),
            QUEUE,
            "generate-pdf",
            serde_json::json!({"templateId": "t1"}),
            JobSettings {
                max_attempts: 1,
                backoff: Backoff::fixed(Duration::ZERO),
                remove_on_complete: keep,
                remove_on_fail: keep,
            },
            priority,
            Duration::ZERO,
        )
        .unwrap()
    }

    fn completion(keep: Option<u32>) -> Completion {
        Completion {
            result: serde_json::json!({"ok": true}),
            finished_at_ms: Utc::now().timestamp_millis(),
            history: Vec::new(),
            keep,
        }
    }

    #[test]
    fn claims_in_fifo_order_within_priority() {
        let backend = connected();
        let now = Utc::now().timestamp_millis();
        for id in ["a", "b", "c"] {
            backend.add_job(&job(id, 0, None), now).unwrap();
        }
        backend.add_job(&job("urgent", 9, None), now).unwrap();

        let order: Vec<String> = (0..4)
            .map(|_| {
                backend
                    .claim_next(QUEUE, LockToken::new(), now, 1000)
                    .unwrap()
                    .unwrap()
                    .id
                    .to_string()
            })
            .collect();

        assert_eq!(order, vec!["urgent", "a", "b", "c"]);
        assert!(backend
            .claim_next(QUEUE, LockToken::new(), now, 1000)
            .unwrap()
            .is_none());
    }

    #[test]
    fn delayed_jobs_wait_until_due() {
        let backend = connected();
        let now = Utc::now().timestamp_millis();
        let mut delayed = job("later", 0, None);
        delayed.ready_at = Some(from_millis(now + 10_000));
        delayed.state = JobState::Delayed;
        backend.add_job(&delayed, now).unwrap();

        assert!(backend
            .claim_next(QUEUE, LockToken::new(), now, 1000)
            .unwrap()
            .is_none());
        let claimed = backend
            .claim_next(QUEUE, LockToken::new(), now + 10_001, 1000)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id.as_str(), "later");
    }

    #[test]
    fn duplicate_id_is_not_added_while_pending() {
        let backend = connected();
        let now = Utc::now().timestamp_millis();
        backend.add_job(&job("doc-1", 0, None), now).unwrap();

        let second = backend.add_job(&job("doc-1", 0, None), now).unwrap();
        assert!(matches!(second, AddOutcome::Duplicate(_)));
        assert_eq!(backend.counts(QUEUE).unwrap().waiting, 1);
    }

    #[test]
    fn terminal_job_is_replaced_on_re_add() {
        let backend = connected();
        let now = Utc::now().timestamp_millis();
        backend.add_job(&job("doc-1", 0, None), now).unwrap();
        let token = LockToken::new();
        let claimed = backend.claim_next(QUEUE, token, now, 1000).unwrap().unwrap();
        assert!(backend
            .complete(QUEUE, &claimed.id, token, &completion(None))
            .unwrap());

        let again = backend.add_job(&job("doc-1", 0, None), now).unwrap();
        assert!(matches!(again, AddOutcome::Added(_)));
        let counts = backend.counts(QUEUE).unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.completed, 0);
    }

    #[test]
    fn stale_token_cannot_complete() {
        let backend = connected();
        let now = Utc::now().timestamp_millis();
        backend.add_job(&job("doc-1", 0, None), now).unwrap();
        let claimed = backend
            .claim_next(QUEUE, LockToken::new(), now, 1000)
            .unwrap()
            .unwrap();

        let ok = backend
            .complete(QUEUE, &claimed.id, LockToken::new(), &completion(None))
            .unwrap();
        assert!(!ok);
        assert_eq!(backend.counts(QUEUE).unwrap().active, 1);
    }

    #[test]
    fn retention_keeps_most_recent_completed() {
        let backend = connected();
        let now = Utc::now().timestamp_millis();
        for id in ["a", "b", "c"] {
            backend.add_job(&job(id, 0, Some(2)), now).unwrap();
            let token = LockToken::new();
            let claimed = backend.claim_next(QUEUE, token, now, 1000).unwrap().unwrap();
            backend
                .complete(QUEUE, &claimed.id, token, &completion(Some(2)))
                .unwrap();
        }

        assert_eq!(backend.counts(QUEUE).unwrap().completed, 2);
        assert!(backend
            .get_job(QUEUE, &JobId::custom("a").unwrap())
            .unwrap()
            .is_none());
        assert!(backend
            .get_job(QUEUE, &JobId::custom("c").unwrap())
            .unwrap()
            .is_some());
    }

    #[test]
    fn remove_on_complete_zero_deletes_immediately() {
        let backend = connected();
        let now = Utc::now().timestamp_millis();
        backend.add_job(&job("gone", 0, Some(0)), now).unwrap();
        let token = LockToken::new();
        let claimed = backend.claim_next(QUEUE, token, now, 1000).unwrap().unwrap();
        backend
            .complete(QUEUE, &claimed.id, token, &completion(Some(0)))
            .unwrap();

        assert!(backend.get_job(QUEUE, &claimed.id).unwrap().is_none());
        assert_eq!(backend.counts(QUEUE).unwrap().completed, 0);

        let outcome = backend.finished_outcome(QUEUE, &claimed.id, now).unwrap();
        assert_eq!(
            outcome,
            Some(FinishedOutcome::Completed(serde_json::json!({"ok": true})))
        );
        let ttl = FINISHED_OUTCOME_TTL.as_millis() as i64;
        assert!(backend
            .finished_outcome(QUEUE, &claimed.id, now + ttl + 1)
            .unwrap()
            .is_none());
    }

    #[test]
    fn re_adding_an_evicted_id_forgets_its_outcome() {
        let backend = connected();
        let now = Utc::now().timestamp_millis();
        backend.add_job(&job("doc-1", 0, Some(0)), now).unwrap();
        let token = LockToken::new();
        let claimed = backend.claim_next(QUEUE, token, now, 1000).unwrap().unwrap();
        backend
            .complete(QUEUE, &claimed.id, token, &completion(Some(0)))
            .unwrap();
        assert!(backend.finished_outcome(QUEUE, &claimed.id, now).unwrap().is_some());

        backend.add_job(&job("doc-1", 0, Some(0)), now).unwrap();
        assert!(backend.finished_outcome(QUEUE, &claimed.id, now).unwrap().is_none());
    }

    #[test]
    fn flush_all_removes_queues() {
        let backend = connected();
        assert!(backend.queue_exists(QUEUE).unwrap());
        backend.flush_all();
        assert!(!backend.queue_exists(QUEUE).unwrap());
    }

    #[test]
    fn expired_lease_is_requeued_then_failed() {
        let backend = connected();
        let now = Utc::now().timestamp_millis();
        backend.add_job(&job("crashy", 0, None), now).unwrap();

        backend
            .claim_next(QUEUE, LockToken::new(), now, 10)
            .unwrap()
            .unwrap();
        let first = backend.recover_stalled(QUEUE, now + 100, 1).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].outcome, StalledOutcome::Requeued);

        let again = backend
            .claim_next(QUEUE, LockToken::new(), now + 100, 10)
            .unwrap()
            .unwrap();
        assert_eq!(again.attempts, 1);
        assert_eq!(again.stalled_count, 1);

        let second = backend.recover_stalled(QUEUE, now + 200, 1).unwrap();
        assert_eq!(second[0].outcome, StalledOutcome::Failed);
        let failed = backend.get_job(QUEUE, &again.id).unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.error.as_deref(), Some(STALLED_TOO_MANY_TIMES));
    }

    #[test]
    fn outage_and_read_only_surface_as_connection_errors() {
        let backend = connected();
        backend.set_read_only(true);
        let err = backend.ensure_queue("other").unwrap_err();
        assert!(matches!(err, BackendError::ReadOnly(_)));
        assert!(backend.queue_exists(QUEUE).unwrap());

        backend.set_available(false);
        assert!(backend.connect().is_err());
        assert!(backend.counts(QUEUE).unwrap_err().is_connection_level());

        backend.set_available(true);
        backend.set_read_only(false);
        backend.connect().unwrap();
        assert!(backend.counts(QUEUE).is_ok());
    }
}

//! In-memory implementations of the cluster contracts.
//!
//! These back single-process deployments and the test suite. Atomicity of
//! the conditional lock operations comes from performing the expiry sweep
//! and the check/mutate under one mutex acquisition, the same way a real
//! node guarantees it with an inline script.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant as TokioInstant;
use uuid::Uuid;

use super::{LockStore, QueueCluster};
use crate::error::{LockStoreError, QueueError};
use crate::job::{EnqueueOptions, Job, JobId};

/// One member of an in-memory lock cluster.
///
/// Keys expire lazily: every operation sweeps dead entries under the same
/// mutex acquisition that performs its conditional step, so no competing
/// client can interleave between sweep and mutation.
pub struct MemoryLockNode {
    entries: Mutex<HashMap<String, LockEntry>>,
    reachable: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    token: Uuid,
    expires_at: Instant,
}

impl MemoryLockNode {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    /// Fault injection: an unreachable node answers every operation with
    /// [`LockStoreError::Unreachable`] until flipped back.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn ensure_reachable(&self) -> Result<(), LockStoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LockStoreError::Unreachable(
                "memory lock node marked unreachable".to_string(),
            ))
        }
    }
}

impl Default for MemoryLockNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for MemoryLockNode {
    async fn set_if_absent(
        &self,
        key: &str,
        token: Uuid,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        self.ensure_reachable()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);

        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            LockEntry {
                token,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn renew_if_equal(
        &self,
        key: &str,
        token: Uuid,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        self.ensure_reachable()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);

        if let Some(entry) = entries.get_mut(key) {
            if entry.token == token {
                entry.expires_at = now + ttl;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn delete_if_equal(&self, key: &str, token: Uuid) -> Result<bool, LockStoreError> {
        self.ensure_reachable()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);

        if let Some(entry) = entries.get(key) {
            if entry.token == token {
                entries.remove(key);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Lifecycle phase of a stored job.
#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Withheld until the enqueue ETA.
    Delayed,
    /// Eligible for delivery.
    Ready,
    /// Claimed by a consumer; redelivered when the deadline passes.
    InFlight { deadline: Instant },
}

#[derive(Debug)]
struct StoredJob {
    queue: String,
    body: Bytes,
    retry: Duration,
    expires_at: Option<DateTime<Utc>>,
    phase: Phase,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, StoredJob>,
    /// Delayed jobs ordered by ETA; the sequence number breaks ties in
    /// submission order.
    delayed: BTreeMap<(DateTime<Utc>, u64), JobId>,
    ready: HashMap<String, VecDeque<JobId>>,
    next_seq: u64,
}

impl QueueState {
    /// Move due delayed jobs to their ready queues and requeue in-flight
    /// jobs whose retry window elapsed. Drops jobs past their TTL.
    fn promote(&mut self, now_utc: DateTime<Utc>, now: Instant) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now_utc {
                break;
            }
            let id = entry.remove();
            self.mark_ready(id, now_utc);
        }

        let lapsed: Vec<JobId> = self
            .jobs
            .iter()
            .filter_map(|(id, job)| match job.phase {
                Phase::InFlight { deadline } if deadline <= now => Some(*id),
                _ => None,
            })
            .collect();
        for id in lapsed {
            self.mark_ready(id, now_utc);
        }
    }

    fn mark_ready(&mut self, id: JobId, now_utc: DateTime<Utc>) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        if job.expires_at.is_some_and(|deadline| deadline <= now_utc) {
            self.jobs.remove(&id);
            return;
        }
        job.phase = Phase::Ready;
        let queue = job.queue.clone();
        self.ready.entry(queue).or_default().push_back(id);
    }

    fn pop_ready(&mut self, queue: &str, now_utc: DateTime<Utc>) -> Option<Job> {
        let ready = self.ready.get_mut(queue)?;
        while let Some(id) = ready.pop_front() {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.expires_at.is_some_and(|deadline| deadline <= now_utc) {
                self.jobs.remove(&id);
                continue;
            }
            job.phase = Phase::InFlight {
                deadline: Instant::now() + job.retry,
            };
            return Some(Job {
                id,
                queue: job.queue.clone(),
                body: job.body.clone(),
                retry: job.retry,
            });
        }
        None
    }

    /// Time until the next scheduled state change (an ETA coming due or a
    /// retry window lapsing), if any.
    fn next_event(&self, now_utc: DateTime<Utc>, now: Instant) -> Option<Duration> {
        let mut next: Option<Duration> = None;
        if let Some(((eta, _), _)) = self.delayed.first_key_value() {
            let until = eta
                .signed_duration_since(now_utc)
                .to_std()
                .unwrap_or(Duration::ZERO);
            next = Some(until);
        }
        for job in self.jobs.values() {
            if let Phase::InFlight { deadline } = job.phase {
                let until = deadline.saturating_duration_since(now);
                next = Some(next.map_or(until, |current| current.min(until)));
            }
        }
        next
    }
}

/// A single in-memory queue node.
///
/// Implements the full queue-cluster contract: delayed enqueue, claimed
/// blocking fetch, visibility extension, ack, and delete. Fetch blocks on a
/// version channel so producers never race a sleeping consumer.
pub struct MemoryQueueNode {
    state: Mutex<QueueState>,
    version: watch::Sender<u64>,
    /// Net depth of advisory pipelining scopes. Tracked for observability
    /// only.
    pipeline_depth: AtomicI64,
    closed: AtomicBool,
    reachable: AtomicBool,
}

impl MemoryQueueNode {
    #[must_use]
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(QueueState::default()),
            version,
            pipeline_depth: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
        }
    }

    /// Fault injection: an unreachable node answers every operation with
    /// [`QueueError::Unreachable`] until flipped back.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Net number of open pipelining scopes.
    #[must_use]
    pub fn pipeline_depth(&self) -> i64 {
        self.pipeline_depth.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(QueueError::Unreachable(
                "memory queue node marked unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn touch(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

impl Default for MemoryQueueNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueCluster for MemoryQueueNode {
    async fn add(
        &self,
        queue: &str,
        body: Bytes,
        eta: DateTime<Utc>,
        options: &EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        self.check_available()?;
        let id = JobId::generate();
        let now_utc = Utc::now();
        let expires_at = options
            .ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now_utc + ttl);

        let mut state = self.state.lock().await;
        state.jobs.insert(
            id,
            StoredJob {
                queue: queue.to_string(),
                body,
                retry: options.retry,
                expires_at,
                phase: Phase::Delayed,
            },
        );
        if eta <= now_utc {
            state.mark_ready(id, now_utc);
        } else {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.delayed.insert((eta, seq), id);
        }
        drop(state);
        self.touch();
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).map(|job| Job {
            id: job_id,
            queue: job.queue.clone(),
            body: job.body.clone(),
            retry: job.retry,
        }))
    }

    async fn fetch(&self, queue: &str, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = TokioInstant::now() + timeout;
        let mut version = self.version.subscribe();
        loop {
            self.check_available()?;
            // Snapshot the version before inspecting state so any mutation
            // after this point trips `changed()`.
            version.borrow_and_update();

            let (popped, next_event) = {
                let mut state = self.state.lock().await;
                let now_utc = Utc::now();
                let now = Instant::now();
                state.promote(now_utc, now);
                let popped = state.pop_ready(queue, now_utc);
                (popped, state.next_event(now_utc, now))
            };
            if popped.is_some() {
                self.touch();
                return Ok(popped);
            }

            let now = TokioInstant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut wake = deadline;
            if let Some(delay) = next_event {
                wake = wake.min(now + delay);
            }
            tokio::select! {
                _ = version.changed() => {}
                () = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn wait(&self, job_id: JobId) -> Result<(), QueueError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job_id) {
            Some(job) if matches!(job.phase, Phase::InFlight { .. }) => {
                job.phase = Phase::InFlight {
                    deadline: Instant::now() + job.retry,
                };
                drop(state);
                self.touch();
                Ok(())
            }
            _ => Err(QueueError::NotInFlight(job_id)),
        }
    }

    async fn ack(&self, job_id: JobId) -> Result<(), QueueError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.jobs.get(&job_id) {
            Some(job) if matches!(job.phase, Phase::InFlight { .. }) => {
                state.jobs.remove(&job_id);
                drop(state);
                self.touch();
                Ok(())
            }
            _ => Err(QueueError::NotInFlight(job_id)),
        }
    }

    async fn delete(&self, job_id: JobId) -> Result<bool, QueueError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let existed = state.jobs.remove(&job_id).is_some();
        if existed {
            state.delayed.retain(|_, id| *id != job_id);
            for ready in state.ready.values_mut() {
                ready.retain(|id| *id != job_id);
            }
        }
        drop(state);
        self.touch();
        Ok(existed)
    }

    async fn chain(&self) {
        self.pipeline_depth.fetch_add(1, Ordering::SeqCst);
    }

    async fn unchain(&self) {
        self.pipeline_depth.fetch_sub(1, Ordering::SeqCst);
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        self.touch();
        Ok(())
    }
}

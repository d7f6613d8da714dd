//! Contracts for the two storage clusters the library talks to, plus
//! in-memory implementations of both.
//!
//! The queue cluster (durable, replicated) owns jobs end to end: delayed
//! enqueue, claimed fetch, visibility extension, and acknowledgement. The
//! lock cluster is an independent set of key/value nodes used solely for
//! distributed locking; quorum comes from the client fanning out, not from
//! replication between the nodes.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{LockStoreError, QueueError};
use crate::job::{EnqueueOptions, Job, JobId};

mod memory;

pub use memory::{MemoryLockNode, MemoryQueueNode};

/// Client-side contract of the job-queue cluster.
#[async_trait]
pub trait QueueCluster: Send + Sync {
    /// Enqueue a job on `queue`, withheld from consumers until `eta`.
    async fn add(
        &self,
        queue: &str,
        body: Bytes,
        eta: DateTime<Utc>,
        options: &EnqueueOptions,
    ) -> Result<JobId, QueueError>;

    /// Fetch job metadata by id, from any phase of its lifecycle.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;

    /// Blocking pop with timeout. A returned job is claimed: redelivery is
    /// gated on its retry window expiring.
    async fn fetch(&self, queue: &str, timeout: Duration) -> Result<Option<Job>, QueueError>;

    /// Extend the visibility/retry timer of an in-flight job.
    async fn wait(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Finalize and remove an in-flight job.
    async fn ack(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Remove a job in any phase. Returns whether a job was removed.
    async fn delete(&self, job_id: JobId) -> Result<bool, QueueError>;

    /// Open an advisory command-pipelining scope. Purely a throughput hint;
    /// correctness never depends on it.
    async fn chain(&self) {}

    /// Close the advisory pipelining scope opened by [`Self::chain`].
    async fn unchain(&self) {}

    /// Release client resources. Subsequent operations may fail.
    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Client-side contract of one lock-cluster member.
///
/// All three operations must be atomic on the server (conditional command or
/// inline script); a client-side read-then-write cannot exclude a competing
/// client between the two steps.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `token` with expiry `ttl`, only if `key` is unset.
    /// Returns whether the conditional set happened.
    async fn set_if_absent(
        &self,
        key: &str,
        token: Uuid,
        ttl: Duration,
    ) -> Result<bool, LockStoreError>;

    /// Reset the expiry of `key` to `ttl`, only if its value equals `token`.
    /// Returns whether the value still matched at execution time.
    async fn renew_if_equal(
        &self,
        key: &str,
        token: Uuid,
        ttl: Duration,
    ) -> Result<bool, LockStoreError>;

    /// Delete `key`, only if its value equals `token`. Returns whether the
    /// delete was performed.
    async fn delete_if_equal(&self, key: &str, token: Uuid) -> Result<bool, LockStoreError>;

    /// Release client resources.
    async fn close(&self) -> Result<(), LockStoreError> {
        Ok(())
    }
}

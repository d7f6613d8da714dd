//! Producer-side handle: delayed enqueue and job management passthroughs.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::cluster::QueueCluster;
use crate::error::QueueError;
use crate::job::{EnqueueOptions, Job, JobId};
use crate::metrics::ClientMetrics;
use crate::retry::{RetryConfig, RetryExecutor};

/// Producer handle over the queue cluster.
///
/// Stateless apart from its client: every enqueued job lives entirely in
/// the cluster. Transient node failures during enqueue are retried with
/// backoff; everything else surfaces to the caller.
pub struct Producer {
    queue: Arc<dyn QueueCluster>,
    retry: RetryExecutor,
}

impl Producer {
    #[must_use]
    pub fn new(queue: Arc<dyn QueueCluster>) -> Self {
        Self {
            queue,
            retry: RetryExecutor::new(RetryConfig::default()),
        }
    }

    #[must_use]
    pub fn with_metrics(queue: Arc<dyn QueueCluster>, metrics: Arc<ClientMetrics>) -> Self {
        Self {
            queue,
            retry: RetryExecutor::with_metrics(RetryConfig::default(), metrics),
        }
    }

    /// Enqueue a job on `queue`, withheld from consumers until `eta`.
    pub async fn enqueue(
        &self,
        queue: &str,
        body: impl Into<Bytes>,
        eta: DateTime<Utc>,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let body = body.into();
        let job_id = self
            .retry
            .execute(
                "queue_add",
                || {
                    let body = body.clone();
                    let options = options.clone();
                    async move { self.queue.add(queue, body, eta, &options).await }
                },
                QueueError::is_transient,
            )
            .await?;
        tracing::debug!(%job_id, queue, %eta, "job enqueued");
        Ok(job_id)
    }

    /// Fetch metadata for a job in any lifecycle phase.
    pub async fn job_info(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        self.queue.get(job_id).await
    }

    /// Remove a job before it is delivered. Returns whether a job was
    /// removed; a job already consumed and acked yields `false`.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, QueueError> {
        let removed = self.queue.delete(job_id).await?;
        if removed {
            tracing::debug!(%job_id, "job cancelled");
        }
        Ok(removed)
    }

    /// Close the underlying cluster client.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.queue.close().await
    }
}

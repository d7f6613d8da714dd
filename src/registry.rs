//! Queue-name to processor routing.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::job::Job;

/// User-supplied work for jobs fetched from one queue.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Run user work for one delivered job.
    ///
    /// An `Err` marks the job as failed but, by default, still acked: a
    /// processor that wants the work retried re-enqueues it itself. This
    /// keeps poison jobs from being redelivered in a storm.
    async fn process(&self, job: &Job) -> anyhow::Result<()>;

    /// Whether the per-job lock should be refreshed for as long as
    /// [`Self::process`] runs. Evaluated once, at lock acquisition.
    /// Defaults to fail-fast: the lock expires at its nominal TTL.
    fn should_auto_renew(&self, _job: &Job) -> bool {
        false
    }
}

/// Concurrency-safe mapping from queue name to processor.
///
/// Registration is last-writer-wins; lookups may race registrations freely.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: DashMap<String, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, queue: impl Into<String>, processor: Arc<dyn JobProcessor>) {
        let queue = queue.into();
        tracing::debug!(queue = %queue, "processor registered");
        self.processors.insert(queue, processor);
    }

    #[must_use]
    pub fn lookup(&self, queue: &str) -> Option<Arc<dyn JobProcessor>> {
        self.processors
            .get(queue)
            .map(|entry| Arc::clone(entry.value()))
    }
}

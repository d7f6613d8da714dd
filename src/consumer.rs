//! Job processing loops and the consumer lifecycle facade.
//!
//! A [`Consumer`] owns one processing loop per queue it was started on.
//! Each loop iteration claims one job, gates execution on a per-job
//! [`QuorumLock`], keeps the job visible through a [`VisibilityWatchdog`]
//! while the processor runs, and acknowledges on success. Losing the lock
//! or the ability to extend visibility discards the iteration's result
//! without acking; the processor's side effects, if any, stand.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::cluster::{LockStore, QueueCluster};
use crate::config::{Config, ConsumerConfig};
use crate::lock::QuorumLock;
use crate::metrics::ClientMetrics;
use crate::registry::{JobProcessor, ProcessorRegistry};
use crate::watchdog::VisibilityWatchdog;

/// How one loop iteration ended. Drives logging and backoff only; every
/// variant leaves the loop ready for the next iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterationOutcome {
    /// Fetch timed out with no job.
    Idle,
    /// Fetch failed outright; the loop backs off before retrying.
    FetchFailed,
    /// A job arrived but no processor is registered for the queue. The job
    /// stays un-acked and will be redelivered.
    Unroutable,
    /// Another consumer holds the job's lock.
    LockBusy,
    /// The processor ran and the job was finalized.
    Completed,
    /// The lock or the visibility timer was lost mid-processing; the
    /// result was discarded without ack.
    LockLost,
}

/// One queue's fetch/lock/process/ack loop.
struct ProcessingLoop {
    queue_name: String,
    queue: Arc<dyn QueueCluster>,
    lock_nodes: Vec<Arc<dyn LockStore>>,
    registry: Arc<ProcessorRegistry>,
    config: ConsumerConfig,
    lock_ttl: Duration,
    metrics: Arc<ClientMetrics>,
}

impl ProcessingLoop {
    async fn run(&self, shutdown: watch::Receiver<bool>) {
        tracing::info!(queue = %self.queue_name, "processing loop started");
        loop {
            // Non-blocking shutdown check; an in-flight iteration is never
            // interrupted.
            if *shutdown.borrow() {
                break;
            }
            self.queue.chain().await;
            let outcome = self.iteration().await;
            self.queue.unchain().await;

            if outcome == IterationOutcome::FetchFailed {
                tokio::time::sleep(self.config.fetch_error_backoff()).await;
            }
        }
        tracing::info!(queue = %self.queue_name, "processing loop stopped");
    }

    async fn iteration(&self) -> IterationOutcome {
        let job = match self
            .queue
            .fetch(&self.queue_name, self.config.fetch_timeout())
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => return IterationOutcome::Idle,
            Err(err) => {
                tracing::warn!(queue = %self.queue_name, error = %err, "queue fetch failed");
                return IterationOutcome::FetchFailed;
            }
        };
        self.metrics.increment_jobs_fetched();

        let Some(processor) = self.registry.lookup(&self.queue_name) else {
            // Leave the job un-acked; it comes back after its retry window.
            self.metrics.increment_unroutable_jobs();
            tracing::debug!(
                queue = %self.queue_name,
                job_id = %job.id,
                "no processor registered for fetched job"
            );
            return IterationOutcome::Unroutable;
        };

        let mut lock = QuorumLock::for_job(self.lock_nodes.clone(), job.id, self.lock_ttl)
            .with_metrics(Arc::clone(&self.metrics));
        if !lock.acquire(processor.should_auto_renew(&job)).await {
            self.metrics.increment_lock_conflicts();
            tracing::debug!(job_id = %job.id, "job lock unavailable; another consumer owns it");
            return IterationOutcome::LockBusy;
        }

        let (watchdog_stop, stop_rx) = mpsc::channel::<()>(1);
        let watchdog = VisibilityWatchdog::new(
            Arc::clone(&self.queue),
            job.id,
            job.retry,
            self.config.watchdog_tick(),
            Arc::clone(&self.metrics),
        )
        .spawn(stop_rx);

        let handler_result = processor.process(&job).await;

        let _ = watchdog_stop.try_send(());
        drop(watchdog_stop);
        let watchdog_ok = match watchdog.await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(join_err) if join_err.is_panic() => {
                // Unknown panic inside the watchdog: clean up, then re-raise.
                lock.release().await;
                std::panic::resume_unwind(join_err.into_panic());
            }
            Err(_) => false,
        };

        match &handler_result {
            Ok(()) => self.metrics.increment_jobs_processed(),
            Err(err) => {
                self.metrics.increment_handler_errors();
                tracing::warn!(job_id = %job.id, error = %err, "processor returned error");
            }
        }

        let outcome = if watchdog_ok && lock.is_active().await {
            if handler_result.is_ok() || self.config.ack_failed_jobs {
                match self.queue.ack(job.id).await {
                    Ok(()) => self.metrics.increment_jobs_acked(),
                    Err(err) => {
                        // Non-fatal: the job will be redelivered, and a
                        // non-idempotent processor may then run twice.
                        self.metrics.increment_ack_failures();
                        tracing::warn!(
                            job_id = %job.id,
                            error = %err,
                            "ack failed; job may be redelivered"
                        );
                    }
                }
            }
            IterationOutcome::Completed
        } else {
            self.metrics.increment_locks_lost();
            tracing::warn!(
                job_id = %job.id,
                "job lock presumed lost; discarding result without ack"
            );
            IterationOutcome::LockLost
        };

        // Always attempt release, whatever the ack outcome; segments we
        // fail to delete expire on their own.
        if !lock.release().await {
            self.metrics.increment_lock_release_failures();
            tracing::debug!(job_id = %job.id, "lock release unacknowledged");
        }
        outcome
    }
}

/// Decrements the live-loop count when a loop task ends, however it ends.
struct ActiveLoopGuard(Arc<AtomicUsize>);

impl Drop for ActiveLoopGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Consumer facade: processor registration and loop lifecycle.
pub struct Consumer {
    queue: Arc<dyn QueueCluster>,
    lock_nodes: Vec<Arc<dyn LockStore>>,
    registry: Arc<ProcessorRegistry>,
    config: Config,
    metrics: Arc<ClientMetrics>,
    shutdown: watch::Sender<bool>,
    active_loops: Arc<AtomicUsize>,
    loop_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Consumer {
    /// Build a consumer over the two cluster clients.
    ///
    /// Fails when the configuration cannot work at runtime (see
    /// [`crate::config::validate`]).
    pub fn new(
        queue: Arc<dyn QueueCluster>,
        lock_nodes: Vec<Arc<dyn LockStore>>,
        config: Config,
    ) -> anyhow::Result<Arc<Self>> {
        crate::config::validate(&config)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            queue,
            lock_nodes,
            registry: Arc::new(ProcessorRegistry::new()),
            config,
            metrics: Arc::new(ClientMetrics::new()),
            shutdown,
            active_loops: Arc::new(AtomicUsize::new(0)),
            loop_tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Register the processor for a queue. Last writer wins.
    pub fn register(&self, queue: impl Into<String>, processor: Arc<dyn JobProcessor>) {
        self.registry.register(queue, processor);
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<ClientMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Begin a processing loop for `queue_name`. May be called for any
    /// number of queues; each loop is an independent task.
    pub async fn start_processing(&self, queue_name: &str) {
        let processing_loop = ProcessingLoop {
            queue_name: queue_name.to_string(),
            queue: Arc::clone(&self.queue),
            lock_nodes: self.lock_nodes.clone(),
            registry: Arc::clone(&self.registry),
            config: self.config.consumer.clone(),
            lock_ttl: self.config.lock.ttl(),
            metrics: Arc::clone(&self.metrics),
        };
        let shutdown = self.shutdown.subscribe();
        self.active_loops.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveLoopGuard(Arc::clone(&self.active_loops));
        let handle = tokio::spawn(async move {
            let _guard = guard;
            processing_loop.run(shutdown).await;
        });
        self.loop_tasks.lock().await.push(handle);
    }

    /// Signal every loop to stop. Fire-and-forget: loops observe the
    /// signal at their next iteration, within at most one fetch timeout.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Whether at least one processing loop is still running.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.active_loops.load(Ordering::SeqCst) > 0
    }

    /// Stop processing, wait for the loops to wind down, and close both
    /// cluster clients. Errors from the closes are aggregated.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.stop();
        let tasks: Vec<JoinHandle<()>> = self.loop_tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
            }
        }

        let mut errors: Vec<String> = Vec::new();
        if let Err(err) = self.queue.close().await {
            errors.push(format!("queue client: {err}"));
        }
        for (index, node) in self.lock_nodes.iter().enumerate() {
            if let Err(err) = node.close().await {
                errors.push(format!("lock node {index}: {err}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("close failed: {}", errors.join("; ")))
        }
    }
}

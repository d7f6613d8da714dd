//! Visibility extension for in-flight jobs.
//!
//! The queue cluster has no arbitrary-duration "still working" ping, so a
//! per-job watchdog periodically resets the retry timer instead. Losing the
//! ability to extend means the job can be redelivered at any moment, which
//! the processing loop treats the same as losing the job's lock.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cluster::QueueCluster;
use crate::error::QueueError;
use crate::job::JobId;
use crate::metrics::ClientMetrics;

/// Watchdog for one job's visibility timer.
///
/// Extends the timer whenever half the retry window has passed since the
/// last extension, leaving headroom for network jitter. One watchdog is
/// spawned per claimed job and stopped before the job is acked.
pub struct VisibilityWatchdog {
    queue: Arc<dyn QueueCluster>,
    job_id: JobId,
    retry: Duration,
    tick: Duration,
    metrics: Arc<ClientMetrics>,
}

impl VisibilityWatchdog {
    pub fn new(
        queue: Arc<dyn QueueCluster>,
        job_id: JobId,
        retry: Duration,
        tick: Duration,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            queue,
            job_id,
            retry,
            tick,
            metrics,
        }
    }

    /// Run the watchdog until stopped or until an extension fails.
    ///
    /// The task resolves `Ok(())` when the control channel signals stop
    /// (sender drop counts, which covers a processing loop unwinding), and
    /// `Err` when a visibility-extend RPC failed — the job must then be
    /// considered forfeited and its result discarded.
    pub fn spawn(self, mut stop: mpsc::Receiver<()>) -> JoinHandle<Result<(), QueueError>> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let threshold = self.retry / 2;
            let mut last_extended = Instant::now();

            loop {
                tokio::select! {
                    _ = stop.recv() => return Ok(()),
                    _ = interval.tick() => {}
                }

                if last_extended.elapsed() >= threshold {
                    if let Err(err) = self.queue.wait(self.job_id).await {
                        tracing::warn!(
                            job_id = %self.job_id,
                            error = %err,
                            "visibility extension failed; abandoning job"
                        );
                        self.metrics.increment_visibility_extend_failures();
                        return Err(err);
                    }
                    self.metrics.increment_visibility_extensions();
                    tracing::trace!(job_id = %self.job_id, "visibility extended");
                    last_extended = Instant::now();
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryQueueNode, QueueCluster};
    use crate::job::EnqueueOptions;
    use bytes::Bytes;
    use chrono::Utc;

    async fn claimed_job(node: &MemoryQueueNode, retry: Duration) -> JobId {
        let options = EnqueueOptions { retry, ttl: None };
        node.add("q", Bytes::from_static(b"w"), Utc::now(), &options)
            .await
            .unwrap();
        node.fetch("q", Duration::from_millis(100))
            .await
            .unwrap()
            .expect("job should be claimable")
            .id
    }

    #[tokio::test]
    async fn watchdog_keeps_job_in_flight_past_retry_window() {
        let node = Arc::new(MemoryQueueNode::new());
        let retry = Duration::from_millis(120);
        let job_id = claimed_job(&node, retry).await;
        let metrics = Arc::new(ClientMetrics::new());

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let watchdog = VisibilityWatchdog::new(
            node.clone() as Arc<dyn QueueCluster>,
            job_id,
            retry,
            Duration::from_millis(10),
            metrics.clone(),
        );
        let handle = watchdog.spawn(stop_rx);

        // Well past the original window; extensions must have kept the job
        // from being redelivered.
        tokio::time::sleep(retry * 3).await;
        let refetch = node.fetch("q", Duration::from_millis(30)).await.unwrap();
        assert!(refetch.is_none(), "extended job must not be redelivered");

        stop_tx.send(()).await.unwrap();
        assert!(handle.await.unwrap().is_ok());
        assert!(metrics.snapshot().visibility_extensions > 0);
    }

    #[tokio::test]
    async fn watchdog_stops_when_sender_dropped() {
        let node = Arc::new(MemoryQueueNode::new());
        let retry = Duration::from_millis(100);
        let job_id = claimed_job(&node, retry).await;
        let metrics = Arc::new(ClientMetrics::new());

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let watchdog = VisibilityWatchdog::new(
            node as Arc<dyn QueueCluster>,
            job_id,
            retry,
            Duration::from_millis(10),
            metrics,
        );
        let handle = watchdog.spawn(stop_rx);
        drop(stop_tx);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn failed_extension_surfaces_as_error() {
        let node = Arc::new(MemoryQueueNode::new());
        let retry = Duration::from_millis(60);
        let job_id = claimed_job(&node, retry).await;
        let metrics = Arc::new(ClientMetrics::new());

        node.set_reachable(false);
        let (_stop_tx, stop_rx) = mpsc::channel(1);
        let watchdog = VisibilityWatchdog::new(
            node.clone() as Arc<dyn QueueCluster>,
            job_id,
            retry,
            Duration::from_millis(10),
            metrics.clone(),
        );
        let handle = watchdog.spawn(stop_rx);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(QueueError::Unreachable(_))));
        assert_eq!(metrics.snapshot().visibility_extend_failures, 1);
    }
}

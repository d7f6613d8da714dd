//! Quorum-based distributed locking over independent lock nodes.
//!
//! A [`QuorumLock`] fans out to every configured lock node and is held only
//! while a strict majority of them carry its token. Nodes do not replicate
//! between themselves; exclusion comes entirely from the client-side quorum.
//! A successful acquisition whose round trips took longer than the TTL is
//! rejected outright, because the earliest segments may already be expiring
//! by the time the quorum is counted.

use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cluster::LockStore;
use crate::job::JobId;
use crate::metrics::ClientMetrics;

/// Clock-drift compensation applied to the validity window, as a fraction
/// of the TTL.
const DRIFT_FACTOR: f64 = 0.01;

/// Floor on drift compensation for very small TTLs.
const MIN_DRIFT: Duration = Duration::from_millis(1);

/// Number of members that constitutes a strict majority of `n`.
pub(crate) const fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// One reservation held at a single lock node.
#[derive(Debug, Clone)]
pub struct LockSegment {
    /// Index of the node in the lock's member list.
    node: usize,
    acquired_at: Instant,
    expires_at: Instant,
}

impl LockSegment {
    /// Conditionally reserve `key` at one node. A node that cannot be
    /// reached counts the same as one that already holds the key.
    async fn acquire(
        node: &dyn LockStore,
        index: usize,
        key: &str,
        token: Uuid,
        ttl: Duration,
    ) -> Option<Self> {
        let acquired_at = Instant::now();
        match node.set_if_absent(key, token, ttl).await {
            Ok(true) => Some(Self {
                node: index,
                acquired_at,
                expires_at: acquired_at + ttl,
            }),
            Ok(false) => None,
            Err(err) => {
                tracing::debug!(node = index, key, error = %err, "lock node unreachable during acquire");
                None
            }
        }
    }

    /// Push the expiry of an existing reservation out by `ttl`. Returns
    /// whether the node still carried our token at execution time.
    async fn renew(node: &dyn LockStore, key: &str, token: Uuid, ttl: Duration) -> bool {
        match node.renew_if_equal(key, token, ttl).await {
            Ok(renewed) => renewed,
            Err(err) => {
                tracing::debug!(key, error = %err, "lock node unreachable during renew");
                false
            }
        }
    }

    /// Compare-and-delete the reservation. Returns whether the node
    /// acknowledged the delete.
    async fn release(node: &dyn LockStore, key: &str, token: Uuid) -> bool {
        match node.delete_if_equal(key, token).await {
            Ok(deleted) => deleted,
            Err(err) => {
                tracing::debug!(key, error = %err, "lock node unreachable during release");
                false
            }
        }
    }
}

/// Segment set and loss flag shared with the renewal task.
struct SharedState {
    held: Mutex<Vec<LockSegment>>,
    /// Monotonic: set once by the renewal loop when the majority is gone,
    /// cleared only by a fresh acquisition.
    lost: AtomicBool,
}

/// A distributed mutual-exclusion lock over a set of independent lock
/// nodes.
///
/// One instance guards one key through one acquisition. `acquire` never
/// retries internally; callers that want the lock later try again with a
/// fresh attempt.
pub struct QuorumLock {
    nodes: Arc<Vec<Arc<dyn LockStore>>>,
    key: String,
    ttl: Duration,
    token: Uuid,
    shared: Arc<SharedState>,
    /// Every node that ever granted a segment for this instance. Release
    /// targets all of them, covering segments we believe expired but which
    /// may not have.
    ever_granted: HashSet<usize>,
    renew_stop: Option<mpsc::Sender<()>>,
    renew_task: Option<JoinHandle<()>>,
    metrics: Option<Arc<ClientMetrics>>,
}

impl QuorumLock {
    pub fn new(nodes: Vec<Arc<dyn LockStore>>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            nodes: Arc::new(nodes),
            key: key.into(),
            ttl,
            token: Uuid::new_v4(),
            shared: Arc::new(SharedState {
                held: Mutex::new(Vec::new()),
                lost: AtomicBool::new(false),
            }),
            ever_granted: HashSet::new(),
            renew_stop: None,
            renew_task: None,
            metrics: None,
        }
    }

    /// Lock keyed by a job identifier: one lock per job, never per queue.
    pub fn for_job(nodes: Vec<Arc<dyn LockStore>>, job_id: JobId, ttl: Duration) -> Self {
        Self::new(nodes, format!("job:{job_id}"), ttl)
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    fn quorum(&self) -> usize {
        majority(self.nodes.len())
    }

    /// Attempt to take the lock.
    ///
    /// Generates a fresh token, fans the conditional set out to every node
    /// in parallel, and succeeds iff a strict majority granted it and the
    /// acquisition round trips fit inside the TTL after drift compensation.
    /// On failure every granted segment is released best-effort and the
    /// attempt is not retried.
    pub async fn acquire(&mut self, auto_renew: bool) -> bool {
        self.token = Uuid::new_v4();
        self.shared.lost.store(false, Ordering::SeqCst);
        let token = self.token;
        let start = Instant::now();

        let attempts = join_all(self.nodes.iter().enumerate().map(|(index, node)| {
            let key = self.key.as_str();
            let ttl = self.ttl;
            async move { LockSegment::acquire(node.as_ref(), index, key, token, ttl).await }
        }))
        .await;

        let granted: Vec<LockSegment> = attempts.into_iter().flatten().collect();
        for segment in &granted {
            self.ever_granted.insert(segment.node);
        }

        let elapsed = start.elapsed();
        let drift = MIN_DRIFT.max(self.ttl.mul_f64(DRIFT_FACTOR));

        if granted.len() >= self.quorum() && elapsed + drift < self.ttl {
            tracing::debug!(
                key = %self.key,
                segments = granted.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "quorum lock acquired"
            );
            *self.shared.held.lock().await = granted;
            if auto_renew {
                self.spawn_renew_loop();
            }
            return true;
        }

        // Insufficient quorum, or the validity window is already exhausted:
        // early segments may be expiring before the last answer arrived.
        tracing::debug!(
            key = %self.key,
            segments = granted.len(),
            quorum = self.quorum(),
            elapsed_ms = elapsed.as_millis() as u64,
            "quorum lock acquisition failed"
        );
        join_all(granted.iter().map(|segment| {
            let node = Arc::clone(&self.nodes[segment.node]);
            let key = self.key.as_str();
            async move { LockSegment::release(node.as_ref(), key, token).await }
        }))
        .await;
        false
    }

    /// Whether the lock still holds a strict majority of unexpired
    /// segments and the renewal loop has not declared it lost.
    pub async fn is_active(&self) -> bool {
        if self.shared.lost.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        let held = self.shared.held.lock().await;
        held.iter().filter(|segment| segment.expires_at > now).count() >= self.quorum()
    }

    /// Release the lock at every node that ever granted a segment.
    ///
    /// Idempotent and safe to call without a prior successful acquisition.
    /// Returns whether at least one node acknowledged the compare-and-delete.
    pub async fn release(&mut self) -> bool {
        // Stop the renewal loop first; the child task never outlives its
        // lock. Dropping the sender is the stop signal.
        self.renew_stop.take();
        if let Some(task) = self.renew_task.take() {
            let _ = task.await;
        }

        let token = self.token;
        let acknowledged = join_all(self.ever_granted.iter().map(|&index| {
            let node = Arc::clone(&self.nodes[index]);
            let key = self.key.as_str();
            async move { LockSegment::release(node.as_ref(), key, token).await }
        }))
        .await
        .into_iter()
        .filter(|acked| *acked)
        .count();

        self.shared.held.lock().await.clear();
        acknowledged > 0
    }

    /// Renewal loop: every `ttl / 2`, renew all held segments in parallel
    /// and drop the ones that no longer carry our token. Falling below the
    /// majority flips the monotonic `lost` flag and ends the loop.
    fn spawn_renew_loop(&mut self) {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let shared = Arc::clone(&self.shared);
        let nodes = Arc::clone(&self.nodes);
        let key = self.key.clone();
        let token = self.token;
        let ttl = self.ttl;
        let quorum = self.quorum();
        let metrics = self.metrics.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl / 2);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; renewals start one
            // period after acquisition.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {}
                }

                let targets: Vec<usize> = shared
                    .held
                    .lock()
                    .await
                    .iter()
                    .map(|segment| segment.node)
                    .collect();
                let renewed_at = Instant::now();
                let outcomes = join_all(targets.iter().map(|&index| {
                    let node = Arc::clone(&nodes[index]);
                    let key = key.as_str();
                    async move { (index, LockSegment::renew(node.as_ref(), key, token, ttl).await) }
                }))
                .await;
                let surviving: HashSet<usize> = outcomes
                    .into_iter()
                    .filter_map(|(index, renewed)| renewed.then_some(index))
                    .collect();

                let mut held = shared.held.lock().await;
                held.retain(|segment| {
                    if surviving.contains(&segment.node) {
                        true
                    } else {
                        tracing::debug!(
                            key = %key,
                            node = segment.node,
                            held_for_ms = segment.acquired_at.elapsed().as_millis() as u64,
                            "lock segment dropped during renewal"
                        );
                        false
                    }
                });
                for segment in held.iter_mut() {
                    segment.expires_at = renewed_at + ttl;
                }
                let held_count = held.len();
                drop(held);

                if let Some(metrics) = &metrics {
                    metrics.add_lock_renewals(surviving.len() as u64);
                    metrics.add_lock_renewal_failures((targets.len() - surviving.len()) as u64);
                }

                if held_count < quorum {
                    shared.lost.store(true, Ordering::SeqCst);
                    tracing::warn!(
                        key = %key,
                        held = held_count,
                        quorum,
                        "lock lost: renewal fell below majority"
                    );
                    break;
                }
            }
        });

        self.renew_stop = Some(stop_tx);
        self.renew_task = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryLockNode;

    fn cluster(n: usize) -> (Vec<Arc<MemoryLockNode>>, Vec<Arc<dyn LockStore>>) {
        let concrete: Vec<Arc<MemoryLockNode>> =
            (0..n).map(|_| Arc::new(MemoryLockNode::new())).collect();
        let erased = concrete
            .iter()
            .map(|node| Arc::clone(node) as Arc<dyn LockStore>)
            .collect();
        (concrete, erased)
    }

    #[test]
    fn majority_is_strict() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }

    #[tokio::test]
    async fn acquire_and_release_roundtrip() {
        let (_, nodes) = cluster(3);
        let mut lock = QuorumLock::new(nodes, "k", Duration::from_secs(3));
        assert!(lock.acquire(false).await);
        assert!(lock.is_active().await);
        assert!(lock.release().await);
        assert!(!lock.is_active().await);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (_, nodes) = cluster(3);
        let mut lock = QuorumLock::new(nodes, "k", Duration::from_secs(3));
        assert!(lock.acquire(false).await);
        assert!(lock.release().await);
        assert!(!lock.release().await);
        assert!(!lock.release().await);
    }

    #[tokio::test]
    async fn release_without_acquisition_is_safe() {
        let (_, nodes) = cluster(3);
        let mut lock = QuorumLock::new(nodes, "k", Duration::from_secs(3));
        assert!(!lock.release().await);
    }

    #[tokio::test]
    async fn acquire_fails_without_quorum() {
        let (concrete, nodes) = cluster(3);
        concrete[0].set_reachable(false);
        concrete[1].set_reachable(false);

        let mut lock = QuorumLock::new(nodes.clone(), "k", Duration::from_secs(3));
        assert!(!lock.acquire(false).await);
        assert!(!lock.is_active().await);

        // The single granted segment must have been cleaned up.
        let probe = Uuid::new_v4();
        assert!(
            concrete[2]
                .set_if_absent("k", probe, Duration::from_secs(1))
                .await
                .unwrap(),
            "failed acquisition must not leave a residual segment"
        );
    }

    #[tokio::test]
    async fn acquire_tolerates_minority_outage() {
        let (concrete, nodes) = cluster(3);
        concrete[2].set_reachable(false);

        let mut lock = QuorumLock::new(nodes, "k", Duration::from_secs(3));
        assert!(lock.acquire(false).await, "two of three segments suffice");
        assert!(lock.release().await);
    }

    #[tokio::test]
    async fn locks_on_distinct_keys_are_independent() {
        let (_, nodes) = cluster(3);
        let mut first = QuorumLock::new(nodes.clone(), "alpha", Duration::from_secs(3));
        let mut second = QuorumLock::new(nodes, "beta", Duration::from_secs(3));
        assert!(first.acquire(false).await);
        assert!(second.acquire(false).await);
        assert!(first.release().await);
        assert!(second.release().await);
    }

    #[tokio::test]
    async fn renewal_declares_loss_when_majority_gone() {
        let (concrete, nodes) = cluster(3);
        let ttl = Duration::from_millis(200);
        let mut lock = QuorumLock::new(nodes, "k", ttl);
        assert!(lock.acquire(true).await);

        // Take out two nodes so the next renewal round cannot reach a
        // majority.
        concrete[0].set_reachable(false);
        concrete[1].set_reachable(false);
        tokio::time::sleep(ttl).await;

        assert!(!lock.is_active().await, "lock must report itself lost");
        lock.release().await;
    }

    #[tokio::test]
    async fn token_mismatch_prevents_foreign_release() {
        let (_, nodes) = cluster(3);
        let ttl = Duration::from_secs(3);
        let mut holder = QuorumLock::new(nodes.clone(), "k", ttl);
        assert!(holder.acquire(false).await);

        let mut intruder = QuorumLock::new(nodes, "k", ttl);
        assert!(!intruder.acquire(false).await);
        assert!(
            !intruder.release().await,
            "an intruder that never held a segment releases nothing"
        );
        assert!(holder.is_active().await);
        assert!(holder.release().await);
    }
}

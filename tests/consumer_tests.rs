//! End-to-end consumer behavior against the in-memory clusters.


use bytes::Bytes;
use chrono::Utc;
use remora_queue::cluster::QueueCluster;
use remora_queue::consumer::Consumer;
use remora_queue::job::EnqueueOptions;
use remora_queue::lock::QuorumLock;
use remora_queue::producer::Producer;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{lock_cluster, queue_node, test_config, wait_until, CollectingProcessor};

#[tokio::test]
async fn consumer_drains_a_hundred_jobs_within_five_seconds() {
    let queue = queue_node();
    let (_, lock_nodes) = lock_cluster();
    let consumer = Consumer::new(queue.clone(), lock_nodes, test_config()).unwrap();

    let (processor, bodies) = CollectingProcessor::new();
    consumer.register("bulk", Arc::new(processor));

    let mut submitted = Vec::new();
    for i in 0..100 {
        let body = format!("job-{i:03}");
        queue
            .add(
                "bulk",
                Bytes::from(body.clone().into_bytes()),
                Utc::now(),
                &EnqueueOptions::default(),
            )
            .await
            .unwrap();
        submitted.push(body);
    }

    consumer.start_processing("bulk").await;
    let drained = wait_until(
        || bodies.lock().unwrap().len() == 100,
        Duration::from_secs(5),
    )
    .await;
    assert!(drained, "all 100 jobs processed within five seconds");

    let processed = bodies.lock().unwrap().clone();
    assert_eq!(processed.len(), 100, "each job runs exactly once");
    let processed_set: HashSet<&String> = processed.iter().collect();
    let submitted_set: HashSet<&String> = submitted.iter().collect();
    assert_eq!(processed_set, submitted_set);

    consumer.close().await.unwrap();
}

#[tokio::test]
async fn delayed_jobs_are_processed_in_eta_order() {
    let queue = queue_node();
    let (_, lock_nodes) = lock_cluster();
    let consumer = Consumer::new(queue.clone(), lock_nodes, test_config()).unwrap();

    let (processor, bodies) = CollectingProcessor::new();
    consumer.register("staggered", Arc::new(processor));

    let base = Utc::now();
    let mut submitted = Vec::new();
    for i in 0..20i64 {
        let body = format!("step-{i:02}");
        queue
            .add(
                "staggered",
                Bytes::from(body.clone().into_bytes()),
                base + chrono::Duration::milliseconds(100 * i),
                &EnqueueOptions::default(),
            )
            .await
            .unwrap();
        submitted.push(body);
    }

    consumer.start_processing("staggered").await;
    tokio::time::sleep(Duration::from_secs(7)).await;

    let processed = bodies.lock().unwrap().clone();
    assert_eq!(
        processed, submitted,
        "spaced etas are delivered in submission order"
    );

    consumer.close().await.unwrap();
}

#[tokio::test]
async fn cancelled_delayed_job_never_runs() {
    let queue = queue_node();
    let (_, lock_nodes) = lock_cluster();
    let producer = Producer::new(queue.clone());
    let consumer = Consumer::new(queue.clone(), lock_nodes, test_config()).unwrap();

    let (processor, bodies) = CollectingProcessor::new();
    consumer.register("cancellable", Arc::new(processor));
    consumer.start_processing("cancellable").await;

    let job_id = producer
        .enqueue(
            "cancellable",
            &b"never"[..],
            Utc::now() + chrono::Duration::seconds(5),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(producer.cancel(job_id).await.unwrap());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(
        bodies.lock().unwrap().is_empty(),
        "cancelled job must never reach the processor"
    );
    assert!(producer.job_info(job_id).await.unwrap().is_none());

    consumer.close().await.unwrap();
}

#[tokio::test]
async fn foreign_lock_defers_processing_until_released() {
    let queue = queue_node();
    let (_, lock_nodes) = lock_cluster();
    let consumer = Consumer::new(queue.clone(), lock_nodes.clone(), test_config()).unwrap();

    let (processor, bodies) = CollectingProcessor::new();
    consumer.register("guarded", Arc::new(processor));

    let job_id = queue
        .add(
            "guarded",
            Bytes::from_static(b"contested"),
            Utc::now(),
            &EnqueueOptions {
                retry: Duration::from_millis(500),
                ttl: None,
            },
        )
        .await
        .unwrap();

    // Another consumer already owns this job's lock.
    let mut foreign = QuorumLock::for_job(lock_nodes, job_id, Duration::from_secs(30));
    assert!(foreign.acquire(false).await);

    consumer.start_processing("guarded").await;
    let conflicted = wait_until(
        || consumer.metrics().snapshot().lock_conflicts >= 1,
        Duration::from_secs(3),
    )
    .await;
    assert!(conflicted, "the loop must skip a job whose lock is held");
    assert!(bodies.lock().unwrap().is_empty());
    assert_eq!(consumer.metrics().snapshot().jobs_acked, 0);

    assert!(foreign.release().await);
    let processed = wait_until(
        || bodies.lock().unwrap().len() == 1,
        Duration::from_secs(5),
    )
    .await;
    assert!(processed, "redelivery after release lets the job run");

    consumer.close().await.unwrap();
}

#[tokio::test]
async fn two_consumers_split_work_without_double_processing() {
    let queue = queue_node();
    let (_, lock_nodes) = lock_cluster();

    let first = Consumer::new(queue.clone(), lock_nodes.clone(), test_config()).unwrap();
    let second = Consumer::new(queue.clone(), lock_nodes, test_config()).unwrap();

    let (processor_a, bodies_a) = CollectingProcessor::new();
    let (processor_b, bodies_b) = CollectingProcessor::new();
    first.register("shared", Arc::new(processor_a));
    second.register("shared", Arc::new(processor_b));

    let mut submitted = HashSet::new();
    for i in 0..50 {
        let body = format!("item-{i:02}");
        queue
            .add(
                "shared",
                Bytes::from(body.clone().into_bytes()),
                Utc::now(),
                &EnqueueOptions::default(),
            )
            .await
            .unwrap();
        submitted.insert(body);
    }

    first.start_processing("shared").await;
    second.start_processing("shared").await;

    let drained = wait_until(
        || bodies_a.lock().unwrap().len() + bodies_b.lock().unwrap().len() == 50,
        Duration::from_secs(10),
    )
    .await;
    assert!(drained);

    let mut seen = HashSet::new();
    for body in bodies_a
        .lock()
        .unwrap()
        .iter()
        .chain(bodies_b.lock().unwrap().iter())
    {
        assert!(seen.insert(body.clone()), "job {body} ran more than once");
    }
    assert_eq!(seen, submitted);

    first.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn long_job_with_auto_renew_survives_and_acks() {
    let queue = queue_node();
    let (_, lock_nodes) = lock_cluster();
    let mut config = test_config();
    config.lock.ttl_ms = 200;
    let consumer = Consumer::new(queue.clone(), lock_nodes, config).unwrap();

    struct SlowRenewing;
    #[async_trait::async_trait]
    impl remora_queue::registry::JobProcessor for SlowRenewing {
        async fn process(&self, _job: &remora_queue::job::Job) -> anyhow::Result<()> {
            // Runs for several lock TTLs; only renewal keeps the lock.
            tokio::time::sleep(Duration::from_millis(700)).await;
            Ok(())
        }

        fn should_auto_renew(&self, _job: &remora_queue::job::Job) -> bool {
            true
        }
    }
    consumer.register("slow", Arc::new(SlowRenewing));

    queue
        .add(
            "slow",
            Bytes::from_static(b"marathon"),
            Utc::now(),
            &EnqueueOptions {
                retry: Duration::from_millis(300),
                ttl: None,
            },
        )
        .await
        .unwrap();

    consumer.start_processing("slow").await;
    let acked = wait_until(
        || consumer.metrics().snapshot().jobs_acked == 1,
        Duration::from_secs(5),
    )
    .await;
    assert!(acked, "renewed lock and extended visibility carry a long job");
    assert_eq!(consumer.metrics().snapshot().locks_lost, 0);
    let snapshot = consumer.metrics().snapshot();
    assert!(snapshot.lock_renewals > 0, "renewal loop must have run");
    assert!(
        snapshot.visibility_extensions > 0,
        "watchdog must have extended visibility"
    );

    consumer.close().await.unwrap();
}

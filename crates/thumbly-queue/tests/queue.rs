//! Queue integration tests.
//!
//! These need a live Redis at `REDIS_URL` (default `redis://localhost:6379`)
//! and are ignored by default. Run with `cargo test -- --ignored`.

use std::time::Duration;

use thumbly_models::{FileId, FileKind, JobId};
use thumbly_queue::{
    CleanKind, JobQueue, NackOutcome, ProcessingEnvelope, QueueConfig, QueueError,
};

fn test_config(suffix: &str) -> QueueConfig {
    QueueConfig {
        redis_url: std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
        stream_name: format!("thumbly-test:jobs:{}", suffix),
        consumer_group: "thumbly-test:workers".to_string(),
        scheduled_key: format!("thumbly-test:scheduled:{}", suffix),
        max_attempts: 3,
        backoff_base: Duration::from_millis(50),
        stall_timeout: Duration::from_millis(200),
    }
}

fn test_envelope() -> ProcessingEnvelope {
    ProcessingEnvelope::new(
        JobId::new(),
        FileId::new(),
        "test-user",
        "/tmp/input.jpg",
        FileKind::Image,
        vec!["128x128".to_string()],
        "/tmp/thumbnails",
    )
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn enqueue_reserve_ack_cycle() {
    let queue = JobQueue::new(test_config("ack")).expect("create queue");
    queue.init().await.expect("init queue");

    let envelope = test_envelope();
    queue.enqueue(&envelope, None).await.expect("enqueue");

    let entries = queue
        .reserve("test-consumer", 1000, 1)
        .await
        .expect("reserve");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].envelope.job_id, envelope.job_id);
    assert_eq!(entries[0].attempt, 1);

    queue.ack(&entries[0]).await.expect("ack");

    // The same job can be enqueued again after settling.
    queue.enqueue(&envelope, None).await.expect("re-enqueue");
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn duplicate_enqueue_is_rejected() {
    let queue = JobQueue::new(test_config("dup")).expect("create queue");
    queue.init().await.expect("init queue");

    let envelope = test_envelope();
    queue.enqueue(&envelope, None).await.expect("first enqueue");

    let err = queue.enqueue(&envelope, None).await.unwrap_err();
    assert!(matches!(err, QueueError::Duplicate(_)));

    // Clean up so later runs are not polluted.
    queue.remove(envelope.job_id.as_str()).await.expect("remove");
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn nack_reschedules_with_backoff_then_exhausts() {
    let queue = JobQueue::new(test_config("nack")).expect("create queue");
    queue.init().await.expect("init queue");

    let envelope = test_envelope();
    queue.enqueue(&envelope, None).await.expect("enqueue");

    for expected_attempt in 1..=3u32 {
        // Wait out backoff and promote before each round after the first.
        for _ in 0..20 {
            queue.promote_due().await.expect("promote");
            let entries = queue
                .reserve("test-consumer", 200, 1)
                .await
                .expect("reserve");
            if entries.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            let entry = &entries[0];
            assert_eq!(entry.attempt, expected_attempt);
            let outcome = queue.nack(entry, "synthetic failure").await.expect("nack");
            match expected_attempt {
                3 => assert_eq!(outcome, NackOutcome::Exhausted),
                n => assert_eq!(
                    outcome,
                    NackOutcome::Retry {
                        delay: thumbly_queue::backoff_delay(Duration::from_millis(50), n),
                        attempt: n,
                    }
                ),
            }
            break;
        }
    }
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn double_settle_is_rejected() {
    let queue = JobQueue::new(test_config("settle")).expect("create queue");
    queue.init().await.expect("init queue");

    let envelope = test_envelope();
    queue.enqueue(&envelope, None).await.expect("enqueue");

    let entries = queue
        .reserve("test-consumer", 1000, 1)
        .await
        .expect("reserve");
    assert_eq!(entries.len(), 1);

    queue.ack(&entries[0]).await.expect("first settle");
    let err = queue.nack(&entries[0], "late nack").await.unwrap_err();
    assert!(matches!(err, QueueError::AlreadyAcked(_)));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn remove_before_reserve_empties_queue() {
    let queue = JobQueue::new(test_config("remove")).expect("create queue");
    queue.init().await.expect("init queue");

    let envelope = test_envelope();
    queue.enqueue(&envelope, None).await.expect("enqueue");

    assert!(queue.remove(envelope.job_id.as_str()).await.expect("remove"));

    let entries = queue
        .reserve("test-consumer", 200, 1)
        .await
        .expect("reserve");
    assert!(entries.is_empty());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn clean_drops_abandoned_delayed_entries() {
    let queue = JobQueue::new(test_config("clean")).expect("create queue");
    queue.init().await.expect("init queue");

    let envelope = test_envelope();
    queue
        .enqueue(&envelope, Some(Duration::from_millis(1)))
        .await
        .expect("enqueue delayed");
    assert_eq!(queue.scheduled_len().await.expect("len"), 1);

    // The entry became visible in the past; once it is older than the
    // cutoff it counts as abandoned.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let removed = queue
        .clean(Duration::from_millis(10), CleanKind::Delayed)
        .await
        .expect("clean");
    assert_eq!(removed, 1);
    assert_eq!(queue.scheduled_len().await.expect("len"), 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn pause_blocks_reservation() {
    let queue = JobQueue::new(test_config("pause")).expect("create queue");
    queue.init().await.expect("init queue");

    let envelope = test_envelope();
    queue.enqueue(&envelope, None).await.expect("enqueue");

    queue.pause().await.expect("pause");
    let entries = queue
        .reserve("test-consumer", 200, 1)
        .await
        .expect("reserve");
    assert!(entries.is_empty());

    queue.resume().await.expect("resume");
    let entries = queue
        .reserve("test-consumer", 1000, 1)
        .await
        .expect("reserve");
    assert_eq!(entries.len(), 1);
    queue.ack(&entries[0]).await.expect("ack");
}

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{leftovers, pipeline, retries, FakeStorage, FakeTranscoder, FixedCatalog};
use tokio::sync::watch;
use video_compress_pipeline::config::model::{FailureMode, JobOptions, QueueConfig, WorkerConfig};
use video_compress_pipeline::error::{AppError, QueueError};
use video_compress_pipeline::enqueue::Enqueuer;
use video_compress_pipeline::queue::{JobCounts, JobOutcome, JobQueue, JobStatus, MemoryQueue};
use video_compress_pipeline::worker::Worker;

fn listing() -> FixedCatalog {
    FixedCatalog(vec![
        "https://src.example/a.mp4?sig=1".to_string(),
        "https://src.example/b.mp4?sig=2".to_string(),
    ])
}

async fn wait_for(queue: &MemoryQueue, done: impl Fn(&JobCounts) -> bool) -> JobCounts {
    for _ in 0..300 {
        let counts = queue.counts().await.unwrap();
        if done(&counts) {
            return counts;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue never settled: {:?}", queue.counts().await.unwrap());
}

#[tokio::test]
async fn enqueued_listing_is_compressed_end_to_end() {
    let scratch = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new(JobOptions::default()));

    let summary = Enqueuer::new(Arc::new(listing()), queue.clone())
        .enqueue_all()
        .await
        .unwrap();
    assert_eq!(summary.enqueued_count, 2);

    let storage = Arc::new(FakeStorage::default());
    let transcoder = Arc::new(FakeTranscoder::default());
    let pipeline = Arc::new(pipeline(&storage, &transcoder, scratch.path(), retries(3, 2, 0)));
    let worker = Worker::new(queue.clone(), pipeline, "it")
        .with_concurrency(2)
        .with_poll_timeout(Duration::from_millis(20));

    let (stop_tx, stop_rx) = watch::channel(false);
    let run = tokio::spawn(async move { worker.run(stop_rx).await });
    wait_for(&queue, |c| c.completed == 2).await;
    stop_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(
        storage.uploaded_keys(),
        vec!["a-compressed.mp4", "b-compressed.mp4"]
    );
    let mut ids: Vec<String> = queue
        .list(JobStatus::Completed, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["video-0", "video-1"]);
    assert!(leftovers(&scratch.path().join("it")).is_empty());

    // Completed jobs keep their ids, so a second pass adds nothing.
    let again = Enqueuer::new(Arc::new(listing()), queue.clone())
        .enqueue_all()
        .await
        .unwrap();
    assert_eq!(again.enqueued_count, 0);
    assert_eq!(again.duplicates, 2);
}

#[tokio::test]
async fn swallowed_failures_complete_the_job() {
    let scratch = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new(JobOptions {
        attempts: 3,
        backoff_delay_ms: 0,
        ..JobOptions::default()
    }));
    Enqueuer::new(Arc::new(listing()), queue.clone())
        .enqueue_all()
        .await
        .unwrap();

    let storage = Arc::new(FakeStorage::default());
    let transcoder = Arc::new(FakeTranscoder::default().failing(u32::MAX));
    let pipeline = Arc::new(pipeline(&storage, &transcoder, scratch.path(), retries(0, 1, 0)));
    let worker = Worker::new(queue.clone(), pipeline, "it").with_poll_timeout(Duration::from_millis(20));

    let (stop_tx, stop_rx) = watch::channel(false);
    let run = tokio::spawn(async move { worker.run(stop_rx).await });
    let counts = wait_for(&queue, |c| c.completed == 2).await;
    stop_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(counts.failed, 0);
    // Two jobs, each with one retry inside the stage and no queue retry.
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 4);
    for job in queue.list(JobStatus::Completed, 10).await.unwrap() {
        assert_eq!(job.attempts_made, 1);
        assert!(matches!(job.outcome, Some(JobOutcome::Failed { .. })));
    }
    assert!(storage.uploaded_keys().is_empty());
}

#[tokio::test]
async fn propagated_failures_use_queue_attempts() {
    let scratch = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new(JobOptions {
        attempts: 2,
        backoff_delay_ms: 10,
        ..JobOptions::default()
    }));
    Enqueuer::new(Arc::new(FixedCatalog(vec!["https://src/a.mp4".to_string()])), queue.clone())
        .enqueue_all()
        .await
        .unwrap();

    let storage = Arc::new(FakeStorage::default());
    let transcoder = Arc::new(FakeTranscoder::default().failing(u32::MAX));
    let pipeline = Arc::new(
        pipeline(&storage, &transcoder, scratch.path(), retries(0, 0, 0))
            .with_failure_mode(FailureMode::Propagate),
    );
    let worker = Worker::new(queue.clone(), pipeline, "it")
        .with_poll_timeout(Duration::from_millis(20))
        .with_promote_interval(Duration::from_millis(10));

    let (stop_tx, stop_rx) = watch::channel(false);
    let run = tokio::spawn(async move { worker.run(stop_rx).await });
    wait_for(&queue, |c| c.failed == 1).await;
    stop_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    let failed = queue.list(JobStatus::Failed, 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, "video-0");
    assert_eq!(failed[0].attempts_made, 2);
    assert!(failed[0]
        .failed_reason
        .as_deref()
        .unwrap()
        .contains("attempt 1"));
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 2);
    assert!(leftovers(&scratch.path().join("it")).is_empty());

    queue.retry_failed("video-0").await.unwrap();
    assert_eq!(queue.counts().await.unwrap().waiting, 1);
}

#[tokio::test]
async fn second_worker_with_the_same_name_leaves_in_flight_job_alone() {
    let scratch = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new(JobOptions::default()));
    Enqueuer::new(Arc::new(FixedCatalog(vec!["https://src/a.mp4".to_string()])), queue.clone())
        .enqueue_all()
        .await
        .unwrap();

    let storage = Arc::new(FakeStorage::default());
    let transcoder = Arc::new(FakeTranscoder::default().with_delay(Duration::from_millis(300)));
    let pipeline = Arc::new(pipeline(&storage, &transcoder, scratch.path(), retries(3, 2, 0)));
    let worker_config = WorkerConfig::default();
    let queue_config = QueueConfig::default();

    let first = Worker::from_config(queue.clone(), pipeline.clone(), &worker_config, &queue_config)
        .with_poll_timeout(Duration::from_millis(20));
    let second = Worker::from_config(queue.clone(), pipeline, &worker_config, &queue_config)
        .with_poll_timeout(Duration::from_millis(20));
    let first_scratch = first.scratch_root().to_path_buf();

    let (stop_tx, stop_rx) = watch::channel(false);
    let first_rx = stop_rx.clone();
    let run = tokio::spawn(async move { first.run(first_rx).await });

    for _ in 0..100 {
        if transcoder.calls.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(queue.counts().await.unwrap().active, 1);

    let refused = second.run(stop_rx).await.unwrap_err();
    assert!(matches!(refused, AppError::Queue(QueueError::WorkerNameInUse { .. })));

    wait_for(&queue, |c| c.completed == 1).await;
    stop_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(storage.download_calls.load(Ordering::SeqCst), 1);
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(storage.uploaded_keys(), vec!["a-compressed.mp4"]);
    let done = queue.list(JobStatus::Completed, 10).await.unwrap();
    assert_eq!(done[0].attempts_made, 1);
    assert!(done[0].outcome.as_ref().unwrap().is_uploaded());
    assert!(leftovers(&first_scratch).is_empty());
}

#[tokio::test]
async fn named_workers_share_queue_and_scratch_root() {
    let scratch = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new(JobOptions::default()));
    let urls = ["a", "b", "c", "d"]
        .iter()
        .map(|name| format!("https://src/{}.mp4", name))
        .collect();
    Enqueuer::new(Arc::new(FixedCatalog(urls)), queue.clone())
        .enqueue_all()
        .await
        .unwrap();

    let storage = Arc::new(FakeStorage::default());
    let transcoder = Arc::new(FakeTranscoder::default().with_delay(Duration::from_millis(50)));
    let pipeline = Arc::new(
        pipeline(&storage, &transcoder, scratch.path(), retries(3, 2, 0)).with_transcode_slots(2),
    );
    let queue_config = QueueConfig::default();
    let worker = |name: &str| {
        let config = WorkerConfig {
            name: name.to_string(),
            concurrency: 1,
            ..WorkerConfig::default()
        };
        Worker::from_config(queue.clone(), pipeline.clone(), &config, &queue_config)
            .with_poll_timeout(Duration::from_millis(20))
    };
    let (host_a, host_b) = (worker("host-a"), worker("host-b"));

    let (stop_tx, stop_rx) = watch::channel(false);
    let rx = stop_rx.clone();
    let run_a = tokio::spawn(async move { host_a.run(rx).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let run_b = tokio::spawn(async move { host_b.run(stop_rx).await });

    wait_for(&queue, |c| c.completed == 4).await;
    stop_tx.send(true).unwrap();
    run_a.await.unwrap().unwrap();
    run_b.await.unwrap().unwrap();

    assert_eq!(storage.download_calls.load(Ordering::SeqCst), 4);
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        storage.uploaded_keys(),
        vec!["a-compressed.mp4", "b-compressed.mp4", "c-compressed.mp4", "d-compressed.mp4"]
    );
    for job in queue.list(JobStatus::Completed, 10).await.unwrap() {
        assert_eq!(job.attempts_made, 1);
        assert!(job.outcome.unwrap().is_uploaded());
    }
    assert!(leftovers(&scratch.path().join("host-a")).is_empty());
    assert!(leftovers(&scratch.path().join("host-b")).is_empty());
}

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use eventpipe::config::StreamSettings;
use eventpipe::counters::FailureCounter;
use eventpipe::error::EnqueueError;
use eventpipe::producer::batching::{CycleOutcome, RecycleOutcome};
use eventpipe::producer::{batching_producer, BatchingProducer, BatchingWorker};

use common::{payload_of, TestBroker, TestConnector};

fn settings(max_items: usize, queue_capacity: usize, threshold: u64) -> StreamSettings {
    StreamSettings {
        batch_max_items: max_items,
        batch_period: Duration::from_millis(100),
        queue_capacity,
        producer_error_threshold: threshold,
        ..Default::default()
    }
}

fn producer(
    broker: &Arc<TestBroker>,
    settings: &StreamSettings,
    failures: Arc<FailureCounter>,
) -> (BatchingProducer, BatchingWorker) {
    batching_producer(
        "audit",
        "audit-topic",
        TestConnector::new(broker.clone()),
        settings,
        failures,
    )
}

#[tokio::test(start_paused = true)]
async fn sends_only_what_fits_the_batch() {
    let broker = TestBroker::new(250);
    let (producer, mut worker) = producer(&broker, &settings(500, 100, 100), Default::default());

    for _ in 0..5 {
        producer.enqueue(&payload_of(100)).unwrap();
    }

    assert_eq!(worker.run_once().await, CycleOutcome::Sent(2));
    assert_eq!(broker.batch_sizes(), vec![2]);
    assert_eq!(worker.retry_len(), 3);
    assert_eq!(producer.counters().sent, 2);

    // The deferred items go first on the next cycles
    assert_eq!(worker.run_once().await, CycleOutcome::Sent(2));
    assert_eq!(worker.run_once().await, CycleOutcome::Sent(1));
    assert_eq!(worker.run_once().await, CycleOutcome::Idle);
    assert_eq!(broker.batch_sizes(), vec![2, 2, 1]);
    assert_eq!(producer.counters().sent, 5);
}

#[tokio::test(start_paused = true)]
async fn stops_at_max_items() {
    let broker = TestBroker::new(1_000_000);
    let (producer, mut worker) = producer(&broker, &settings(3, 100, 100), Default::default());

    for i in 0..7 {
        producer.enqueue(&i).unwrap();
    }

    assert_eq!(worker.run_once().await, CycleOutcome::Sent(3));
    assert_eq!(worker.run_once().await, CycleOutcome::Sent(3));
    assert_eq!(worker.run_once().await, CycleOutcome::Sent(1));
    assert_eq!(broker.batch_sizes(), vec![3, 3, 1]);
}

#[tokio::test(start_paused = true)]
async fn receipts_resolve_after_delivery() {
    let broker = TestBroker::new(1_000);
    let (producer, mut worker) = producer(&broker, &settings(500, 100, 100), Default::default());

    let receipt = producer.enqueue(&"hello").unwrap();
    worker.run_once().await;

    assert!(receipt.delivered().await);
    assert_eq!(
        broker.batches.lock().unwrap()[0][0].as_ref(),
        br#""hello""#
    );
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_without_blocking() {
    let broker = TestBroker::new(1_000);
    let (producer, _worker) = producer(&broker, &settings(500, 2, 100), Default::default());

    producer.enqueue(&1).unwrap();
    producer.enqueue(&2).unwrap();
    assert!(matches!(producer.enqueue(&3), Err(EnqueueError::QueueFull)));
}

#[tokio::test(start_paused = true)]
async fn failed_send_loses_nothing() {
    let broker = TestBroker::new(250);
    let failures = Arc::new(FailureCounter::default());
    let (producer, mut worker) = producer(&broker, &settings(500, 100, 100), failures.clone());

    for _ in 0..5 {
        producer.enqueue(&payload_of(100)).unwrap();
    }
    broker.fail_sends.store(true, Ordering::SeqCst);

    // Two items were in the batch and three were deferred to the retry buffer
    let outcome = worker.run_once().await;
    assert_eq!(
        outcome,
        CycleOutcome::SendFailed(RecycleOutcome {
            requeued: 5,
            retained: 0,
        })
    );
    assert_eq!(worker.scratch_len(), 0);
    assert!(!worker.has_client());
    assert_eq!(broker.closes.load(Ordering::SeqCst), 1);
    assert_eq!(failures.count(), 1);
    assert_eq!(producer.counters().send_errors, 1);

    // The client is rebuilt and every item eventually goes out
    broker.fail_sends.store(false, Ordering::SeqCst);
    let mut sent = 0;
    while let CycleOutcome::Sent(count) = worker.run_once().await {
        sent += count;
    }
    assert_eq!(sent, 5);
    assert_eq!(broker.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn recycle_keeps_what_the_queue_cannot_take() {
    let broker = TestBroker::new(250);
    let (producer, mut worker) = producer(&broker, &settings(500, 4, 100), Default::default());

    for _ in 0..4 {
        producer.enqueue(&payload_of(100)).unwrap();
    }
    assert_eq!(worker.run_once().await, CycleOutcome::Sent(2));
    assert_eq!(worker.retry_len(), 2);

    // Callers fill the queue again while two items wait for retry
    for _ in 0..4 {
        producer.enqueue(&payload_of(100)).unwrap();
    }
    broker.fail_sends.store(true, Ordering::SeqCst);

    // Two retried items make the batch, the four queued ones are deferred.
    // Six items come back but the queue only has room for four.
    assert_eq!(
        worker.run_once().await,
        CycleOutcome::SendFailed(RecycleOutcome {
            requeued: 4,
            retained: 2,
        })
    );
    assert_eq!(worker.retry_len(), 2);
    assert!(matches!(
        producer.enqueue(&payload_of(100)),
        Err(EnqueueError::QueueFull)
    ));

    broker.fail_sends.store(false, Ordering::SeqCst);
    let mut sent = 0;
    while let CycleOutcome::Sent(count) = worker.run_once().await {
        sent += count;
    }
    assert_eq!(sent, 6);
    assert_eq!(producer.counters().sent, 8);
}

#[tokio::test(start_paused = true)]
async fn oversized_items_are_dropped() {
    let broker = TestBroker::new(50);
    let (producer, mut worker) = producer(&broker, &settings(500, 100, 100), Default::default());

    producer.enqueue(&payload_of(200)).unwrap();
    producer.enqueue(&payload_of(20)).unwrap();

    assert_eq!(worker.run_once().await, CycleOutcome::Sent(1));
    assert_eq!(worker.retry_len(), 0);
    assert_eq!(producer.counters().dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn connect_failures_count_toward_restart() {
    let broker = TestBroker::new(1_000);
    broker.fail_connects.store(true, Ordering::SeqCst);
    let (producer, mut worker) = producer(&broker, &settings(500, 100, 1), Default::default());
    producer.enqueue(&1).unwrap();

    assert_eq!(worker.run_once().await, CycleOutcome::ConnectFailed);
    assert!(!producer.require_restart());
    assert_eq!(worker.run_once().await, CycleOutcome::ConnectFailed);
    assert!(producer.require_restart());

    broker.fail_connects.store(false, Ordering::SeqCst);
    assert_eq!(worker.run_once().await, CycleOutcome::Sent(1));
}

#[tokio::test(start_paused = true)]
async fn closing_stops_the_worker() {
    let broker = TestBroker::new(1_000);
    let (producer, worker) = producer(&broker, &settings(500, 100, 100), Default::default());

    let handle = tokio::spawn(worker.run());
    let receipt = producer.enqueue(&"first").unwrap();
    assert!(receipt.delivered().await);

    producer.close();
    handle.await.unwrap();

    assert!(producer.is_closed());
    assert!(matches!(producer.enqueue(&"late"), Err(EnqueueError::Closed)));
    assert_eq!(broker.closes.load(Ordering::SeqCst), 1);
}

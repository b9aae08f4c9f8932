//! In-process broker implementing the [`Bus`] trait.
//!
//! Used by integration tests to run the whole pipeline without an external
//! broker. Topology mirrors the real brokers: topic exchanges route on exact
//! routing keys, fan-out exchanges copy to every subscriber, named queues are
//! consumed competitively. Persistence flags are accepted and ignored —
//! everything lives in process memory.

use async_trait::async_trait;
use fts_bus::{
    AckHandle, AckMode, Bus, BusError, Delivery, Exchange, ExchangeKind, PublishProps, Source,
    Subscription,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const SUBSCRIPTION_DEPTH: usize = 1024;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(String, Vec<u8>)>,
    consumers: Vec<mpsc::Sender<Delivery>>,
    next_consumer: usize,
    acked: Arc<AtomicU64>,
}

#[derive(Default)]
struct BrokerState {
    /// queue name -> state
    queues: HashMap<String, QueueState>,
    /// exchange name -> [(routing key or None for fanout, queue name)]
    bindings: HashMap<String, Vec<(Option<String>, String)>>,
}

/// The in-process broker. Clone freely; clones share the broker state.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BrokerState>>,
}

struct MemoryAck {
    acked: Arc<AtomicU64>,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), BusError> {
        // Reject without requeue: the message is dropped.
        Ok(())
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of acks observed on a queue. Test hook.
    pub fn acked(&self, queue: &str) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .queues
            .get(queue)
            .map(|q| q.acked.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Messages sitting in a queue with no consumer attached. Test hook.
    pub fn depth(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.queues.get(queue).map(|q| q.pending.len()).unwrap_or(0)
    }

    fn bind(state: &mut BrokerState, exchange: &str, routing_key: Option<String>, queue: &str) {
        let bindings = state.bindings.entry(exchange.to_string()).or_default();
        let entry = (routing_key, queue.to_string());
        if !bindings.contains(&entry) {
            bindings.push(entry);
        }
        state.queues.entry(queue.to_string()).or_default();
    }

    fn deliver(queue: &mut QueueState, routing_key: &str, body: Vec<u8>) {
        // Round-robin across live consumers; fall back to the backlog.
        let total = queue.consumers.len();
        for _ in 0..total {
            let idx = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);
            let consumer = &queue.consumers[idx];
            let delivery = Delivery::new(
                HashMap::from([("routing-key".to_string(), routing_key.to_string())]),
                body.clone(),
                Box::new(MemoryAck {
                    acked: queue.acked.clone(),
                }),
            );
            if consumer.try_send(delivery).is_ok() {
                return;
            }
        }
        queue.pending.push_back((routing_key.to_string(), body));
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(
        &self,
        exchange: &Exchange,
        routing_key: &str,
        body: Vec<u8>,
        _props: PublishProps,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        let targets: Vec<String> = state
            .bindings
            .get(exchange.name)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|(key, _)| match (exchange.kind, key) {
                        (ExchangeKind::Fanout, _) => true,
                        (ExchangeKind::Topic, Some(k)) => k == routing_key,
                        (ExchangeKind::Topic, None) => false,
                    })
                    .map(|(_, queue)| queue.clone())
                    .collect()
            })
            .unwrap_or_default();

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                Self::deliver(queue, routing_key, body.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        source: Source,
        consumer_id: &str,
        _ack_mode: AckMode,
    ) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        let (_err_tx, err_rx) = mpsc::channel(8);

        let mut state = self.state.lock().unwrap();
        let queue_name = match source {
            Source::Queue(queue) => {
                if let Some(bind) = queue.bind {
                    Self::bind(
                        &mut state,
                        bind.exchange.name,
                        Some(bind.routing_key.to_string()),
                        queue.name,
                    );
                } else {
                    state.queues.entry(queue.name.to_string()).or_default();
                }
                if queue.exclusive_consumer {
                    let q = state.queues.get_mut(queue.name).unwrap();
                    if !q.consumers.is_empty() {
                        return Err(BusError::Protocol(format!(
                            "queue {} is exclusive and already has a consumer",
                            queue.name
                        )));
                    }
                }
                queue.name.to_string()
            }
            Source::Exchange(exchange) => {
                // Private queue per subscriber, every message copied in.
                let name = format!("{}::{}", exchange.name, consumer_id);
                Self::bind(&mut state, exchange.name, None, &name);
                name
            }
        };

        let queue = state.queues.get_mut(&queue_name).unwrap();
        // Hand over any backlog accumulated before this consumer appeared.
        while let Some((routing_key, body)) = queue.pending.pop_front() {
            let delivery = Delivery::new(
                HashMap::from([("routing-key".to_string(), routing_key)]),
                body,
                Box::new(MemoryAck {
                    acked: queue.acked.clone(),
                }),
            );
            if tx.try_send(delivery).is_err() {
                break;
            }
        }
        queue.consumers.push(tx);

        Ok(Subscription {
            deliveries: rx,
            errors: err_rx,
        })
    }
}

//! Broker topology: exchanges and queues used by the pipeline.
//!
//! The workflow is mainly driven by messages going through the transition
//! exchange; routing keys are state names in upper case.

/// Exchange flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routing-key based delivery to bound queues.
    Topic,
    /// Every bound consumer gets every message.
    Fanout,
}

/// An exchange on the message broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    pub name: &'static str,
    pub kind: ExchangeKind,
    pub durable: bool,
}

/// Binding between a queue and an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bind {
    pub exchange: &'static Exchange,
    pub routing_key: &'static str,
}

/// A named queue on the message broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queue {
    pub name: &'static str,
    pub durable: bool,
    /// An exclusive queue admits a single consumer; a second subscription
    /// attempt fails at the broker.
    pub exclusive_consumer: bool,
    pub bind: Option<Bind>,
}

/// Exchange for state-transition events. Routing key = state name.
pub static EXCHANGE_TRANSITION: Exchange = Exchange {
    name: "fts.e.transition",
    kind: ExchangeKind::Topic,
    durable: true,
};

/// Fan-out of performance markers.
pub static EXCHANGE_PERFORMANCE: Exchange = Exchange {
    name: "fts.e.perf",
    kind: ExchangeKind::Fanout,
    durable: true,
};

/// Fan-out of cancellation orders.
pub static EXCHANGE_KILL: Exchange = Exchange {
    name: "fts.e.kill",
    kind: ExchangeKind::Fanout,
    durable: true,
};

/// Queue shared by all workers to split the READY load.
pub static QUEUE_WORKER: Queue = Queue {
    name: "fts.q.worker",
    durable: true,
    exclusive_consumer: false,
    bind: Some(Bind {
        exchange: &EXCHANGE_TRANSITION,
        routing_key: "READY",
    }),
};

/// Queue holding SUBMITTED batches. Only one scheduler may consume from
/// this; the exclusive subscription is what prevents a second scheduler.
pub static QUEUE_SUBMISSIONS: Queue = Queue {
    name: "fts.q.submitted",
    durable: true,
    exclusive_consumer: true,
    bind: Some(Bind {
        exchange: &EXCHANGE_TRANSITION,
        routing_key: "SUBMITTED",
    }),
};

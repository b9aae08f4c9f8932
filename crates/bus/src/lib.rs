//! Message-bus abstraction for the FTS pipeline.
//!
//! Defines the narrow [`Bus`] interface the core depends on, implemented by
//! the AMQP backend (`fts-bus-amqp`), the STOMP backend (`fts-bus-stomp`) and
//! the in-process test broker (`fts-bus-memory`).
//!
//! The pipeline needs exactly three capabilities from a broker:
//!
//! - synchronous publish that returns on broker ack,
//! - subscriptions delivering messages with individual ack/nack,
//! - bounded reconnection, fatal when exhausted.
//!
//! Messages marked persistent survive broker restarts, and an un-acked
//! message is redelivered. There is no ordering between topics, and
//! redelivery order after a crash is broker dependent — consumers must be
//! idempotent to redelivery.

mod error;
mod message;
mod topics;

pub use error::BusError;
pub use message::{AckHandle, AckMode, Delivery, NoopAck};
pub use topics::{
    Bind, Exchange, ExchangeKind, Queue, EXCHANGE_KILL, EXCHANGE_PERFORMANCE,
    EXCHANGE_TRANSITION, QUEUE_SUBMISSIONS, QUEUE_WORKER,
};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Connection settings shared by all broker backends.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Broker address as `host:port`.
    pub address: String,
    pub login: String,
    pub passcode: String,
    /// Stable client identifier, usually derived from the host name.
    pub client_id: String,
    /// Maximum number of reconnect attempts before giving up. Exceeding this
    /// is fatal to the process.
    pub reconnect_retry: u32,
    /// Wait between reconnection attempts.
    pub reconnect_wait: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address: "localhost:61613".to_string(),
            login: "fts".to_string(),
            passcode: "fts".to_string(),
            client_id: "fts".to_string(),
            reconnect_retry: 5,
            reconnect_wait: Duration::from_secs(1),
        }
    }
}

/// Options for a single publish.
#[derive(Debug, Clone)]
pub struct PublishProps {
    /// Persistent messages survive broker restarts.
    pub persistent: bool,
    pub content_type: &'static str,
}

impl PublishProps {
    /// Persistent JSON payload, the common case for transition events.
    pub fn persistent_json() -> Self {
        Self {
            persistent: true,
            content_type: "application/json",
        }
    }

    /// Transient JSON payload, acceptable for performance markers.
    pub fn transient_json() -> Self {
        Self {
            persistent: false,
            content_type: "application/json",
        }
    }
}

/// What a subscription consumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A named, durable queue, consumed competitively (or exclusively, for
    /// the submissions queue).
    Queue(&'static Queue),
    /// A fan-out exchange; each subscriber gets every message.
    Exchange(&'static Exchange),
}

/// An active subscription: a lazy sequence of deliveries plus a parallel
/// sequence of transport errors.
pub struct Subscription {
    pub deliveries: mpsc::Receiver<Delivery>,
    pub errors: mpsc::Receiver<BusError>,
}

/// The capability set the core requires from a broker.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish to an exchange with the given routing key. Returns once the
    /// broker has acknowledged the message (or the write failed).
    async fn publish(
        &self,
        exchange: &Exchange,
        routing_key: &str,
        body: Vec<u8>,
        props: PublishProps,
    ) -> Result<(), BusError>;

    /// Subscribe to a queue or a fan-out exchange.
    async fn subscribe(
        &self,
        source: Source,
        consumer_id: &str,
        ack_mode: AckMode,
    ) -> Result<Subscription, BusError>;
}

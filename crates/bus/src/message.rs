//! Deliveries and acknowledgement handles.

use crate::error::BusError;
use async_trait::async_trait;
use std::collections::HashMap;

/// Acknowledgement mode for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Every message must be acked or nacked individually; un-acked messages
    /// are redelivered.
    Individual,
    /// The broker considers the message handled on delivery.
    Auto,
}

/// Backend-specific acknowledgement of a single delivery.
#[async_trait]
pub trait AckHandle: Send {
    async fn ack(self: Box<Self>) -> Result<(), BusError>;
    /// Negative acknowledgement. The broker decides whether to redeliver or
    /// drop; parse failures use this to reject permanently.
    async fn nack(self: Box<Self>) -> Result<(), BusError>;
}

/// Ack handle for auto-ack subscriptions; both operations are no-ops.
pub struct NoopAck;

#[async_trait]
impl AckHandle for NoopAck {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), BusError> {
        Ok(())
    }
}

/// One message received from a subscription.
pub struct Delivery {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    handle: Box<dyn AckHandle>,
}

impl Delivery {
    pub fn new(headers: HashMap<String, String>, body: Vec<u8>, handle: Box<dyn AckHandle>) -> Self {
        Self {
            headers,
            body,
            handle,
        }
    }

    /// Routing key the message was published with, when the backend exposes it.
    pub fn routing_key(&self) -> Option<&str> {
        self.headers.get("routing-key").map(String::as_str)
    }

    pub async fn ack(self) -> Result<(), BusError> {
        self.handle.ack().await
    }

    pub async fn nack(self) -> Result<(), BusError> {
        self.handle.nack().await
    }
}

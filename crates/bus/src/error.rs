//! Bus error taxonomy.

use thiserror::Error;

/// Errors from broker backends.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to broker {broker}: {reason}")]
    Connect { broker: String, reason: String },

    #[error("connection to broker lost after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("publish to {exchange} failed: {reason}")]
    Publish { exchange: String, reason: String },

    #[error("subscription closed")]
    SubscriptionClosed,

    #[error("ack failed: {0}")]
    Ack(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

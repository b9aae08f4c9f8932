//! AMQP 0.9.1 backend for the FTS message bus.
//!
//! Declares the durable topology (transition/performance/kill exchanges and
//! the worker/submissions queues) on connect, publishes with publisher
//! confirms so [`Bus::publish`] only returns once the broker has the message,
//! and consumes with per-message acks.
//!
//! Connection loss is handled with bounded retries: each operation that hits
//! a dead connection triggers a reconnect loop (`reconnect_retry` attempts,
//! `reconnect_wait` between them). Exhausting the retries is fatal — the
//! error is surfaced and the daemon is expected to exit so its supervisor
//! restarts it.

use async_trait::async_trait;
use fts_bus::{
    AckHandle, AckMode, Bus, BusConfig, BusError, Delivery, Exchange, ExchangeKind, PublishProps,
    Queue, Source, Subscription,
};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const SUBSCRIPTION_DEPTH: usize = 256;

/// AMQP-backed bus.
pub struct AmqpBus {
    config: BusConfig,
    channel: Mutex<Channel>,
}

impl AmqpBus {
    /// Connect to the broker and declare the pipeline topology. The initial
    /// connection itself is retried within the configured bounds.
    pub async fn connect(config: BusConfig) -> Result<Arc<Self>, BusError> {
        let channel = dial(&config).await?;
        declare_topology(&channel).await?;
        info!(broker = %config.address, "connected to AMQP broker");
        Ok(Arc::new(Self {
            config,
            channel: Mutex::new(channel),
        }))
    }

    /// Replace a dead channel, retrying within the configured bounds.
    async fn reconnect(&self) -> Result<Channel, BusError> {
        let mut guard = self.channel.lock().await;
        if guard.status().connected() {
            return Ok(guard.clone());
        }
        warn!(broker = %self.config.address, "lost connection with broker");
        let channel = dial(&self.config).await?;
        declare_topology(&channel).await?;
        *guard = channel.clone();
        Ok(channel)
    }

    async fn current_channel(&self) -> Channel {
        self.channel.lock().await.clone()
    }
}

/// Establish a connection + confirmed channel, with bounded retries.
async fn dial(config: &BusConfig) -> Result<Channel, BusError> {
    let uri = format!(
        "amqp://{}:{}@{}/%2f",
        config.login, config.passcode, config.address
    );
    let mut attempts = 0u32;
    loop {
        match Connection::connect(&uri, ConnectionProperties::default()).await {
            Ok(connection) => {
                let channel = connection
                    .create_channel()
                    .await
                    .map_err(|e| BusError::Protocol(e.to_string()))?;
                channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await
                    .map_err(|e| BusError::Protocol(e.to_string()))?;
                return Ok(channel);
            }
            Err(e) => {
                attempts += 1;
                if attempts > config.reconnect_retry {
                    warn!(
                        broker = %config.address,
                        attempts,
                        "could not reconnect to the broker, giving up"
                    );
                    return Err(BusError::ReconnectExhausted { attempts });
                }
                warn!(
                    broker = %config.address,
                    error = %e,
                    attempts,
                    "failed to connect, waiting before retry"
                );
                tokio::time::sleep(config.reconnect_wait).await;
            }
        }
    }
}

async fn declare_topology(channel: &Channel) -> Result<(), BusError> {
    for exchange in [
        &fts_bus::EXCHANGE_TRANSITION,
        &fts_bus::EXCHANGE_PERFORMANCE,
        &fts_bus::EXCHANGE_KILL,
    ] {
        declare_exchange(channel, exchange).await?;
    }
    for queue in [&fts_bus::QUEUE_WORKER, &fts_bus::QUEUE_SUBMISSIONS] {
        declare_queue(channel, queue).await?;
    }
    Ok(())
}

async fn declare_exchange(channel: &Channel, exchange: &Exchange) -> Result<(), BusError> {
    let kind = match exchange.kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    };
    channel
        .exchange_declare(
            exchange.name,
            kind,
            ExchangeDeclareOptions {
                durable: exchange.durable,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Protocol(format!("declaring {}: {e}", exchange.name)))
}

async fn declare_queue(channel: &Channel, queue: &Queue) -> Result<(), BusError> {
    channel
        .queue_declare(
            queue.name,
            QueueDeclareOptions {
                durable: queue.durable,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Protocol(format!("declaring {}: {e}", queue.name)))?;

    if let Some(bind) = queue.bind {
        channel
            .queue_bind(
                queue.name,
                bind.exchange.name,
                bind.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Protocol(format!("binding {}: {e}", queue.name)))?;
    }
    Ok(())
}

struct AmqpAck {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl AckHandle for AmqpAck {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn nack(self: Box<Self>) -> Result<(), BusError> {
        // No requeue: a nack is a permanent rejection (parse failures).
        self.acker
            .nack(BasicNackOptions {
                requeue: false,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}

#[async_trait]
impl Bus for AmqpBus {
    async fn publish(
        &self,
        exchange: &Exchange,
        routing_key: &str,
        body: Vec<u8>,
        props: PublishProps,
    ) -> Result<(), BusError> {
        let properties = BasicProperties::default()
            .with_content_type(props.content_type.into())
            .with_delivery_mode(if props.persistent { 2 } else { 1 });

        let mut channel = self.current_channel().await;
        if !channel.status().connected() {
            channel = self.reconnect().await?;
        }

        let confirm = channel
            .basic_publish(
                exchange.name,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish {
                exchange: exchange.name.to_string(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| BusError::Publish {
                exchange: exchange.name.to_string(),
                reason: e.to_string(),
            })?;

        match confirm {
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => Err(BusError::Publish {
                exchange: exchange.name.to_string(),
                reason: "broker nacked the publish".to_string(),
            }),
        }
    }

    async fn subscribe(
        &self,
        source: Source,
        consumer_id: &str,
        ack_mode: AckMode,
    ) -> Result<Subscription, BusError> {
        let channel = self.current_channel().await;

        let (queue_name, exclusive) = match source {
            Source::Queue(queue) => (queue.name.to_string(), queue.exclusive_consumer),
            Source::Exchange(exchange) => {
                // Private, broker-named queue receiving every fanned-out
                // message for this subscriber only.
                let declared = channel
                    .queue_declare(
                        "",
                        QueueDeclareOptions {
                            exclusive: true,
                            auto_delete: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| BusError::Protocol(e.to_string()))?;
                let name = declared.name().to_string();
                channel
                    .queue_bind(
                        &name,
                        exchange.name,
                        "",
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| BusError::Protocol(e.to_string()))?;
                (name, false)
            }
        };

        let consumer = channel
            .basic_consume(
                &queue_name,
                consumer_id,
                BasicConsumeOptions {
                    no_ack: ack_mode == AckMode::Auto,
                    exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Protocol(format!("consuming {queue_name}: {e}")))?;

        let (delivery_tx, delivery_rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        let (error_tx, error_rx) = mpsc::channel(8);

        tokio::spawn(async move {
            let mut consumer = consumer;
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let lapin::message::Delivery {
                            data,
                            acker,
                            routing_key,
                            ..
                        } = delivery;
                        let headers =
                            HashMap::from([("routing-key".to_string(), routing_key.to_string())]);
                        let message = Delivery::new(headers, data, Box::new(AmqpAck { acker }));
                        if delivery_tx.send(message).await.is_err() {
                            debug!("subscription receiver dropped, stopping consumer");
                            return;
                        }
                    }
                    Err(e) => {
                        if error_tx
                            .send(BusError::Protocol(e.to_string()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
            let _ = error_tx.send(BusError::SubscriptionClosed).await;
        });

        Ok(Subscription {
            deliveries: delivery_rx,
            errors: error_rx,
        })
    }
}

//! STOMP 1.2 backend for the FTS message bus.
//!
//! A single client task owns the TCP connection; publishes and subscriptions
//! go through a command channel. Publishes carry a `receipt` header and
//! resolve once the broker sends the matching RECEIPT, so [`Bus::publish`]
//! has the same returns-on-ack contract as the AMQP backend.
//!
//! Destination mapping (binding of queues to routing keys is broker
//! configuration on the STOMP side):
//!
//! - topic exchange + routing key -> `/topic/<exchange>.<KEY>`
//! - fan-out exchange -> `/topic/<exchange>`
//! - named queue -> `/queue/<name>`
//!
//! On connection loss the client reconnects with bounded retries and
//! re-issues every active subscription. Exhausting the retries closes all
//! subscriptions with a fatal error.

mod frame;

pub use frame::{Frame, FrameError};

use async_trait::async_trait;
use bytes::BytesMut;
use fts_bus::{
    AckHandle, AckMode, Bus, BusConfig, BusError, Delivery, Exchange, ExchangeKind, PublishProps,
    Source, Subscription,
};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const SUBSCRIPTION_DEPTH: usize = 256;

enum Command {
    Publish {
        destination: String,
        body: Vec<u8>,
        persistent: bool,
        content_type: &'static str,
        done: oneshot::Sender<Result<(), BusError>>,
    },
    Subscribe {
        destination: String,
        ack_mode: AckMode,
        deliveries: mpsc::Sender<Delivery>,
        errors: mpsc::Sender<BusError>,
        done: oneshot::Sender<Result<(), BusError>>,
    },
    Ack {
        ack_id: String,
    },
    Nack {
        ack_id: String,
    },
}

/// STOMP-backed bus.
pub struct StompBus {
    commands: mpsc::Sender<Command>,
}

impl StompBus {
    /// Connect to the broker and start the client task.
    pub async fn connect(config: BusConfig) -> Result<Self, BusError> {
        let stream = Client::dial(&config).await?;
        let (commands, command_rx) = mpsc::channel(64);
        let client = Client {
            config,
            subscriptions: Vec::new(),
            receipts: HashMap::new(),
            next_id: 0,
            commands_handle: commands.downgrade(),
        };
        tokio::spawn(client.run(stream, command_rx));
        Ok(Self { commands })
    }

    fn destination(exchange: &Exchange, routing_key: &str) -> String {
        match exchange.kind {
            ExchangeKind::Topic => format!("/topic/{}.{}", exchange.name, routing_key),
            ExchangeKind::Fanout => format!("/topic/{}", exchange.name),
        }
    }

    async fn send(&self, command: Command) -> Result<(), BusError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BusError::SubscriptionClosed)
    }
}

#[async_trait]
impl Bus for StompBus {
    async fn publish(
        &self,
        exchange: &Exchange,
        routing_key: &str,
        body: Vec<u8>,
        props: PublishProps,
    ) -> Result<(), BusError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Publish {
            destination: Self::destination(exchange, routing_key),
            body,
            persistent: props.persistent,
            content_type: props.content_type,
            done,
        })
        .await?;
        rx.await.map_err(|_| BusError::SubscriptionClosed)?
    }

    async fn subscribe(
        &self,
        source: Source,
        _consumer_id: &str,
        ack_mode: AckMode,
    ) -> Result<Subscription, BusError> {
        let destination = match source {
            Source::Queue(queue) => format!("/queue/{}", queue.name),
            Source::Exchange(exchange) => format!("/topic/{}", exchange.name),
        };

        let (delivery_tx, delivery_rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        let (error_tx, error_rx) = mpsc::channel(8);
        let (done, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            destination,
            ack_mode,
            deliveries: delivery_tx,
            errors: error_tx,
            done,
        })
        .await?;
        rx.await.map_err(|_| BusError::SubscriptionClosed)??;

        Ok(Subscription {
            deliveries: delivery_rx,
            errors: error_rx,
        })
    }
}

struct StompAck {
    commands: mpsc::Sender<Command>,
    ack_id: String,
}

#[async_trait]
impl AckHandle for StompAck {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.commands
            .send(Command::Ack {
                ack_id: self.ack_id,
            })
            .await
            .map_err(|_| BusError::SubscriptionClosed)
    }

    async fn nack(self: Box<Self>) -> Result<(), BusError> {
        self.commands
            .send(Command::Nack {
                ack_id: self.ack_id,
            })
            .await
            .map_err(|_| BusError::SubscriptionClosed)
    }
}

struct SubscriptionEntry {
    id: String,
    destination: String,
    ack_mode: AckMode,
    deliveries: mpsc::Sender<Delivery>,
    errors: mpsc::Sender<BusError>,
}

struct Client {
    config: BusConfig,
    subscriptions: Vec<SubscriptionEntry>,
    receipts: HashMap<String, oneshot::Sender<Result<(), BusError>>>,
    next_id: u64,
    /// Weak handle on the bus command channel, handed to ack handles. Weak
    /// so the client task still sees the channel close when the bus drops.
    commands_handle: mpsc::WeakSender<Command>,
}

impl Client {
    /// TCP connect + CONNECT/CONNECTED handshake, with bounded retries.
    async fn dial(config: &BusConfig) -> Result<TcpStream, BusError> {
        let mut attempts = 0u32;
        loop {
            match Self::try_dial(config).await {
                Ok(stream) => return Ok(stream),
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
                        "failed to connect, waiting before retry"
                    );
                    tokio::time::sleep(config.reconnect_wait).await;
                }
            }
        }
    }

    async fn try_dial(config: &BusConfig) -> Result<TcpStream, BusError> {
        let mut stream =
            TcpStream::connect(&config.address)
                .await
                .map_err(|e| BusError::Connect {
                    broker: config.address.clone(),
                    reason: e.to_string(),
                })?;

        let connect = Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", "/")
            .header("login", &config.login)
            .header("passcode", &config.passcode)
            .header("client-id", &config.client_id)
            .header("heart-beat", "0,0");
        stream.write_all(&connect.encode()).await?;

        // Wait for CONNECTED before handing the stream over.
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match frame::parse(&mut buf).map_err(|e| BusError::Protocol(e.to_string()))? {
                Some(frame) if frame.command == "CONNECTED" => {
                    info!(broker = %config.address, "connected to STOMP broker");
                    return Ok(stream);
                }
                Some(frame) => {
                    return Err(BusError::Connect {
                        broker: config.address.clone(),
                        reason: format!(
                            "expected CONNECTED, got {}: {}",
                            frame.command,
                            String::from_utf8_lossy(&frame.body)
                        ),
                    });
                }
                None => {
                    let n = stream.read_buf(&mut buf).await?;
                    if n == 0 {
                        return Err(BusError::Connect {
                            broker: config.address.clone(),
                            reason: "connection closed during handshake".to_string(),
                        });
                    }
                }
            }
        }
    }

    async fn run(mut self, mut stream: TcpStream, mut commands: mpsc::Receiver<Command>) {
        let mut buf = BytesMut::with_capacity(8192);
        loop {
            let result = self.serve(&mut stream, &mut buf, &mut commands).await;
            match result {
                ServeExit::CommandsClosed => {
                    let _ = stream.write_all(&Frame::new("DISCONNECT").encode()).await;
                    return;
                }
                ServeExit::ConnectionLost(reason) => {
                    warn!(broker = %self.config.address, %reason, "lost connection with broker");
                    self.fail_receipts(&reason);
                    match Self::dial(&self.config).await {
                        Ok(new_stream) => {
                            stream = new_stream;
                            buf.clear();
                            if let Err(e) = self.resubscribe(&mut stream).await {
                                self.fatal(e).await;
                                return;
                            }
                        }
                        Err(e) => {
                            self.fatal(e).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Serve one connection until it drops or the bus handle goes away.
    async fn serve(
        &mut self,
        stream: &mut TcpStream,
        buf: &mut BytesMut,
        commands: &mut mpsc::Receiver<Command>,
    ) -> ServeExit {
        loop {
            // Drain complete frames before waiting for more input.
            loop {
                match frame::parse(buf) {
                    Ok(Some(frame)) => self.handle_frame(frame).await,
                    Ok(None) => break,
                    Err(e) => return ServeExit::ConnectionLost(e.to_string()),
                }
            }

            // Settle the select before touching the stream again, so the
            // read future's borrow is gone when a command is handled.
            enum Step {
                Command(Option<Command>),
                Read(std::io::Result<usize>),
            }

            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                read = stream.read_buf(buf) => Step::Read(read),
            };

            match step {
                Step::Command(None) => return ServeExit::CommandsClosed,
                Step::Command(Some(command)) => {
                    if let Err(e) = self.handle_command(stream, command).await {
                        return ServeExit::ConnectionLost(e.to_string());
                    }
                }
                Step::Read(Ok(0)) => {
                    return ServeExit::ConnectionLost("connection closed".into())
                }
                Step::Read(Ok(_)) => {}
                Step::Read(Err(e)) => return ServeExit::ConnectionLost(e.to_string()),
            }
        }
    }

    async fn handle_command(
        &mut self,
        stream: &mut TcpStream,
        command: Command,
    ) -> std::io::Result<()> {
        match command {
            Command::Publish {
                destination,
                body,
                persistent,
                content_type,
                done,
            } => {
                let receipt = format!("r-{}", self.next_id);
                self.next_id += 1;
                let frame = Frame::new("SEND")
                    .header("destination", &destination)
                    .header("receipt", &receipt)
                    .header("persistent", if persistent { "true" } else { "false" })
                    .header("content-type", content_type)
                    .body(body);
                self.receipts.insert(receipt, done);
                stream.write_all(&frame.encode()).await?;
            }
            Command::Subscribe {
                destination,
                ack_mode,
                deliveries,
                errors,
                done,
            } => {
                let id = format!("sub-{}", self.next_id);
                self.next_id += 1;
                let entry = SubscriptionEntry {
                    id: id.clone(),
                    destination,
                    ack_mode,
                    deliveries,
                    errors,
                };
                let frame = Self::subscribe_frame(&entry);
                self.subscriptions.push(entry);
                stream.write_all(&frame.encode()).await?;
                let _ = done.send(Ok(()));
            }
            Command::Ack { ack_id } => {
                let frame = Frame::new("ACK").header("id", &ack_id);
                stream.write_all(&frame.encode()).await?;
            }
            Command::Nack { ack_id } => {
                let frame = Frame::new("NACK").header("id", &ack_id);
                stream.write_all(&frame.encode()).await?;
            }
        }
        Ok(())
    }

    fn subscribe_frame(entry: &SubscriptionEntry) -> Frame {
        let ack = match entry.ack_mode {
            AckMode::Individual => "client-individual",
            AckMode::Auto => "auto",
        };
        Frame::new("SUBSCRIBE")
            .header("id", &entry.id)
            .header("destination", &entry.destination)
            .header("ack", ack)
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame.command.as_str() {
            "MESSAGE" => self.handle_message(frame).await,
            "RECEIPT" => {
                if let Some(id) = frame.get("receipt-id") {
                    if let Some(done) = self.receipts.remove(id) {
                        let _ = done.send(Ok(()));
                    }
                }
            }
            "ERROR" => {
                let message = String::from_utf8_lossy(&frame.body).to_string();
                warn!(error = %message, "broker sent an ERROR frame");
                if let Some(id) = frame.get("receipt-id") {
                    if let Some(done) = self.receipts.remove(id) {
                        let _ = done.send(Err(BusError::Protocol(message.clone())));
                        return;
                    }
                }
                for sub in &self.subscriptions {
                    let _ = sub.errors.try_send(BusError::Protocol(message.clone()));
                }
            }
            other => debug!(command = other, "ignoring unexpected frame"),
        }
    }

    async fn handle_message(&mut self, frame: Frame) {
        let Some(sub) = self
            .subscriptions
            .iter()
            .find(|s| frame.get("subscription") == Some(s.id.as_str()))
        else {
            debug!("message for unknown subscription, dropping");
            return;
        };

        let mut headers: HashMap<String, String> =
            frame.headers.iter().cloned().collect();
        // Topic destinations encode the routing key after the exchange name.
        if let Some(dest) = frame.get("destination") {
            if let Some((_, key)) = dest.rsplit_once('.') {
                headers.insert("routing-key".to_string(), key.to_string());
            }
        }

        let handle: Box<dyn AckHandle> = match (sub.ack_mode, frame.get("ack")) {
            (AckMode::Individual, Some(ack_id)) => match self.commands_handle.upgrade() {
                Some(commands) => Box::new(StompAck {
                    commands,
                    ack_id: ack_id.to_string(),
                }),
                None => Box::new(fts_bus::NoopAck),
            },
            _ => Box::new(fts_bus::NoopAck),
        };

        let delivery = Delivery::new(headers, frame.body, handle);
        if sub.deliveries.send(delivery).await.is_err() {
            debug!(subscription = %sub.id, "subscription receiver dropped");
        }
    }

    async fn resubscribe(&mut self, stream: &mut TcpStream) -> Result<(), BusError> {
        for entry in &self.subscriptions {
            stream.write_all(&Self::subscribe_frame(entry).encode()).await?;
        }
        Ok(())
    }

    fn fail_receipts(&mut self, reason: &str) {
        for (_, done) in self.receipts.drain() {
            let _ = done.send(Err(BusError::Publish {
                exchange: "stomp".to_string(),
                reason: reason.to_string(),
            }));
        }
    }

    async fn fatal(&mut self, error: BusError) {
        let attempts = self.config.reconnect_retry;
        self.fail_receipts(&error.to_string());
        for sub in self.subscriptions.drain(..) {
            let _ = sub
                .errors
                .send(BusError::ReconnectExhausted { attempts })
                .await;
        }
    }
}

enum ServeExit {
    CommandsClosed,
    ConnectionLost(String),
}

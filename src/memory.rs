// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! [`MemoryBroker`] routes messages the way RabbitMQ does for the features
//! this crate uses: topic, direct and fanout exchanges, the default exchange,
//! server-named queues, acknowledgements and requeueing. Each
//! [`MemoryBroker::connect`] returns an independent [`MemoryTransport`].
//!
//! The broker records every publish, ack and nack so tests can assert on
//! them, and can be switched unavailable to simulate an outage.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{Envelope, MessageProperties},
    queue::QueueDefinition,
    routing::RoutingPattern,
    transport::Transport,
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

/// A message as it was handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: RoutingPattern,
}

struct QueueConsumer {
    connection: u64,
    sender: UnboundedSender<Envelope>,
    auto_ack: bool,
}

struct Unacked {
    connection: u64,
    queue: String,
    envelope: Envelope,
}

#[derive(Default)]
struct MemoryQueue {
    owner: Option<u64>,
    consumer: Option<QueueConsumer>,
    backlog: VecDeque<Envelope>,
}

#[derive(Default)]
struct BrokerState {
    unavailable: bool,
    next_connection: u64,
    next_tag: u64,
    closed: HashSet<u64>,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Unacked>,
    prefetch: HashMap<u64, u16>,
    published: Vec<PublishedMessage>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
}

impl BrokerState {
    fn ensure_open(&self, connection: u64) -> Result<(), AmqpError> {
        if self.unavailable {
            return Err(AmqpError::ConnectionError("broker unavailable".to_owned()));
        }
        if self.closed.contains(&connection) {
            return Err(AmqpError::ConnectionError("connection closed".to_owned()));
        }
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(kind) = self.exchanges.get(exchange) else {
            return Err(AmqpError::PublishingError);
        };

        let mut targets: Vec<String> = vec![];
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            if kind.routes(&binding.pattern, routing_key) && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, queue: &str, mut envelope: Envelope) {
        self.next_tag += 1;
        envelope.delivery_tag = self.next_tag;

        let Some(target) = self.queues.get_mut(queue) else {
            return;
        };

        match &target.consumer {
            Some(consumer) => {
                if !consumer.auto_ack {
                    self.unacked.insert(
                        envelope.delivery_tag,
                        Unacked {
                            connection: consumer.connection,
                            queue: queue.to_owned(),
                            envelope: envelope.clone(),
                        },
                    );
                }
                if let Err(returned) = consumer.sender.send(envelope) {
                    target.consumer = None;
                    self.unacked.remove(&returned.0.delivery_tag);
                    target.backlog.push_back(returned.0);
                }
            }
            None => target.backlog.push_back(envelope),
        }
    }

    fn settle(&mut self, delivery_tag: u64) -> Option<Unacked> {
        self.unacked.remove(&delivery_tag)
    }

    /// Puts every delivery left unsettled by `connection` back on its queue.
    fn requeue_unacked(&mut self, connection: u64) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, pending)| pending.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags {
            if let Some(mut pending) = self.unacked.remove(&tag) {
                pending.envelope.redelivered = true;
                self.enqueue(&pending.queue, pending.envelope);
            }
        }
    }
}

/// Shared in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates an empty, available broker.
    pub fn new() -> Self {
        MemoryBroker::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a new connection to the broker.
    pub fn connect(&self) -> Result<MemoryTransport, AmqpError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(AmqpError::ConnectionError("broker unavailable".to_owned()));
        }

        state.next_connection += 1;
        let (sender, receiver) = unbounded_channel();

        Ok(MemoryTransport {
            id: state.next_connection,
            broker: self.clone(),
            sender,
            receiver,
        })
    }

    /// Makes every current and future connection fail (`false`) or lets new
    /// connections succeed again (`true`). Connections that observed the
    /// outage stay broken.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        state.unavailable = !available;

        if !available {
            let open: Vec<u64> = (1..=state.next_connection).collect();
            state.closed.extend(open.iter().copied());
            state.queues.retain(|_, q| q.owner.is_none());
            for queue in state.queues.values_mut() {
                queue.consumer = None;
            }
            let remaining: HashSet<String> = state.queues.keys().cloned().collect();
            state.bindings.retain(|b| remaining.contains(&b.queue));
            for connection in open {
                state.requeue_unacked(connection);
            }
        }
    }

    /// Every message handed to the broker so far. Like [`MemoryBroker::acked`]
    /// and [`MemoryBroker::nacked`], the log is kept for assertions and grows
    /// for the broker's whole life; use a fresh broker per test.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Delivery tags acknowledged so far.
    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    /// Negatively acknowledged delivery tags with their requeue flag.
    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.lock().nacked.clone()
    }

    /// Kind of the exchange declared as `name`, if any.
    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(name).copied()
    }

    /// Whether `name` is currently declared.
    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Routing keys bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.pattern.to_string())
            .collect()
    }

    /// Prefetch window requested by the connection owning `queue`'s consumer.
    ///
    /// Recorded only; the in-process broker does not throttle deliveries.
    pub fn prefetch_for(&self, queue: &str) -> Option<u16> {
        let state = self.lock();
        let connection = state.queues.get(queue)?.consumer.as_ref()?.connection;
        state.prefetch.get(&connection).copied()
    }

    /// Messages waiting in `queue` without a consumer to take them.
    pub fn backlog(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or_default()
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    id: u64,
    broker: MemoryBroker,
    sender: UnboundedSender<Envelope>,
    receiver: UnboundedReceiver<Envelope>,
}

impl MemoryTransport {
    /// Broker this connection belongs to.
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        match state.exchanges.get(def.name()) {
            Some(kind) if *kind != def.exchange_kind() => {
                Err(AmqpError::DeclareExchangeError(def.name().to_owned()))
            }
            _ => {
                state
                    .exchanges
                    .insert(def.name().to_owned(), def.exchange_kind());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        let name = if def.name().is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            def.name().to_owned()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != self.id) {
                return Err(AmqpError::DeclareQueueError(name));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            MemoryQueue {
                owner: def.is_exclusive().then_some(self.id),
                ..Default::default()
            },
        );
        debug!("queue: {} was created", name);
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        if !state.exchanges.contains_key(exchange) || !state.queues.contains_key(queue) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        state.bindings.push(Binding {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            pattern: RoutingPattern::new(routing_key),
        });
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        state.prefetch.insert(self.id, prefetch_count);
        Ok(())
    }

    async fn consume(&mut self, queue: &str, auto_ack: bool) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        let Some(target) = state.queues.get_mut(queue) else {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        };
        if target.consumer.is_some() {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        target.consumer = Some(QueueConsumer {
            connection: self.id,
            sender: self.sender.clone(),
            auto_ack,
        });

        let pending: Vec<Envelope> = target.backlog.drain(..).collect();
        for envelope in pending {
            state.enqueue(queue, envelope);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        let targets = state.route(exchange, routing_key)?;
        state.published.push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.to_vec(),
            properties: properties.clone(),
        });

        for queue in targets {
            let envelope = Envelope {
                delivery_tag: 0,
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
                properties: properties.clone(),
                body: body.to_vec(),
            };
            state.enqueue(&queue, envelope);
        }
        Ok(())
    }

    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Envelope>, AmqpError> {
        self.broker.lock().ensure_open(self.id)?;

        match tokio::time::timeout(wait, self.receiver.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(envelope)) => Ok(Some(envelope)),
            Ok(None) => Err(AmqpError::ConnectionError(
                "delivery stream closed".to_owned(),
            )),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        if state.settle(delivery_tag).is_none() {
            return Err(AmqpError::AckMessageError);
        }
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        let Some(mut pending) = state.settle(delivery_tag) else {
            return Err(AmqpError::NackMessageError);
        };
        state.nacked.push((delivery_tag, requeue));

        if requeue {
            pending.envelope.redelivered = true;
            state.enqueue(&pending.queue, pending.envelope);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.closed.insert(self.id);

        let id = self.id;
        state.queues.retain(|_, q| q.owner != Some(id));
        for queue in state.queues.values_mut() {
            if queue.consumer.as_ref().is_some_and(|c| c.connection == id) {
                queue.consumer = None;
            }
        }
        let remaining: HashSet<String> = state.queues.keys().cloned().collect();
        state.bindings.retain(|b| remaining.contains(&b.queue));
        state.requeue_unacked(id);
        Ok(())
    }
}

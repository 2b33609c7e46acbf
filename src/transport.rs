// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The primitives the clients need from a broker connection. A transport owns
//! one connection/channel pair and is driven from a single task: operations
//! that pump deliveries or register consumers take `&mut self`.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Envelope, MessageProperties},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use std::time::Duration;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares the exchange, creating it when missing.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its name (broker assigned for anonymous queues).
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries in flight.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Starts consuming `queue` on this connection. Deliveries surface through
    /// [`Transport::next_delivery`].
    async fn consume(&mut self, queue: &str, auto_ack: bool) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Waits up to `wait` for the next delivery from any consumed queue.
    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Envelope>, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

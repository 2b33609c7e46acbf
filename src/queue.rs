// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queues used by this crate are anonymous: the broker assigns the name on
//! declaration. Subscription queues are exclusive and durable and may carry a
//! priority ceiling; RPC reply queues are exclusive only.

/// Constant for the queue argument used to enable message priorities
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) delete: bool,
    pub(crate) max_priority: Option<u8>,
}

impl QueueDefinition {
    /// Creates a definition for a queue named by the broker.
    pub fn server_named() -> QueueDefinition {
        QueueDefinition::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete once its last consumer is gone.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Enables priorities `0..=max` on the queue.
    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }

    /// Requested name. Empty for a server-named queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

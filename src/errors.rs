// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ RPC Client
//!
//! This module provides the error type shared by every component of the crate.
//! Setup failures (connect, declare, bind, consumer registration) surface as
//! `ConnectionError`, per-message failures are isolated inside the consumer and
//! never escape the receive loop.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// Transport or setup failure. Also produced when the retry budget is exhausted.
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Invalid configuration values
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// The consumer was given no routing keys to bind
    #[error("at least one routing key is required")]
    InvalidRoutingKeys,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// A payload could not be represented on the wire
    #[error("failure to encode payload `{0}`")]
    EncodingError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// A user callback failed while handling a delivery
    #[error("callback failure `{0}`")]
    CallbackError(String),

    /// No matching RPC reply arrived before the deadline
    #[error("no reply received within {0:?}")]
    TimeoutError(Duration),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

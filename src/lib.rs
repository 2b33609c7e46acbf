// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ RPC
//!
//! Topic-routed publish/subscribe and request/reply over AMQP.
//!
//! - [`client::AmqpClient`] owns one connection and its exchange.
//! - [`consumer::Consumer`] binds a private queue to routing-key patterns and
//!   dispatches deliveries to a [`handler::MessageHandler`], replying to RPC
//!   requests. Messages are acknowledged even when the handler fails unless
//!   [`handler::AckPolicy::RequeueOnce`] is selected.
//! - [`publisher::Producer`] publishes messages and performs RPC calls.
//! - [`retry::run_with_retries`] bounds reconnection attempts.
//!
//! The broker is reached through the [`transport::Transport`] trait, backed by
//! lapin ([`channel::LapinTransport`]) or by the in-process
//! [`memory::MemoryBroker`].

mod otel;

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod routing;
pub mod transport;

pub use client::AmqpClient;
pub use codec::{dumps_message, loads_message, Payload};
pub use config::AmqpConfigs;
pub use consumer::{consume_with_retries, Consumer, ConsumerDefinition, ThreadedConsumer};
pub use errors::AmqpError;
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use handler::{AckPolicy, HandlerResult, IdleHandler, MessageHandler};
pub use message::{DeliveryMode, Envelope, MessageProperties};
pub use publisher::Producer;
pub use retry::{run_with_retries, run_with_retries_until, RetryPolicy};
pub use transport::Transport;

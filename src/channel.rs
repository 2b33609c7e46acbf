// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels and
//! implements [`Transport`] on top of them using `lapin`.

use crate::{
    config::AmqpConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{DeliveryMode, Envelope, MessageProperties},
    queue::{QueueDefinition, AMQP_HEADERS_MAX_PRIORITY},
    transport::Transport,
};
use async_trait::async_trait;
use futures_util::stream::{SelectAll, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, error};
use uuid::Uuid;

/// Creates a transport for the broker described by `cfg`.
///
/// The connection is registered under the configured application name.
pub async fn new_amqp_channel(cfg: &AmqpConfigs) -> Result<LapinTransport, AmqpError> {
    LapinTransport::connect(&cfg.uri(), &cfg.app_name).await
}

/// [`Transport`] backed by one lapin connection and one channel on it.
pub struct LapinTransport {
    conn: Connection,
    channel: Channel,
    deliveries: SelectAll<Consumer>,
}

impl LapinTransport {
    /// Opens a connection to `uri` and a channel on it.
    pub async fn connect(uri: &str, connection_name: &str) -> Result<LapinTransport, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let conn = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(LapinTransport {
                    conn,
                    channel,
                    deliveries: SelectAll::new(),
                })
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Underlying lapin channel, for operations the transport does not wrap.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable(),
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut queue_args = BTreeMap::new();

        if let Some(max) = def.max_priority {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::from(queue_args),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                Ok(queue.name().to_string())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&mut self, queue: &str, auto_ack: bool) -> Result<(), AmqpError> {
        let tag = format!("{}-{}", queue, Uuid::new_v4());

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        self.deliveries.push(consumer);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                to_basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Envelope>, AmqpError> {
        if self.deliveries.is_empty() {
            return Err(AmqpError::ConsumerError("no active consumer".to_owned()));
        }

        match tokio::time::timeout(wait, self.deliveries.next()).await {
            Err(_) => Ok(None),
            Ok(Some(Ok(delivery))) => Ok(Some(to_envelope(delivery))),
            Ok(Some(Err(err))) => {
                error!(error = err.to_string(), "errors consume msg");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
            Ok(None) => Err(AmqpError::ConnectionError(
                "delivery stream closed".to_owned(),
            )),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        debug!("closing amqp connection");
        self.conn.close(200, "closing").await.map_err(|err| {
            error!(error = err.to_string(), "error to close the connection");
            AmqpError::ConnectionError(err.to_string())
        })
    }
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();

    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(mode) = props.delivery_mode {
        basic = basic.with_delivery_mode(mode as u8);
    }
    if let Some(id) = &props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(queue) = &props.reply_to {
        basic = basic.with_reply_to(ShortString::from(queue.clone()));
    }
    if let Some(priority) = props.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if !props.headers.is_empty() {
        let headers: BTreeMap<ShortString, AMQPValue> = props
            .headers
            .iter()
            .map(|(k, v)| {
                (
                    ShortString::from(k.clone()),
                    AMQPValue::LongString(LongString::from(v.clone())),
                )
            })
            .collect();
        basic = basic.with_headers(FieldTable::from(headers));
    }

    basic
}

fn to_envelope(delivery: Delivery) -> Envelope {
    let props = &delivery.properties;

    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(k, v)| match v {
                    AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes())
                        .ok()
                        .map(|s| (k.to_string(), s.to_owned())),
                    AMQPValue::ShortString(s) => Some((k.to_string(), s.to_string())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let properties = MessageProperties {
        content_type: props.content_type().as_ref().map(|s| s.to_string()),
        delivery_mode: (*props.delivery_mode()).and_then(DeliveryMode::from_u8),
        correlation_id: props.correlation_id().as_ref().map(|s| s.to_string()),
        reply_to: props.reply_to().as_ref().map(|s| s.to_string()),
        priority: *props.priority(),
        message_id: props.message_id().as_ref().map(|s| s.to_string()),
        headers,
    };

    Envelope {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties,
        body: delivery.data,
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! Publishes JSON messages to the client's exchange and implements the client
//! half of request/reply.
//!
//! Publishing is fire-and-forget: [`Producer::publish`] logs transport
//! failures instead of returning them. Use [`Producer::try_publish`] when the
//! caller must know the broker accepted the write.
//!
//! [`Producer::call`] publishes a request carrying a fresh correlation id and
//! the producer's private reply queue, then pumps that queue until a reply
//! with the same correlation id arrives or the timeout elapses. One reply
//! queue serves every call of a producer, which is why `call` takes
//! `&mut self`: overlapping calls on one producer are impossible.

use crate::{
    client::AmqpClient,
    codec::{dumps_message, loads_message, JSON_CONTENT_TYPE},
    errors::AmqpError,
    message::{DeliveryMode, MessageProperties},
    otel,
    queue::QueueDefinition,
    transport::Transport,
};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default longest single wait on the reply queue during a call.
pub const DEFAULT_RPC_PUMP_INTERVAL: Duration = Duration::from_millis(100);

/// Publishes to the client's exchange and performs RPC calls.
///
/// The reply queue is declared lazily by the first call and reused after.
pub struct Producer<T: Transport> {
    client: AmqpClient<T>,
    reply_queue: Option<String>,
    pump_interval: Duration,
}

impl<T: Transport> Producer<T> {
    /// Creates a producer over an open client.
    ///
    /// # Parameters
    /// * `client` - Connected client whose exchange receives every message
    ///
    /// # Returns
    /// A producer with no reply queue yet and the default pump interval
    ///
    /// # Example
    /// ```
    /// # use rabbitmq_rpc::{memory::MemoryBroker, AmqpClient, AmqpError, ExchangeDefinition, Producer};
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), AmqpError> {
    /// let broker = MemoryBroker::new();
    /// let client =
    ///     AmqpClient::with_transport(broker.connect()?, ExchangeDefinition::new("events")).await?;
    ///
    /// let producer = Producer::new(client);
    /// producer.publish("orders.created", &serde_json::json!({"id": 1})).await?;
    /// assert_eq!(broker.published().len(), 1);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(client: AmqpClient<T>) -> Self {
        Producer {
            client,
            reply_queue: None,
            pump_interval: DEFAULT_RPC_PUMP_INTERVAL,
        }
    }

    /// Longest single wait on the reply queue inside [`Producer::call`].
    pub fn pump_interval(mut self, interval: Duration) -> Self {
        self.pump_interval = interval;
        self
    }

    /// Connection the producer publishes on.
    pub fn client(&self) -> &AmqpClient<T> {
        &self.client
    }

    /// Name of the private reply queue, once a call has created it.
    pub fn reply_queue(&self) -> Option<&str> {
        self.reply_queue.as_deref()
    }

    /// Publishes `body` as a persistent JSON message.
    ///
    /// Only encoding failures are returned; they happen before anything is
    /// written to the broker.
    pub async fn publish<B>(&self, routing_key: &str, body: &B) -> Result<(), AmqpError>
    where
        B: Serialize + ?Sized,
    {
        self.publish_with(routing_key, body, MessageProperties::default())
            .await
    }

    /// Like [`Producer::publish`], with caller supplied properties. Content
    /// type is always JSON and delivery mode defaults to persistent.
    pub async fn publish_with<B>(
        &self,
        routing_key: &str,
        body: &B,
        props: MessageProperties,
    ) -> Result<(), AmqpError>
    where
        B: Serialize + ?Sized,
    {
        match self.try_publish(routing_key, body, props).await {
            Err(err @ AmqpError::EncodingError(_)) => Err(err),
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    routing_key, "message dropped, publish failed"
                );
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Publishes and returns every failure, including transport ones.
    pub async fn try_publish<B>(
        &self,
        routing_key: &str,
        body: &B,
        props: MessageProperties,
    ) -> Result<(), AmqpError>
    where
        B: Serialize + ?Sized,
    {
        let data = dumps_message(body)?;
        let props = self.message_properties(props);

        match self
            .client
            .transport()
            .publish(self.client.exchange().name(), routing_key, &data, &props)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), routing_key, "error publishing message");
                Err(err)
            }
            _ => {
                debug!(routing_key, "message published");
                Ok(())
            }
        }
    }

    fn message_properties(&self, props: MessageProperties) -> MessageProperties {
        let mut props = props
            .with_content_type(JSON_CONTENT_TYPE)
            .with_message_id(&Uuid::new_v4().to_string());
        if props.delivery_mode.is_none() {
            props.delivery_mode = Some(DeliveryMode::Persistent);
        }

        otel::inject_context(&Context::current(), &mut props);
        props
    }

    async fn ensure_reply_queue(&mut self) -> Result<String, AmqpError> {
        if let Some(queue) = &self.reply_queue {
            return Ok(queue.clone());
        }

        let transport = self.client.transport_mut();
        let queue = transport
            .declare_queue(&QueueDefinition::server_named().exclusive().delete())
            .await?;
        transport.consume(&queue, true).await?;

        debug!(queue = queue.as_str(), "reply queue ready");
        self.reply_queue = Some(queue.clone());
        Ok(queue)
    }

    /// Sends an RPC request and waits up to `timeout` for its reply.
    ///
    /// Replies carrying another correlation id are discarded. A handler that
    /// fails on the other side sends no reply, so the caller sees
    /// `TimeoutError`.
    pub async fn call<B>(
        &mut self,
        routing_key: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<Value, AmqpError>
    where
        B: Serialize + ?Sized,
    {
        self.call_as(routing_key, body, timeout).await
    }

    /// Same as [`Producer::call`], decoding the reply into `R`.
    pub async fn call_as<R, B>(
        &mut self,
        routing_key: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R, AmqpError>
    where
        R: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        // Encode first so a bad body never creates the reply queue.
        let data = dumps_message(body)?;
        let reply_queue = self.ensure_reply_queue().await?;

        let correlation_id = Uuid::new_v4().to_string();
        let props = self.message_properties(
            MessageProperties::default()
                .with_correlation_id(&correlation_id)
                .with_reply_to(&reply_queue),
        );

        let deadline = Instant::now() + timeout;
        self.client
            .transport()
            .publish(self.client.exchange().name(), routing_key, &data, &props)
            .await?;

        debug!(
            routing_key,
            correlation_id = correlation_id.as_str(),
            "rpc request sent"
        );

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    routing_key,
                    correlation_id = correlation_id.as_str(),
                    "rpc call timed out"
                );
                return Err(AmqpError::TimeoutError(timeout));
            }

            let wait = remaining.min(self.pump_interval);
            let Some(envelope) = self.client.transport_mut().next_delivery(wait).await? else {
                continue;
            };

            if envelope.properties.correlation_id.as_deref() == Some(correlation_id.as_str()) {
                return loads_message(&envelope.body);
            }

            debug!(
                correlation_id = envelope.properties.correlation_id.as_deref(),
                "discarding unmatched reply"
            );
        }
    }

    /// Closes the connection, dropping the reply queue with it.
    pub async fn close(self) -> Result<(), AmqpError> {
        self.client.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::Payload, exchange::ExchangeDefinition, memory::MemoryBroker, message::Envelope,
        transport::MockTransport,
    };
    use serde_json::json;
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    async fn mocked_producer(transport: MockTransport) -> Producer<MockTransport> {
        let client = AmqpClient::with_transport(transport, ExchangeDefinition::new("test_exchange"))
            .await
            .unwrap();
        Producer::new(client)
    }

    async fn memory_producer(broker: &MemoryBroker) -> Producer<crate::memory::MemoryTransport> {
        let client = AmqpClient::with_transport(
            broker.connect().unwrap(),
            ExchangeDefinition::new("test_exchange"),
        )
        .await
        .unwrap();
        Producer::new(client)
    }

    #[tokio::test]
    async fn publish_sends_one_json_message() {
        let mut transport = MockTransport::new();
        transport.expect_declare_exchange().returning(|_| Ok(()));
        transport
            .expect_publish()
            .withf(|exchange: &str, key: &str, body: &[u8], props: &MessageProperties| {
                let body: Value = serde_json::from_slice(body).unwrap();
                exchange == "test_exchange"
                    && key == "test.route"
                    && body == json!({"test": "data"})
                    && props.content_type.as_deref() == Some(JSON_CONTENT_TYPE)
                    && props.delivery_mode == Some(DeliveryMode::Persistent)
                    && props.message_id.is_some()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let producer = mocked_producer(transport).await;
        producer
            .publish("test.route", &json!({"test": "data"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn encoding_failure_never_reaches_the_broker() {
        let mut transport = MockTransport::new();
        transport.expect_declare_exchange().returning(|_| Ok(()));
        transport.expect_publish().times(0);

        let producer = mocked_producer(transport).await;
        let mut body = HashMap::new();
        body.insert((1, 2), "tuple keys are not strings");

        assert!(matches!(
            producer.publish("test.route", &body).await,
            Err(AmqpError::EncodingError(_))
        ));
        assert!(matches!(
            producer.publish("test.route", &Payload::Float(f64::NAN)).await,
            Err(AmqpError::EncodingError(_))
        ));
    }

    #[tokio::test]
    async fn publish_is_fire_and_forget() {
        let mut transport = MockTransport::new();
        transport.expect_declare_exchange().returning(|_| Ok(()));
        transport
            .expect_publish()
            .times(2)
            .returning(|_, _, _, _| Err(AmqpError::PublishingError));

        let producer = mocked_producer(transport).await;

        assert_eq!(producer.publish("test.route", &json!({})).await, Ok(()));
        assert_eq!(
            producer
                .try_publish("test.route", &json!({}), MessageProperties::default())
                .await,
            Err(AmqpError::PublishingError)
        );
    }

    #[tokio::test]
    async fn publish_with_keeps_caller_properties() {
        let mut transport = MockTransport::new();
        transport.expect_declare_exchange().returning(|_| Ok(()));
        transport
            .expect_publish()
            .withf(|_: &str, _: &str, _: &[u8], props: &MessageProperties| {
                props.delivery_mode == Some(DeliveryMode::Transient)
                    && props.priority == Some(5)
                    && props.content_type.as_deref() == Some(JSON_CONTENT_TYPE)
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let producer = mocked_producer(transport).await;
        let props = MessageProperties::default()
            .with_delivery_mode(DeliveryMode::Transient)
            .with_priority(5);

        producer
            .publish_with("test.route", &json!({"urgent": true}), props)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn call_returns_the_matching_reply() {
        let published = Arc::new(Mutex::new(None::<MessageProperties>));
        let sent = published.clone();

        let mut transport = MockTransport::new();
        transport.expect_declare_exchange().returning(|_| Ok(()));
        transport
            .expect_declare_queue()
            .withf(|def: &QueueDefinition| {
                def.name().is_empty() && def.is_exclusive() && def.delete && !def.durable
            })
            .times(1)
            .returning(|_| Ok("amq.gen-reply".to_owned()));
        transport
            .expect_consume()
            .withf(|queue: &str, auto_ack: &bool| queue == "amq.gen-reply" && *auto_ack)
            .times(1)
            .returning(|_, _| Ok(()));
        transport
            .expect_publish()
            .times(1)
            .returning(move |_, _, _, props| {
                *sent.lock().unwrap() = Some(props.clone());
                Ok(())
            });

        let request = published.clone();
        let mut replies = 0;
        transport.expect_next_delivery().returning(move |_| {
            replies += 1;
            let props = request.lock().unwrap().clone().unwrap();
            let correlation_id = if replies == 1 {
                "someone-else".to_owned()
            } else {
                props.correlation_id.unwrap()
            };

            Ok(Some(Envelope {
                routing_key: props.reply_to.unwrap(),
                properties: MessageProperties::default().with_correlation_id(&correlation_id),
                body: br#"{"response": "data"}"#.to_vec(),
                ..Default::default()
            }))
        });

        let mut producer = mocked_producer(transport).await;
        let reply = producer
            .call("test.route", &json!({"test": "data"}), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(reply, json!({"response": "data"}));
        assert_eq!(producer.reply_queue(), Some("amq.gen-reply"));

        let request = published.lock().unwrap().clone().unwrap();
        assert_eq!(request.reply_to.as_deref(), Some("amq.gen-reply"));
        assert!(request.correlation_id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_at_the_deadline() {
        let broker = MemoryBroker::new();
        let mut producer = memory_producer(&broker).await;
        let timeout = Duration::from_secs(5);

        let started = Instant::now();
        let result = producer.call("nobody.listens", &json!({}), timeout).await;

        assert_eq!(result, Err(AmqpError::TimeoutError(timeout)));
        assert!(started.elapsed() >= timeout);
        assert!(started.elapsed() < timeout + DEFAULT_RPC_PUMP_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_queue_is_created_once() {
        let broker = MemoryBroker::new();
        let mut producer = memory_producer(&broker).await;

        for _ in 0..2 {
            let _ = producer
                .call("nobody.listens", &json!({}), Duration::from_millis(200))
                .await;
        }

        let queue = producer.reply_queue().unwrap().to_owned();
        assert!(broker.queue_exists(&queue));
        assert_eq!(broker.published().len(), 2);
        assert!(broker
            .published()
            .iter()
            .all(|msg| msg.properties.reply_to.as_deref() == Some(queue.as_str())));
    }

    #[tokio::test]
    async fn typed_call_decodes_the_reply() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Answer {
            response: String,
        }

        let mut transport = MockTransport::new();
        transport.expect_declare_exchange().returning(|_| Ok(()));
        transport
            .expect_declare_queue()
            .returning(|_| Ok("amq.gen-reply".to_owned()));
        transport.expect_consume().returning(|_, _| Ok(()));

        let sent = Arc::new(Mutex::new(String::new()));
        let id = sent.clone();
        transport.expect_publish().returning(move |_, _, _, props| {
            *id.lock().unwrap() = props.correlation_id.clone().unwrap();
            Ok(())
        });
        transport.expect_next_delivery().returning(move |_| {
            Ok(Some(Envelope {
                properties: MessageProperties::default()
                    .with_correlation_id(&sent.lock().unwrap()),
                body: br#"{"response": "data"}"#.to_vec(),
                ..Default::default()
            }))
        });

        let mut producer = mocked_producer(transport).await;
        let answer: Answer = producer
            .call_as("test.route", &json!({}), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(
            answer,
            Answer {
                response: "data".to_owned()
            }
        );
    }
}

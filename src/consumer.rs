// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! A [`Consumer`] binds an anonymous, exclusive, durable queue to the client's
//! exchange with one or more routing-key patterns and dispatches deliveries,
//! strictly one at a time, to a [`MessageHandler`].
//!
//! ## Acknowledgement
//!
//! With the default [`AckPolicy::AckAlways`] every delivery is acknowledged
//! once its handler returns, whether it succeeded or failed. A failing
//! handler is logged and its message dropped: delivery is at-most-once and a
//! poison message cannot loop. Workloads that need guaranteed processing must
//! not rely on this default; [`AckPolicy::RequeueOnce`] gives a failed message
//! one redelivery.
//!
//! ## RPC
//!
//! A delivery carrying `reply_to` is an RPC request. The handler's return
//! value is published to the default exchange with the reply queue as routing
//! key and the request's correlation id. A failing handler sends no reply and
//! the caller times out.
//!
//! ## Idle maintenance
//!
//! The receive loop pumps deliveries for at most `pump_interval` at a time.
//! Between pumps it runs the idle handler once `idle_interval` has passed
//! since the previous run, blocking message processing while it runs.

use crate::{
    client::AmqpClient,
    codec::{dumps_message, Payload, JSON_CONTENT_TYPE},
    errors::AmqpError,
    exchange::ExchangeKind,
    handler::{AckPolicy, IdleHandler, MessageHandler},
    message::{DeliveryMode, Envelope, MessageProperties},
    otel,
    queue::QueueDefinition,
    retry::{run_with_retries_until, RetryPolicy},
    routing::RoutingPattern,
    transport::Transport,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, future::Future, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Unacknowledged deliveries the broker may push per configured worker.
pub const PREFETCH_PER_WORKER: u16 = 1;
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_PUMP_INTERVAL: Duration = Duration::from_secs(60);

/// Everything a consumer needs besides its connection: the bindings, the
/// callbacks and the loop tuning.
#[derive(Clone)]
pub struct ConsumerDefinition {
    pub(crate) routing_keys: Vec<RoutingPattern>,
    pub(crate) threads: u16,
    pub(crate) max_priority: Option<u8>,
    pub(crate) idle_interval: Duration,
    pub(crate) pump_interval: Duration,
    pub(crate) ack_policy: AckPolicy,
    pub(crate) handler: Option<Arc<dyn MessageHandler>>,
    pub(crate) idle_handler: Option<Arc<dyn IdleHandler>>,
    pub(crate) tracer: Arc<BoxedTracer>,
}

impl ConsumerDefinition {
    /// Creates a definition binding the given patterns. At least one is required.
    pub fn new<I, S>(routing_keys: I) -> Result<ConsumerDefinition, AmqpError>
    where
        I: IntoIterator<Item = S>,
        S: Into<RoutingPattern>,
    {
        let routing_keys: Vec<RoutingPattern> = routing_keys.into_iter().map(Into::into).collect();
        if routing_keys.is_empty() {
            return Err(AmqpError::InvalidRoutingKeys);
        }

        Ok(ConsumerDefinition {
            routing_keys,
            threads: 1,
            max_priority: None,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            pump_interval: DEFAULT_PUMP_INTERVAL,
            ack_policy: AckPolicy::default(),
            handler: None,
            idle_handler: None,
            tracer: Arc::new(global::tracer("amqp consumer")),
        })
    }

    /// Sizes the prefetch window. Messages are still handled one at a time.
    pub fn threads(mut self, threads: u16) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Declares the queue with a priority ceiling.
    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }

    /// Sets how often the idle handler runs.
    ///
    /// The handler is checked at pump boundaries, so the effective period is
    /// rounded up to the next boundary after `interval` elapses.
    ///
    /// # Parameters
    /// * `interval` - Minimum time between two idle handler runs
    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Longest time the loop waits for a delivery before checking the idle
    /// handler and the stop signal.
    pub fn pump_interval(mut self, interval: Duration) -> Self {
        self.pump_interval = interval;
        self
    }

    /// Chooses how a failed handler settles its delivery.
    ///
    /// # Parameters
    /// * `policy` - [`AckPolicy::AckAlways`] acks regardless of the outcome;
    ///   [`AckPolicy::RequeueOnce`] nacks a first failure with requeue
    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    /// Sets the callback invoked for every delivery.
    ///
    /// Without one, deliveries are acked with a warning and RPC callers get
    /// no reply.
    pub fn handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Sets the callback run every [`idle_interval`](Self::idle_interval).
    pub fn idle_handler(mut self, handler: impl IdleHandler + 'static) -> Self {
        self.idle_handler = Some(Arc::new(handler));
        self
    }

    /// Replaces the tracer used for the per-delivery spans.
    pub fn tracer(mut self, tracer: BoxedTracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Patterns bound to the subscription queue.
    pub fn routing_keys(&self) -> &[RoutingPattern] {
        &self.routing_keys
    }

    /// Prefetch window requested from the broker.
    ///
    /// # Returns
    /// `threads` times the per-worker window, saturating at `u16::MAX`
    pub fn prefetch_count(&self) -> u16 {
        self.threads.saturating_mul(PREFETCH_PER_WORKER)
    }

    /// Whether any bound pattern routes `routing_key` on an exchange of `kind`.
    pub fn accepts(&self, kind: ExchangeKind, routing_key: &str) -> bool {
        self.routing_keys
            .iter()
            .any(|pattern| kind.routes(pattern, routing_key))
    }
}

/// A subscription bound to one connection.
pub struct Consumer<T: Transport> {
    client: AmqpClient<T>,
    queue_name: String,
    def: ConsumerDefinition,
    last_idle: Instant,
}

impl<T: Transport> Consumer<T> {
    /// Declares the subscription queue, binds every pattern and starts
    /// consuming. Any failure is a `ConnectionError`.
    pub async fn new(client: AmqpClient<T>, def: ConsumerDefinition) -> Result<Self, AmqpError> {
        let mut client = client;

        let queue_name = match subscribe(&mut client, &def).await {
            Ok(name) => name,
            Err(err) => {
                error!(error = err.to_string(), "failure to initialize the consumer");
                return Err(AmqpError::ConnectionError(err.to_string()));
            }
        };

        info!(
            queue = queue_name.as_str(),
            exchange = client.exchange().name(),
            "consumer subscribed"
        );

        Ok(Consumer {
            client,
            queue_name,
            def,
            last_idle: Instant::now(),
        })
    }

    /// Server-assigned name of the subscription queue.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn definition(&self) -> &ConsumerDefinition {
        &self.def
    }

    /// Connection the consumer receives on and replies through.
    pub fn client(&self) -> &AmqpClient<T> {
        &self.client
    }

    /// Handles one delivery: runs the handler, replies to RPC requests and
    /// settles the message.
    ///
    /// Handler failures never surface here. An error means the delivery could
    /// not be settled, which only happens when the channel is broken.
    pub async fn callback_wrapper(&self, envelope: Envelope) -> Result<(), AmqpError> {
        let rpc = envelope.is_rpc();
        let (ctx, mut span) =
            otel::new_span(&envelope.properties, &self.def.tracer, &envelope.routing_key);

        debug!(
            routing_key = envelope.routing_key.as_str(),
            delivery_tag = envelope.delivery_tag,
            rpc,
            "received a message"
        );

        let kind = self.client.exchange().exchange_kind();
        if !self.def.accepts(kind, &envelope.routing_key) {
            debug!(
                routing_key = envelope.routing_key.as_str(),
                "routing key matches none of the bound patterns"
            );
        }

        let Some(handler) = &self.def.handler else {
            warn!("received a message but there is no handler registered");
            span.end();
            return self.client.transport().ack(envelope.delivery_tag).await;
        };

        match handler.handle(&envelope, rpc).await {
            Ok(reply) => {
                if rpc {
                    if let Err(err) = self.reply(&ctx, &envelope, reply).await {
                        error!(error = err.to_string(), "failure to send the rpc reply");
                        span.record_error(&err);
                    }
                }
                span.set_status(Status::Ok);
            }
            Err(err) => {
                let err = AmqpError::CallbackError(err.to_string());
                error!(error = err.to_string(), "error in callback processing");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("callback failure"),
                });

                if self.def.ack_policy.requeue_failed(&envelope) {
                    warn!("requeuing failed message for one more attempt");
                    span.end();
                    return self
                        .client
                        .transport()
                        .nack(envelope.delivery_tag, true)
                        .await;
                }
            }
        }

        span.end();
        self.client.transport().ack(envelope.delivery_tag).await
    }

    async fn reply(
        &self,
        ctx: &Context,
        request: &Envelope,
        reply: Option<Payload>,
    ) -> Result<(), AmqpError> {
        let Some(reply_to) = &request.properties.reply_to else {
            return Ok(());
        };

        let body = dumps_message(&reply.unwrap_or(Payload::Null))?;

        let mut props = MessageProperties::default()
            .with_content_type(JSON_CONTENT_TYPE)
            .with_delivery_mode(DeliveryMode::Transient);
        props.correlation_id = request.properties.correlation_id.clone();
        otel::inject_context(ctx, &mut props);

        self.client
            .transport()
            .publish("", reply_to, &body, &props)
            .await
    }

    async fn run_idle_handler(&mut self) {
        let Some(idle_handler) = &self.def.idle_handler else {
            return;
        };

        let now = Instant::now();
        if now.duration_since(self.last_idle) < self.def.idle_interval {
            return;
        }

        debug!("running idle handler");
        if let Err(err) = idle_handler.on_idle().await {
            error!(error = err.to_string(), "error in idle handler");
        }
        self.last_idle = now;
    }

    /// Runs the receive loop until `stop` is cancelled.
    ///
    /// Returns an error only when the connection breaks; per-message failures
    /// are handled inside [`Consumer::callback_wrapper`].
    pub async fn run(&mut self, stop: &CancellationToken) -> Result<(), AmqpError> {
        info!(queue = self.queue_name.as_str(), "starting message consumption");

        while !stop.is_cancelled() {
            let pump_interval = self.def.pump_interval;
            let delivery = tokio::select! {
                _ = stop.cancelled() => break,
                delivery = self.client.transport_mut().next_delivery(pump_interval) => delivery,
            };

            match delivery {
                Ok(Some(envelope)) => self.callback_wrapper(envelope).await?,
                Ok(None) => {}
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    return Err(err);
                }
            }

            self.run_idle_handler().await;
        }

        info!(queue = self.queue_name.as_str(), "message consumption stopped");
        Ok(())
    }

    /// Closes the consumer's connection. The broker drops the exclusive
    /// queue and requeues anything left unacknowledged.
    pub async fn close(self) -> Result<(), AmqpError> {
        self.client.close().await
    }
}

impl<T: Transport + 'static> Consumer<T> {
    /// Runs the receive loop on its own task until stopped.
    pub fn spawn(mut self) -> ThreadedConsumer {
        let stop = CancellationToken::new();
        let token = stop.clone();

        let handle = tokio::spawn(async move {
            self.run(&token).await?;
            self.close().await
        });

        ThreadedConsumer { stop, handle }
    }
}

async fn subscribe<T: Transport>(
    client: &mut AmqpClient<T>,
    def: &ConsumerDefinition,
) -> Result<String, AmqpError> {
    let exchange = client.exchange().name().to_owned();
    let transport = client.transport_mut();

    transport.qos(def.prefetch_count()).await?;

    let mut queue_def = QueueDefinition::server_named().durable().exclusive();
    if let Some(max) = def.max_priority {
        queue_def = queue_def.max_priority(max);
    }
    let queue_name = transport.declare_queue(&queue_def).await?;

    for key in &def.routing_keys {
        transport
            .bind_queue(&queue_name, &exchange, key.as_str())
            .await?;
    }

    transport.consume(&queue_name, false).await?;
    Ok(queue_name)
}

/// Connects, subscribes and consumes until `stop` is cancelled, all under one
/// retry budget: a broken connection is replaced by a fresh one from
/// `connect` and consumption resumes.
///
/// Cancelling `stop` during an outage ends the retries at once and returns
/// `Ok(())`.
///
/// # Parameters
/// * `policy` - attempt budget shared by every reconnect
/// * `connect` - opens a fresh client for each attempt
/// * `def` - subscription used on every connection
/// * `stop` - ends consumption and any pending retry
pub async fn consume_with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    mut connect: F,
    def: ConsumerDefinition,
    stop: CancellationToken,
) -> Result<(), AmqpError>
where
    T: Transport,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<AmqpClient<T>, AmqpError>>,
{
    run_with_retries_until(policy, &stop, || {
        let client = connect();
        let def = def.clone();
        let stop = stop.clone();

        async move {
            let mut consumer = Consumer::new(client.await?, def).await?;
            consumer.run(&stop).await?;
            consumer.close().await
        }
    })
    .await
    .map(|_| ())
}

/// A consumer running on its own task.
///
/// The task owns the consumer's connection; nothing else touches its channel.
pub struct ThreadedConsumer {
    stop: CancellationToken,
    handle: JoinHandle<Result<(), AmqpError>>,
}

impl ThreadedConsumer {
    /// Spawns [`consume_with_retries`] on its own task.
    pub fn spawn_with_retries<T, F, Fut>(
        policy: RetryPolicy,
        connect: F,
        def: ConsumerDefinition,
    ) -> ThreadedConsumer
    where
        T: Transport + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<AmqpClient<T>, AmqpError>> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let token = stop.clone();

        let handle = tokio::spawn(async move {
            consume_with_retries(&policy, connect, def, token).await
        });

        ThreadedConsumer { stop, handle }
    }

    /// Asks the loop to stop. It exits at its next pump boundary.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether the task has exited, either stopped or out of retries.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task to finish and returns the loop's outcome.
    pub async fn join(self) -> Result<(), AmqpError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => {
                error!(error = err.to_string(), "consumer task failed");
                Err(AmqpError::InternalError(err.to_string()))
            }
        }
    }
}

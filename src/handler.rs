// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Callbacks
//!
//! User code plugged into a consumer: the per-message handler, the periodic
//! idle handler and the policy applied when a handler fails.

use crate::{codec::Payload, message::Envelope};
use async_trait::async_trait;
use std::error::Error;

pub type HandlerError = Box<dyn Error + Send + Sync>;

/// What a message handler produces: a reply for RPC requests, usually
/// nothing otherwise.
pub type HandlerResult = Result<Option<Payload>, HandlerError>;

/// Handles one delivery at a time.
///
/// `rpc` is set when the delivery carries a reply-to queue. For RPC requests
/// the returned payload is encoded and published as the reply.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope, rpc: bool) -> HandlerResult;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&Envelope, bool) -> HandlerResult + Send + Sync,
{
    async fn handle(&self, envelope: &Envelope, rpc: bool) -> HandlerResult {
        (self)(envelope, rpc)
    }
}

/// Periodic maintenance run from the receive loop between deliveries.
#[async_trait]
pub trait IdleHandler: Send + Sync {
    async fn on_idle(&self) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F> IdleHandler for F
where
    F: Fn() -> Result<(), HandlerError> + Send + Sync,
{
    async fn on_idle(&self) -> Result<(), HandlerError> {
        (self)()
    }
}

/// How a delivery is settled when its handler fails.
///
/// Successful deliveries are always acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledge regardless of the handler outcome. Failed work is dropped
    /// after being logged, so a poison message can never loop. Delivery is
    /// at-most-once.
    #[default]
    AckAlways,
    /// Requeue a failed first delivery; acknowledge and drop it if it fails
    /// again after redelivery.
    RequeueOnce,
}

impl AckPolicy {
    /// Whether a failed delivery should be negatively acknowledged with requeue.
    pub fn requeue_failed(&self, envelope: &Envelope) -> bool {
        match self {
            AckPolicy::AckAlways => false,
            AckPolicy::RequeueOnce => !envelope.redelivered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closures_are_message_handlers() {
        let handler = |envelope: &Envelope, rpc: bool| -> HandlerResult {
            Ok(rpc.then(|| Payload::from(envelope.routing_key.clone())))
        };
        let envelope = Envelope {
            routing_key: "test.route".to_owned(),
            ..Default::default()
        };

        assert_eq!(
            handler.handle(&envelope, true).await.unwrap(),
            Some(Payload::from("test.route"))
        );
        assert_eq!(handler.handle(&envelope, false).await.unwrap(), None);
    }

    #[test]
    fn requeue_once_only_retries_first_deliveries() {
        let mut envelope = Envelope::default();

        assert!(!AckPolicy::AckAlways.requeue_failed(&envelope));
        assert!(AckPolicy::RequeueOnce.requeue_failed(&envelope));

        envelope.redelivered = true;
        assert!(!AckPolicy::RequeueOnce.requeue_failed(&envelope));
    }
}

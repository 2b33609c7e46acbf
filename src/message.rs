// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Transport-independent view of a message: the property bag set on publish
//! and the delivery handed to consumers.

use crate::{codec::loads_message, errors::AmqpError};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient = 1,
    Persistent = 2,
}

impl DeliveryMode {
    /// Maps the AMQP `delivery-mode` octet. Any value other than 1 or 2 is
    /// unknown.
    pub fn from_u8(value: u8) -> Option<DeliveryMode> {
        match value {
            1 => Some(DeliveryMode::Transient),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }
}

/// Message properties carried alongside the body.
///
/// `headers` holds string-valued application headers; the trace context is
/// propagated through it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub delivery_mode: Option<DeliveryMode>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub priority: Option<u8>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = Some(mode);
        self
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn with_reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    /// Adds a string-valued application header, replacing any previous
    /// value for `key`.
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }
}

/// A delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl Envelope {
    /// A message carrying `reply_to` is an RPC request and expects exactly one reply.
    pub fn is_rpc(&self) -> bool {
        self.properties.reply_to.is_some()
    }

    /// Decodes the body.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        loads_message(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn reply_to_marks_an_rpc_request() {
        let mut envelope = Envelope::default();
        assert!(!envelope.is_rpc());

        envelope.properties = MessageProperties::default().with_reply_to("amq.gen-reply");
        assert!(envelope.is_rpc());
    }

    #[test]
    fn payload_decodes_the_body() {
        let envelope = Envelope {
            body: br#"{"test": "data"}"#.to_vec(),
            ..Default::default()
        };

        assert_eq!(envelope.payload::<Value>().unwrap(), json!({"test": "data"}));
    }

    #[test]
    fn delivery_mode_codes() {
        assert_eq!(DeliveryMode::from_u8(2), Some(DeliveryMode::Persistent));
        assert_eq!(DeliveryMode::Transient as u8, 1);
        assert_eq!(DeliveryMode::from_u8(7), None);
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Every client owns exactly one exchange. It is always declared durable; the
//! kind decides how routing keys are interpreted.

use crate::{errors::AmqpError, routing::RoutingPattern};
use std::{fmt, str::FromStr};

/// Represents the types of exchanges a client can declare.
///
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Fanout,
}

impl ExchangeKind {
    /// Kind name as sent in `exchange.declare`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }

    /// Whether a binding with `pattern` routes a message published with
    /// `routing_key` on an exchange of this kind.
    pub fn routes(&self, pattern: &RoutingPattern, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Topic => pattern.matches(routing_key),
            ExchangeKind::Direct => pattern.as_str() == routing_key,
            ExchangeKind::Fanout => true,
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "topic" => Ok(ExchangeKind::Topic),
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            other => Err(AmqpError::ConfigError(format!(
                "unsupported exchange kind `{}`",
                other
            ))),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition of the exchange a client publishes to and binds against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
}

impl ExchangeDefinition {
    /// Creates a topic exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::default(),
        }
    }

    /// Sets the exchange kind.
    ///
    /// # Parameters
    /// * `kind` - How the exchange matches routing keys against bindings
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind the exchange is declared with.
    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Exchanges are always declared durable.
    pub fn durable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_a_durable_topic_exchange() {
        let def = ExchangeDefinition::new("events");

        assert_eq!(def.name(), "events");
        assert_eq!(def.exchange_kind(), ExchangeKind::Topic);
        assert!(def.durable());
    }

    #[test]
    fn parses_kinds_case_insensitively() {
        assert_eq!("Fanout".parse::<ExchangeKind>(), Ok(ExchangeKind::Fanout));
        assert_eq!("direct".parse::<ExchangeKind>(), Ok(ExchangeKind::Direct));
        assert!("headers".parse::<ExchangeKind>().is_err());
    }

    #[test]
    fn routing_follows_the_exchange_kind() {
        let pattern = RoutingPattern::new("test.*");

        assert!(ExchangeKind::Topic.routes(&pattern, "test.created"));
        assert!(!ExchangeKind::Direct.routes(&pattern, "test.created"));
        assert!(ExchangeKind::Direct.routes(&pattern, "test.*"));
        assert!(ExchangeKind::Fanout.routes(&pattern, "other.created"));
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Handle
//!
//! An [`AmqpClient`] owns one broker session (a connection/channel pair) and
//! the single exchange declared on it. Opening and declaring never retry;
//! wrap the call in [`crate::retry::run_with_retries`] for that. A dropped
//! connection is terminal for the client.

use crate::{
    channel::{new_amqp_channel, LapinTransport},
    config::AmqpConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    transport::Transport,
};
use tracing::{debug, error};

/// An open connection paired with the exchange it publishes to and binds on.
///
/// Defaults to the lapin transport; tests swap in the in-process broker or a
/// mock.
pub struct AmqpClient<T: Transport = LapinTransport> {
    transport: T,
    exchange: ExchangeDefinition,
}

impl AmqpClient<LapinTransport> {
    /// Connects to `url` and declares the exchange.
    pub async fn connect(url: &str, exchange: ExchangeDefinition) -> Result<Self, AmqpError> {
        let transport = LapinTransport::connect(url, exchange.name())
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))?;

        AmqpClient::with_transport(transport, exchange).await
    }

    /// Connects using the broker configuration and declares the exchange.
    pub async fn from_configs(
        cfg: &AmqpConfigs,
        exchange: ExchangeDefinition,
    ) -> Result<Self, AmqpError> {
        let transport = new_amqp_channel(cfg)
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))?;

        AmqpClient::with_transport(transport, exchange).await
    }
}

impl<T: Transport> AmqpClient<T> {
    /// Declares the exchange on an already open transport.
    pub async fn with_transport(transport: T, exchange: ExchangeDefinition) -> Result<Self, AmqpError> {
        if let Err(err) = transport.declare_exchange(&exchange).await {
            error!(
                error = err.to_string(),
                exchange = exchange.name(),
                "failure to initialize the client"
            );
            return Err(AmqpError::ConnectionError(err.to_string()));
        }

        debug!(
            exchange = exchange.name(),
            kind = exchange.exchange_kind().as_str(),
            "client ready"
        );

        Ok(AmqpClient {
            transport,
            exchange,
        })
    }

    /// Exchange declared when the client connected.
    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    /// Transport behind the client.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Closes the connection. Consumes the client, so it can only happen once.
    pub async fn close(self) -> Result<(), AmqpError> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exchange::ExchangeKind, transport::MockTransport};

    #[tokio::test]
    async fn declares_one_durable_exchange() {
        let mut transport = MockTransport::new();
        transport
            .expect_declare_exchange()
            .withf(|def: &ExchangeDefinition| {
                def.name() == "test_exchange"
                    && def.exchange_kind() == ExchangeKind::Topic
                    && def.durable()
            })
            .times(1)
            .returning(|_| Ok(()));

        let client = AmqpClient::with_transport(transport, ExchangeDefinition::new("test_exchange"))
            .await
            .unwrap();

        assert_eq!(client.exchange().name(), "test_exchange");
    }

    #[tokio::test]
    async fn declare_failure_is_a_connection_error() {
        let mut transport = MockTransport::new();
        transport
            .expect_declare_exchange()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name().to_owned())));

        let result =
            AmqpClient::with_transport(transport, ExchangeDefinition::new("test_exchange")).await;

        assert!(matches!(result, Err(AmqpError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn close_releases_the_connection() {
        let mut transport = MockTransport::new();
        transport.expect_declare_exchange().returning(|_| Ok(()));
        transport.expect_close().times(1).returning(|| Ok(()));

        let client = AmqpClient::with_transport(transport, ExchangeDefinition::new("events").fanout())
            .await
            .unwrap();

        assert_eq!(client.close().await, Ok(()));
    }
}

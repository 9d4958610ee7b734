// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Topology Management
//!
//! This module declares queues and their dead-letter satellites on the
//! broker, exactly once per process lifetime. Declared names are memoized in
//! a process-local set, so repeated calls for the same queue cost no broker
//! round-trip. A failed declaration is not memoized and is retried on the
//! next call, which covers transient broker unavailability during warm-up.

use crate::{errors::AmqpError, queue::QueueSpec};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel, ExchangeKind,
};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Routing key under which dead-lettered messages reach the dead-letter queue
pub const DEAD_LETTER_ROUTING_KEY: &str = "dead-letter";

/// The broker operations the topology manager performs on a channel.
///
/// Implemented by `lapin::Channel`; the trait exists so declaration behavior
/// can be exercised against a mock broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a durable direct exchange.
    async fn declare_direct_exchange(&self, name: &str) -> Result<(), AmqpError>;

    /// Declares a durable queue with the given arguments.
    async fn declare_durable_queue(&self, name: &str, args: FieldTable) -> Result<(), AmqpError>;

    /// Binds a queue to an exchange under a routing key.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;
}

#[async_trait]
impl BrokerChannel for Channel {
    async fn declare_direct_exchange(&self, name: &str) -> Result<(), AmqpError> {
        match self
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name, "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_durable_queue(&self, name: &str, args: FieldTable) -> Result<(), AmqpError> {
        match self
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        match self
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
                Err(AmqpError::BindingQueueError(
                    queue.to_owned(),
                    exchange.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Idempotent declarer of queue topology.
///
/// One instance is shared by all producers and consumers of a process; the
/// memoized set it guards is the source of truth for what has already been
/// declared, not a query to the broker.
pub struct Topology {
    declared: Mutex<HashSet<String>>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology {
            declared: Mutex::new(HashSet::new()),
        }
    }

    /// Ensures the queue described by `spec` exists on the broker.
    ///
    /// The first call for a queue name declares the dead-letter wiring (when
    /// configured) and then the primary queue, and memoizes the name. Later
    /// calls return immediately. On a declaration failure nothing is
    /// memoized, so the next call retries from scratch.
    pub async fn ensure_queue<C>(&self, channel: &C, spec: &QueueSpec) -> Result<(), AmqpError>
    where
        C: BrokerChannel + ?Sized,
    {
        // The lock is held across the declarations so a queue is never
        // declared twice by concurrent callers.
        let mut declared = self.declared.lock().await;
        if declared.contains(spec.name()) {
            return Ok(());
        }

        debug!(queue = spec.name(), "declaring queue");

        let mut args = BTreeMap::new();
        if spec.is_dead_lettered() {
            declare_dead_letter(channel, spec, &mut args).await?;
        }

        channel
            .declare_durable_queue(spec.name(), FieldTable::from(args))
            .await?;

        declared.insert(spec.name().to_owned());
        debug!(queue = spec.name(), "queue declared");

        Ok(())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Topology::new()
    }
}

/// Declares the `{name}.dlx` exchange and `{name}.dlq` queue, binds them
/// under the fixed dead-letter routing key, and points the primary queue's
/// dead-letter arguments at them.
async fn declare_dead_letter<C>(
    channel: &C,
    spec: &QueueSpec,
    args: &mut BTreeMap<ShortString, AMQPValue>,
) -> Result<(), AmqpError>
where
    C: BrokerChannel + ?Sized,
{
    let dlx = spec.dlx_name();
    let dlq = spec.dlq_name();

    channel.declare_direct_exchange(&dlx).await?;
    channel
        .declare_durable_queue(&dlq, FieldTable::default())
        .await?;
    channel
        .bind_queue(&dlq, &dlx, DEAD_LETTER_ROUTING_KEY)
        .await?;

    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from(dlx)),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(DEAD_LETTER_ROUTING_KEY)),
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    #[tokio::test]
    async fn queue_is_declared_at_most_once() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_durable_queue()
            .times(1)
            .returning(|_, _| Ok(()));

        let topology = Topology::new();
        let spec = QueueSpec::new("email-notifications");

        for _ in 0..3 {
            topology.ensure_queue(&channel, &spec).await.unwrap();
        }
    }

    #[tokio::test]
    async fn dead_letter_wiring_is_declared_before_the_primary_queue() {
        let mut channel = MockBrokerChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_declare_direct_exchange()
            .withf(|name| name == "email-notifications.dlx")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_durable_queue()
            .withf(|name, _| name == "email-notifications.dlq")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        channel
            .expect_bind_queue()
            .withf(|queue, exchange, key| {
                queue == "email-notifications.dlq"
                    && exchange == "email-notifications.dlx"
                    && key == DEAD_LETTER_ROUTING_KEY
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_declare_durable_queue()
            .withf(|name, args| {
                name == "email-notifications"
                    && args.inner().get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE))
                        == Some(&AMQPValue::LongString(LongString::from(
                            "email-notifications.dlx",
                        )))
                    && args
                        .inner()
                        .get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY))
                        == Some(&AMQPValue::LongString(LongString::from(
                            DEAD_LETTER_ROUTING_KEY,
                        )))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let topology = Topology::new();
        let spec = QueueSpec::new("email-notifications").with_dead_letter();

        topology.ensure_queue(&channel, &spec).await.unwrap();
        // A second call is a no-op; the expectations above would fail otherwise.
        topology.ensure_queue(&channel, &spec).await.unwrap();
    }

    #[tokio::test]
    async fn failed_declaration_is_retried_on_the_next_call() {
        let mut channel = MockBrokerChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_declare_durable_queue()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, _| Err(AmqpError::DeclareQueueError(name.to_owned())));
        channel
            .expect_declare_durable_queue()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let topology = Topology::new();
        let spec = QueueSpec::new("email-notifications");

        assert_eq!(
            topology.ensure_queue(&channel, &spec).await.unwrap_err(),
            AmqpError::DeclareQueueError("email-notifications".to_owned())
        );
        topology.ensure_queue(&channel, &spec).await.unwrap();
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Runtime
//!
//! This module subscribes to a queue with a bounded prefetch and feeds each
//! delivered message to a registered handler. A handler that completes is
//! acknowledged; a handler that fails is negatively acknowledged without
//! requeueing, so the broker dead-letters the message when the queue is
//! configured for it instead of redelivering in a tight loop. Retrying is
//! not this module's job; it belongs to the dispatcher layered above.
//!
//! The consumption setup (topology, prefetch, subscription) replays after
//! every reconnect, so a consumer survives connection loss transparently.

use crate::{
    connection::{ConnectionManager, ConnectionStatus, ManagedChannel},
    errors::AmqpError,
    otel,
    queue::QueueSpec,
    topology::Topology,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use serde_json::Value;
use std::{borrow::Cow, sync::Arc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Handler invoked once per delivered message with the decoded JSON payload.
///
/// Returning `Ok` acknowledges the message permanently; returning an error
/// rejects it without requeueing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, payload: &Value) -> Result<(), AmqpError>;
}

/// Subscription parameters for one consumer registration.
pub struct ConsumerOptions {
    /// The queue to consume from
    pub queue: QueueSpec,
    /// Maximum number of unacknowledged messages delivered concurrently
    pub prefetch: u16,
    /// Consumer tag reported to the broker
    pub tag: String,
}

/// A queue consumer bound to one channel of the shared connection.
pub struct Consumer {
    manager: ConnectionManager,
    channel: ManagedChannel,
    options: ConsumerOptions,
    handler: Arc<dyn ConsumerHandler>,
}

impl Consumer {
    /// Creates a consumer for the given queue and handler.
    ///
    /// The consumer owns its channel; the channel's setup routine declares
    /// the queue topology and configures the prefetch, and is replayed on
    /// every reconnect.
    pub fn new(
        manager: &ConnectionManager,
        topology: Arc<Topology>,
        options: ConsumerOptions,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Consumer {
        let spec = options.queue.clone();
        let prefetch = options.prefetch;

        let channel = manager.create_channel(move |channel| {
            let topology = Arc::clone(&topology);
            let spec = spec.clone();

            Box::pin(async move {
                topology.ensure_queue(&channel, &spec).await?;

                match channel
                    .basic_qos(prefetch, BasicQosOptions::default())
                    .await
                {
                    Err(err) => {
                        error!(error = err.to_string(), "error to configure qos");
                        Err(AmqpError::QoSDeclarationError(spec.name().to_owned()))
                    }
                    _ => {
                        debug!(queue = spec.name(), prefetch, "consumer channel ready");
                        Ok(())
                    }
                }
            })
        });

        Consumer {
            manager: manager.clone(),
            channel,
            options,
            handler,
        }
    }

    /// Consumes messages until the connection is closed for shutdown.
    ///
    /// Each pass subscribes to the queue and streams deliveries, spawning a
    /// task per message so up to `prefetch` handlers run concurrently. When
    /// the delivery stream ends with the connection, the pass restarts after
    /// the reconnect delay and the channel setup replays.
    pub async fn run(&self) -> Result<(), AmqpError> {
        let mut status = self.manager.status();

        loop {
            if *status.borrow() == ConnectionStatus::Closed {
                return Ok(());
            }

            let channel = match self.channel.get().await {
                Ok(channel) => channel,
                Err(AmqpError::ConnectionClosedError) => return Ok(()),
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        queue = self.options.queue.name(),
                        "consumer channel unavailable, retrying"
                    );
                    sleep(self.manager.reconnect_delay()).await;
                    continue;
                }
            };

            let mut deliveries = match channel
                .basic_consume(
                    self.options.queue.name(),
                    &self.options.tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    error!(error = err.to_string(), "error to create the consumer");
                    self.channel.invalidate().await;
                    sleep(self.manager.reconnect_delay()).await;
                    continue;
                }
            };

            info!(queue = self.options.queue.name(), "consumer started");

            loop {
                tokio::select! {
                    changed = status.changed() => {
                        if changed.is_err() || *status.borrow() == ConnectionStatus::Closed {
                            info!(queue = self.options.queue.name(), "consumer stopping");
                            return Ok(());
                        }
                    }
                    delivery = deliveries.next() => {
                        match delivery {
                            Some(Ok(delivery)) => self.spawn_delivery(delivery),
                            Some(Err(err)) => {
                                error!(error = err.to_string(), "delivery error");
                            }
                            None => {
                                warn!(
                                    queue = self.options.queue.name(),
                                    "delivery stream closed, re-establishing"
                                );
                                break;
                            }
                        }
                    }
                }
            }

            self.channel.invalidate().await;
            sleep(self.manager.reconnect_delay()).await;
        }
    }

    fn spawn_delivery(&self, delivery: Delivery) {
        let handler = Arc::clone(&self.handler);
        let queue = self.options.queue.name().to_owned();

        tokio::spawn(async move {
            process_delivery(&queue, delivery, handler.as_ref()).await;
        });
    }
}

/// Outcome of processing one delivery.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Acknowledge: the message is removed from the queue permanently
    Ack,
    /// Negatively acknowledge without requeue: the broker drops the message
    /// or dead-letters it when the queue is configured for it
    Reject,
}

/// Decodes the message body and runs the handler, mapping the outcome to an
/// acknowledgment verdict. An undecodable body is rejected without invoking
/// the handler.
pub(crate) async fn judge(
    handler: &dyn ConsumerHandler,
    ctx: &Context,
    data: &[u8],
) -> Verdict {
    let payload: Value = match serde_json::from_slice(data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = err.to_string(), "rejecting undecodable message");
            return Verdict::Reject;
        }
    };

    match handler.exec(ctx, &payload).await {
        Ok(()) => Verdict::Ack,
        Err(err) => {
            warn!(error = err.to_string(), "handler failed, rejecting message");
            Verdict::Reject
        }
    }
}

async fn process_delivery(queue: &str, delivery: Delivery, handler: &dyn ConsumerHandler) {
    let tracer = global::tracer("amqp consumer");
    let (ctx, mut span) = otel::consumer_span(&delivery.properties, &tracer, queue);

    match judge(handler, &ctx, &delivery.data).await {
        Verdict::Ack => match delivery.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error to ack message");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
            }
            _ => span.set_status(Status::Ok),
        },
        Verdict::Reject => {
            match delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: false,
                })
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to nack message");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to nack msg"),
                    });
                }
                _ => span.set_status(Status::Error {
                    description: Cow::from("message rejected"),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_handler_acknowledges_the_message() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().times(1).returning(|_, _| Ok(()));

        let verdict = judge(&handler, &Context::current(), b"{\"kind\":\"noop\"}").await;

        assert_eq!(verdict, Verdict::Ack);
    }

    #[tokio::test]
    async fn failing_handler_rejects_the_message() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(1)
            .returning(|_, _| Err(AmqpError::ConsumerError("boom".to_owned())));

        let verdict = judge(&handler, &Context::current(), b"{}").await;

        assert_eq!(verdict, Verdict::Reject);
    }

    #[tokio::test]
    async fn undecodable_body_is_rejected_without_invoking_the_handler() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().times(0);

        let verdict = judge(&handler, &Context::current(), b"not json").await;

        assert_eq!(verdict, Verdict::Reject);
    }
}

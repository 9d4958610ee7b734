// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Producer
//!
//! This module publishes serialized jobs to a named durable queue. Publishes
//! wait for the managed channel to be ready, ensure the queue topology
//! exists, and flag the message persistent so the broker stores it before
//! acknowledging. Delivery to a consumer is not awaited.

use crate::{
    connection::{ConnectionManager, ManagedChannel},
    errors::AmqpError,
    otel::AmqpHeaderCarrier,
    queue::QueueSpec,
    topology::Topology,
};
use lapin::{
    options::BasicPublishOptions,
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{global, Context};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Persistent delivery mode: the broker stores the message durably before
/// acknowledging the publish
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Publisher of jobs to durable queues.
///
/// All publishes share one long-lived managed channel; while the broker is
/// unreachable they suspend until the connection is re-established.
pub struct Producer {
    channel: ManagedChannel,
    topology: Arc<Topology>,
}

impl Producer {
    /// Creates a producer bound to the given connection.
    ///
    /// # Parameters
    /// * `manager` - The process-wide connection manager
    /// * `topology` - The shared topology declarer
    ///
    /// # Returns
    /// An Arc-wrapped Producer for sharing across tasks
    pub fn new(manager: &ConnectionManager, topology: Arc<Topology>) -> Arc<Producer> {
        let channel = manager.create_channel(|_| {
            Box::pin(async {
                debug!("publisher channel ready");
                Ok(())
            })
        });

        Arc::new(Producer { channel, topology })
    }

    /// Publishes `payload` to the queue described by `spec`.
    ///
    /// Suspends until the channel is connected, ensures the queue topology,
    /// then publishes with the persistent flag set. The current trace context
    /// is injected into the message headers. The broker's enqueue
    /// acknowledgment is the only confirmation; consumer-side processing is
    /// never awaited.
    pub async fn publish<T>(
        &self,
        ctx: &Context,
        spec: &QueueSpec,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync,
    {
        let channel = self.channel.get().await?;

        self.topology.ensure_queue(&channel, spec).await?;

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(err) => {
                error!(error = err.to_string(), "failure to serialize payload");
                return Err(AmqpError::SerializePayloadError);
            }
        };

        let mut headers = BTreeMap::default();
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(ctx, &mut AmqpHeaderCarrier::new(&mut headers))
        });

        match channel
            .basic_publish(
                "",
                spec.name(),
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
                    .with_headers(FieldTable::from(headers)),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = spec.name(),
                    "error publishing message"
                );
                Err(AmqpError::PublishingError)
            }
            _ => {
                debug!(queue = spec.name(), "message published");
                Ok(())
            }
        }
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Specifications
//!
//! This module provides the type used to describe a queue and its optional
//! dead-letter satellites. A spec is pure data; declaration against the
//! broker is the topology manager's job.

/// Specification of a job queue and its optional dead-letter wiring.
///
/// Queues are always declared durable so jobs survive a broker restart.
/// When dead-lettering is enabled, rejected messages are routed to a
/// companion queue named after the primary one instead of being discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    name: String,
    with_dead_letter: bool,
}

impl QueueSpec {
    /// Creates a new spec for the queue with the given name.
    ///
    /// By default no dead-letter wiring is configured.
    pub fn new(name: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_owned(),
            with_dead_letter: false,
        }
    }

    /// Adds a dead-letter exchange/queue pair to the spec.
    ///
    /// Messages rejected from the primary queue will be routed by the broker
    /// to `{name}.dlq` through the direct exchange `{name}.dlx`, where they
    /// are retained for inspection.
    pub fn with_dead_letter(mut self) -> Self {
        self.with_dead_letter = true;
        self
    }

    /// The primary queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this queue is configured with dead-letter wiring.
    pub fn is_dead_lettered(&self) -> bool {
        self.with_dead_letter
    }

    /// Name of the dead-letter exchange for this queue.
    pub fn dlx_name(&self) -> String {
        format!("{}.dlx", self.name)
    }

    /// Name of the dead-letter queue for this queue.
    pub fn dlq_name(&self) -> String {
        format!("{}.dlq", self.name)
    }
}

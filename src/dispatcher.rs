// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Email Job Dispatcher
//!
//! This module turns raw queue messages into typed email jobs and routes
//! them by kind to a registered side-effect handler. A failed job is
//! re-submitted to the same queue with an incremented attempt counter after
//! an exponential delay, up to a ceiling of total attempts; past the ceiling
//! it is abandoned with an error log. Malformed messages and unknown kinds
//! are dropped without retry, since retrying cannot fix either.
//!
//! Retry timers are process-local: a process that exits before a timer fires
//! loses that pending retry. The message itself was already settled with the
//! broker at that point.

use crate::{
    consumer::ConsumerHandler, errors::AmqpError, publisher::Producer, queue::QueueSpec,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// The closed set of email job kinds this service knows how to deliver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    WelcomeTenant,
    PasswordReset,
}

impl JobKind {
    /// Maps a wire-format kind tag to the enum, or `None` for a kind this
    /// service does not know.
    fn parse(raw: &str) -> Option<JobKind> {
        match raw {
            "welcome-tenant" => Some(JobKind::WelcomeTenant),
            "password-reset" => Some(JobKind::PasswordReset),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::WelcomeTenant => "welcome-tenant",
            JobKind::PasswordReset => "password-reset",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work, carried as a single JSON message body.
///
/// A job is immutable once constructed; a retry is a new value produced by
/// [`next_attempt`](Job::next_attempt), never an in-place mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub kind: JobKind,
    pub recipient: String,
    pub data: Map<String, Value>,
    pub attempt: u32,
}

impl Job {
    /// Creates a first-attempt job.
    pub fn new(kind: JobKind, recipient: impl Into<String>, data: Map<String, Value>) -> Job {
        Job {
            kind,
            recipient: recipient.into(),
            data,
            attempt: 0,
        }
    }

    /// Returns the retry copy of this job with the attempt counter
    /// incremented.
    pub fn next_attempt(&self) -> Job {
        Job {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Failure reported by a side-effect handler.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Side-effect collaborator for one job kind, e.g. a templated-email sender.
///
/// The only contract with the dispatcher is that it succeeds or returns an
/// error; how delivery happens is not this crate's concern.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn send(&self, recipient: &str, data: &Map<String, Value>) -> Result<(), HandlerError>;
}

/// Destination for re-submitted retry jobs. Implemented by [`Producer`];
/// the seam exists so the retry path can be exercised without a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn send(&self, ctx: &Context, queue: &QueueSpec, job: &Job) -> Result<(), AmqpError>;
}

#[async_trait]
impl JobSink for Producer {
    async fn send(&self, ctx: &Context, queue: &QueueSpec, job: &Job) -> Result<(), AmqpError> {
        self.publish(ctx, queue, job).await
    }
}

/// Default ceiling of total delivery attempts per job
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default base of the exponential backoff, in seconds
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 5;

/// Outcome of a retry policy evaluation for a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-submit the job after the given delay
    Retry { delay: Duration },
    /// All attempts exhausted; abandon the job
    GiveUp,
}

/// Retry policy: bounded attempts with a fixed exponential backoff.
///
/// The delay for a job that failed on attempt `n` is `base^(n+1)` seconds,
/// so the default base of 5 yields 5s and 25s between the three attempts of
/// the default ceiling. The schedule is keyed to the attempt number and is
/// not jittered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base_secs: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base_secs: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base_secs,
        }
    }

    /// Decides what to do with a job that just failed its `attempt`-th
    /// delivery (0-based).
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt + 1 < self.max_attempts {
            RetryDecision::Retry {
                delay: Duration::from_secs(self.backoff_base_secs.saturating_pow(attempt + 1)),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BACKOFF_BASE_SECS)
    }
}

/// Routes decoded jobs to their kind-specific handlers and drives the retry
/// schedule for failed ones.
///
/// Registered as the [`ConsumerHandler`] of the email queue's consumer.
pub struct JobDispatcher {
    queue: QueueSpec,
    sink: Arc<dyn JobSink>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    retry: RetryPolicy,
}

impl JobDispatcher {
    /// Creates a dispatcher that re-submits retries to `queue` through
    /// `sink`.
    pub fn new(queue: QueueSpec, sink: Arc<dyn JobSink>, retry: RetryPolicy) -> JobDispatcher {
        JobDispatcher {
            queue,
            sink,
            handlers: HashMap::default(),
            retry,
        }
    }

    /// Registers the handler for a job kind.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn register(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    fn schedule_retry(&self, ctx: &Context, job: Job, delay: Duration) {
        let sink = Arc::clone(&self.sink);
        let queue = self.queue.clone();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            sleep(delay).await;
            if let Err(err) = sink.send(&ctx, &queue, &job).await {
                warn!(
                    error = err.to_string(),
                    kind = %job.kind,
                    attempt = job.attempt,
                    "failure to re-enqueue job retry"
                );
            }
        });
    }
}

#[async_trait]
impl ConsumerHandler for JobDispatcher {
    /// Processes one decoded message.
    ///
    /// Malformed messages and unknown kinds return `Ok` so the consumer acks
    /// and drops them; they are not valid work and retrying cannot fix them.
    /// A handler failure returns an error so the spent delivery is rejected
    /// (and dead-lettered when configured), with the retry copy re-submitted
    /// separately after its backoff delay.
    async fn exec(&self, ctx: &Context, payload: &Value) -> Result<(), AmqpError> {
        let Some(raw) = decode(payload) else {
            warn!("dropping malformed job message");
            return Ok(());
        };

        let Some(kind) = JobKind::parse(raw.kind) else {
            warn!(kind = raw.kind, "dropping job with unknown kind");
            return Ok(());
        };

        let Some(handler) = self.handlers.get(&kind) else {
            warn!(kind = %kind, "dropping job with no registered handler");
            return Ok(());
        };

        let job = Job {
            kind,
            recipient: raw.recipient.to_owned(),
            data: raw.data.clone(),
            attempt: raw.attempt,
        };

        match handler.send(&job.recipient, &job.data).await {
            Ok(()) => {
                info!(kind = %kind, attempt = job.attempt, "job delivered");
                Ok(())
            }
            Err(err) => {
                match self.retry.decide(job.attempt) {
                    RetryDecision::Retry { delay } => {
                        warn!(
                            error = err.to_string(),
                            kind = %kind,
                            attempt = job.attempt,
                            delay_secs = delay.as_secs(),
                            "job failed, scheduling retry"
                        );
                        self.schedule_retry(ctx, job.next_attempt(), delay);
                    }
                    RetryDecision::GiveUp => {
                        error!(
                            error = err.to_string(),
                            kind = %kind,
                            attempt = job.attempt,
                            "job abandoned after final attempt"
                        );
                    }
                }
                Err(AmqpError::ConsumerError(err.to_string()))
            }
        }
    }
}

/// Producer-side enqueue API for email jobs, fire-and-forget.
///
/// Used by request/response code paths (e.g. user registration) that must
/// never block or fail on broker unavailability; a publish failure surfaces
/// only as a warning log.
pub struct EmailQueue {
    producer: Arc<Producer>,
    queue: QueueSpec,
}

impl EmailQueue {
    pub fn new(producer: Arc<Producer>, queue: QueueSpec) -> EmailQueue {
        EmailQueue { producer, queue }
    }

    /// Enqueues a first-attempt email job without awaiting the publish.
    pub fn queue_email(&self, kind: JobKind, recipient: impl Into<String>, data: Map<String, Value>) {
        let job = Job::new(kind, recipient, data);
        let producer = Arc::clone(&self.producer);
        let queue = self.queue.clone();
        let ctx = Context::current();

        tokio::spawn(async move {
            if let Err(err) = producer.publish(&ctx, &queue, &job).await {
                warn!(
                    error = err.to_string(),
                    kind = %job.kind,
                    "failure to enqueue email job"
                );
            }
        });
    }
}

struct RawJob<'a> {
    kind: &'a str,
    recipient: &'a str,
    data: &'a Map<String, Value>,
    attempt: u32,
}

/// Validates the shape of a decoded message: `kind` and `recipient` strings,
/// `data` an object, `attempt` a non-negative integer.
fn decode(payload: &Value) -> Option<RawJob<'_>> {
    let obj = payload.as_object()?;

    Some(RawJob {
        kind: obj.get("kind")?.as_str()?,
        recipient: obj.get("recipient")?.as_str()?,
        data: obj.get("data")?.as_object()?,
        attempt: u32::try_from(obj.get("attempt")?.as_u64()?).ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::{advance, Instant};

    struct RecordingSink {
        tx: mpsc::UnboundedSender<Job>,
    }

    #[async_trait]
    impl JobSink for RecordingSink {
        async fn send(&self, _: &Context, _: &QueueSpec, job: &Job) -> Result<(), AmqpError> {
            let _ = self.tx.send(job.clone());
            Ok(())
        }
    }

    fn welcome_data() -> Map<String, Value> {
        json!({"userName": "Ana", "tenantName": "Acme"})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn dispatcher(
        sink: Arc<dyn JobSink>,
        handler: Arc<dyn JobHandler>,
    ) -> JobDispatcher {
        JobDispatcher::new(
            QueueSpec::new("email-notifications"),
            sink,
            RetryPolicy::default(),
        )
        .register(JobKind::WelcomeTenant, handler)
    }

    #[test]
    fn retry_policy_follows_the_exponential_schedule() {
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.decide(0),
            RetryDecision::Retry {
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(
            policy.decide(1),
            RetryDecision::Retry {
                delay: Duration::from_secs(25)
            }
        );
        assert_eq!(policy.decide(2), RetryDecision::GiveUp);
    }

    #[test]
    fn retry_policy_honors_a_custom_ceiling() {
        let policy = RetryPolicy::new(4, 5);

        assert_eq!(
            policy.decide(2),
            RetryDecision::Retry {
                delay: Duration::from_secs(125)
            }
        );
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
    }

    #[test]
    fn job_serializes_to_the_wire_format() {
        let job = Job::new(JobKind::WelcomeTenant, "a@x.com", welcome_data());

        assert_eq!(
            serde_json::to_value(&job).unwrap(),
            json!({
                "kind": "welcome-tenant",
                "recipient": "a@x.com",
                "data": {"userName": "Ana", "tenantName": "Acme"},
                "attempt": 0
            })
        );
    }

    #[test]
    fn next_attempt_produces_a_new_job() {
        let job = Job::new(JobKind::PasswordReset, "a@x.com", Map::new());
        let retry = job.next_attempt();

        assert_eq!(job.attempt, 0);
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.kind, job.kind);
        assert_eq!(retry.recipient, job.recipient);
    }

    #[tokio::test]
    async fn delivered_job_is_routed_to_its_handler() {
        let mut sink = MockJobSink::new();
        sink.expect_send().times(0);

        let mut handler = MockJobHandler::new();
        handler
            .expect_send()
            .withf(|recipient, data| {
                recipient == "a@x.com"
                    && data.get("userName") == Some(&json!("Ana"))
                    && data.get("tenantName") == Some(&json!("Acme"))
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = dispatcher(Arc::new(sink), Arc::new(handler));
        let payload = json!({
            "kind": "welcome-tenant",
            "recipient": "a@x.com",
            "data": {"userName": "Ana", "tenantName": "Acme"},
            "attempt": 0
        });

        assert!(dispatcher.exec(&Context::current(), &payload).await.is_ok());
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped_without_side_effects() {
        let payloads = vec![
            json!({"kind": "welcome-tenant", "data": {}, "attempt": 0}),
            json!({"kind": "welcome-tenant", "recipient": "a@x.com", "data": "nope", "attempt": 0}),
            json!({"kind": "welcome-tenant", "recipient": "a@x.com", "data": {}}),
            json!({"kind": "welcome-tenant", "recipient": "a@x.com", "data": {}, "attempt": 1.5}),
            json!({"kind": 7, "recipient": "a@x.com", "data": {}, "attempt": 0}),
            json!("not an object"),
        ];

        for payload in payloads {
            let mut sink = MockJobSink::new();
            sink.expect_send().times(0);
            let mut handler = MockJobHandler::new();
            handler.expect_send().times(0);

            let dispatcher = dispatcher(Arc::new(sink), Arc::new(handler));

            assert!(dispatcher.exec(&Context::current(), &payload).await.is_ok());
        }
    }

    #[tokio::test]
    async fn unknown_kind_is_dropped_without_side_effects() {
        let mut sink = MockJobSink::new();
        sink.expect_send().times(0);
        let mut handler = MockJobHandler::new();
        handler.expect_send().times(0);

        let dispatcher = dispatcher(Arc::new(sink), Arc::new(handler));
        let payload = json!({
            "kind": "unknown-xyz",
            "recipient": "a@x.com",
            "data": {},
            "attempt": 0
        });

        assert!(dispatcher.exec(&Context::current(), &payload).await.is_ok());
    }

    #[tokio::test]
    async fn unregistered_kind_is_dropped_without_retry() {
        let mut sink = MockJobSink::new();
        sink.expect_send().times(0);
        let handler = MockJobHandler::new();

        // Only welcome-tenant is registered
        let dispatcher = dispatcher(Arc::new(sink), Arc::new(handler));
        let payload = json!({
            "kind": "password-reset",
            "recipient": "a@x.com",
            "data": {},
            "attempt": 0
        });

        assert!(dispatcher.exec(&Context::current(), &payload).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn handler_failures_walk_the_backoff_schedule() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(RecordingSink { tx });

        let mut handler = MockJobHandler::new();
        handler
            .expect_send()
            .times(2)
            .returning(|_, _| Err(HandlerError("gateway timeout".to_owned())));
        handler.expect_send().times(1).returning(|_, _| Ok(()));

        let dispatcher = dispatcher(sink, Arc::new(handler));
        let ctx = Context::current();
        let started = Instant::now();

        let job = Job::new(JobKind::WelcomeTenant, "a@x.com", welcome_data());
        let payload = serde_json::to_value(&job).unwrap();
        assert!(dispatcher.exec(&ctx, &payload).await.is_err());

        // Let the retry task register its timer before moving the clock
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        // First retry lands 5 seconds after the first failure
        advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        let retry = rx.try_recv().unwrap();
        assert_eq!(retry.attempt, 1);
        assert_eq!(started.elapsed(), Duration::from_secs(5));

        let payload = serde_json::to_value(&retry).unwrap();
        assert!(dispatcher.exec(&ctx, &payload).await.is_err());
        tokio::task::yield_now().await;

        // Second retry lands 25 seconds after the second failure
        advance(Duration::from_secs(25)).await;
        tokio::task::yield_now().await;
        let retry = rx.try_recv().unwrap();
        assert_eq!(retry.attempt, 2);
        assert_eq!(started.elapsed(), Duration::from_secs(30));

        // Third delivery succeeds; nothing further is scheduled
        let payload = serde_json::to_value(&retry).unwrap();
        assert!(dispatcher.exec(&ctx, &payload).await.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn job_at_the_attempt_ceiling_is_abandoned() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(RecordingSink { tx });

        let mut handler = MockJobHandler::new();
        handler
            .expect_send()
            .times(1)
            .returning(|_, _| Err(HandlerError("gateway timeout".to_owned())));

        let dispatcher = dispatcher(sink, Arc::new(handler));
        let payload = json!({
            "kind": "welcome-tenant",
            "recipient": "a@x.com",
            "data": {},
            "attempt": 2
        });

        assert!(dispatcher.exec(&Context::current(), &payload).await.is_err());

        tokio::task::yield_now().await;
        advance(Duration::from_secs(1000)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}

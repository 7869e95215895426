//! Shard message queue: publish/subscribe with at-least-once delivery.
//!
//! Two roles, each a single trait:
//!
//! - [`Publisher`]: fire-and-forget `publish`, with send failures aggregated
//!   and reported once by `close`.
//! - [`Subscriber`]: blocking one-at-a-time `synchronous_pull`, explicit
//!   `ack`/`nack`. While a message is held its ack deadline is extended in
//!   the background; the extension stops before `ack`/`nack` return.
//!
//! Backends are chosen by [`QueueBackend::from_env`] and built through
//! [`new_publisher`] / [`new_subscriber`]:
//!
//! ```text
//! REPO_CRON_QUEUE_BACKEND=pubsub   Google Cloud Pub/Sub REST (default)
//! REPO_CRON_QUEUE_BACKEND=memory   rejected: the broker dies with the process
//! ```
//!
//! The in-process [`MemoryBroker`] is built directly by callers that run
//! publisher and subscribers in the same process, as `QueueBackend::Memory`.

mod deadline;
mod error;
pub mod memory;
mod publisher;
pub mod pubsub;

use std::time::Duration;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

pub use deadline::DeadlineExtender;
pub use error::QueueError;
pub use memory::{BrokerStats, MemoryBroker, MemorySubscriber, DEFAULT_MAX_DELIVERY_ATTEMPTS};
pub use publisher::{MessageSink, TopicPublisher};
pub use pubsub::{PubSubClient, PubSubSink, PubSubSubscriber};

use crate::data::BatchRequest;

/// Environment variable selecting the queue backend.
pub const QUEUE_BACKEND_ENV: &str = "REPO_CRON_QUEUE_BACKEND";
const MEMORY_SCHEME: &str = "mem://";

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Publisher: Send {
    /// Start sending one shard and return immediately. Only local encoding
    /// errors surface here; send failures are reported by [`Publisher::close`].
    fn publish(&mut self, request: &BatchRequest) -> Result<(), QueueError>;

    /// Wait for every outstanding send. Fails with
    /// [`QueueError::PublishFailed`] if any send failed.
    async fn close(&mut self) -> Result<(), QueueError>;
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Block until one message is available. `Ok(None)` is a shutdown signal.
    async fn synchronous_pull(&mut self) -> Result<Option<BatchRequest>, QueueError>;

    /// Commit the held message; it will not be redelivered.
    async fn ack(&mut self) -> Result<(), QueueError>;

    /// Release the held message for immediate redelivery.
    async fn nack(&mut self) -> Result<(), QueueError>;

    async fn close(&mut self) -> Result<(), QueueError>;
}

/// Subscriber timing knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberOptions {
    /// Wait between pulls while the queue is empty.
    pub empty_backoff: Duration,
    /// Deadline requested on each extension (Pub/Sub only; the memory broker
    /// uses its own deadline).
    pub ack_deadline: Duration,
    pub extend_interval: Duration,
    /// Consecutive transient pull failures tolerated before giving up.
    pub max_transport_retries: u32,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            empty_backoff: Duration::from_secs(10),
            ack_deadline: Duration::from_secs(600),
            extend_interval: Duration::from_secs(120),
            max_transport_retries: 5,
        }
    }
}

/// Which transport backs the queue.
#[derive(Clone)]
pub enum QueueBackend {
    PubSub(PubSubClient),
    Memory(MemoryBroker),
}

impl QueueBackend {
    /// Select a cross-process backend from `REPO_CRON_QUEUE_BACKEND`.
    ///
    /// `memory` is refused: a broker private to one controller or worker
    /// process would accept shards that no other process can ever pull.
    pub fn from_env() -> Result<Self, QueueError> {
        match std::env::var(QUEUE_BACKEND_ENV).as_deref() {
            Err(_) | Ok("") | Ok("pubsub") => Ok(Self::PubSub(PubSubClient::from_env())),
            Ok("memory") => Err(QueueError::ProcessLocalBackend),
            Ok(other) => Err(QueueError::UnknownBackend(other.to_string())),
        }
    }
}

fn check_memory_url(url: &str) -> Result<(), QueueError> {
    match url.strip_prefix(MEMORY_SCHEME) {
        Some(name) if !name.is_empty() => Ok(()),
        _ => Err(QueueError::InvalidUrl {
            url: url.to_string(),
            reason: format!("expected {MEMORY_SCHEME}<name>"),
        }),
    }
}

pub fn new_publisher(backend: &QueueBackend, topic_url: &str) -> Result<Box<dyn Publisher>, QueueError> {
    match backend {
        QueueBackend::PubSub(client) => Ok(Box::new(TopicPublisher::new(PubSubSink::new(
            client.clone(),
            topic_url,
        )?))),
        QueueBackend::Memory(broker) => {
            check_memory_url(topic_url)?;
            Ok(Box::new(TopicPublisher::new(broker.clone())))
        }
    }
}

pub fn new_subscriber(
    backend: &QueueBackend,
    subscription_url: &str,
    options: SubscriberOptions,
) -> Result<Box<dyn Subscriber>, QueueError> {
    match backend {
        QueueBackend::PubSub(client) => Ok(Box::new(PubSubSubscriber::new(
            client.clone(),
            subscription_url,
            options,
        )?)),
        QueueBackend::Memory(broker) => {
            check_memory_url(subscription_url)?;
            Ok(Box::new(MemorySubscriber::new(broker.clone(), options)))
        }
    }
}

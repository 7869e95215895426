//! In-process broker with at-least-once semantics.
//!
//! Messages are leased to one subscriber at a time. A lease expires after the
//! ack deadline unless it is extended; expired and nacked leases go back to
//! the ready queue. A message released after its last allowed delivery
//! attempt is moved to the dead-letter list instead. Once
//! [`MemoryBroker::close`] has been called and every message has been
//! acknowledged or dead-lettered, pulls return `Ok(None)`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::deadline::DeadlineExtender;
use super::publisher::MessageSink;
use super::{QueueError, Subscriber, SubscriberOptions};
use crate::data::BatchRequest;

/// Counters describing what the broker has seen so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub ready: usize,
    pub leased: usize,
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub expired: u64,
    pub dead_lettered: u64,
}

/// Delivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

struct Envelope {
    id: u64,
    payload: Vec<u8>,
    attempts: u32,
}

struct Lease {
    envelope: Envelope,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Envelope>,
    leased: HashMap<String, Lease>,
    dead_letters: Vec<Envelope>,
    closed: bool,
    next_id: u64,
    stats: BrokerStats,
}

enum Receive {
    Message { ack_id: String, payload: Vec<u8> },
    Empty,
    Drained,
}

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    ack_deadline: Duration,
    max_delivery_attempts: u32,
}

impl MemoryBroker {
    pub fn new(ack_deadline: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            ack_deadline,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
        }
    }

    /// Dead-letter a message once it has been delivered `attempts` times
    /// without an ack. Zero is treated as one.
    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts.max(1);
        self
    }

    pub fn ack_deadline(&self) -> Duration {
        self.ack_deadline
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // a poisoned lock only means another thread panicked mid-update of counters
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn publish(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.stats.published += 1;
        state.ready.push_back(Envelope {
            id,
            payload,
            attempts: 0,
        });
        Ok(())
    }

    /// Stop accepting messages. Subscribers see `Ok(None)` once drained.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn stats(&self) -> BrokerStats {
        let mut state = self.lock();
        self.reclaim_expired(&mut state, Instant::now());
        let mut stats = state.stats.clone();
        stats.ready = state.ready.len();
        stats.leased = state.leased.len();
        stats
    }

    /// Payloads of every dead-lettered message, oldest first.
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.lock().dead_letters.iter().map(|e| e.payload.clone()).collect()
    }

    /// Put a released message back on the ready queue, or dead-letter it if
    /// it has used up its delivery attempts.
    fn requeue(&self, state: &mut State, envelope: Envelope) {
        if envelope.attempts >= self.max_delivery_attempts {
            error!(
                message_id = envelope.id,
                attempts = envelope.attempts,
                "Message exhausted its delivery attempts, dead-lettering it"
            );
            state.stats.dead_lettered += 1;
            state.dead_letters.push(envelope);
        } else {
            state.ready.push_back(envelope);
        }
    }

    fn reclaim_expired(&self, state: &mut State, now: Instant) {
        let expired: Vec<String> = state
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();
        for ack_id in expired {
            if let Some(lease) = state.leased.remove(&ack_id) {
                warn!(message_id = lease.envelope.id, "Lease expired, message will be redelivered");
                state.stats.expired += 1;
                self.requeue(state, lease.envelope);
            }
        }
    }

    fn receive(&self) -> Receive {
        let now = Instant::now();
        let mut state = self.lock();
        self.reclaim_expired(&mut state, now);
        match state.ready.pop_front() {
            Some(mut envelope) => {
                envelope.attempts += 1;
                let ack_id = uuid::Uuid::new_v4().to_string();
                let payload = envelope.payload.clone();
                debug!(message_id = envelope.id, attempt = envelope.attempts, "Leasing message");
                state.stats.delivered += 1;
                state.leased.insert(
                    ack_id.clone(),
                    Lease {
                        envelope,
                        expires_at: now + self.ack_deadline,
                    },
                );
                Receive::Message { ack_id, payload }
            }
            None if state.closed && state.leased.is_empty() => Receive::Drained,
            None => Receive::Empty,
        }
    }

    fn ack(&self, ack_id: &str) {
        let mut state = self.lock();
        if state.leased.remove(ack_id).is_some() {
            state.stats.acked += 1;
        } else {
            debug!(ack_id, "Ack for a lease that no longer exists");
        }
    }

    /// Move the lease deadline to `now + deadline`; zero releases it.
    fn modify_deadline(&self, ack_id: &str, deadline: Duration) -> Result<(), QueueError> {
        let mut state = self.lock();
        if deadline.is_zero() {
            if let Some(lease) = state.leased.remove(ack_id) {
                state.stats.nacked += 1;
                self.requeue(&mut state, lease.envelope);
            }
            return Ok(());
        }
        match state.leased.get_mut(ack_id) {
            Some(lease) => {
                lease.expires_at = Instant::now() + deadline;
                Ok(())
            }
            None => Err(QueueError::NoMessageHeld),
        }
    }
}

#[async_trait]
impl MessageSink for MemoryBroker {
    async fn send(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        self.publish(payload)
    }
}

struct Held {
    ack_id: String,
    extender: DeadlineExtender,
}

pub struct MemorySubscriber {
    broker: MemoryBroker,
    options: SubscriberOptions,
    held: Option<Held>,
}

impl MemorySubscriber {
    pub fn new(broker: MemoryBroker, options: SubscriberOptions) -> Self {
        Self {
            broker,
            options,
            held: None,
        }
    }

    fn hold(&mut self, ack_id: String) {
        let broker = self.broker.clone();
        let id = ack_id.clone();
        let deadline = broker.ack_deadline();
        let extender = DeadlineExtender::spawn(self.options.extend_interval, move || {
            let broker = broker.clone();
            let id = id.clone();
            async move { broker.modify_deadline(&id, deadline) }
        });
        self.held = Some(Held { ack_id, extender });
    }

    async fn release(&mut self) -> Result<String, QueueError> {
        let held = self.held.take().ok_or(QueueError::NoMessageHeld)?;
        held.extender.stop().await;
        Ok(held.ack_id)
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn synchronous_pull(&mut self) -> Result<Option<BatchRequest>, QueueError> {
        if self.held.is_some() {
            return Err(QueueError::MessageHeld);
        }
        loop {
            match self.broker.receive() {
                Receive::Message { ack_id, payload } => match BatchRequest::decode(&payload) {
                    Ok(request) => {
                        self.hold(ack_id);
                        return Ok(Some(request));
                    }
                    Err(e) => {
                        error!(error = %e, "Dropping message that cannot be decoded");
                        self.broker.ack(&ack_id);
                    }
                },
                Receive::Empty => tokio::time::sleep(self.options.empty_backoff).await,
                Receive::Drained => return Ok(None),
            }
        }
    }

    async fn ack(&mut self) -> Result<(), QueueError> {
        let ack_id = self.release().await?;
        self.broker.ack(&ack_id);
        Ok(())
    }

    async fn nack(&mut self) -> Result<(), QueueError> {
        let ack_id = self.release().await?;
        self.broker.modify_deadline(&ack_id, Duration::ZERO)
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        if self.held.is_some() {
            warn!("Closing subscriber with a held message, releasing it");
            self.nack().await?;
        }
        Ok(())
    }
}

//! Event queue boundary: envelope, publisher, and an in-process queue with a consumer loop.
//!
//! Delivery is at-least-once. The consumer runs up to `maxInFlight` deliveries as their own
//! tasks, acknowledges handled and dropped outcomes, redelivers failures after a growing delay,
//! and dead-letters a delivery once its redeliveries are used up or shutdown cuts it off.

use crate::config::QueueConfig;
use crate::router::{DispatchOutcome, Router};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;

/// Event payload: opaque key/value map whose shape depends on the event name.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Unit carried on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(alias = "event")]
    pub event_name: String,
    #[serde(default, alias = "object")]
    pub payload: Payload,
}

impl EventEnvelope {
    pub fn new(event_name: impl Into<String>, payload: Payload) -> Self {
        Self {
            event_name: event_name.into(),
            payload,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue {0} is closed")]
    Closed(String),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), QueueError>;
}

/// One delivery of an envelope; `attempt` is 0 for the first delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: EventEnvelope,
    pub attempt: u32,
}

/// In-process queue named by exchange and routing key.
#[derive(Clone)]
pub struct MemoryQueue {
    tx: mpsc::Sender<Delivery>,
    name: Arc<str>,
}

impl MemoryQueue {
    pub fn new(config: &QueueConfig) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let name: Arc<str> = format!("{}/{}", config.exchange, config.routing_key).into();
        (Self { tx, name }, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl EventPublisher for MemoryQueue {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), QueueError> {
        log::debug!("queue: publishing {} to {}", envelope.event_name, self.name);
        self.tx
            .send(Delivery { envelope, attempt: 0 })
            .await
            .map_err(|_| QueueError::Closed(self.name.to_string()))
    }
}

/// A delivery that failed on every attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub envelope: EventEnvelope,
    pub attempts: u32,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Shared list of dead-lettered deliveries.
#[derive(Clone, Default)]
pub struct DeadLetters {
    inner: Arc<RwLock<Vec<DeadLetter>>>,
}

impl DeadLetters {
    pub async fn push(&self, letter: DeadLetter) {
        self.inner.write().await.push(letter);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn list(&self) -> Vec<DeadLetter> {
        self.inner.read().await.clone()
    }
}

/// How the consumer retries, how much it runs at once, and how long shutdown may take.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerPolicy {
    pub max_redeliveries: u32,
    /// Backoff unit; the n-th redelivery waits `delay * n`.
    pub delay: Duration,
    pub max_in_flight: usize,
    pub drain_timeout: Duration,
}

impl From<&QueueConfig> for ConsumerPolicy {
    fn from(c: &QueueConfig) -> Self {
        Self {
            max_redeliveries: c.max_redeliveries,
            delay: c.redelivery_delay(),
            max_in_flight: c.max_in_flight.max(1),
            drain_timeout: c.drain_timeout(),
        }
    }
}

/// Consumes deliveries and dispatches them through the router.
pub struct Consumer {
    router: Arc<Router>,
    queue: MemoryQueue,
    policy: ConsumerPolicy,
    dead_letters: DeadLetters,
    /// Deliveries currently running, so the ones cut off by shutdown can be dead-lettered.
    running: Mutex<HashMap<u64, Delivery>>,
    next_seq: AtomicU64,
}

impl Consumer {
    pub fn new(router: Arc<Router>, queue: MemoryQueue, policy: ConsumerPolicy, dead_letters: DeadLetters) -> Self {
        Self {
            router,
            queue,
            policy,
            dead_letters,
            running: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Run until `shutdown` completes, then drain: keep handling what is in flight and what it
    /// publishes until the queue is empty or the drain timeout passes. Whatever is still
    /// running or queued after that is dead-lettered.
    pub async fn run(self, mut rx: mpsc::Receiver<Delivery>, shutdown: impl Future<Output = ()>) {
        let this = Arc::new(self);
        let permits = Arc::new(Semaphore::new(this.policy.max_in_flight.max(1)));
        let mut in_flight = JoinSet::new();
        tokio::pin!(shutdown);
        log::info!(
            "queue: consumer started on {} (max {} in flight)",
            this.queue.name(),
            this.policy.max_in_flight
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                next = next_delivery(&mut rx, &permits) => {
                    let Some((delivery, permit)) = next else { break };
                    this.spawn(&mut in_flight, delivery, permit);
                }
            }
        }

        log::info!("queue: draining {} in-flight deliver(ies)", in_flight.len());
        let deadline = tokio::time::sleep(this.policy.drain_timeout);
        tokio::pin!(deadline);
        while !(in_flight.is_empty() && rx.is_empty()) {
            tokio::select! {
                _ = &mut deadline => {
                    log::warn!(
                        "queue: drain timed out with {} running and {} queued",
                        in_flight.len(),
                        rx.len()
                    );
                    break;
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                next = next_delivery(&mut rx, &permits) => {
                    let Some((delivery, permit)) = next else { break };
                    this.spawn(&mut in_flight, delivery, permit);
                }
            }
        }

        rx.close();
        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}
        let interrupted: Vec<Delivery> = this.running_slots().drain().map(|(_, d)| d).collect();
        for delivery in interrupted {
            this.dead_letter(delivery.envelope, delivery.attempt + 1, "interrupted by shutdown".to_string())
                .await;
        }
        while let Ok(delivery) = rx.try_recv() {
            this.dead_letter(delivery.envelope, delivery.attempt, "not delivered before shutdown".to_string())
                .await;
        }
        log::info!("queue: consumer stopped");
    }

    fn running_slots(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Delivery>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(self: &Arc<Self>, in_flight: &mut JoinSet<()>, delivery: Delivery, permit: OwnedSemaphorePermit) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.running_slots().insert(seq, delivery.clone());
        let consumer = Arc::clone(self);
        in_flight.spawn(async move {
            consumer.process(delivery).await;
            consumer.running_slots().remove(&seq);
            drop(permit);
        });
    }

    /// Dispatch until the delivery is handled or dropped, waiting `delay * n` before the n-th
    /// redelivery, and dead-letter it once the redeliveries are used up.
    async fn process(&self, delivery: Delivery) {
        let Delivery { envelope, mut attempt } = delivery;
        loop {
            let outcome = match self.router.spawn_dispatch(envelope.clone()).await {
                Ok(outcome) => outcome,
                Err(e) => DispatchOutcome::Failed(format!("dispatch task failed: {}", e)),
            };
            let DispatchOutcome::Failed(error) = outcome else {
                log::debug!("queue: {} acknowledged ({:?})", envelope.event_name, outcome);
                return;
            };
            if attempt >= self.policy.max_redeliveries {
                self.dead_letter(envelope, attempt + 1, error).await;
                return;
            }
            attempt += 1;
            log::warn!(
                "queue: {} failed (attempt {}), redelivering: {}",
                envelope.event_name,
                attempt,
                error
            );
            tokio::time::sleep(self.policy.delay * attempt).await;
        }
    }

    async fn dead_letter(&self, envelope: EventEnvelope, attempts: u32, error: String) {
        log::error!(
            "queue: {} dead-lettered after {} attempt(s): {}",
            envelope.event_name,
            attempts,
            error
        );
        self.dead_letters
            .push(DeadLetter {
                envelope,
                attempts,
                error,
                at: Utc::now(),
            })
            .await;
    }
}

/// Wait for a free slot, then for the next delivery.
async fn next_delivery(
    rx: &mut mpsc::Receiver<Delivery>,
    permits: &Arc<Semaphore>,
) -> Option<(Delivery, OwnedSemaphorePermit)> {
    let permit = Arc::clone(permits).acquire_owned().await.ok()?;
    let delivery = rx.recv().await?;
    Some((delivery, permit))
}

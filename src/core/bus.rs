use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::core::error::SagaError;

pub const TOPIC_QUERY_INITIATED: &str = "q.initiated";
pub const TOPIC_QUERY_GENERATED: &str = "q.generated";
pub const TOPIC_QUERY_EXECUTED: &str = "q.executed";
pub const TOPIC_KB_INGEST: &str = "kb.ingest";

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One delivered message. `attempt` starts at 1 and grows on every
/// redelivery; `receipt` identifies the in-flight hold for ack/nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Value,
    pub attempt: u32,
    receipt: u64,
}

/// Topic-based fan-out with durable per-topic queues and at-least-once
/// delivery. Consumers must ack; an unacked message becomes visible again
/// after the visibility timeout.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), SagaError>;
    async fn subscribe(&self, topic: &str) -> Box<dyn TopicConsumer>;
}

#[async_trait]
pub trait TopicConsumer: Send {
    /// Next visible message; `None` once the bus shuts down.
    async fn next(&mut self) -> Option<Delivery>;
    async fn ack(&mut self, delivery: &Delivery);
    /// Return the message to the queue after `delay`.
    async fn nack(&mut self, delivery: &Delivery, delay: Duration);
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    payload: Value,
    attempt: u32,
}

#[derive(Default)]
struct TopicQueues {
    ready: VecDeque<QueuedMessage>,
    delayed: Vec<(Instant, QueuedMessage)>,
    inflight: HashMap<u64, (Instant, QueuedMessage)>,
    next_receipt: u64,
}

impl TopicQueues {
    /// Promote due delayed messages and expired in-flight holds.
    fn promote(&mut self, now: Instant) {
        let mut due = Vec::new();
        self.delayed.retain(|(at, msg)| {
            if *at <= now {
                due.push(msg.clone());
                false
            } else {
                true
            }
        });
        for msg in due {
            self.ready.push_back(msg);
        }

        let expired: Vec<u64> = self
            .inflight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some((_, mut msg)) = self.inflight.remove(&receipt) {
                msg.attempt += 1;
                self.ready.push_back(msg);
            }
        }
    }
}

struct Topic {
    queues: Mutex<TopicQueues>,
    notify: Notify,
}

/// In-process broker. Worker pools in the same process share each topic's
/// queue, so a message is handed to exactly one consumer at a time; external
/// brokers can implement `MessageBus` with the same contract.
pub struct InProcessBus {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    visibility_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            visibility_timeout,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn topic(&self, name: &str) -> Arc<Topic> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Topic {
                    queues: Mutex::new(TopicQueues::default()),
                    notify: Notify::new(),
                })
            })
            .clone()
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), SagaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SagaError::BusUnavailable("bus is shut down".to_string()));
        }
        let topic = self.topic(topic).await;
        {
            let mut queues = topic.queues.lock().await;
            queues.ready.push_back(QueuedMessage {
                payload,
                attempt: 0,
            });
        }
        topic.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Box<dyn TopicConsumer> {
        debug!(topic, "subscribing consumer");
        Box::new(InProcessConsumer {
            topic: self.topic(topic).await,
            visibility_timeout: self.visibility_timeout,
            closed: self.closed.clone(),
        })
    }
}

struct InProcessConsumer {
    topic: Arc<Topic>,
    visibility_timeout: Duration,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TopicConsumer for InProcessConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            {
                let now = Instant::now();
                let mut queues = self.topic.queues.lock().await;
                queues.promote(now);
                if let Some(mut msg) = queues.ready.pop_front() {
                    msg.attempt += 1;
                    queues.next_receipt += 1;
                    let receipt = queues.next_receipt;
                    queues
                        .inflight
                        .insert(receipt, (now + self.visibility_timeout, msg.clone()));
                    return Some(Delivery {
                        payload: msg.payload,
                        attempt: msg.attempt,
                        receipt,
                    });
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            let _ = tokio::time::timeout(POLL_INTERVAL, self.topic.notify.notified()).await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) {
        let mut queues = self.topic.queues.lock().await;
        queues.inflight.remove(&delivery.receipt);
    }

    async fn nack(&mut self, delivery: &Delivery, delay: Duration) {
        let mut queues = self.topic.queues.lock().await;
        if let Some((_, mut msg)) = queues.inflight.remove(&delivery.receipt) {
            msg.attempt += 1;
            queues.delayed.push((Instant::now() + delay, msg));
        }
    }
}

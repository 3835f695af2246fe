//! Key-scoped publish/subscribe for attempt outcomes.
//!
//! Every key has two derived topics, `key:result` and `key:error`. Topics
//! exist only while something is subscribed to them: the first
//! subscription creates the registry entry and the last one to detach
//! removes it.
//!
//! # Delivery
//!
//! ```text
//! publish(topic, event)
//!   ├─ one-shot: every live `Once` on the topic, non-blocking, then detached
//!   └─ repeatable: every live `Subscription`, each bounded by `grace`
//! ```
//!
//! Publishing never waits longer than `grace` on any one subscriber. A
//! subscriber that cannot take the event in time loses that event only.
//! With no subscribers registered the event is dropped; there is no replay.
//!
//! A `Once` bound to an attempt ignores events from other attempts of the
//! same key and stays registered until its own attempt is published.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::config::RunnerConfig;
use crate::error::AppError;
use crate::models::{AttemptId, Event, Topic};

type SubscriptionId = u64;

/// Per-publish delivery accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Subscribers that accepted the event.
    pub delivered: usize,
    /// Repeatable subscribers skipped because they stayed full past the grace period.
    pub abandoned: usize,
}

impl Delivery {
    /// True if nobody received the event.
    pub fn is_dropped(&self) -> bool {
        self.delivered == 0
    }
}

struct TopicEntry<R> {
    repeatable: Vec<(SubscriptionId, mpsc::Sender<Event<R>>)>,
    /// One-shot waiters in registration order.
    once: VecDeque<SubscriptionId>,
}

impl<R> TopicEntry<R> {
    fn new() -> Self {
        Self {
            repeatable: Vec::new(),
            once: VecDeque::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.repeatable.is_empty() && self.once.is_empty()
    }

    fn forget(&mut self, id: SubscriptionId) {
        self.repeatable.retain(|(sub, _)| *sub != id);
        self.once.retain(|sub| *sub != id);
    }
}

struct OnceSlot<R> {
    sender: oneshot::Sender<Event<R>>,
    topics: Vec<Topic>,
    attempt: Option<AttemptId>,
}

impl<R> OnceSlot<R> {
    fn accepts(&self, event: &Event<R>) -> bool {
        self.attempt.is_none_or(|attempt| attempt == event.attempt)
    }
}

struct Registry<R> {
    topics: HashMap<Topic, TopicEntry<R>>,
    once: HashMap<SubscriptionId, OnceSlot<R>>,
}

impl<R> Registry<R> {
    /// Removes `id` from the given topics, dropping entries left empty.
    fn detach(&mut self, id: SubscriptionId, topics: &[Topic]) {
        self.once.remove(&id);
        for topic in topics {
            if let Some(entry) = self.topics.get_mut(topic) {
                entry.forget(id);
                if entry.is_empty() {
                    self.topics.remove(topic);
                }
            }
        }
    }
}

struct Shared<R> {
    registry: Mutex<Registry<R>>,
    next_id: AtomicU64,
}

impl<R> Shared<R> {
    /// Acquires the registry lock, recovering from poison if necessary.
    fn lock(&self) -> MutexGuard<'_, Registry<R>> {
        self.registry.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned event bus registry");
            poisoned.into_inner()
        })
    }
}

/// Keyed publish/subscribe bus owned by a runner.
pub struct EventBus<R> {
    shared: Arc<Shared<R>>,
    grace: Duration,
    capacity: usize,
}

impl<R> Clone for EventBus<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            grace: self.grace,
            capacity: self.capacity,
        }
    }
}

impl<R: Clone + Send + 'static> EventBus<R> {
    /// Create a bus with the given per-subscriber grace period and
    /// repeatable-subscription buffer size.
    pub fn new(grace: Duration, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    topics: HashMap::new(),
                    once: HashMap::new(),
                }),
                next_id: AtomicU64::new(1),
            }),
            grace,
            capacity: capacity.max(1),
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.publish_grace, config.subscriber_capacity)
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    fn next_id(&self) -> SubscriptionId {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribe to every future event on `topics`.
    pub fn subscribe(&self, topics: impl IntoIterator<Item = Topic>) -> Subscription<R> {
        let id = self.next_id();
        let topics = dedup(topics);
        let (sender, receiver) = mpsc::channel(self.capacity);

        {
            let mut registry = self.shared.lock();
            for topic in &topics {
                registry
                    .topics
                    .entry(topic.clone())
                    .or_insert_with(TopicEntry::new)
                    .repeatable
                    .push((id, sender.clone()));
            }
        }

        Subscription {
            id,
            topics,
            receiver,
            bus: Arc::downgrade(&self.shared),
        }
    }

    /// Subscribe to the next single event on any of `topics`.
    pub fn subscribe_once(&self, topics: impl IntoIterator<Item = Topic>) -> Once<R> {
        self.register_once(topics, None)
    }

    /// Subscribe to the event of one specific attempt on any of `topics`.
    pub fn subscribe_attempt(
        &self,
        topics: impl IntoIterator<Item = Topic>,
        attempt: AttemptId,
    ) -> Once<R> {
        self.register_once(topics, Some(attempt))
    }

    fn register_once(
        &self,
        topics: impl IntoIterator<Item = Topic>,
        attempt: Option<AttemptId>,
    ) -> Once<R> {
        let id = self.next_id();
        let topics = dedup(topics);
        let (sender, receiver) = oneshot::channel();

        {
            let mut registry = self.shared.lock();
            for topic in &topics {
                registry
                    .topics
                    .entry(topic.clone())
                    .or_insert_with(TopicEntry::new)
                    .once
                    .push_back(id);
            }
            if !topics.is_empty() {
                registry.once.insert(
                    id,
                    OnceSlot {
                        sender,
                        topics: topics.clone(),
                        attempt,
                    },
                );
            }
        }

        Once {
            id,
            topics,
            attempt,
            receiver: Some(receiver),
            bus: Arc::downgrade(&self.shared),
        }
    }

    /// Deliver `event` to the subscribers currently registered on `topic`.
    ///
    /// The registry lock is released before any wait on a slow subscriber.
    pub async fn publish(&self, topic: &Topic, event: Event<R>) -> Delivery {
        let mut delivery = Delivery::default();

        let targets = {
            let mut guard = self.shared.lock();
            let registry = &mut *guard;

            let Some(entry) = registry.topics.get_mut(topic) else {
                return delivery;
            };

            entry.repeatable.retain(|(_, sender)| !sender.is_closed());
            let targets: Vec<_> = entry
                .repeatable
                .iter()
                .map(|(_, sender)| sender.clone())
                .collect();

            let claimed: Vec<_> = entry
                .once
                .iter()
                .copied()
                .filter(|id| {
                    registry
                        .once
                        .get(id)
                        .is_some_and(|slot| slot.accepts(&event))
                })
                .collect();

            for id in claimed {
                let Some(slot) = registry.once.remove(&id) else {
                    continue;
                };
                registry.detach(id, &slot.topics);
                if slot.sender.send(event.clone()).is_ok() {
                    delivery.delivered += 1;
                }
            }

            if registry.topics.get(topic).is_some_and(TopicEntry::is_empty) {
                registry.topics.remove(topic);
            }
            targets
        };

        for sender in targets {
            match sender.try_send(event.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(event)) => {
                    if self.grace.is_zero() {
                        delivery.abandoned += 1;
                        continue;
                    }
                    match tokio::time::timeout(self.grace, sender.send(event)).await {
                        Ok(Ok(())) => delivery.delivered += 1,
                        Ok(Err(_)) => {}
                        Err(_) => delivery.abandoned += 1,
                    }
                }
            }
        }

        delivery
    }

    /// Live subscriptions (repeatable and one-shot) registered on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        let registry = self.shared.lock();
        registry.topics.get(topic).map_or(0, |entry| {
            entry
                .repeatable
                .iter()
                .filter(|(_, sender)| !sender.is_closed())
                .count()
                + entry
                    .once
                    .iter()
                    .filter(|id| registry.once.contains_key(*id))
                    .count()
        })
    }

    /// Number of topics with at least one registration.
    pub fn topic_count(&self) -> usize {
        self.shared.lock().topics.len()
    }
}

fn dedup(topics: impl IntoIterator<Item = Topic>) -> Vec<Topic> {
    let mut out: Vec<Topic> = Vec::new();
    for topic in topics {
        if !out.contains(&topic) {
            out.push(topic);
        }
    }
    out
}

/// Repeatable subscription. Yields every event published on its topics
/// until dropped.
///
/// Implements [`Stream`]; the stream ends once the owning bus is gone.
pub struct Subscription<R> {
    id: SubscriptionId,
    topics: Vec<Topic>,
    receiver: mpsc::Receiver<Event<R>>,
    bus: Weak<Shared<R>>,
}

impl<R> Subscription<R> {
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Wait for the next event. `None` once the bus has been dropped.
    pub async fn recv(&mut self) -> Option<Event<R>> {
        self.receiver.recv().await
    }

    /// Wait for the next event, giving up after `deadline`.
    pub async fn recv_timeout(&mut self, deadline: Duration) -> Result<Event<R>, AppError> {
        match tokio::time::timeout(deadline, self.receiver.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(AppError::SubscriptionClosed),
            Err(_) => Err(AppError::WaitTimeout(deadline)),
        }
    }

    /// Blocking variant of [`recv`](Self::recv) for non-async threads.
    ///
    /// Panics if called from within an async execution context.
    pub fn blocking_recv(&mut self) -> Option<Event<R>> {
        self.receiver.blocking_recv()
    }

    /// Detach from the bus. Buffered events are discarded.
    pub fn unsubscribe(self) {}
}

impl<R> Stream for Subscription<R> {
    type Item = Event<R>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl<R> Drop for Subscription<R> {
    fn drop(&mut self) {
        if let Some(shared) = self.bus.upgrade() {
            shared.lock().detach(self.id, &self.topics);
        }
    }
}

/// One-shot subscription. Receives exactly one event from any of its
/// topics, then is detached from all of them.
pub struct Once<R> {
    id: SubscriptionId,
    topics: Vec<Topic>,
    attempt: Option<AttemptId>,
    receiver: Option<oneshot::Receiver<Event<R>>>,
    bus: Weak<Shared<R>>,
}

impl<R> Once<R> {
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// The attempt this subscription is bound to, if any.
    pub fn attempt(&self) -> Option<AttemptId> {
        self.attempt
    }

    fn take_receiver(&mut self) -> Result<oneshot::Receiver<Event<R>>, AppError> {
        self.receiver.take().ok_or(AppError::SubscriptionClosed)
    }

    /// Wait for the event.
    pub async fn recv(mut self) -> Result<Event<R>, AppError> {
        self.take_receiver()?
            .await
            .map_err(|_| AppError::SubscriptionClosed)
    }

    /// Wait for the event, giving up after `deadline`. The subscription is
    /// detached either way.
    pub async fn recv_timeout(mut self, deadline: Duration) -> Result<Event<R>, AppError> {
        match tokio::time::timeout(deadline, self.take_receiver()?).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(AppError::SubscriptionClosed),
            Err(_) => Err(AppError::WaitTimeout(deadline)),
        }
    }

    /// Blocking variant of [`recv`](Self::recv) for non-async threads.
    ///
    /// Panics if called from within an async execution context.
    pub fn blocking_recv(mut self) -> Result<Event<R>, AppError> {
        self.take_receiver()?
            .blocking_recv()
            .map_err(|_| AppError::SubscriptionClosed)
    }
}

impl<R> Drop for Once<R> {
    fn drop(&mut self) {
        if let Some(shared) = self.bus.upgrade() {
            shared.lock().detach(self.id, &self.topics);
        }
    }
}

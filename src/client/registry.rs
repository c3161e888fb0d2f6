use std::collections::HashMap;
use std::sync::Arc;
use log::debug;

use crate::client::broker::PortSender;
use crate::client::topic::{Payload, Topic};

/// Where a cached value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Live,
    Backfilled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedValue {
    pub payload: Payload,
    pub source: ValueSource,
}

pub type Callback = Arc<dyn Fn(&Topic, &CachedValue) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receives the subscribe/unsubscribe intents the registry issues.
pub trait SubscriptionSink: Send + Sync {
    fn subscribe(&self, topic: &Topic);
    fn unsubscribe(&self, topic: &Topic);
}

impl SubscriptionSink for PortSender {
    fn subscribe(&self, topic: &Topic) {
        PortSender::subscribe(self, topic.clone());
    }

    fn unsubscribe(&self, topic: &Topic) {
        PortSender::unsubscribe(self, topic.clone());
    }
}

/// A callback invocation, run by the caller once the registry is no longer borrowed.
pub struct Delivery {
    callback: Callback,
    topic: Topic,
    value: CachedValue,
}

impl Delivery {
    pub fn run(self) {
        (self.callback)(&self.topic, &self.value);
    }
}

pub fn run_all(deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        delivery.run();
    }
}

struct Subscription {
    refcount: usize,
    callbacks: HashMap<SubscriptionId, Callback>,
}

/// Ref-counted topic table. The first registration for a topic subscribes it,
/// the last deregistration unsubscribes it.
pub struct SubscriptionRegistry {
    sink: Arc<dyn SubscriptionSink>,
    subscriptions: HashMap<Topic, Subscription>,
    cache: HashMap<Topic, CachedValue>,
    owners: HashMap<SubscriptionId, Topic>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new(sink: Arc<dyn SubscriptionSink>) -> Self {
        Self {
            sink,
            subscriptions: HashMap::new(),
            cache: HashMap::new(),
            owners: HashMap::new(),
            next_id: 1,
        }
    }

    /// Registers a callback. Returns the id and, when a value is already
    /// cached, the delivery that hands it to the new callback.
    pub fn register(&mut self, topic: Topic, callback: Callback) -> (SubscriptionId, Option<Delivery>) {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        let subscription = self.subscriptions.entry(topic.clone()).or_insert_with(|| Subscription {
            refcount: 0,
            callbacks: HashMap::new(),
        });
        subscription.refcount += 1;
        subscription.callbacks.insert(id, callback.clone());
        if subscription.refcount == 1 {
            debug!("First subscriber for {}", topic);
            self.sink.subscribe(&topic);
        }
        self.owners.insert(id, topic.clone());

        let immediate = self.cache.get(&topic).map(|value| Delivery {
            callback,
            topic,
            value: *value,
        });
        (id, immediate)
    }

    /// Returns false for an unknown id.
    pub fn deregister(&mut self, id: SubscriptionId) -> bool {
        let Some(topic) = self.owners.remove(&id) else {
            return false;
        };
        let Some(subscription) = self.subscriptions.get_mut(&topic) else {
            return false;
        };

        subscription.callbacks.remove(&id);
        subscription.refcount = subscription.refcount.saturating_sub(1);
        if subscription.refcount == 0 {
            debug!("Last subscriber left {}", topic);
            self.subscriptions.remove(&topic);
            self.cache.remove(&topic);
            self.sink.unsubscribe(&topic);
        }
        true
    }

    /// Caches a pushed value and fans it out. Unsubscribed topics are ignored.
    pub fn deliver_live(&mut self, topic: &Topic, payload: Payload) -> Vec<Delivery> {
        self.store(topic, CachedValue { payload, source: ValueSource::Live })
    }

    /// Seeds a backfilled value unless something is already cached.
    pub fn seed_backfill(&mut self, topic: &Topic, payload: Payload) -> Vec<Delivery> {
        if self.cache.contains_key(topic) {
            debug!("Backfill for {} superseded by a cached value", topic);
            return Vec::new();
        }
        self.store(topic, CachedValue { payload, source: ValueSource::Backfilled })
    }

    pub fn cached(&self, topic: &Topic) -> Option<CachedValue> {
        self.cache.get(topic).copied()
    }

    pub fn refcount(&self, topic: &Topic) -> usize {
        self.subscriptions.get(topic).map(|s| s.refcount).unwrap_or(0)
    }

    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.subscriptions.keys().cloned().collect();
        topics.sort();
        topics
    }

    fn store(&mut self, topic: &Topic, value: CachedValue) -> Vec<Delivery> {
        let Some(subscription) = self.subscriptions.get(topic) else {
            return Vec::new();
        };
        self.cache.insert(topic.clone(), value);
        subscription
            .callbacks
            .values()
            .map(|callback| Delivery {
                callback: callback.clone(),
                topic: topic.clone(),
                value,
            })
            .collect()
    }
}

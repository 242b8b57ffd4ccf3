//! Topic subscription registry
//!
//! A `Topic` holds the handlers registered for one topic name. The
//! `TopicRegistry` maps names to topics and drops a topic as soon as its last
//! handler is removed, so `has_subscribers` is a plain key lookup.
//!
//! Concurrency note: the registry is owned by a `MessageBus` and only touched
//! behind its lock. Handlers are cloned out before dispatch so the lock is
//! never held while user code runs.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::broker::message::Message;
use crate::utils::HandlerResult;

pub type SubscriberId = String;

/// A subscriber callback. Receives the payload and the full envelope.
pub type Handler = Arc<dyn Fn(Value, Message) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Box an async closure into a `Handler`.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Value, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(
        move |payload: Value, message: Message| -> BoxFuture<'static, HandlerResult> {
            Box::pin(f(payload, message))
        },
    )
}

#[derive(Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashMap<SubscriberId, Handler>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self, id: SubscriberId, handler: Handler) {
        self.subscribers.insert(id, handler);
    }

    /// Returns true if the handler was present.
    pub fn unsubscribe(&mut self, id: &SubscriberId) -> bool {
        self.subscribers.remove(id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("subscribers", &self.subscribers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: HashMap<String, Topic>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler, creating the topic if needed.
    pub fn subscribe(&mut self, topic: &str, id: SubscriberId, handler: Handler) {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic))
            .subscribe(id, handler);
    }

    /// Removes one handler; the topic entry goes away with its last handler.
    pub fn unsubscribe(&mut self, topic: &str, id: &SubscriberId) -> bool {
        let Some(t) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = t.unsubscribe(id);
        if t.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Snapshot of the handlers for `topic`, empty when nobody listens.
    pub fn handlers(&self, topic: &str) -> Vec<(SubscriberId, Handler)> {
        self.topics
            .get(topic)
            .map(|t| {
                t.subscribers
                    .iter()
                    .map(|(id, h)| (id.clone(), h.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |t| t.subscribers.len())
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }
}

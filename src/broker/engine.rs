//! Bus engine
//!
//! This module contains the in-process bus responsible for:
//! - keeping the topic registry and the delivery queue
//! - stamping and enqueuing published messages, persisting the critical tier
//! - running the scheduler tick that delivers due messages, backs off when a
//!   topic has no subscriber yet, and drops expired or exhausted messages
//! - suppressing repeated idempotency keys within a configurable window
//!
//! Concurrency and usage notes:
//! - All state sits behind one `std::sync::Mutex` that is never held across
//!   an `.await`. Handlers are cloned out of the registry and run in their
//!   own tokio tasks, so a handler may publish or subscribe freely.
//! - One scheduler task per bus. Every tick starts a pass in its own task, so
//!   a pass stuck behind a slow handler never delays the next tick. Within a
//!   pass, each topic's due messages are processed in queue order and each
//!   message's handler batch is awaited (bounded by `handler_timeout_ms`)
//!   before the next message on that topic is looked at.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::AddAssign;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::correlation::PendingRequests;
use crate::broker::message::{Message, Priority, PublishOptions, QueueEntry};
use crate::broker::topic::{Handler, SubscriberId, TopicRegistry};
use crate::config::BusSettings;
use crate::persistence::{MessageStore, NoopStore};

/// Outcome counts for one scheduler pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub delivered: usize,
    pub retried: usize,
    pub expired: usize,
    pub exhausted: usize,
}

impl AddAssign for TickReport {
    fn add_assign(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.expired += other.expired;
        self.exhausted += other.exhausted;
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub by_priority: BTreeMap<Priority, usize>,
    pub topics: usize,
    pub pending_requests: usize,
}

#[derive(Debug)]
struct SeenKey {
    message_id: String,
    seen_at: i64,
}

#[derive(Debug, Default)]
struct BusState {
    queue: VecDeque<QueueEntry>,
    topics: TopicRegistry,
    /// (topic, idempotency key) -> first message published with it
    seen_keys: HashMap<(String, String), SeenKey>,
}

impl BusState {
    fn forget_stale_keys(&mut self, now: i64, window_ms: u64) {
        self.seen_keys
            .retain(|_, seen| now.saturating_sub(seen.seen_at) <= window_ms as i64);
    }
}

/// The dispatch machinery itself failed; every handler task was cancelled
/// before it could run.
#[derive(Debug)]
struct DispatchFailed;

pub struct MessageBus {
    service: String,
    settings: BusSettings,
    state: Mutex<BusState>,
    store: Arc<dyn MessageStore>,
    pub(crate) pending: Arc<PendingRequests>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    pub fn new(service: &str, settings: BusSettings, store: Arc<dyn MessageStore>) -> Arc<Self> {
        Arc::new(Self {
            service: service.to_string(),
            settings,
            state: Mutex::new(BusState::default()),
            store,
            pending: Arc::new(PendingRequests::default()),
            scheduler: Mutex::new(None),
        })
    }

    /// A bus without durable storage.
    pub fn in_memory(service: &str, settings: BusSettings) -> Arc<Self> {
        Self::new(service, settings, Arc::new(NoopStore))
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-enqueue every stored message, then start the scheduler tick.
    /// Returns the number of messages restored.
    pub async fn start(self: &Arc<Self>) -> usize {
        let restored = self.restore().await;
        self.spawn_scheduler();
        info!(
            service = %self.service,
            restored,
            tick_ms = self.settings.tick_interval_ms,
            "message bus started"
        );
        restored
    }

    /// Load durable records into the queue, immediately eligible.
    pub async fn restore(&self) -> usize {
        let messages = match self.store.load_all().await {
            Ok(messages) => messages,
            Err(e) => {
                error!(service = %self.service, error = %e, "failed to load durable messages");
                return 0;
            }
        };

        let now = chrono::Utc::now().timestamp_millis();
        let mut count = 0;
        let mut state = self.state();
        for message in messages {
            if state.queue.iter().any(|e| e.message.id == message.id) {
                continue;
            }
            count += 1;
            debug!(id = %message.id, topic = %message.topic, "restored durable message");
            state.queue.push_back(QueueEntry::new(
                message,
                now,
                self.settings.initial_backoff_ms,
            ));
        }
        count
    }

    fn spawn_scheduler(self: &Arc<Self>) {
        let bus = Arc::downgrade(self);
        let period = Duration::from_millis(self.settings.tick_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(bus) = bus.upgrade() else {
                    break;
                };
                // due entries leave the queue when a pass starts, so passes
                // never overlap on the same message
                tokio::spawn(async move {
                    bus.process_due().await;
                });
            }
        });

        let previous = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop the scheduler. Queued messages are not flushed.
    pub fn stop(&self) {
        let handle = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!(service = %self.service, queued = self.queue_len(), "message bus stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Subscribe `handler` to `topic`.
    pub fn subscribe(self: &Arc<Self>, topic: &str, handler: Handler) -> Subscription {
        let id: SubscriberId = Uuid::new_v4().to_string();
        self.state().topics.subscribe(topic, id.clone(), handler);
        debug!(topic, subscriber = %id, "subscribed");
        Subscription {
            bus: Arc::downgrade(self),
            entries: vec![(topic.to_string(), id)],
        }
    }

    pub(crate) fn unsubscribe(&self, topic: &str, id: &SubscriberId) -> bool {
        let removed = self.state().topics.unsubscribe(topic, id);
        if removed {
            debug!(topic, subscriber = %id, "unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state().topics.subscriber_count(topic)
    }

    /// Publish `payload` on `topic` as this bus's own service.
    pub async fn publish(&self, topic: &str, payload: Value, options: PublishOptions) -> String {
        let message = Message::new(topic, payload, &self.service, options);
        self.publish_message(message).await
    }

    /// Accept a fully built envelope. Returns the id the message is known by;
    /// for a suppressed duplicate that is the id of the first publish.
    pub async fn publish_message(&self, message: Message) -> String {
        let now = chrono::Utc::now().timestamp_millis();

        if let Some(key) = message.idempotency_key.clone() {
            let mut state = self.state();
            let window = self.settings.dedup_window_ms as i64;
            let slot = (message.topic.clone(), key);
            if let Some(seen) = state.seen_keys.get(&slot) {
                if now.saturating_sub(seen.seen_at) <= window {
                    debug!(
                        topic = %message.topic,
                        key = %slot.1,
                        original = %seen.message_id,
                        "duplicate idempotency key, not enqueued"
                    );
                    return seen.message_id.clone();
                }
            }
            state.seen_keys.insert(
                slot,
                SeenKey {
                    message_id: message.id.clone(),
                    seen_at: now,
                },
            );
        }

        if message.priority.is_durable() {
            self.persist(&message).await;
        }

        let id = message.id.clone();
        debug!(
            id = %id,
            topic = %message.topic,
            priority = %message.priority,
            source = %message.source,
            "message enqueued"
        );
        self.state().queue.push_back(QueueEntry::new(
            message,
            now,
            self.settings.initial_backoff_ms,
        ));
        id
    }

    async fn persist(&self, message: &Message) {
        if let Err(e) = self.store.persist(message).await {
            error!(
                id = %message.id,
                topic = %message.topic,
                error = %e,
                "failed to persist message, continuing in memory"
            );
        }
    }

    /// Terminal outcome: drop the durable record if there is one.
    async fn forget(&self, message: &Message) {
        if !message.priority.is_durable() {
            return;
        }
        if let Err(e) = self.store.remove(&message.id).await {
            error!(id = %message.id, error = %e, "failed to remove durable message");
        }
    }

    /// One scheduler pass at the current time.
    pub async fn process_due(&self) -> TickReport {
        self.process_due_at(chrono::Utc::now().timestamp_millis())
            .await
    }

    /// One scheduler pass as if the clock read `now`.
    ///
    /// Due entries are grouped by topic. Each topic's entries are handled in
    /// queue order; different topics proceed concurrently, so a slow handler
    /// only holds back its own topic.
    pub async fn process_due_at(&self, now: i64) -> TickReport {
        let mut lanes: HashMap<String, Vec<QueueEntry>> = HashMap::new();
        {
            let mut state = self.state();
            state.forget_stale_keys(now, self.settings.dedup_window_ms);
            let (due, rest): (Vec<_>, Vec<_>) =
                state.queue.drain(..).partition(|e| e.is_due(now));
            state.queue = rest.into();
            for entry in due {
                lanes
                    .entry(entry.message.topic.clone())
                    .or_default()
                    .push(entry);
            }
        }

        let passes = lanes.into_values().map(|entries| async move {
            let mut report = TickReport::default();
            for entry in entries {
                self.process_entry(entry, now, &mut report).await;
            }
            report
        });

        let mut report = TickReport::default();
        for lane in join_all(passes).await {
            report += lane;
        }
        report
    }

    async fn process_entry(&self, entry: QueueEntry, now: i64, report: &mut TickReport) {
        let message = &entry.message;
        if message.is_expired_at(now) {
            debug!(id = %message.id, topic = %message.topic, "message expired, dropping");
            self.forget(message).await;
            report.expired += 1;
            return;
        }

        let handlers = self.state().topics.handlers(&message.topic);
        if handlers.is_empty() {
            self.retry_or_drop(entry, now, report).await;
            return;
        }

        let outcome = self.dispatch(message, handlers).await;
        match outcome {
            Ok(()) => {
                self.forget(message).await;
                report.delivered += 1;
            }
            Err(DispatchFailed) => {
                warn!(id = %message.id, topic = %message.topic, "dispatch failed");
                self.retry_or_drop(entry, now, report).await;
            }
        }
    }

    async fn retry_or_drop(&self, mut entry: QueueEntry, now: i64, report: &mut TickReport) {
        if entry.message.retries_exhausted() {
            if entry.message.max_retries == 0 {
                // single-shot messages (replies) are expected to miss sometimes
                debug!(id = %entry.message.id, topic = %entry.message.topic, "no subscriber, dropping");
            } else {
                warn!(
                    id = %entry.message.id,
                    topic = %entry.message.topic,
                    attempts = entry.message.attempts,
                    "retries exhausted, dropping message"
                );
            }
            self.forget(&entry.message).await;
            report.exhausted += 1;
            return;
        }

        entry.back_off(now, self.settings.max_backoff_ms);
        debug!(
            id = %entry.message.id,
            topic = %entry.message.topic,
            attempts = entry.message.attempts,
            backoff_ms = entry.backoff_delay_ms,
            "no delivery, backing off"
        );
        if entry.message.priority.is_durable() {
            self.persist(&entry.message).await;
        }
        self.state().queue.push_back(entry);
        report.retried += 1;
    }

    async fn dispatch(
        &self,
        message: &Message,
        handlers: Vec<(SubscriberId, Handler)>,
    ) -> Result<(), DispatchFailed> {
        let total = handlers.len();
        let tasks = handlers.into_iter().map(|(id, handler)| {
            let payload = message.payload.clone();
            let envelope = message.clone();
            let task = tokio::spawn(async move { handler(payload, envelope).await });
            async move { (id, task.await) }
        });

        let budget = Duration::from_millis(self.settings.handler_timeout_ms);
        let results = match tokio::time::timeout(budget, join_all(tasks)).await {
            Ok(results) => results,
            Err(_) => {
                warn!(
                    id = %message.id,
                    topic = %message.topic,
                    "handlers still running after {}ms, leaving them detached",
                    self.settings.handler_timeout_ms
                );
                return Ok(());
            }
        };

        let mut cancelled = 0;
        for (subscriber, result) in results {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    id = %message.id,
                    topic = %message.topic,
                    %subscriber,
                    error = %e,
                    "handler failed"
                ),
                Err(e) if e.is_panic() => error!(
                    id = %message.id,
                    topic = %message.topic,
                    %subscriber,
                    "handler panicked"
                ),
                Err(_) => cancelled += 1,
            }
        }

        if cancelled == total {
            return Err(DispatchFailed);
        }
        Ok(())
    }

    pub fn queue_len(&self) -> usize {
        self.state().queue.len()
    }

    /// Snapshot of the queue in its current order.
    pub fn queued(&self) -> Vec<QueueEntry> {
        self.state().queue.iter().cloned().collect()
    }

    pub fn queued_entry(&self, id: &str) -> Option<QueueEntry> {
        self.state()
            .queue
            .iter()
            .find(|e| e.message.id == id)
            .cloned()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state();
        let mut by_priority = BTreeMap::new();
        for entry in &state.queue {
            *by_priority.entry(entry.message.priority).or_insert(0) += 1;
        }
        QueueStats {
            queued: state.queue.len(),
            by_priority,
            topics: state.topics.topic_names().len(),
            pending_requests: self.pending.len(),
        }
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        if let Some(handle) = self
            .scheduler
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("service", &self.service)
            .field("queued", &self.queue_len())
            .field("store", &self.store)
            .finish()
    }
}

/// Handle returned by `subscribe`. Registrations stay in place until
/// `unsubscribe` is called; dropping the handle does not remove them.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<MessageBus>,
    entries: Vec<(String, SubscriberId)>,
}

impl Subscription {
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(topic, _)| topic.as_str())
    }

    /// Combine two handles so one `unsubscribe` removes both.
    pub fn join(mut self, other: Subscription) -> Subscription {
        self.entries.extend(other.entries);
        self
    }

    pub fn unsubscribe(self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        for (topic, id) in &self.entries {
            bus.unsubscribe(topic, id);
        }
    }
}

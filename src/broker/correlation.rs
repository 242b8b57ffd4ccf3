//! Request/response on top of publish/subscribe
//!
//! A request subscribes to a reply topic unique to its correlation id,
//! publishes the outbound message with `_correlationId` and `_replyTo` merged
//! into the payload, and waits on a oneshot channel. The first reply wins;
//! anything arriving later finds no pending entry and is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::broker::engine::{MessageBus, Subscription};
use crate::broker::message::{merge_fields, Message, Priority, PublishOptions};
use crate::broker::topic::handler;
use crate::utils::{BusError, HandlerResult};

pub const CORRELATION_FIELD: &str = "_correlationId";
pub const REPLY_TO_FIELD: &str = "_replyTo";

/// Options for `request`. The timeout defaults to the effective TTL of the
/// outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub publish: PublishOptions,
    pub timeout_ms: Option<u64>,
}

impl RequestOptions {
    pub fn with_timeout_ms(timeout_ms: u64) -> Self {
        Self {
            publish: PublishOptions::default(),
            timeout_ms: Some(timeout_ms),
        }
    }

    pub fn publish(mut self, publish: PublishOptions) -> Self {
        self.publish = publish;
        self
    }

    pub fn effective_timeout_ms(&self) -> u64 {
        self.timeout_ms
            .unwrap_or_else(|| self.publish.effective_ttl_ms())
    }
}

/// Outstanding requests keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingRequests {
    waiting: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl PendingRequests {
    pub fn register(&self, correlation_id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(correlation_id.to_string(), tx);
        rx
    }

    /// Hand `response` to the waiting caller. Returns false when nobody is
    /// waiting any more (timed out, or already answered).
    pub fn complete(&self, correlation_id: &str, response: Value) -> bool {
        let sender = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, correlation_id: &str) {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id);
    }

    pub fn len(&self) -> usize {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn reply_topic(source: &str, correlation_id: &str) -> String {
    format!("{source}.reply.{correlation_id}")
}

/// Pull `(reply topic, correlation id)` out of a request payload.
pub fn reply_route(payload: &Value) -> Result<(&str, &str), BusError> {
    let reply_to = payload
        .get(REPLY_TO_FIELD)
        .and_then(Value::as_str)
        .ok_or(BusError::MissingCorrelation {
            field: REPLY_TO_FIELD,
        })?;
    let correlation_id = payload
        .get(CORRELATION_FIELD)
        .and_then(Value::as_str)
        .ok_or(BusError::MissingCorrelation {
            field: CORRELATION_FIELD,
        })?;
    Ok((reply_to, correlation_id))
}

/// Reply subscription and pending entry of one in-flight request.
struct WaitingRequest<'a> {
    pending: &'a PendingRequests,
    correlation_id: &'a str,
    subscription: Option<Subscription>,
}

impl Drop for WaitingRequest<'_> {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.pending.cancel(self.correlation_id);
    }
}

impl MessageBus {
    /// Publish to `destination.topic` on behalf of `source` and wait for the
    /// matching `respond`.
    pub async fn request(
        self: &Arc<Self>,
        source: &str,
        destination: &str,
        topic: &str,
        payload: Value,
        options: RequestOptions,
    ) -> Result<Value, BusError> {
        let correlation_id = Uuid::new_v4().to_string();
        let reply_to = reply_topic(source, &correlation_id);
        let timeout_ms = options.effective_timeout_ms();

        let response = self.pending.register(&correlation_id);
        let subscription = {
            let pending = Arc::clone(&self.pending);
            let correlation_id = correlation_id.clone();
            self.subscribe(
                &reply_to,
                handler(move |reply, _message| {
                    if !pending.complete(&correlation_id, reply) {
                        debug!(%correlation_id, "reply arrived with nobody waiting");
                    }
                    async { HandlerResult::Ok(()) }
                }),
            )
        };

        // released on every exit, including the caller dropping this future
        let waiting = WaitingRequest {
            pending: &self.pending,
            correlation_id: &correlation_id,
            subscription: Some(subscription),
        };

        let payload = merge_fields(
            payload,
            vec![
                (CORRELATION_FIELD, Value::String(correlation_id.clone())),
                (REPLY_TO_FIELD, Value::String(reply_to)),
            ],
        );
        let target = format!("{destination}.{topic}");
        self.publish_message(Message::new(&target, payload, source, options.publish))
            .await;

        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), response).await;
        drop(waiting);

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(BusError::ResponseDropped { correlation_id }),
            Err(_) => Err(BusError::RequestTimeout {
                destination: destination.to_string(),
                topic: topic.to_string(),
                timeout_ms,
            }),
        }
    }

    /// Answer a request received as `original`. The reply goes out at high
    /// priority and is single-shot: if the requester has already given up,
    /// it is dropped on the first tick.
    pub async fn respond(
        &self,
        source: &str,
        original: &Value,
        response: Value,
    ) -> Result<String, BusError> {
        let (reply_to, correlation_id) = reply_route(original)?;
        debug!(%correlation_id, reply_to, "responding");
        let options = PublishOptions::with_priority(Priority::High).max_retries(0);
        Ok(self
            .publish_message(Message::new(reply_to, response, source, options))
            .await)
    }
}

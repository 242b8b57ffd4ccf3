//! Message envelope and priority policy
//!
//! `Message` is the unit of transport on the bus. Its delivery budget (TTL and
//! retry count) is derived from its `Priority` when it is created and never
//! changes afterwards; the scheduler only mutates `attempts`.
//!
//! Notes on fields:
//! - `id`: UUID v4 generated at publish time
//! - `topic`: `service.topic` for direct addressing, bare name for broadcast
//! - `payload`: JSON value; call sites serialize their own typed payloads
//! - `created_at`: milliseconds since UNIX epoch, used for expiry
//! - `ttl_ms` / `max_retries`: priority defaults unless overridden

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    /// Default time-to-live in milliseconds.
    pub fn default_ttl_ms(self) -> u64 {
        match self {
            Priority::Low => 5 * MINUTE_MS,
            Priority::Normal => 30 * MINUTE_MS,
            Priority::High => 2 * HOUR_MS,
            Priority::Critical => 7 * 24 * HOUR_MS,
        }
    }

    /// Default delivery attempt budget. Critical is bounded only by its TTL.
    pub fn default_max_retries(self) -> u32 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 3,
            Priority::High => 10,
            Priority::Critical => u32::MAX,
        }
    }

    /// Only the critical tier is written to durable storage.
    pub fn is_durable(self) -> bool {
        self == Priority::Critical
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Per-publish overrides. Anything left `None` falls back to the priority
/// defaults (or, at the façade, to the per-topic priority table).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub priority: Option<Priority>,
    pub ttl_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub idempotency_key: Option<String>,
}

impl PublishOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            ..Self::default()
        }
    }

    pub fn ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Fill unset fields from `defaults`. Values already set here win.
    pub fn merged_over(self, defaults: &PublishOptions) -> Self {
        Self {
            priority: self.priority.or(defaults.priority),
            ttl_ms: self.ttl_ms.or(defaults.ttl_ms),
            max_retries: self.max_retries.or(defaults.max_retries),
            idempotency_key: self
                .idempotency_key
                .or_else(|| defaults.idempotency_key.clone()),
        }
    }

    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }

    pub fn effective_ttl_ms(&self) -> u64 {
        self.ttl_ms
            .unwrap_or_else(|| self.effective_priority().default_ttl_ms())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Value,
    pub source: String,
    pub created_at: i64,
    pub priority: Priority,
    pub ttl_ms: u64,
    pub attempts: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Message {
    /// Build an envelope stamped with the current time.
    pub fn new(topic: &str, payload: Value, source: &str, options: PublishOptions) -> Self {
        Self::new_at(
            topic,
            payload,
            source,
            options,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    pub fn new_at(
        topic: &str,
        payload: Value,
        source: &str,
        options: PublishOptions,
        created_at: i64,
    ) -> Self {
        let priority = options.effective_priority();
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            source: source.to_string(),
            created_at,
            priority,
            ttl_ms: options.ttl_ms.unwrap_or_else(|| priority.default_ttl_ms()),
            attempts: 0,
            max_retries: options
                .max_retries
                .unwrap_or_else(|| priority.default_max_retries()),
            idempotency_key: options.idempotency_key,
        }
    }

    /// Expired messages are never delivered, whatever their retry budget.
    pub fn is_expired_at(&self, now: i64) -> bool {
        let ttl_ms = i64::try_from(self.ttl_ms).unwrap_or(i64::MAX);
        now.saturating_sub(self.created_at) > ttl_ms
    }

    pub fn retries_exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }
}

/// Scheduling wrapper around a `Message`. Rebuilt from the message on load,
/// never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub message: Message,
    pub next_attempt_at: i64,
    pub backoff_delay_ms: u64,
}

impl QueueEntry {
    pub fn new(message: Message, next_attempt_at: i64, backoff_delay_ms: u64) -> Self {
        Self {
            message,
            next_attempt_at,
            backoff_delay_ms,
        }
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.next_attempt_at <= now
    }

    /// Count a failed or subscriber-less attempt and push the next attempt
    /// out by the doubled delay, capped at `max_backoff_ms`.
    pub fn back_off(&mut self, now: i64, max_backoff_ms: u64) {
        self.message.attempts = self.message.attempts.saturating_add(1);
        self.backoff_delay_ms = self.backoff_delay_ms.saturating_mul(2).min(max_backoff_ms);
        self.next_attempt_at = now + self.backoff_delay_ms as i64;
    }
}

/// Merge `fields` into an object payload. Non-object payloads are nested
/// under `data` so the injected fields always have somewhere to live.
pub(crate) fn merge_fields(payload: Value, fields: Vec<(&str, Value)>) -> Value {
    let mut object = match payload {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    for (key, value) in fields {
        object.insert(key.to_string(), value);
    }
    Value::Object(object)
}

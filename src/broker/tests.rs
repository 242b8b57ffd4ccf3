use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::correlation::{reply_route, reply_topic};
use super::message::merge_fields;
use super::topic::{Topic, TopicRegistry};
use super::*;
use crate::config::BusSettings;
use crate::utils::{BusError, HandlerResult};

fn settings() -> BusSettings {
    BusSettings {
        tick_interval_ms: 10,
        ..BusSettings::default()
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn recorder() -> (Handler, mpsc::UnboundedReceiver<(Value, Message)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let h = handler(move |payload, message| {
        let _ = tx.send((payload, message));
        async { HandlerResult::Ok(()) }
    });
    (h, rx)
}

fn noop() -> Handler {
    handler(|_, _| async { HandlerResult::Ok(()) })
}

#[test]
fn test_priority_defaults() {
    let expected = [
        (Priority::Low, 5 * 60 * 1000, 1),
        (Priority::Normal, 30 * 60 * 1000, 3),
        (Priority::High, 2 * 60 * 60 * 1000, 10),
        (Priority::Critical, 7 * 24 * 60 * 60 * 1000, u32::MAX),
    ];
    for (priority, ttl_ms, max_retries) in expected {
        let msg = Message::new("t", json!({}), "svc", PublishOptions::with_priority(priority));
        assert_eq!(msg.priority, priority);
        assert_eq!(msg.ttl_ms, ttl_ms, "ttl for {priority}");
        assert_eq!(msg.max_retries, max_retries, "retries for {priority}");
        assert_eq!(msg.attempts, 0);
    }
}

#[test]
fn test_unset_priority_is_normal() {
    let msg = Message::new("t", Value::Null, "svc", PublishOptions::default());
    assert_eq!(msg.priority, Priority::Normal);
    assert_eq!(msg.max_retries, 3);
}

#[test]
fn test_overrides_win_over_defaults() {
    let options = PublishOptions::with_priority(Priority::Low)
        .ttl_ms(42)
        .max_retries(7);
    let msg = Message::new("t", json!(1), "svc", options);
    assert_eq!(msg.priority, Priority::Low);
    assert_eq!(msg.ttl_ms, 42);
    assert_eq!(msg.max_retries, 7);
}

#[test]
fn test_merged_over_keeps_caller_values() {
    let defaults = PublishOptions::with_priority(Priority::High).ttl_ms(10);
    let merged = PublishOptions::with_priority(Priority::Low).merged_over(&defaults);
    assert_eq!(merged.priority, Some(Priority::Low));
    assert_eq!(merged.ttl_ms, Some(10));
}

#[test]
fn test_message_expiry_boundary() {
    let msg = Message::new_at(
        "t",
        Value::Null,
        "svc",
        PublishOptions::default().ttl_ms(1_000),
        10_000,
    );
    assert!(!msg.is_expired_at(11_000));
    assert!(msg.is_expired_at(11_001));
}

#[test]
fn test_huge_ttl_override_never_expires() {
    let msg = Message::new_at(
        "t",
        Value::Null,
        "svc",
        PublishOptions::default().ttl_ms(u64::MAX),
        10_000,
    );
    assert!(!msg.is_expired_at(10_001));
    assert!(!msg.is_expired_at(i64::MAX));
}

#[test]
fn test_message_serialization_keeps_all_fields() {
    let msg = Message::new(
        "doc-service.created",
        json!({"doc": 7}),
        "api",
        PublishOptions::with_priority(Priority::Critical).idempotency_key("k1"),
    );
    let text = serde_json::to_string(&msg).unwrap();
    assert!(text.contains("\"createdAt\""));
    assert!(text.contains("\"priority\":\"critical\""));
    let parsed: Message = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed, msg);
}

#[test]
fn test_merge_fields_wraps_scalars() {
    let merged = merge_fields(json!(5), vec![("_sender", json!("x"))]);
    assert_eq!(merged, json!({"data": 5, "_sender": "x"}));

    let merged = merge_fields(json!({"a": 1}), vec![("_sender", json!("x"))]);
    assert_eq!(merged, json!({"a": 1, "_sender": "x"}));
}

#[test]
fn test_topic_subscribe_and_unsubscribe() {
    let mut topic = Topic::new("test_topic");
    assert!(topic.is_empty());
    topic.subscribe("client1".to_string(), noop());
    assert!(topic.subscribers.contains_key("client1"));
    assert!(topic.unsubscribe(&"client1".to_string()));
    assert!(!topic.unsubscribe(&"client1".to_string()));
    assert!(topic.is_empty());
}

#[test]
fn test_registry_drops_empty_topics() {
    let mut registry = TopicRegistry::new();
    registry.subscribe("orders", "a".to_string(), noop());
    registry.subscribe("orders", "b".to_string(), noop());
    assert_eq!(registry.subscriber_count("orders"), 2);

    assert!(registry.unsubscribe("orders", &"a".to_string()));
    assert!(registry.has_subscribers("orders"));
    assert!(registry.unsubscribe("orders", &"b".to_string()));
    assert!(!registry.has_subscribers("orders"));
    assert!(registry.topic_names().is_empty());
    assert!(registry.handlers("orders").is_empty());
}

#[test]
fn test_queue_entry_backoff_doubles_and_caps() {
    let msg = Message::new("t", Value::Null, "svc", PublishOptions::default());
    let mut entry = QueueEntry::new(msg, 0, 1_000);
    entry.back_off(0, 5_000);
    assert_eq!((entry.backoff_delay_ms, entry.next_attempt_at), (2_000, 2_000));
    entry.back_off(2_000, 5_000);
    assert_eq!((entry.backoff_delay_ms, entry.next_attempt_at), (4_000, 6_000));
    entry.back_off(6_000, 5_000);
    assert_eq!((entry.backoff_delay_ms, entry.next_attempt_at), (5_000, 11_000));
    assert_eq!(entry.message.attempts, 3);
}

#[tokio::test]
async fn test_publish_and_deliver() {
    let bus = MessageBus::in_memory("svc", settings());
    let (h, mut rx) = recorder();
    let _sub = bus.subscribe("orders", h);

    let id = bus
        .publish("orders", json!({"n": 1}), PublishOptions::default())
        .await;
    assert_eq!(bus.queue_len(), 1);

    let report = bus.process_due_at(now()).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(bus.queue_len(), 0);

    let (payload, message) = rx.try_recv().unwrap();
    assert_eq!(payload, json!({"n": 1}));
    assert_eq!(message.id, id);
    assert_eq!(message.source, "svc");
}

#[tokio::test]
async fn test_two_subscribers_one_failing() {
    let bus = MessageBus::in_memory("svc", settings());
    let failing = handler(|_, _| async {
        HandlerResult::Err("handler blew up".into())
    });
    let (h, mut rx) = recorder();
    let _a = bus.subscribe("orders", failing);
    let _b = bus.subscribe("orders", h);

    bus.publish("orders", json!("x"), PublishOptions::default())
        .await;
    let report = bus.process_due_at(now()).await;

    // a failing handler still counts as delivered, no retry
    assert_eq!(report.delivered, 1);
    assert_eq!(report.retried, 0);
    assert_eq!(bus.queue_len(), 0);
    assert_eq!(rx.try_recv().unwrap().0, json!("x"));
}

#[tokio::test]
async fn test_panicking_handler_is_isolated() {
    let bus = MessageBus::in_memory("svc", settings());
    let panicking = handler(|_, _| async {
        if true {
            panic!("boom");
        }
        HandlerResult::Ok(())
    });
    let (h, mut rx) = recorder();
    let _a = bus.subscribe("orders", panicking);
    let _b = bus.subscribe("orders", h);

    bus.publish("orders", json!(1), PublishOptions::default())
        .await;
    let report = bus.process_due_at(now()).await;
    assert_eq!(report.delivered, 1);
    assert!(rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_no_subscriber_retries_then_drops() {
    let bus = MessageBus::in_memory("svc", settings());
    let id = bus
        .publish("svc.ping", json!({}), PublishOptions::with_priority(Priority::Normal))
        .await;

    let mut t = now();
    let mut last_delay = 0;
    for attempt in 1..=3 {
        let report = bus.process_due_at(t).await;
        assert_eq!(report.retried, 1, "cycle {attempt}");
        let entry = bus.queued_entry(&id).expect("still queued");
        assert_eq!(entry.message.attempts, attempt);
        assert!(entry.message.attempts <= entry.message.max_retries);
        assert!(entry.backoff_delay_ms > last_delay);
        last_delay = entry.backoff_delay_ms;

        // not due yet: nothing happens
        let idle = bus.process_due_at(entry.next_attempt_at - 1).await;
        assert_eq!(idle, TickReport::default());
        t = entry.next_attempt_at;
    }

    let report = bus.process_due_at(t).await;
    assert_eq!(report.exhausted, 1);
    assert!(bus.queued_entry(&id).is_none());
    assert_eq!(bus.queue_len(), 0);
}

#[tokio::test]
async fn test_backoff_is_capped() {
    let settings = BusSettings {
        initial_backoff_ms: 1_000,
        max_backoff_ms: 5_000,
        ..settings()
    };
    let bus = MessageBus::in_memory("svc", settings);
    let id = bus
        .publish("nobody", json!({}), PublishOptions::with_priority(Priority::High))
        .await;

    let mut t = now();
    let mut delays = Vec::new();
    for _ in 0..5 {
        bus.process_due_at(t).await;
        let entry = bus.queued_entry(&id).unwrap();
        delays.push(entry.backoff_delay_ms);
        t = entry.next_attempt_at;
    }
    assert_eq!(delays, vec![2_000, 4_000, 5_000, 5_000, 5_000]);
}

#[tokio::test]
async fn test_expired_message_never_delivered() {
    let bus = MessageBus::in_memory("svc", settings());
    let (h, mut rx) = recorder();
    let _sub = bus.subscribe("orders", h);

    let id = bus
        .publish("orders", json!(1), PublishOptions::default().ttl_ms(1_000))
        .await;
    let created_at = bus.queued_entry(&id).unwrap().message.created_at;

    let report = bus.process_due_at(created_at + 1_001).await;
    assert_eq!(report.expired, 1);
    assert_eq!(report.delivered, 0);
    assert_eq!(bus.queue_len(), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_late_subscriber_receives_after_backoff() {
    let bus = MessageBus::in_memory("svc", settings());
    let id = bus
        .publish("orders", json!("late"), PublishOptions::default())
        .await;

    bus.process_due_at(now()).await;
    let entry = bus.queued_entry(&id).unwrap();

    let (h, mut rx) = recorder();
    let _sub = bus.subscribe("orders", h);
    let report = bus.process_due_at(entry.next_attempt_at).await;
    assert_eq!(report.delivered, 1);
    let (_, message) = rx.try_recv().unwrap();
    assert_eq!(message.attempts, 1);
}

#[tokio::test]
async fn test_publish_order_within_topic() {
    let bus = MessageBus::in_memory("svc", settings());
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = bus.subscribe(
        "orders",
        handler(move |payload, _| {
            sink.lock().unwrap().push(payload);
            async { HandlerResult::Ok(()) }
        }),
    );

    for n in 0..5 {
        bus.publish("orders", json!(n), PublishOptions::default())
            .await;
    }
    bus.process_due_at(now()).await;
    assert_eq!(
        *seen.lock().unwrap(),
        (0..5).map(|n| json!(n)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_unsubscribe_handle() {
    let bus = MessageBus::in_memory("svc", settings());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let sub = bus.subscribe(
        "orders",
        handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { HandlerResult::Ok(()) }
        }),
    );
    assert_eq!(sub.topics().collect::<Vec<_>>(), vec!["orders"]);
    assert_eq!(bus.subscriber_count("orders"), 1);

    sub.unsubscribe();
    assert_eq!(bus.subscriber_count("orders"), 0);

    bus.publish("orders", json!(1), PublishOptions::default())
        .await;
    let report = bus.process_due_at(now()).await;
    assert_eq!(report.retried, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_idempotency_key_suppresses_repeats() {
    let bus = MessageBus::in_memory("svc", settings());
    let options = PublishOptions::default().idempotency_key("order-17");

    let first = bus.publish("orders", json!(1), options.clone()).await;
    let second = bus.publish("orders", json!(2), options.clone()).await;
    assert_eq!(first, second);
    assert_eq!(bus.queue_len(), 1);

    // same key on another topic is independent
    let other = bus.publish("invoices", json!(1), options.clone()).await;
    assert_ne!(other, first);
    assert_eq!(bus.queue_len(), 2);
}

#[tokio::test]
async fn test_idempotency_window_expires() {
    let settings = BusSettings {
        dedup_window_ms: 50,
        ..settings()
    };
    let bus = MessageBus::in_memory("svc", settings);
    let options = PublishOptions::default().idempotency_key("k");

    let first = bus.publish("orders", json!(1), options.clone()).await;
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    let second = bus.publish("orders", json!(1), options).await;
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_stats_count_by_priority() {
    let bus = MessageBus::in_memory("svc", settings());
    let _sub = bus.subscribe("a", noop());
    bus.publish("a", json!(1), PublishOptions::with_priority(Priority::High))
        .await;
    bus.publish("b", json!(1), PublishOptions::with_priority(Priority::High))
        .await;
    bus.publish("c", json!(1), PublishOptions::with_priority(Priority::Low))
        .await;

    let stats = bus.stats();
    assert_eq!(stats.queued, 3);
    assert_eq!(stats.by_priority.get(&Priority::High), Some(&2));
    assert_eq!(stats.by_priority.get(&Priority::Low), Some(&1));
    assert_eq!(stats.topics, 1);
    assert_eq!(stats.pending_requests, 0);
}

#[test]
fn test_pending_requests_first_reply_wins() {
    let pending = PendingRequests::default();
    let mut rx = pending.register("c1");
    assert_eq!(pending.len(), 1);

    assert!(pending.complete("c1", json!({"n": 2})));
    assert!(!pending.complete("c1", json!({"n": 3})));
    assert!(pending.is_empty());
    assert_eq!(rx.try_recv().unwrap(), json!({"n": 2}));
}

#[test]
fn test_reply_route_requires_metadata() {
    let payload = json!({"_replyTo": reply_topic("api", "c1"), "_correlationId": "c1"});
    assert_eq!(reply_route(&payload).unwrap(), ("api.reply.c1", "c1"));

    let err = reply_route(&json!({"_replyTo": "x"})).unwrap_err();
    assert!(matches!(
        err,
        BusError::MissingCorrelation {
            field: "_correlationId"
        }
    ));
}

#[tokio::test]
async fn test_request_and_respond() {
    let bus = MessageBus::in_memory("shared", settings());
    bus.start().await;

    let responder = Arc::clone(&bus);
    let _sub = bus.subscribe(
        "doc-service.ping",
        handler(move |payload, _| {
            let bus = Arc::clone(&responder);
            async move {
                let n = payload["n"].as_i64().unwrap_or_default();
                bus.respond("doc-service", &payload, json!({"n": n + 1}))
                    .await?;
                HandlerResult::Ok(())
            }
        }),
    );

    let response = bus
        .request(
            "api",
            "doc-service",
            "ping",
            json!({"n": 1}),
            RequestOptions::with_timeout_ms(2_000),
        )
        .await
        .unwrap();
    assert_eq!(response, json!({"n": 2}));
    assert!(bus.pending.is_empty());
    bus.stop();
}

#[tokio::test]
async fn test_request_times_out_and_cleans_up() {
    let bus = MessageBus::in_memory("shared", settings());
    bus.start().await;

    let err = bus
        .request(
            "api",
            "doc-service",
            "ping",
            json!({"n": 1}),
            RequestOptions::with_timeout_ms(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BusError::RequestTimeout { timeout_ms: 100, .. }
    ));
    assert!(bus.pending.is_empty());
    assert_eq!(bus.stats().topics, 0);
    bus.stop();
}

#[tokio::test]
async fn test_late_reply_is_dropped_quietly() {
    let bus = MessageBus::in_memory("shared", settings());
    let original = json!({"_replyTo": "api.reply.gone", "_correlationId": "gone"});
    bus.respond("doc-service", &original, json!({"n": 2}))
        .await
        .unwrap();

    let report = bus.process_due_at(now()).await;
    assert_eq!(report.exhausted, 1);
    assert_eq!(bus.queue_len(), 0);
}

#[tokio::test]
async fn test_scheduler_stops() {
    let bus = MessageBus::in_memory("svc", settings());
    bus.start().await;
    assert!(bus.is_running());
    bus.stop();
    assert!(!bus.is_running());
}

#[tokio::test]
async fn test_huge_ttl_override_is_delivered() {
    let bus = MessageBus::in_memory("svc", settings());
    let (h, mut rx) = recorder();
    let _sub = bus.subscribe("orders", h);

    bus.publish("orders", json!({"n": 1}), PublishOptions::default().ttl_ms(u64::MAX))
        .await;
    let report = bus.process_due_at(now()).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.expired, 0);
    assert_eq!(rx.try_recv().unwrap().0, json!({"n": 1}));
}

#[tokio::test]
async fn test_request_from_inside_a_handler() {
    let bus = MessageBus::in_memory("shared", settings());
    bus.start().await;

    let responder = Arc::clone(&bus);
    let _answer = bus.subscribe(
        "b.x",
        handler(move |payload, _| {
            let bus = Arc::clone(&responder);
            async move {
                bus.respond("b", &payload, json!({"ok": true})).await?;
                HandlerResult::Ok(())
            }
        }),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let requester = Arc::clone(&bus);
    let _ask = bus.subscribe(
        "a",
        handler(move |_, _| {
            let bus = Arc::clone(&requester);
            let tx = tx.clone();
            async move {
                let outcome = bus
                    .request("a", "b", "x", json!({}), RequestOptions::with_timeout_ms(2_000))
                    .await;
                let _ = tx.send(outcome);
                HandlerResult::Ok(())
            }
        }),
    );

    bus.publish("a", json!({}), PublishOptions::default()).await;
    let outcome = tokio::time::timeout(std::time::Duration::from_secs(3), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.unwrap(), json!({"ok": true}));
    bus.stop();
}

#[tokio::test]
async fn test_slow_handler_does_not_delay_other_topics() {
    let bus = MessageBus::in_memory("svc", settings());
    bus.start().await;

    let _slow = bus.subscribe(
        "slow",
        handler(|_, _| async {
            tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
            HandlerResult::Ok(())
        }),
    );
    let (h, mut rx) = recorder();
    let _fast = bus.subscribe("fast", h);

    bus.publish("slow", json!({}), PublishOptions::default()).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    bus.publish("fast", json!({"n": 1}), PublishOptions::default())
        .await;
    let (payload, _) = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
        .await
        .expect("fast topic held back by slow handler")
        .unwrap();
    assert_eq!(payload, json!({"n": 1}));
    assert!(started.elapsed() < std::time::Duration::from_millis(1_000));
    bus.stop();
}

#[tokio::test]
async fn test_slow_topics_in_one_pass_run_side_by_side() {
    let bus = MessageBus::in_memory("svc", settings());
    let _slow = bus.subscribe(
        "slow",
        handler(|_, _| async {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            HandlerResult::Ok(())
        }),
    );
    let (h, mut rx) = recorder();
    let _fast = bus.subscribe("fast", h);

    bus.publish("slow", json!({}), PublishOptions::default()).await;
    bus.publish("fast", json!({}), PublishOptions::default()).await;

    let pass = bus.process_due_at(now());
    tokio::pin!(pass);
    let received = tokio::select! {
        _ = &mut pass => false,
        got = rx.recv() => got.is_some(),
    };
    assert!(received, "fast delivery waited for the slow topic");
    assert_eq!(pass.await.delivered, 2);
}

#[tokio::test]
async fn test_dropped_request_releases_reply_subscription() {
    let bus = MessageBus::in_memory("shared", settings());

    let abandoned = tokio::time::timeout(
        std::time::Duration::from_millis(20),
        bus.request(
            "api",
            "doc-service",
            "ping",
            json!({}),
            RequestOptions::with_timeout_ms(60_000),
        ),
    )
    .await;
    assert!(abandoned.is_err());

    let stats = bus.stats();
    assert_eq!(stats.pending_requests, 0);
    assert_eq!(stats.topics, 0);
}

//! End-to-end messaging behaviour against the in-memory broker

use hire_bus::provider::memory::MemoryBroker;
use hire_bus::{
    BoxError, ClientConfig, ConnectionConfig, DeadLetterHandler, MemoryDeadLetterHandler,
    MessageMetadata, MessagingClient, MessagingError, PublishOptions, StreamConfig,
    SubscribeOptions, SubscriptionInfo,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_config(service: &str) -> ClientConfig {
    ClientConfig::new(ConnectionConfig::new("memory://local", service)).with_streams(vec![
        StreamConfig::new("JOB_EVENTS", vec!["job.>".to_string()]),
        StreamConfig::new("MATCHING_EVENTS", vec!["matching.>".to_string()]),
    ])
}

async fn test_client(broker: &MemoryBroker, service: &str) -> MessagingClient {
    let client = MessagingClient::new(test_config(service), broker.clone());
    client.initialize().await.unwrap();
    client
}

fn fast_retry() -> SubscribeOptions {
    SubscribeOptions {
        retry_delay_ms: Some(20),
        ack_wait_ms: Some(2_000),
        ..Default::default()
    }
}

/// Poll `cond` until it holds or five seconds pass
async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

type Attempts = Arc<Mutex<Vec<u64>>>;

/// Subscribe with a handler that records each delivered stream sequence
async fn subscribe_sequences(
    client: &MessagingClient,
    subject: &str,
    sink: Attempts,
) -> hire_bus::Result<SubscriptionInfo> {
    client
        .subscribe(
            subject,
            move |_: serde_json::Value, meta: MessageMetadata| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(meta.sequence);
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        )
        .await
}

fn recorded(attempts: &Attempts) -> Vec<u64> {
    attempts.lock().unwrap().clone()
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let broker = MemoryBroker::new();
    let a = test_client(&broker, "jobs").await;
    let b = test_client(&broker, "matcher").await;
    a.initialize().await.unwrap();

    let streams = b.streams().list_streams().await.unwrap();
    assert_eq!(streams.len(), 2);
    assert!(a.health_status().connected);
    assert!(a.health_status().jetstream_available);
}

#[tokio::test]
async fn test_publish_and_consume() {
    let broker = MemoryBroker::new();
    let client = test_client(&broker, "matcher").await;

    let received: Arc<Mutex<Vec<(serde_json::Value, MessageMetadata)>>> = Arc::default();
    let sink = received.clone();
    client
        .subscribe(
            "job.created",
            move |data: serde_json::Value, meta: MessageMetadata| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push((data, meta));
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    let result = client
        .publish("job.created", &json!({"jobId": "J1"}), PublishOptions::default())
        .await;
    assert!(result.success);

    assert!(wait_for(|| received.lock().unwrap().len() == 1).await);
    let (data, meta) = received.lock().unwrap()[0].clone();
    assert_eq!(data, json!({"jobId": "J1"}));
    assert_eq!(meta.subject, "job.created");
    assert_eq!(meta.stream, "JOB_EVENTS");
    assert_eq!(meta.sequence, 1);
    assert_eq!(meta.delivery_attempt, 1);
    assert_eq!(meta.message_id.as_deref(), Some(result.message_id.as_str()));

    // Acked: nothing left pending on the consumer
    let mut pending = u64::MAX;
    for _ in 0..100 {
        pending = client
            .streams()
            .get_consumer_info("JOB_EVENTS", "matcher-job_created")
            .await
            .unwrap()
            .map(|c| c.num_ack_pending)
            .unwrap_or(u64::MAX);
        if pending == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pending, 0);
}

#[tokio::test]
async fn test_duplicate_message_id_stored_once() {
    let broker = MemoryBroker::new();
    let client = test_client(&broker, "jobs").await;

    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();
    client
        .subscribe(
            "job.created",
            move |_: serde_json::Value, _: MessageMetadata| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    let opts = || PublishOptions::with_message_id("job-J1-created");
    let first = client.publish("job.created", &json!({"jobId": "J1"}), opts()).await;
    let second = client.publish("job.created", &json!({"jobId": "J1"}), opts()).await;

    assert!(first.success && second.success);
    assert_eq!(first.sequence, Some(1));
    assert_eq!(second.sequence, Some(1));
    assert!(second.duplicate);

    let info = client.streams().get_stream_info("JOB_EVENTS").await.unwrap().unwrap();
    assert_eq!(info.state.messages, 1);

    assert!(wait_for(|| *calls.lock().unwrap() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_failed_handler_is_redelivered_then_acked() {
    let broker = MemoryBroker::new();
    let client = test_client(&broker, "matcher").await;

    let attempts: Attempts = Arc::default();
    let log = attempts.clone();
    client
        .subscribe(
            "job.created",
            move |_: serde_json::Value, meta: MessageMetadata| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(meta.delivery_attempt);
                    if meta.delivery_attempt == 1 {
                        Err(BoxError::from("scoring service unavailable"))
                    } else {
                        Ok(())
                    }
                }
            },
            fast_retry(),
        )
        .await
        .unwrap();

    client
        .publish("job.created", &json!({"jobId": "J2"}), PublishOptions::default())
        .await;

    assert!(wait_for(|| recorded(&attempts) == vec![1, 2]).await);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(recorded(&attempts), vec![1, 2]);
}

#[tokio::test]
async fn test_redelivery_stops_at_max_deliver() {
    let broker = MemoryBroker::new();
    let client = test_client(&broker, "matcher").await;

    let attempts: Attempts = Arc::default();
    let log = attempts.clone();
    client
        .subscribe(
            "job.created",
            move |_: serde_json::Value, meta: MessageMetadata| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(meta.delivery_attempt);
                    Err(BoxError::from("always fails"))
                }
            },
            fast_retry(),
        )
        .await
        .unwrap();

    client
        .publish("job.created", &json!({"jobId": "J3"}), PublishOptions::default())
        .await;

    assert!(wait_for(|| recorded(&attempts).len() == 3).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorded(&attempts), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_handler_timeout_naks_and_redelivers() {
    let broker = MemoryBroker::new();
    let client = test_client(&broker, "matcher").await;

    let attempts: Attempts = Arc::default();
    let finished = Arc::new(Mutex::new(0u32));
    let (log, done) = (attempts.clone(), finished.clone());
    let options = SubscribeOptions {
        handler_timeout_ms: Some(100),
        ..fast_retry()
    };

    client
        .subscribe(
            "job.created",
            move |_: serde_json::Value, meta: MessageMetadata| {
                let (log, done) = (log.clone(), done.clone());
                async move {
                    log.lock().unwrap().push(meta.delivery_attempt);
                    if meta.delivery_attempt == 1 {
                        tokio::time::sleep(Duration::from_millis(400)).await;
                    }
                    *done.lock().unwrap() += 1;
                    Ok(())
                }
            },
            options,
        )
        .await
        .unwrap();

    client
        .publish("job.created", &json!({"jobId": "J4"}), PublishOptions::default())
        .await;

    assert!(wait_for(|| recorded(&attempts) == vec![1, 2]).await);
    // The timed-out handler keeps running in the background
    assert!(wait_for(|| *finished.lock().unwrap() == 2).await);
}

#[tokio::test]
async fn test_undecodable_payload_is_naked() {
    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct JobCreated {
        job_id: String,
        title: String,
    }

    let broker = MemoryBroker::new();
    let client = test_client(&broker, "matcher").await;

    let handled: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = handled.clone();
    client
        .subscribe(
            "job.created",
            move |job: JobCreated, _: MessageMetadata| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(job.job_id);
                    Ok(())
                }
            },
            fast_retry(),
        )
        .await
        .unwrap();

    client
        .publish("job.created", &json!({"unexpected": true}), PublishOptions::default())
        .await;
    client
        .publish(
            "job.created",
            &JobCreated {
                job_id: "J5".to_string(),
                title: "Rust engineer".to_string(),
            },
            PublishOptions::default(),
        )
        .await;

    assert!(wait_for(|| handled.lock().unwrap().len() == 1).await);
    assert_eq!(handled.lock().unwrap()[0], "J5");
}

#[tokio::test]
async fn test_dead_letter_hook_receives_exhausted_message() {
    let broker = MemoryBroker::new();
    let dlq = Arc::new(MemoryDeadLetterHandler::default());
    let client = MessagingClient::new(test_config("matcher"), broker.clone()).with_dead_letter(dlq.clone());
    client.initialize().await.unwrap();

    let options = SubscribeOptions {
        max_deliver: Some(2),
        ..fast_retry()
    };
    client
        .subscribe(
            "job.created",
            |_: serde_json::Value, _: MessageMetadata| async { Err(BoxError::from("poison")) },
            options,
        )
        .await
        .unwrap();

    client
        .publish(
            "job.created",
            &json!({"jobId": "J6"}),
            PublishOptions::with_message_id("job-J6"),
        )
        .await;

    let mut count = 0;
    for _ in 0..500 {
        count = dlq.count().await.unwrap();
        if count == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(count, 1);

    let letters = dlq.list(10).await.unwrap();
    assert_eq!(letters[0].reason, "poison");
    assert_eq!(letters[0].metadata.delivery_attempt, 2);
    assert_eq!(letters[0].metadata.message_id.as_deref(), Some("job-J6"));

    let consumer = client
        .streams()
        .get_consumer_info("JOB_EVENTS", "matcher-job_created")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(consumer.num_ack_pending, 0);
}

#[tokio::test]
async fn test_queue_group_delivers_each_message_once() {
    let broker = MemoryBroker::new();
    // Two instances of the same service
    let a = test_client(&broker, "scorer").await;
    let b = test_client(&broker, "scorer").await;

    let seen: Arc<Mutex<Vec<u64>>> = Arc::default();
    for client in [&a, &b] {
        let sink = seen.clone();
        client
            .subscribe(
                "matching.requested",
                move |_: serde_json::Value, meta: MessageMetadata| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(meta.sequence);
                        Ok(())
                    }
                },
                SubscribeOptions {
                    queue_group: Some("scorers".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    for i in 0..10 {
        let result = a
            .publish("matching.requested", &json!({"n": i}), PublishOptions::default())
            .await;
        assert!(result.success);
    }

    assert!(wait_for(|| seen.lock().unwrap().len() >= 10).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 10);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 10);
}

#[tokio::test]
async fn test_same_queue_group_in_different_services_is_not_shared() {
    let broker = MemoryBroker::new();
    let matcher = test_client(&broker, "matcher").await;
    let notifier = test_client(&broker, "notifier").await;

    let counts = Arc::new(Mutex::new((0u32, 0u32)));
    let mut durables = Vec::new();
    for (client, first) in [(&matcher, true), (&notifier, false)] {
        let counts = counts.clone();
        let info = client
            .subscribe(
                "job.created",
                move |_: serde_json::Value, _: MessageMetadata| {
                    let counts = counts.clone();
                    async move {
                        let mut c = counts.lock().unwrap();
                        if first {
                            c.0 += 1;
                        } else {
                            c.1 += 1;
                        }
                        Ok(())
                    }
                },
                SubscribeOptions {
                    queue_group: Some("workers".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        durables.push(info.durable_name);
    }
    assert_eq!(durables, vec!["matcher-workers-job_created", "notifier-workers-job_created"]);

    for i in 0..10 {
        matcher
            .publish("job.created", &json!({"n": i}), PublishOptions::default())
            .await;
    }

    assert!(wait_for(|| *counts.lock().unwrap() == (10, 10)).await);
}

#[tokio::test]
async fn test_separate_services_each_get_a_copy() {
    let broker = MemoryBroker::new();
    let a = test_client(&broker, "matcher").await;
    let b = test_client(&broker, "notifier").await;

    let counts = Arc::new(Mutex::new((0u32, 0u32)));
    let (ca, cb) = (counts.clone(), counts.clone());
    a.subscribe(
        "job.created",
        move |_: serde_json::Value, _: MessageMetadata| {
            let ca = ca.clone();
            async move {
                ca.lock().unwrap().0 += 1;
                Ok(())
            }
        },
        SubscribeOptions::default(),
    )
    .await
    .unwrap();
    b.subscribe(
        "job.created",
        move |_: serde_json::Value, _: MessageMetadata| {
            let cb = cb.clone();
            async move {
                cb.lock().unwrap().1 += 1;
                Ok(())
            }
        },
        SubscribeOptions::default(),
    )
    .await
    .unwrap();

    a.publish("job.created", &json!({}), PublishOptions::default()).await;
    assert!(wait_for(|| *counts.lock().unwrap() == (1, 1)).await);
}

#[tokio::test(start_paused = true)]
async fn test_publish_times_out_on_slow_broker() {
    let broker = MemoryBroker::new();
    let client = test_client(&broker, "jobs").await;
    broker.set_publish_delay(Duration::from_secs(60));

    let options = PublishOptions {
        timeout_ms: Some(50),
        ..Default::default()
    };
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.publish("job.created", &json!({"jobId": "J8"}), options),
    )
    .await
    .expect("publish must honour its own timeout");

    assert!(!result.success);
    assert!(result.sequence.is_none());
    let error = result.error.unwrap_or_default();
    assert!(error.contains("timed out"), "{}", error);

    let info = client.streams().get_stream_info("JOB_EVENTS").await.unwrap().unwrap();
    assert_eq!(info.state.messages, 0);

    broker.set_publish_delay(Duration::ZERO);
    let result = client
        .publish("job.created", &json!({"jobId": "J8"}), PublishOptions::default())
        .await;
    assert!(result.success);
}

#[tokio::test]
async fn test_optional_connection_degrades_gracefully() {
    let broker = MemoryBroker::new();
    broker.set_available(false);

    let mut config = test_config("matcher");
    config.connection.optional = true;
    let client = MessagingClient::new(config, broker.clone());
    client.initialize().await.unwrap();
    assert!(!client.is_connected());

    let result = client
        .publish("job.created", &json!({"jobId": "J7"}), PublishOptions::default())
        .await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("JetStream not available"));

    let err = client
        .subscribe(
            "job.created",
            |_: serde_json::Value, _: MessageMetadata| async { Ok(()) },
            SubscribeOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::SubscriptionSetup { .. }));

    let health = client.health_status();
    assert!(!health.connected);
    assert!(!health.jetstream_available);
    assert_eq!(health.active_subscriptions, 0);
}

#[tokio::test]
async fn test_required_connection_failure_aborts_initialize() {
    let broker = MemoryBroker::new();
    broker.set_available(false);

    let client = MessagingClient::new(test_config("matcher"), broker);
    let err = client.initialize().await.unwrap_err();
    assert!(matches!(err, MessagingError::Connection(_)));
}

#[tokio::test]
async fn test_connection_drop_ends_subscription_without_resubscribe() {
    let broker = MemoryBroker::new();
    let client = test_client(&broker, "matcher").await;

    client
        .subscribe(
            "job.created",
            |_: serde_json::Value, _: MessageMetadata| async { Ok(()) },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(client.active_subscriptions().len(), 1);

    broker.interrupt();
    assert!(wait_for(|| client.active_subscriptions().is_empty()).await);
    assert!(!client.is_connected());

    let result = client
        .publish("job.created", &json!({}), PublishOptions::default())
        .await;
    assert!(!result.success);

    broker.resume();
    assert!(client.is_connected());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.active_subscriptions().is_empty());
    assert_eq!(client.health_status().reconnect_attempts, 1);
}

#[tokio::test]
async fn test_shutdown_stops_subscriptions_and_disconnects() {
    let broker = MemoryBroker::new();
    let client = test_client(&broker, "matcher").await;

    for subject in ["job.created", "matching.completed"] {
        client
            .subscribe(
                subject,
                |_: serde_json::Value, _: MessageMetadata| async { Ok(()) },
                SubscribeOptions::default(),
            )
            .await
            .unwrap();
    }
    assert_eq!(client.health_status().active_subscriptions, 2);

    client.shutdown().await.unwrap();
    assert!(client.active_subscriptions().is_empty());
    assert!(!client.is_connected());

    let result = client
        .publish("job.created", &json!({}), PublishOptions::default())
        .await;
    assert!(!result.success);

    // Safe to call twice
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_resumes_from_durable_position() {
    let broker = MemoryBroker::new();
    let client = test_client(&broker, "matcher").await;

    let seen: Attempts = Arc::default();

    subscribe_sequences(&client, "job.created", seen.clone())
        .await
        .unwrap();
    client.publish("job.created", &json!({"n": 1}), PublishOptions::default()).await;
    assert!(wait_for(|| recorded(&seen) == vec![1]).await);

    assert!(client.unsubscribe("matcher-job_created").await.unwrap());
    client.publish("job.created", &json!({"n": 2}), PublishOptions::default()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorded(&seen), vec![1]);

    subscribe_sequences(&client, "job.created", seen.clone())
        .await
        .unwrap();
    assert!(wait_for(|| recorded(&seen) == vec![1, 2]).await);
}

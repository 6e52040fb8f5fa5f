//! NATS JetStream integration tests
//!
//! These tests require a running NATS server with JetStream enabled:
//!   nats-server -js
//!
//! Tests are skipped automatically if NATS is not available.

use hire_bus::{
    BoxError, ClientConfig, ConnectionConfig, DeliverPolicy, MessageMetadata, MessagingClient,
    PublishOptions, StorageType, StreamConfig, SubscribeOptions,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A client bound to a throwaway stream capturing `<prefix>.>`
struct TestBus {
    client: MessagingClient,
    stream: String,
    prefix: String,
}

impl TestBus {
    fn subject(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name)
    }

    async fn cleanup(self) {
        let _ = self.client.streams().delete_stream(&self.stream).await;
        let _ = self.client.shutdown().await;
    }
}

/// Try to connect to NATS. Returns None if server is unavailable.
async fn try_nats_client(suffix: &str) -> Option<TestBus> {
    let tag = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    let stream = format!("TEST_{}_{}", suffix.to_uppercase(), tag);
    let prefix = format!("test.{}_{}", suffix, tag);

    let mut stream_config = StreamConfig::new(&stream, vec![format!("{}.>", prefix)]);
    stream_config.storage = StorageType::Memory;
    stream_config.max_age_ms = 60_000;

    let mut connection = ConnectionConfig::new("nats://127.0.0.1:4222", format!("it-{}", suffix));
    connection.timeout_ms = 1_000;

    let config = ClientConfig::new(connection).with_streams(vec![stream_config]);
    let client = MessagingClient::nats(config);

    match client.initialize().await {
        Ok(()) => Some(TestBus {
            client,
            stream,
            prefix,
        }),
        Err(_) => {
            eprintln!("NATS not available, skipping integration test");
            None
        }
    }
}

/// Helper to create a NATS-backed client, or skip the test
macro_rules! nats_bus {
    ($suffix:expr) => {
        match try_nats_client($suffix).await {
            Some(bus) => bus,
            None => return,
        }
    };
}

async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn test_nats_provisioning_is_idempotent() {
    let bus = nats_bus!("provision");

    bus.client.initialize().await.unwrap();
    let info = bus
        .client
        .streams()
        .get_stream_info(&bus.stream)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.config.storage, StorageType::Memory);
    assert_eq!(
        bus.client
            .streams()
            .stream_for_subject(&bus.subject("job.created"))
            .await
            .unwrap()
            .as_deref(),
        Some(bus.stream.as_str())
    );

    let health = bus.client.health_status();
    assert!(health.connected);
    assert!(health.jetstream_available);

    bus.cleanup().await;
}

#[tokio::test]
async fn test_nats_publish_deduplicates_by_message_id() {
    let bus = nats_bus!("dedup");
    let subject = bus.subject("job.created");

    let first = bus
        .client
        .publish(&subject, &json!({"jobId": "J1"}), PublishOptions::with_message_id("job-J1"))
        .await;
    let second = bus
        .client
        .publish(&subject, &json!({"jobId": "J1"}), PublishOptions::with_message_id("job-J1"))
        .await;

    assert!(first.success, "{:?}", first.error);
    assert!(second.success, "{:?}", second.error);
    assert_eq!(first.sequence, Some(1));
    assert_eq!(second.sequence, Some(1));
    assert!(second.duplicate);
    assert_eq!(first.stream.as_deref(), Some(bus.stream.as_str()));

    let info = bus
        .client
        .streams()
        .get_stream_info(&bus.stream)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.state.messages, 1);

    bus.cleanup().await;
}

#[tokio::test]
async fn test_nats_publish_without_stream_fails() {
    let bus = nats_bus!("nostream");

    let result = bus
        .client
        .publish("unprovisioned.subject.zzz", &json!({}), PublishOptions::default())
        .await;
    assert!(!result.success);
    assert!(result.error.is_some());

    bus.cleanup().await;
}

#[tokio::test]
async fn test_nats_subscribe_receives_and_acks() {
    let bus = nats_bus!("consume");
    let subject = bus.subject("job.created");

    let received: Arc<Mutex<Vec<MessageMetadata>>> = Arc::default();
    let sink = received.clone();
    let info = bus
        .client
        .subscribe(
            &subject,
            move |_: serde_json::Value, meta: MessageMetadata| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(meta);
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(info.stream, bus.stream);

    let published = bus
        .client
        .publish(&subject, &json!({"jobId": "J2"}), PublishOptions::default())
        .await;
    assert!(published.success);

    assert!(wait_for(|| received.lock().unwrap().len() == 1).await);
    let meta = received.lock().unwrap()[0].clone();
    assert_eq!(meta.delivery_attempt, 1);
    assert_eq!(meta.message_id.as_deref(), Some(published.message_id.as_str()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let consumer = bus
        .client
        .streams()
        .get_consumer_info(&bus.stream, &info.durable_name)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(consumer.num_ack_pending, 0);

    bus.cleanup().await;
}

#[tokio::test]
async fn test_nats_failed_handler_redelivers_until_max_deliver() {
    let bus = nats_bus!("redeliver");
    let subject = bus.subject("job.created");

    let attempts: Arc<Mutex<Vec<u64>>> = Arc::default();
    let log = attempts.clone();
    bus.client
        .subscribe(
            &subject,
            move |_: serde_json::Value, meta: MessageMetadata| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(meta.delivery_attempt);
                    Err(BoxError::from("always fails"))
                }
            },
            SubscribeOptions {
                deliver_policy: DeliverPolicy::New,
                max_deliver: Some(3),
                retry_delay_ms: Some(50),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    bus.client
        .publish(&subject, &json!({"jobId": "J3"}), PublishOptions::default())
        .await;

    assert!(wait_for(|| attempts.lock().unwrap().len() == 3).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3]);

    bus.cleanup().await;
}

#[tokio::test]
async fn test_nats_shutdown_clears_subscriptions() {
    let bus = nats_bus!("shutdown");
    let subject = bus.subject("job.created");

    bus.client
        .subscribe(
            &subject,
            |_: serde_json::Value, _: MessageMetadata| async { Ok(()) },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(bus.client.active_subscriptions().len(), 1);

    bus.client.streams().delete_stream(&bus.stream).await.unwrap();
    bus.client.shutdown().await.unwrap();
    assert!(bus.client.active_subscriptions().is_empty());
    assert!(!bus.client.is_connected());
}

#[tokio::test]
async fn test_nats_disconnect_drains_and_reconnects() {
    let bus = nats_bus!("drain");
    let subject = bus.subject("job.created");

    bus.client.connection().disconnect().await.unwrap();
    assert!(!bus.client.is_connected());
    // Second disconnect is a no-op
    bus.client.connection().disconnect().await.unwrap();

    let result = bus
        .client
        .publish(&subject, &json!({}), PublishOptions::default())
        .await;
    assert!(!result.success);

    bus.client.initialize().await.unwrap();
    assert!(bus.client.is_connected());
    let result = bus
        .client
        .publish(&subject, &json!({"jobId": "J9"}), PublishOptions::default())
        .await;
    assert!(result.success, "{:?}", result.error);

    bus.cleanup().await;
}

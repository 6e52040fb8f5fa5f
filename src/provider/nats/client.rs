//! NATS JetStream client: publish, stream and consumer management, consumption

use crate::config::{
    AckPolicy, ConsumerConfig, DeliverPolicy, DiscardPolicy, RetentionPolicy, StorageType,
    StreamConfig,
};
use crate::error::{MessagingError, Result};
use crate::provider::{DeliveryInfo, JetStreamApi, MessageStream, PendingMessage};
use crate::types::{ConsumerInfo, MessageEnvelope, PublishAck, StreamInfo, StreamState};
use async_nats::jetstream;
use async_nats::jetstream::context::GetStreamByNameErrorKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// `JetStreamApi` backed by an `async-nats` JetStream context
pub struct NatsJetStream {
    context: jetstream::Context,
}

impl NatsJetStream {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }

    /// Underlying JetStream context for advanced usage
    pub fn context(&self) -> &jetstream::Context {
        &self.context
    }

    async fn stream(&self, name: &str) -> Result<jetstream::stream::Stream> {
        self.context
            .get_stream(name)
            .await
            .map_err(|e| MessagingError::Stream(format!("Failed to get stream '{}': {}", name, e)))
    }
}

#[async_trait]
impl JetStreamApi for NatsJetStream {
    async fn publish(&self, envelope: &MessageEnvelope, timeout: Duration) -> Result<PublishAck> {
        let mut headers = async_nats::HeaderMap::new();
        for (key, value) in &envelope.headers {
            headers.insert(key.as_str(), value.as_str());
        }

        let publish_err = |reason: String| MessagingError::Publish {
            subject: envelope.subject.clone(),
            reason,
        };

        let ack_fut = self
            .context
            .publish_with_headers(envelope.subject.clone(), headers, envelope.payload.clone())
            .await
            .map_err(|e| publish_err(e.to_string()))?;

        let ack = tokio::time::timeout(timeout, ack_fut)
            .await
            .map_err(|_| {
                MessagingError::Timeout(format!(
                    "Publish ack timed out after {}ms for subject '{}'",
                    timeout.as_millis(),
                    envelope.subject
                ))
            })?
            .map_err(|e| publish_err(format!("ack failed: {}", e)))?;

        tracing::debug!(
            subject = %envelope.subject,
            message_id = %envelope.message_id,
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Message published"
        );

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn stream_info(&self, name: &str) -> Result<Option<StreamInfo>> {
        match self.context.get_stream(name).await {
            Ok(stream) => Ok(Some(from_stream_info(stream.cached_info()))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(MessagingError::Stream(format!(
                "Failed to get stream '{}': {}",
                name, e
            ))),
        }
    }

    async fn create_stream(&self, config: &StreamConfig) -> Result<StreamInfo> {
        match self.context.create_stream(to_stream_config(config)).await {
            Ok(stream) => Ok(from_stream_info(stream.cached_info())),
            Err(e) if is_already_exists(&e) => {
                Err(MessagingError::AlreadyExists(format!("stream '{}'", config.name)))
            }
            Err(e) => Err(MessagingError::Stream(format!(
                "Failed to create stream '{}': {}",
                config.name, e
            ))),
        }
    }

    async fn update_stream(&self, config: &StreamConfig) -> Result<StreamInfo> {
        let info = self
            .context
            .update_stream(to_stream_config(config))
            .await
            .map_err(|e| {
                MessagingError::Stream(format!("Failed to update stream '{}': {}", config.name, e))
            })?;
        Ok(from_stream_info(&info))
    }

    async fn delete_stream(&self, name: &str) -> Result<bool> {
        match self.context.delete_stream(name).await {
            Ok(status) => Ok(status.success),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(MessagingError::Stream(format!(
                "Failed to delete stream '{}': {}",
                name, e
            ))),
        }
    }

    async fn list_streams(&self) -> Result<Vec<StreamInfo>> {
        let mut streams = self.context.streams();
        let mut infos = Vec::new();
        while let Some(info) = streams.next().await {
            let info =
                info.map_err(|e| MessagingError::Stream(format!("Failed to list streams: {}", e)))?;
            infos.push(from_stream_info(&info));
        }
        Ok(infos)
    }

    async fn stream_by_subject(&self, subject: &str) -> Result<Option<String>> {
        match self.context.stream_by_subject(subject).await {
            Ok(name) => Ok(Some(name)),
            Err(e) if matches!(e.kind(), GetStreamByNameErrorKind::NotFound) => Ok(None),
            Err(e) => Err(MessagingError::Stream(format!(
                "Failed to look up stream for subject '{}': {}",
                subject, e
            ))),
        }
    }

    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<Option<ConsumerInfo>> {
        let stream = self.stream(stream).await?;
        match stream.consumer_info(durable).await {
            Ok(info) => Ok(Some(from_consumer_info(&info))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(MessagingError::Consumer(format!(
                "Failed to get consumer '{}': {}",
                durable, e
            ))),
        }
    }

    async fn create_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo> {
        let stream = self.stream(stream).await?;
        match stream.create_consumer(to_consumer_config(config)).await {
            Ok(consumer) => Ok(from_consumer_info(consumer.cached_info())),
            Err(e) if is_already_exists(&e) => Err(MessagingError::AlreadyExists(format!(
                "consumer '{}'",
                config.durable_name
            ))),
            Err(e) => Err(MessagingError::Consumer(format!(
                "Failed to create durable consumer '{}': {}",
                config.durable_name, e
            ))),
        }
    }

    async fn update_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo> {
        let stream = self.stream(stream).await?;
        let consumer = stream
            .update_consumer(to_consumer_config(config))
            .await
            .map_err(|e| {
                MessagingError::Consumer(format!(
                    "Failed to update consumer '{}': {}",
                    config.durable_name, e
                ))
            })?;
        Ok(from_consumer_info(consumer.cached_info()))
    }

    async fn delete_consumer(&self, stream: &str, durable: &str) -> Result<bool> {
        let stream = self.stream(stream).await?;
        match stream.delete_consumer(durable).await {
            Ok(status) => Ok(status.success),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(MessagingError::Consumer(format!(
                "Failed to delete consumer '{}': {}",
                durable, e
            ))),
        }
    }

    async fn list_consumers(&self, stream: &str) -> Result<Vec<ConsumerInfo>> {
        let stream = self.stream(stream).await?;
        let mut consumers = stream.consumers();
        let mut infos = Vec::new();
        while let Some(info) = consumers.next().await {
            let info = info
                .map_err(|e| MessagingError::Consumer(format!("Failed to list consumers: {}", e)))?;
            infos.push(from_consumer_info(&info));
        }
        Ok(infos)
    }

    async fn messages(&self, stream: &str, durable: &str) -> Result<MessageStream> {
        let consumer: jetstream::consumer::PullConsumer = self
            .stream(stream)
            .await?
            .get_consumer(durable)
            .await
            .map_err(|e| {
                MessagingError::Consumer(format!("Failed to get consumer '{}': {}", durable, e))
            })?;

        let messages = consumer.messages().await.map_err(|e| {
            MessagingError::Consumer(format!(
                "Failed to open message stream for '{}': {}",
                durable, e
            ))
        })?;

        let stream_name = stream.to_string();
        let deliveries = messages
            .filter_map(|item| async move {
                match item {
                    // Idle heartbeats are reported as errors but are recoverable
                    Err(e) if e.to_string().contains("heartbeat") => {
                        tracing::debug!(error = %e, "Missed idle heartbeat");
                        None
                    }
                    other => Some(other),
                }
            })
            .map(move |item| match item {
                Ok(msg) => to_pending(msg, &stream_name),
                Err(e) => Err(MessagingError::Connection(format!(
                    "Consume loop failed: {}",
                    e
                ))),
            });

        Ok(Box::pin(deliveries))
    }
}

fn to_pending(msg: jetstream::Message, stream: &str) -> Result<PendingMessage> {
    let info = {
        let meta = msg
            .info()
            .map_err(|e| MessagingError::Consumer(format!("Invalid delivery metadata: {}", e)))?;
        DeliveryInfo {
            stream: if meta.stream.is_empty() {
                stream.to_string()
            } else {
                meta.stream.to_string()
            },
            stream_sequence: meta.stream_sequence,
            delivered: meta.delivered.max(1) as u64,
            published: to_chrono(meta.published),
        }
    };

    let mut headers = HashMap::new();
    if let Some(map) = &msg.headers {
        for (name, values) in map.iter() {
            if let Some(value) = values.first() {
                headers.insert(name.to_string(), value.to_string());
            }
        }
    }

    let subject = msg.subject.to_string();
    let payload = msg.payload.clone();
    let ack_msg = Arc::new(msg);
    let nak_msg = ack_msg.clone();

    Ok(PendingMessage::new(
        subject,
        payload,
        headers,
        info,
        move || {
            async move {
                ack_msg
                    .ack()
                    .await
                    .map_err(|e| MessagingError::Ack(e.to_string()))
            }
            .boxed()
        },
        move |delay| {
            async move {
                nak_msg
                    .ack_with(jetstream::AckKind::Nak(delay))
                    .await
                    .map_err(|e| MessagingError::Ack(e.to_string()))
            }
            .boxed()
        },
    ))
}

fn is_not_found(e: &impl std::fmt::Display) -> bool {
    e.to_string().to_lowercase().contains("not found")
}

fn is_already_exists(e: &impl std::fmt::Display) -> bool {
    let text = e.to_string().to_lowercase();
    text.contains("already in use") || text.contains("already exists")
}

fn to_chrono(t: time::OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(t.unix_timestamp(), t.nanosecond()).unwrap_or_default()
}

fn to_stream_config(config: &StreamConfig) -> jetstream::stream::Config {
    jetstream::stream::Config {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        retention: match config.retention {
            RetentionPolicy::Limits => jetstream::stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => jetstream::stream::RetentionPolicy::Interest,
            RetentionPolicy::WorkQueue => jetstream::stream::RetentionPolicy::WorkQueue,
        },
        max_age: config.max_age(),
        max_messages: config.max_msgs,
        max_bytes: config.max_bytes,
        discard: match config.discard {
            DiscardPolicy::Old => jetstream::stream::DiscardPolicy::Old,
            DiscardPolicy::New => jetstream::stream::DiscardPolicy::New,
        },
        duplicate_window: config.duplicate_window(),
        storage: match config.storage {
            StorageType::File => jetstream::stream::StorageType::File,
            StorageType::Memory => jetstream::stream::StorageType::Memory,
        },
        num_replicas: config.replicas,
        ..Default::default()
    }
}

fn from_stream_info(info: &jetstream::stream::Info) -> StreamInfo {
    let c = &info.config;
    StreamInfo {
        config: StreamConfig {
            name: c.name.clone(),
            subjects: c.subjects.clone(),
            retention: match c.retention {
                jetstream::stream::RetentionPolicy::Limits => RetentionPolicy::Limits,
                jetstream::stream::RetentionPolicy::Interest => RetentionPolicy::Interest,
                jetstream::stream::RetentionPolicy::WorkQueue => RetentionPolicy::WorkQueue,
            },
            max_age_ms: c.max_age.as_millis() as u64,
            max_msgs: c.max_messages,
            max_bytes: c.max_bytes,
            discard: match c.discard {
                jetstream::stream::DiscardPolicy::New => DiscardPolicy::New,
                _ => DiscardPolicy::Old,
            },
            duplicate_window_ms: c.duplicate_window.as_millis() as u64,
            storage: match c.storage {
                jetstream::stream::StorageType::Memory => StorageType::Memory,
                _ => StorageType::File,
            },
            replicas: c.num_replicas,
        },
        state: StreamState {
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
            consumer_count: info.state.consumer_count,
        },
        created: to_chrono(info.created),
    }
}

/// Build a JetStream pull consumer config from a `ConsumerConfig`
fn to_consumer_config(config: &ConsumerConfig) -> jetstream::consumer::pull::Config {
    let deliver_policy = match &config.deliver_policy {
        DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
        DeliverPolicy::Last => jetstream::consumer::DeliverPolicy::Last,
        DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
        DeliverPolicy::ByStartSequence { sequence } => {
            jetstream::consumer::DeliverPolicy::ByStartSequence {
                start_sequence: *sequence,
            }
        }
        DeliverPolicy::ByStartTime { timestamp } => {
            let nanos = (*timestamp as i128) * 1_000_000;
            let start_time = time::OffsetDateTime::from_unix_timestamp_nanos(nanos)
                .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
            jetstream::consumer::DeliverPolicy::ByStartTime { start_time }
        }
        DeliverPolicy::LastPerSubject => jetstream::consumer::DeliverPolicy::LastPerSubject,
    };

    jetstream::consumer::pull::Config {
        durable_name: Some(config.durable_name.clone()),
        filter_subject: config.filter_subject.clone(),
        ack_policy: match config.ack_policy {
            AckPolicy::None => jetstream::consumer::AckPolicy::None,
            AckPolicy::All => jetstream::consumer::AckPolicy::All,
            AckPolicy::Explicit => jetstream::consumer::AckPolicy::Explicit,
        },
        deliver_policy,
        max_deliver: config.max_deliver,
        ack_wait: config.ack_wait(),
        max_ack_pending: config.max_ack_pending.unwrap_or(0),
        ..Default::default()
    }
}

fn from_consumer_info(info: &jetstream::consumer::Info) -> ConsumerInfo {
    let c = &info.config;
    let deliver_policy = match c.deliver_policy {
        jetstream::consumer::DeliverPolicy::All => DeliverPolicy::All,
        jetstream::consumer::DeliverPolicy::Last => DeliverPolicy::Last,
        jetstream::consumer::DeliverPolicy::New => DeliverPolicy::New,
        jetstream::consumer::DeliverPolicy::ByStartSequence { start_sequence } => {
            DeliverPolicy::ByStartSequence {
                sequence: start_sequence,
            }
        }
        jetstream::consumer::DeliverPolicy::ByStartTime { start_time } => {
            DeliverPolicy::ByStartTime {
                timestamp: (start_time.unix_timestamp_nanos() / 1_000_000).max(0) as u64,
            }
        }
        jetstream::consumer::DeliverPolicy::LastPerSubject => DeliverPolicy::LastPerSubject,
    };

    ConsumerInfo {
        stream_name: info.stream_name.clone(),
        config: ConsumerConfig {
            durable_name: c.durable_name.clone().unwrap_or_else(|| info.name.clone()),
            filter_subject: c.filter_subject.clone(),
            deliver_policy,
            ack_policy: match c.ack_policy {
                jetstream::consumer::AckPolicy::None => AckPolicy::None,
                jetstream::consumer::AckPolicy::All => AckPolicy::All,
                jetstream::consumer::AckPolicy::Explicit => AckPolicy::Explicit,
            },
            max_deliver: c.max_deliver,
            ack_wait_ms: c.ack_wait.as_millis() as u64,
            queue_group: None,
            max_ack_pending: (c.max_ack_pending > 0).then_some(c.max_ack_pending),
        },
        num_ack_pending: info.num_ack_pending as u64,
        num_redelivered: info.num_redelivered as u64,
        num_pending: info.num_pending,
        created: to_chrono(info.created),
    }
}

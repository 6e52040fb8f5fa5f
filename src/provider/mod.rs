//! Broker provider traits: the seam between the messaging core and a transport
//!
//! A `BrokerProvider` opens a `BrokerConnection`; the connection exposes a
//! `JetStreamApi` for streams, consumers, publishing, and consumption. The
//! connection manager, stream manager, and client only talk to these traits,
//! so NATS and the in-memory broker are interchangeable.

use crate::config::{ConnectionConfig, ConsumerConfig, StreamConfig};
use crate::connection::ConnectionObserver;
use crate::error::Result;
use crate::types::{ConsumerInfo, MessageEnvelope, PublishAck, StreamInfo, MSG_ID_HEADER};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub mod nats;

/// Opens physical connections to a broker
#[async_trait]
pub trait BrokerProvider: Send + Sync {
    /// Connect using `config`, reporting status changes to `observer`
    async fn connect(
        &self,
        config: &ConnectionConfig,
        observer: ConnectionObserver,
    ) -> Result<Arc<dyn BrokerConnection>>;

    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;
}

/// A live connection to the broker
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// JetStream context, `None` when the server has JetStream disabled
    fn jetstream(&self) -> Option<Arc<dyn JetStreamApi>>;

    /// Drain in-flight work, then close the connection
    async fn drain(&self) -> Result<()>;
}

/// Asynchronous stream of deliveries for one durable consumer
///
/// An `Err` item means the consume loop itself broke (e.g. connection
/// lost); the stream ends after it.
pub type MessageStream = BoxStream<'static, Result<PendingMessage>>;

/// JetStream operations used by the messaging core
#[async_trait]
pub trait JetStreamApi: Send + Sync {
    /// Publish an envelope and wait for the broker ack
    async fn publish(&self, envelope: &MessageEnvelope, timeout: Duration) -> Result<PublishAck>;

    /// Look up a stream by name; `Ok(None)` if absent
    async fn stream_info(&self, name: &str) -> Result<Option<StreamInfo>>;

    /// Create a stream; `MessagingError::AlreadyExists` if the name is taken
    async fn create_stream(&self, config: &StreamConfig) -> Result<StreamInfo>;

    /// Update an existing stream
    async fn update_stream(&self, config: &StreamConfig) -> Result<StreamInfo>;

    /// Delete a stream; `Ok(false)` if it did not exist
    async fn delete_stream(&self, name: &str) -> Result<bool>;

    async fn list_streams(&self) -> Result<Vec<StreamInfo>>;

    /// Name of the stream whose subjects cover `subject`
    async fn stream_by_subject(&self, subject: &str) -> Result<Option<String>>;

    /// Look up a durable consumer; `Ok(None)` if absent
    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<Option<ConsumerInfo>>;

    /// Create a durable consumer; `MessagingError::AlreadyExists` if taken
    async fn create_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo>;

    /// Update an existing durable consumer
    async fn update_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo>;

    /// Delete a durable consumer; `Ok(false)` if it did not exist
    async fn delete_consumer(&self, stream: &str, durable: &str) -> Result<bool>;

    async fn list_consumers(&self, stream: &str) -> Result<Vec<ConsumerInfo>>;

    /// Open the delivery stream bound to an existing durable consumer
    async fn messages(&self, stream: &str, durable: &str) -> Result<MessageStream>;
}

/// Broker-side delivery context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub stream: String,
    pub stream_sequence: u64,
    /// Number of times this message has been delivered (1 = first)
    pub delivered: u64,
    /// When the broker stored the message
    pub published: DateTime<Utc>,
}

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
type NakFn = Box<dyn FnOnce(Option<Duration>) -> BoxFuture<'static, Result<()>> + Send>;

/// A delivered message pending acknowledgement
pub struct PendingMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub info: DeliveryInfo,

    /// Ack callback: call to confirm processing
    ack_fn: AckFn,

    /// Nak callback: call to request redelivery after an optional delay
    nak_fn: NakFn,
}

impl PendingMessage {
    /// Create a new pending message with ack/nak callbacks
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        headers: HashMap<String, String>,
        info: DeliveryInfo,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nak_fn: impl FnOnce(Option<Duration>) -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers,
            info,
            ack_fn: Box::new(ack_fn),
            nak_fn: Box::new(nak_fn),
        }
    }

    /// Dedup id the publisher attached, if any
    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(MSG_ID_HEADER).map(String::as_str)
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Negative-acknowledge, asking for redelivery after `delay`
    pub async fn nak(self, delay: Option<Duration>) -> Result<()> {
        (self.nak_fn)(delay).await
    }
}

impl std::fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("info", &self.info)
            .finish()
    }
}

//! Core message types for the hire-bus messaging core
//!
//! All types use camelCase JSON serialization for wire compatibility.

use crate::config::{AckPolicy, ConsumerConfig, DeliverPolicy, StreamConfig};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header carrying the broker-side deduplication key
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// A message as it travels to the broker
///
/// Created at publish time; the broker stores it in the matching stream
/// until retention or discard rules evict it.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    /// Subject the message is published on
    pub subject: String,

    /// Encoded payload bytes
    pub payload: Bytes,

    /// Transport headers (dedup id included)
    pub headers: HashMap<String, String>,

    /// Deduplication id (`Nats-Msg-Id`)
    pub message_id: String,
}

impl MessageEnvelope {
    /// Build an envelope, stamping the dedup header from `message_id`
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        message_id: impl Into<String>,
        mut headers: HashMap<String, String>,
    ) -> Self {
        let message_id = message_id.into();
        headers.insert(MSG_ID_HEADER.to_string(), message_id.clone());
        Self {
            subject: subject.into(),
            payload,
            headers,
            message_id,
        }
    }
}

/// Delivery context handed to a message handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Subject the message was published on
    pub subject: String,

    /// Stream sequence number
    pub sequence: u64,

    /// When the broker stored the message
    pub timestamp: DateTime<Utc>,

    /// Delivery attempt (1 = first delivery)
    pub delivery_attempt: u64,

    /// Deduplication id, if the publisher set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Name of the stream the message lives in
    pub stream: String,

    /// Transport headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Outcome of a publish call
///
/// `publish` never fails outright; callers branch on `success`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResult {
    pub success: bool,

    /// Message id used as the dedup key
    pub message_id: String,

    /// Stream sequence assigned by the broker (success only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,

    /// Stream that stored the message (success only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,

    /// True when the broker recognized the message id as a duplicate
    #[serde(default)]
    pub duplicate: bool,

    /// Failure description (failure only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Time spent in the publish call, in milliseconds
    pub processing_time_ms: u64,

    /// When the publish completed
    pub timestamp: DateTime<Utc>,
}

impl PublishResult {
    pub(crate) fn succeeded(
        message_id: String,
        ack: &PublishAck,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            success: true,
            message_id,
            sequence: Some(ack.sequence),
            stream: Some(ack.stream.clone()),
            duplicate: ack.duplicate,
            error: None,
            processing_time_ms,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn failed(
        message_id: String,
        error: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            success: false,
            message_id,
            sequence: None,
            stream: None,
            duplicate: false,
            error: Some(error.into()),
            processing_time_ms,
            timestamp: Utc::now(),
        }
    }
}

/// Broker acknowledgement of a stored message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    pub duplicate: bool,
}

/// Health snapshot of the messaging core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResult {
    pub connected: bool,
    pub jetstream_available: bool,
    pub active_subscriptions: usize,

    /// Last successful broker operation (connect, publish, ack)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_operation: Option<DateTime<Utc>>,

    /// Reconnect attempts observed since the connection was opened
    pub reconnect_attempts: u64,

    /// Time since the current connection was established
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<u64>,

    /// Configured broker URL(s)
    pub server_url: String,
}

/// Options for a single publish
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOptions {
    /// Caller-supplied dedup id; takes precedence over the generated one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Publish timeout in milliseconds (default 5000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Extra transport headers
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl PublishOptions {
    /// Options carrying only a dedup id
    pub fn with_message_id(message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            ..Default::default()
        }
    }

    /// Add a header
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Options for a subscription
///
/// Unset fields fall back to the client defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeOptions {
    /// Durable consumer name (derived from service name and subject if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,

    #[serde(default)]
    pub deliver_policy: DeliverPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_policy: Option<AckPolicy>,

    /// Maximum delivery attempts (default 3)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,

    /// Broker ack wait in milliseconds (default 30000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_wait_ms: Option<u64>,

    /// Queue group shared by instances of the same service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_group: Option<String>,

    /// Per-message handler timeout in milliseconds (default 30000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_timeout_ms: Option<u64>,

    /// Redelivery delay after a nak in milliseconds (default 5000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,

    /// Maximum unacknowledged messages in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,
}

/// Stream state counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub consumer_count: usize,
}

/// Stream description returned by introspection calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub state: StreamState,
    pub created: DateTime<Utc>,
}

/// Consumer description returned by introspection calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub config: ConsumerConfig,
    /// Messages delivered but not yet acknowledged
    pub num_ack_pending: u64,
    /// Messages waiting for redelivery
    pub num_redelivered: u64,
    /// Messages not yet delivered
    pub num_pending: u64,
    pub created: DateTime<Utc>,
}

/// Subscription summary reported by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub subject: String,
    pub stream: String,
    pub durable_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_group: Option<String>,
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

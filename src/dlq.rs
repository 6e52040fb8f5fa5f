//! Exhaustion hook: messages whose final delivery attempt failed
//!
//! Opt-in via `MessagingClient::with_dead_letter`. Without a handler the
//! broker's own terminal policy applies once `max_deliver` is reached: the
//! message is simply no longer redelivered.

use crate::connection::{generate_message_id, ConnectionManager};
use crate::error::Result;
use crate::types::{MessageEnvelope, MessageMetadata};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Header carrying the subject a dead-lettered message was consumed from
pub const ORIGINAL_SUBJECT_HEADER: &str = "X-Original-Subject";

/// Header carrying the failure that exhausted the message
pub const DEAD_LETTER_REASON_HEADER: &str = "X-Dead-Letter-Reason";

/// A message whose last allowed delivery failed
#[derive(Debug, Clone)]
pub struct DeadLetterMessage {
    /// Raw payload as delivered
    pub payload: Bytes,

    /// Delivery context of the final attempt
    pub metadata: MessageMetadata,

    /// Handler failure on the final attempt
    pub reason: String,

    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterMessage {
    pub fn new(payload: Bytes, metadata: MessageMetadata, reason: impl Into<String>) -> Self {
        Self {
            payload,
            metadata,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Receives messages that exhausted their delivery attempts
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    /// Take ownership of an exhausted message
    ///
    /// `Ok` means the message is safe to acknowledge; an error leaves it to
    /// the broker's terminal policy.
    async fn handle(&self, message: DeadLetterMessage) -> Result<()>;

    /// Number of messages handled so far
    async fn count(&self) -> Result<usize> {
        Ok(0)
    }

    /// Most recent dead-lettered messages, newest first
    async fn list(&self, _limit: usize) -> Result<Vec<DeadLetterMessage>> {
        Ok(Vec::new())
    }
}

/// In-memory handler for development and testing
///
/// Keeps at most `max_messages` entries; the oldest are dropped first.
pub struct MemoryDeadLetterHandler {
    messages: Arc<RwLock<Vec<DeadLetterMessage>>>,
    max_messages: usize,
}

impl MemoryDeadLetterHandler {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Arc::new(RwLock::new(Vec::new())),
            max_messages,
        }
    }
}

impl Default for MemoryDeadLetterHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterHandler for MemoryDeadLetterHandler {
    async fn handle(&self, message: DeadLetterMessage) -> Result<()> {
        tracing::warn!(
            subject = %message.metadata.subject,
            sequence = message.metadata.sequence,
            attempt = message.metadata.delivery_attempt,
            reason = %message.reason,
            "Message dead-lettered"
        );

        let mut messages = self.messages.write().await;
        messages.push(message);

        if self.max_messages > 0 && messages.len() > self.max_messages {
            let drain_count = messages.len() - self.max_messages;
            messages.drain(..drain_count);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.messages.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterMessage>> {
        let messages = self.messages.read().await;
        Ok(messages.iter().rev().take(limit).cloned().collect())
    }
}

/// Republishes exhausted messages to `<prefix>.<original subject>`
///
/// A stream covering `<prefix>.>` must exist; the original subject and the
/// failure reason travel as headers.
pub struct SubjectDeadLetterHandler {
    connection: Arc<ConnectionManager>,
    prefix: String,
    publish_timeout: Duration,
    forwarded: AtomicUsize,
}

impl SubjectDeadLetterHandler {
    pub fn new(connection: Arc<ConnectionManager>, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            publish_timeout: Duration::from_secs(5),
            forwarded: AtomicUsize::new(0),
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Subject a message consumed from `subject` is forwarded to
    pub fn target_subject(&self, subject: &str) -> String {
        format!("{}.{}", self.prefix, subject)
    }
}

#[async_trait]
impl DeadLetterHandler for SubjectDeadLetterHandler {
    async fn handle(&self, message: DeadLetterMessage) -> Result<()> {
        let js = self.connection.require_jetstream()?;
        let meta = &message.metadata;

        let mut headers: HashMap<String, String> = meta.headers.clone();
        headers.insert(ORIGINAL_SUBJECT_HEADER.to_string(), meta.subject.clone());
        headers.insert(DEAD_LETTER_REASON_HEADER.to_string(), message.reason.clone());

        // Stable id so a retried hand-off is deduplicated
        let message_id = match &meta.message_id {
            Some(id) => format!("dlq-{}", id),
            None => generate_message_id(&format!("dlq-{}-{}", meta.stream, meta.sequence)),
        };

        let target = self.target_subject(&meta.subject);
        let envelope = MessageEnvelope::new(target.clone(), message.payload.clone(), message_id, headers);
        let ack = js.publish(&envelope, self.publish_timeout).await?;

        self.forwarded.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(
            subject = %meta.subject,
            target = %target,
            stream = %ack.stream,
            sequence = ack.sequence,
            reason = %message.reason,
            "Message dead-lettered to subject"
        );
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.forwarded.load(Ordering::SeqCst))
    }
}

/// Whether a failure on `delivery_attempt` is the last one the broker allows
///
/// A non-positive `max_deliver` means unlimited redelivery.
pub fn should_dead_letter(delivery_attempt: u64, max_deliver: i64) -> bool {
    max_deliver > 0 && delivery_attempt >= max_deliver as u64
}

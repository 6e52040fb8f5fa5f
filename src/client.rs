//! Messaging client: the publish/subscribe façade services use
//!
//! ## Delivery semantics
//!
//! At-least-once. A handler that returns `Ok` gets its message acked; an
//! error, a panic, or exceeding the handler timeout naks the message with a
//! redelivery delay. The broker redelivers until `max_deliver` attempts are
//! used up. Handlers must therefore be idempotent: the same message id can
//! arrive more than once.
//!
//! Messages of one subscription are handled one at a time in delivery
//! order; separate subscriptions run concurrently.

use crate::codec::JsonCodec;
use crate::config::{AckPolicy, ClientConfig, ConsumerConfig};
use crate::connection::{generate_message_id, ConnectionManager};
use crate::dlq::{should_dead_letter, DeadLetterHandler, DeadLetterMessage};
use crate::error::{BoxError, MessagingError, Result};
use crate::provider::nats::NatsProvider;
use crate::provider::{BrokerProvider, MessageStream, PendingMessage};
use crate::streams::StreamManager;
use crate::types::{
    HealthResult, MessageEnvelope, MessageMetadata, PublishOptions, PublishResult,
    SubscribeOptions, SubscriptionInfo,
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What a message handler returns
pub type HandlerResult = std::result::Result<(), BoxError>;

/// How long `unsubscribe`/`shutdown` wait for a consume loop to stop
const STOP_GRACE: Duration = Duration::from_secs(5);

struct ActiveSubscription {
    id: uuid::Uuid,
    info: SubscriptionInfo,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type SubscriptionMap = Arc<Mutex<HashMap<String, ActiveSubscription>>>;

/// Publish/subscribe client over a JetStream broker
pub struct MessagingClient {
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    streams: StreamManager,
    subscriptions: SubscriptionMap,
    dead_letter: Option<Arc<dyn DeadLetterHandler>>,
}

impl MessagingClient {
    /// Create a client backed by `provider`; call `initialize` before use
    pub fn new(config: ClientConfig, provider: impl BrokerProvider + 'static) -> Self {
        Self::with_provider(config, Arc::new(provider))
    }

    /// Create a client backed by NATS JetStream
    pub fn nats(config: ClientConfig) -> Self {
        Self::new(config, NatsProvider::new())
    }

    pub fn with_provider(config: ClientConfig, provider: Arc<dyn BrokerProvider>) -> Self {
        let connection = Arc::new(ConnectionManager::new(provider));
        Self {
            streams: StreamManager::new(connection.clone()),
            connection,
            config,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            dead_letter: None,
        }
    }

    /// Hand messages whose final delivery attempt failed to `handler`
    ///
    /// A message the handler accepts is acked; if the handler fails the
    /// message is nak'd and left to the broker's terminal policy.
    pub fn with_dead_letter(mut self, handler: Arc<dyn DeadLetterHandler>) -> Self {
        self.dead_letter = Some(handler);
        self
    }

    /// Connect and provision the configured streams
    ///
    /// With an optional connection, a failed connect is logged and
    /// provisioning is skipped; publish then reports failures and subscribe
    /// errors until a connection exists.
    pub async fn initialize(&self) -> Result<()> {
        self.connection.connect(&self.config.connection).await?;

        if !self.connection.is_connected() {
            tracing::warn!("Messaging disabled: broker unavailable, skipping stream provisioning");
            return Ok(());
        }

        if self.connection.jetstream().is_none() {
            if self.config.connection.optional {
                tracing::warn!("JetStream not available, skipping stream provisioning");
                return Ok(());
            }
            return Err(MessagingError::JetStreamUnavailable);
        }

        self.streams.ensure_streams_exist(&self.config.streams).await?;
        tracing::info!(
            service = %self.config.connection.service_name,
            streams = self.config.streams.len(),
            "Messaging client initialized"
        );
        Ok(())
    }

    /// Publish a payload
    ///
    /// Never fails: the outcome, including errors, is in the returned
    /// `PublishResult`. A caller-supplied message id is used as the dedup
    /// key, so republishing with the same id inside the stream's duplicate
    /// window stores the message once.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        payload: &T,
        options: PublishOptions,
    ) -> PublishResult {
        let start = Instant::now();
        let elapsed_ms = |start: Instant| start.elapsed().as_millis() as u64;

        let message_id = options
            .message_id
            .clone()
            .unwrap_or_else(|| generate_message_id(&sanitize_token(subject)));

        let Some(js) = self.connection.jetstream() else {
            tracing::warn!(subject = %subject, msg_id = %message_id, "Publish skipped: JetStream not available");
            return PublishResult::failed(
                message_id,
                MessagingError::JetStreamUnavailable.to_string(),
                elapsed_ms(start),
            );
        };

        let bytes = match JsonCodec::encode(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(subject = %subject, error = %e, "Publish failed: payload not encodable");
                return PublishResult::failed(message_id, e.to_string(), elapsed_ms(start));
            }
        };

        let timeout = Duration::from_millis(
            options.timeout_ms.unwrap_or(self.config.publish_timeout_ms),
        );
        let envelope = MessageEnvelope::new(subject, bytes, message_id.clone(), options.headers);

        let outcome = tokio::time::timeout(timeout, js.publish(&envelope, timeout))
            .await
            .unwrap_or_else(|_| {
                Err(MessagingError::Timeout(format!(
                    "publish to '{}' after {}ms",
                    subject,
                    timeout.as_millis()
                )))
            });

        match outcome {
            Ok(ack) => {
                self.connection.record_success();
                tracing::debug!(
                    subject = %subject,
                    msg_id = %message_id,
                    stream = %ack.stream,
                    sequence = ack.sequence,
                    duplicate = ack.duplicate,
                    "Message published"
                );
                PublishResult::succeeded(message_id, &ack, elapsed_ms(start))
            }
            Err(e) => {
                tracing::warn!(subject = %subject, msg_id = %message_id, error = %e, "Publish failed");
                PublishResult::failed(message_id, e.to_string(), elapsed_ms(start))
            }
        }
    }

    /// Start a durable subscription on `subject`
    ///
    /// Fails with `MessagingError::SubscriptionSetup` when there is no
    /// JetStream context, no stream captures `subject`, the consumer cannot
    /// be provisioned, or the durable name already has an active
    /// subscription in this client. The consume loop runs until
    /// `unsubscribe`/`shutdown`, or until the delivery stream breaks, in
    /// which case the subscription is dropped and not restarted.
    pub async fn subscribe<T, F, Fut>(
        &self,
        subject: &str,
        handler: F,
        options: SubscribeOptions,
    ) -> Result<SubscriptionInfo>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, MessageMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let setup_err = |reason: String| MessagingError::SubscriptionSetup {
            subject: subject.to_string(),
            reason,
        };

        let js = self
            .connection
            .jetstream()
            .ok_or_else(|| setup_err(MessagingError::JetStreamUnavailable.to_string()))?;

        let durable_name = options.durable_name.clone().unwrap_or_else(|| {
            derive_durable_name(
                &self.config.connection.service_name,
                options.queue_group.as_deref(),
                subject,
            )
        });

        if lock(&self.subscriptions).contains_key(&durable_name) {
            return Err(setup_err(format!(
                "durable consumer '{}' already has an active subscription",
                durable_name
            )));
        }

        let stream = self
            .streams
            .stream_for_subject(subject)
            .await
            .map_err(|e| setup_err(e.to_string()))?
            .ok_or_else(|| setup_err("no stream captures this subject".to_string()))?;

        let consumer_config = ConsumerConfig {
            durable_name: durable_name.clone(),
            filter_subject: subject.to_string(),
            deliver_policy: options.deliver_policy.clone(),
            ack_policy: options.ack_policy.unwrap_or(AckPolicy::Explicit),
            max_deliver: options.max_deliver.unwrap_or(self.config.max_deliver),
            ack_wait_ms: options.ack_wait_ms.unwrap_or(self.config.ack_wait_ms),
            queue_group: options.queue_group.clone(),
            max_ack_pending: options.max_ack_pending,
        };

        let consumer = self
            .streams
            .ensure_consumer_exists(&stream, &consumer_config)
            .await
            .map_err(|e| setup_err(e.to_string()))?;

        let messages = js
            .messages(&stream, &durable_name)
            .await
            .map_err(|e| setup_err(e.to_string()))?;

        let info = SubscriptionInfo {
            subject: subject.to_string(),
            stream: stream.clone(),
            durable_name: durable_name.clone(),
            queue_group: options.queue_group.clone(),
        };

        let ctx = ConsumeContext {
            subject: subject.to_string(),
            stream,
            durable_name: durable_name.clone(),
            handler_timeout: Duration::from_millis(
                options.handler_timeout_ms.unwrap_or(self.config.handler_timeout_ms),
            ),
            retry_delay: Duration::from_millis(
                options.retry_delay_ms.unwrap_or(self.config.retry_delay_ms),
            ),
            max_deliver: consumer.config.max_deliver,
            ack_policy: consumer.config.ack_policy,
            connection: self.connection.clone(),
            dead_letter: self.dead_letter.clone(),
        };

        let id = uuid::Uuid::new_v4();
        let cancel = CancellationToken::new();
        {
            // Re-checked under the same lock as the insert: a concurrent
            // subscribe may have claimed the durable while we provisioned
            let mut subscriptions = lock(&self.subscriptions);
            if subscriptions.contains_key(&durable_name) {
                return Err(setup_err(format!(
                    "durable consumer '{}' already has an active subscription",
                    durable_name
                )));
            }
            let task = tokio::spawn(consume_loop(
                ctx,
                messages,
                Arc::new(handler),
                cancel.clone(),
                self.subscriptions.clone(),
                id,
            ));
            subscriptions.insert(
                durable_name.clone(),
                ActiveSubscription {
                    id,
                    info: info.clone(),
                    cancel,
                    task,
                },
            );
        }

        tracing::info!(
            subject = %subject,
            stream = %info.stream,
            consumer = %durable_name,
            queue_group = ?info.queue_group,
            max_deliver = consumer.config.max_deliver,
            "Subscription started"
        );
        Ok(info)
    }

    /// Stop the subscription bound to `durable_name`
    ///
    /// The durable consumer stays on the broker, so a later subscribe
    /// resumes where this one stopped. Returns `false` if there was no such
    /// subscription.
    pub async fn unsubscribe(&self, durable_name: &str) -> Result<bool> {
        let Some(subscription) = lock(&self.subscriptions).remove(durable_name) else {
            return Ok(false);
        };
        stop_subscription(subscription).await;
        Ok(true)
    }

    /// Currently running subscriptions
    pub fn active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        lock(&self.subscriptions)
            .values()
            .map(|s| s.info.clone())
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn health_status(&self) -> HealthResult {
        let mut health = self.connection.health_status();
        health.active_subscriptions = lock(&self.subscriptions).len();
        health
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Stop every subscription, then drain and close the connection
    ///
    /// A subscription that fails to stop is logged and skipped.
    pub async fn shutdown(&self) -> Result<()> {
        let subscriptions: Vec<ActiveSubscription> = lock(&self.subscriptions)
            .drain()
            .map(|(_, s)| s)
            .collect();

        tracing::info!(subscriptions = subscriptions.len(), "Shutting down messaging client");

        for subscription in subscriptions {
            stop_subscription(subscription).await;
        }

        self.connection.disconnect().await
    }
}

async fn stop_subscription(mut subscription: ActiveSubscription) {
    let durable = subscription.info.durable_name.clone();
    subscription.cancel.cancel();

    match tokio::time::timeout(STOP_GRACE, &mut subscription.task).await {
        Ok(Ok(())) => {
            tracing::info!(consumer = %durable, subject = %subscription.info.subject, "Subscription stopped");
        }
        Ok(Err(e)) => {
            tracing::warn!(consumer = %durable, error = %e, "Consume loop ended abnormally");
        }
        Err(_) => {
            tracing::warn!(consumer = %durable, "Consume loop did not stop in time, aborting");
            subscription.task.abort();
        }
    }
}

/// Per-subscription settings the consume loop needs
struct ConsumeContext {
    subject: String,
    stream: String,
    durable_name: String,
    handler_timeout: Duration,
    retry_delay: Duration,
    max_deliver: i64,
    ack_policy: AckPolicy,
    connection: Arc<ConnectionManager>,
    dead_letter: Option<Arc<dyn DeadLetterHandler>>,
}

async fn consume_loop<T, F, Fut>(
    ctx: ConsumeContext,
    mut messages: MessageStream,
    handler: Arc<F>,
    cancel: CancellationToken,
    subscriptions: SubscriptionMap,
    id: uuid::Uuid,
) where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, MessageMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = messages.next() => next,
        };

        match next {
            Some(Ok(msg)) => process_message(&ctx, handler.as_ref(), msg).await,
            Some(Err(e)) => {
                tracing::error!(
                    subject = %ctx.subject,
                    consumer = %ctx.durable_name,
                    error = %e,
                    "Consume loop failed, subscription removed"
                );
                remove_subscription(&subscriptions, &ctx.durable_name, id);
                return;
            }
            None => {
                tracing::error!(
                    subject = %ctx.subject,
                    consumer = %ctx.durable_name,
                    "Delivery stream ended, subscription removed"
                );
                remove_subscription(&subscriptions, &ctx.durable_name, id);
                return;
            }
        }
    }

    tracing::debug!(consumer = %ctx.durable_name, "Consume loop cancelled");
}

fn remove_subscription(subscriptions: &SubscriptionMap, durable_name: &str, id: uuid::Uuid) {
    let mut subscriptions = lock(subscriptions);
    if subscriptions.get(durable_name).map(|s| s.id) == Some(id) {
        subscriptions.remove(durable_name);
    }
}

async fn process_message<T, F, Fut>(ctx: &ConsumeContext, handler: &F, msg: PendingMessage)
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, MessageMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let metadata = MessageMetadata {
        subject: msg.subject.clone(),
        sequence: msg.info.stream_sequence,
        timestamp: msg.info.published,
        delivery_attempt: msg.info.delivered.max(1),
        message_id: msg.message_id().map(str::to_string),
        stream: msg.info.stream.clone(),
        headers: msg.headers.clone(),
    };

    let outcome = match JsonCodec::decode::<T>(&msg.payload) {
        Ok(data) => run_handler(ctx, handler(data, metadata.clone())).await,
        Err(e) => Err(format!("payload decode failed: {}", e)),
    };

    if ctx.ack_policy == AckPolicy::None {
        if let Err(reason) = outcome {
            tracing::warn!(
                subject = %metadata.subject,
                sequence = metadata.sequence,
                error = %reason,
                "Handler failed on unacknowledged consumer, message dropped"
            );
        }
        return;
    }

    match outcome {
        Ok(()) => settle_ack(ctx, msg, &metadata).await,
        Err(reason) => settle_failure(ctx, msg, metadata, reason).await,
    }
}

/// Run the handler on its own task, bounded by the handler timeout
///
/// On timeout the task is detached rather than aborted: the message is
/// nak'd, but the handler may still finish in the background.
async fn run_handler<Fut>(ctx: &ConsumeContext, fut: Fut) -> std::result::Result<(), String>
where
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let task = tokio::spawn(fut);
    match tokio::time::timeout(ctx.handler_timeout, task).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Err(e)) => Err(format!("handler panicked: {}", e)),
        Err(_) => Err(MessagingError::HandlerTimeout {
            subject: ctx.subject.clone(),
            timeout_ms: ctx.handler_timeout.as_millis() as u64,
        }
        .to_string()),
    }
}

async fn settle_ack(ctx: &ConsumeContext, msg: PendingMessage, metadata: &MessageMetadata) {
    match msg.ack().await {
        Ok(()) => {
            ctx.connection.record_success();
            tracing::debug!(
                subject = %metadata.subject,
                stream = %metadata.stream,
                sequence = metadata.sequence,
                attempt = metadata.delivery_attempt,
                "Message acknowledged"
            );
        }
        Err(e) => {
            tracing::warn!(
                subject = %metadata.subject,
                sequence = metadata.sequence,
                error = %e,
                "Failed to acknowledge message; broker will redeliver after ack wait"
            );
        }
    }
}

async fn settle_failure(
    ctx: &ConsumeContext,
    msg: PendingMessage,
    metadata: MessageMetadata,
    reason: String,
) {
    let attempt = metadata.delivery_attempt;
    let exhausted = should_dead_letter(attempt, ctx.max_deliver);

    if exhausted {
        if let Some(dead_letter) = &ctx.dead_letter {
            let letter = DeadLetterMessage::new(msg.payload.clone(), metadata.clone(), reason.clone());
            match dead_letter.handle(letter).await {
                Ok(()) => {
                    settle_ack(ctx, msg, &metadata).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        subject = %metadata.subject,
                        sequence = metadata.sequence,
                        error = %e,
                        "Dead-letter handler failed"
                    );
                }
            }
        }
    }

    tracing::warn!(
        subject = %metadata.subject,
        stream = %metadata.stream,
        consumer = %ctx.durable_name,
        sequence = metadata.sequence,
        msg_id = ?metadata.message_id,
        attempt,
        max_deliver = ctx.max_deliver,
        exhausted,
        error = %reason,
        "Handler failed, message nak'd"
    );

    if let Err(e) = msg.nak(Some(ctx.retry_delay)).await {
        tracing::warn!(
            subject = %metadata.subject,
            sequence = metadata.sequence,
            error = %e,
            "Failed to nak message; broker will redeliver after ack wait"
        );
    }
}

/// Durable consumer name for `service` on `subject`
///
/// Instances of one service that share a queue group pull from the same
/// durable; the group is part of the name, never a replacement for the
/// service.
pub fn derive_durable_name(service: &str, queue_group: Option<&str>, subject: &str) -> String {
    match queue_group {
        Some(group) => format!(
            "{}-{}-{}",
            sanitize_token(service),
            sanitize_token(group),
            sanitize_token(subject)
        ),
        None => format!("{}-{}", sanitize_token(service), sanitize_token(subject)),
    }
}

/// Make a subject usable inside consumer names and message ids
fn sanitize_token(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '.' => out.push('_'),
            '*' => out.push_str("any"),
            '>' => out.push_str("all"),
            c if c.is_whitespace() => out.push('_'),
            c => out.push(c),
        }
    }
    out
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

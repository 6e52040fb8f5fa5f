//! In-memory JetStream emulation
//!
//! Single-process broker for tests and local development. Emulates the
//! parts of JetStream the messaging core depends on: subject-routed streams
//! with sequence numbers, `Nats-Msg-Id` deduplication inside the duplicate
//! window, count/age/byte limits with discard policy, durable consumers with
//! deliver policies, ack-wait redelivery, nak with delay, and `max_deliver`
//! exhaustion. Outages and connection drops can be simulated.

use super::{BrokerConnection, BrokerProvider, DeliveryInfo, JetStreamApi, MessageStream, PendingMessage};
use crate::config::{
    AckPolicy, ConnectionConfig, ConsumerConfig, DeliverPolicy, DiscardPolicy, RetentionPolicy,
    StreamConfig,
};
use crate::connection::{ConnectionEvent, ConnectionObserver};
use crate::error::{MessagingError, Result};
use crate::types::{ConsumerInfo, MessageEnvelope, PublishAck, StreamInfo, StreamState, MSG_ID_HEADER};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Upper bound on how long an idle consume loop sleeps before re-checking
const IDLE_POLL: Duration = Duration::from_millis(25);

/// In-process broker; clones share the same state
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    available: AtomicBool,
    jetstream_enabled: AtomicBool,
    /// Artificial latency before a publish is stored, in milliseconds
    publish_delay_ms: AtomicU64,
    connections: Mutex<Vec<Arc<LiveConnection>>>,
}

#[derive(Default)]
struct BrokerState {
    streams: BTreeMap<String, MemStream>,
}

struct LiveConnection {
    open: AtomicBool,
    interrupted: AtomicBool,
    observer: ConnectionObserver,
}

impl LiveConnection {
    fn usable(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.interrupted.load(Ordering::SeqCst)
    }
}

struct StoredMessage {
    subject: String,
    payload: Bytes,
    headers: HashMap<String, String>,
    stored_at: Instant,
    published: DateTime<Utc>,
}

struct MemStream {
    config: StreamConfig,
    created: DateTime<Utc>,
    messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    bytes: u64,
    dedup: HashMap<String, (u64, Instant)>,
    consumers: BTreeMap<String, MemConsumer>,
}

struct InFlight {
    deliveries: u64,
    /// When the message becomes eligible for redelivery
    redeliver_at: Instant,
}

struct MemConsumer {
    config: ConsumerConfig,
    created: DateTime<Utc>,
    /// Next never-delivered sequence
    next_sequence: u64,
    /// Delivered but unacknowledged messages, by stream sequence
    in_flight: BTreeMap<u64, InFlight>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty, available broker with JetStream enabled
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                available: AtomicBool::new(true),
                jetstream_enabled: AtomicBool::new(true),
                publish_delay_ms: AtomicU64::new(0),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Refuse (false) or accept (true) new connections
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Simulate a server with JetStream disabled
    pub fn set_jetstream_enabled(&self, enabled: bool) {
        self.inner.jetstream_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Simulate a slow server: every publish waits `delay` before it is stored
    pub fn set_publish_delay(&self, delay: Duration) {
        self.inner
            .publish_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Simulate a dropped connection: live consume loops fail and
    /// observers see `Disconnected`
    pub fn interrupt(&self) {
        for conn in self.live_connections() {
            if !conn.interrupted.swap(true, Ordering::SeqCst) {
                conn.observer.notify(ConnectionEvent::Disconnected);
            }
        }
        self.inner.notify.notify_waiters();
    }

    /// Simulate a successful transport reconnect after `interrupt`
    pub fn resume(&self) {
        for conn in self.live_connections() {
            if conn.interrupted.swap(false, Ordering::SeqCst) {
                conn.observer.notify(ConnectionEvent::Reconnecting { attempt: 1 });
                conn.observer.notify(ConnectionEvent::Connected);
            }
        }
    }

    /// Simulate the transport giving up (reconnects exhausted): live
    /// connections are closed for good and observers see `Closed`
    pub fn close(&self) {
        for conn in self.live_connections() {
            if conn.open.swap(false, Ordering::SeqCst) {
                conn.observer.notify(ConnectionEvent::Closed);
            }
        }
        self.inner.notify.notify_waiters();
    }

    fn live_connections(&self) -> Vec<Arc<LiveConnection>> {
        match self.inner.connections.lock() {
            Ok(mut conns) => {
                conns.retain(|c| c.open.load(Ordering::SeqCst));
                conns.clone()
            }
            Err(_) => Vec::new(),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| MessagingError::Stream("memory broker state poisoned".to_string()))
    }
}

#[async_trait]
impl BrokerProvider for MemoryBroker {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        observer: ConnectionObserver,
    ) -> Result<Arc<dyn BrokerConnection>> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(MessagingError::Connection(format!(
                "{}: connection refused",
                config.server_list()
            )));
        }

        let live = Arc::new(LiveConnection {
            open: AtomicBool::new(true),
            interrupted: AtomicBool::new(false),
            observer,
        });
        if let Ok(mut conns) = self.inner.connections.lock() {
            conns.push(live.clone());
        }

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            live,
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    live: Arc<LiveConnection>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn jetstream(&self) -> Option<Arc<dyn JetStreamApi>> {
        if !self.broker.inner.jetstream_enabled.load(Ordering::SeqCst) {
            return None;
        }
        Some(Arc::new(MemoryJetStream {
            broker: self.broker.clone(),
            live: self.live.clone(),
        }))
    }

    async fn drain(&self) -> Result<()> {
        if self.live.open.swap(false, Ordering::SeqCst) {
            self.live.observer.notify(ConnectionEvent::Closed);
        }
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryJetStream {
    broker: MemoryBroker,
    live: Arc<LiveConnection>,
}

impl MemoryJetStream {
    fn ensure_usable(&self) -> Result<()> {
        if self.live.usable() {
            Ok(())
        } else {
            Err(MessagingError::Connection("connection closed".to_string()))
        }
    }
}

#[async_trait]
impl JetStreamApi for MemoryJetStream {
    async fn publish(&self, envelope: &MessageEnvelope, _timeout: Duration) -> Result<PublishAck> {
        self.ensure_usable()?;
        let delay = self.broker.inner.publish_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.ensure_usable()?;
        }
        let publish_err = |reason: String| MessagingError::Publish {
            subject: envelope.subject.clone(),
            reason,
        };

        let now = Instant::now();
        let mut state = self.broker.state()?;
        let stream = state
            .streams
            .values_mut()
            .find(|s| s.config.subjects.iter().any(|p| subject_matches(p, &envelope.subject)))
            .ok_or_else(|| publish_err("no stream matches subject".to_string()))?;

        stream.expire(now);

        let msg_id = envelope.headers.get(MSG_ID_HEADER).cloned();
        if let Some(id) = &msg_id {
            if let Some((sequence, _)) = stream.dedup.get(id) {
                return Ok(PublishAck {
                    stream: stream.config.name.clone(),
                    sequence: *sequence,
                    duplicate: true,
                });
            }
        }

        stream
            .make_room(envelope.payload.len() as u64)
            .map_err(publish_err)?;

        stream.last_sequence += 1;
        let sequence = stream.last_sequence;
        stream.bytes += envelope.payload.len() as u64;
        stream.messages.insert(
            sequence,
            StoredMessage {
                subject: envelope.subject.clone(),
                payload: envelope.payload.clone(),
                headers: envelope.headers.clone(),
                stored_at: now,
                published: Utc::now(),
            },
        );
        if let Some(id) = msg_id {
            stream.dedup.insert(id, (sequence, now));
        }

        let ack = PublishAck {
            stream: stream.config.name.clone(),
            sequence,
            duplicate: false,
        };
        drop(state);
        self.broker.inner.notify.notify_waiters();
        Ok(ack)
    }

    async fn stream_info(&self, name: &str) -> Result<Option<StreamInfo>> {
        self.ensure_usable()?;
        let mut state = self.broker.state()?;
        Ok(state.streams.get_mut(name).map(|s| {
            s.expire(Instant::now());
            s.info()
        }))
    }

    async fn create_stream(&self, config: &StreamConfig) -> Result<StreamInfo> {
        self.ensure_usable()?;
        config.validate()?;
        let mut state = self.broker.state()?;
        if state.streams.contains_key(&config.name) {
            return Err(MessagingError::AlreadyExists(format!(
                "stream '{}'",
                config.name
            )));
        }
        check_subject_overlap(&state, config)?;

        let stream = MemStream {
            config: config.clone(),
            created: Utc::now(),
            messages: BTreeMap::new(),
            last_sequence: 0,
            bytes: 0,
            dedup: HashMap::new(),
            consumers: BTreeMap::new(),
        };
        let info = stream.info();
        state.streams.insert(config.name.clone(), stream);
        Ok(info)
    }

    async fn update_stream(&self, config: &StreamConfig) -> Result<StreamInfo> {
        self.ensure_usable()?;
        config.validate()?;
        let mut state = self.broker.state()?;
        check_subject_overlap(&state, config)?;
        let stream = state
            .streams
            .get_mut(&config.name)
            .ok_or_else(|| MessagingError::Stream(format!("stream '{}' not found", config.name)))?;
        if stream.config.storage != config.storage {
            return Err(MessagingError::Stream(format!(
                "stream '{}': storage type cannot be changed",
                config.name
            )));
        }
        stream.config = config.clone();
        stream.expire(Instant::now());
        Ok(stream.info())
    }

    async fn delete_stream(&self, name: &str) -> Result<bool> {
        self.ensure_usable()?;
        let removed = self.broker.state()?.streams.remove(name).is_some();
        self.broker.inner.notify.notify_waiters();
        Ok(removed)
    }

    async fn list_streams(&self) -> Result<Vec<StreamInfo>> {
        self.ensure_usable()?;
        let mut state = self.broker.state()?;
        let now = Instant::now();
        Ok(state
            .streams
            .values_mut()
            .map(|s| {
                s.expire(now);
                s.info()
            })
            .collect())
    }

    async fn stream_by_subject(&self, subject: &str) -> Result<Option<String>> {
        self.ensure_usable()?;
        let state = self.broker.state()?;
        Ok(state
            .streams
            .values()
            .find(|s| {
                s.config
                    .subjects
                    .iter()
                    .any(|p| subject_matches(p, subject) || subject_matches(subject, p))
            })
            .map(|s| s.config.name.clone()))
    }

    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<Option<ConsumerInfo>> {
        self.ensure_usable()?;
        let state = self.broker.state()?;
        let s = state
            .streams
            .get(stream)
            .ok_or_else(|| MessagingError::Stream(format!("stream '{}' not found", stream)))?;
        Ok(s.consumers.get(durable).map(|c| s.consumer_info(c)))
    }

    async fn create_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo> {
        self.ensure_usable()?;
        config.validate()?;
        let mut state = self.broker.state()?;
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| MessagingError::Stream(format!("stream '{}' not found", stream)))?;
        if s.consumers.contains_key(&config.durable_name) {
            return Err(MessagingError::AlreadyExists(format!(
                "consumer '{}' on stream '{}'",
                config.durable_name, stream
            )));
        }

        let consumer = MemConsumer {
            config: config.clone(),
            created: Utc::now(),
            next_sequence: s.start_sequence(&config.deliver_policy),
            in_flight: BTreeMap::new(),
        };
        let info = s.consumer_info(&consumer);
        s.consumers.insert(config.durable_name.clone(), consumer);
        Ok(info)
    }

    async fn update_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo> {
        self.ensure_usable()?;
        config.validate()?;
        let mut state = self.broker.state()?;
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| MessagingError::Stream(format!("stream '{}' not found", stream)))?;
        let consumer = s.consumers.get_mut(&config.durable_name).ok_or_else(|| {
            MessagingError::Consumer(format!("consumer '{}' not found", config.durable_name))
        })?;
        if consumer.config.deliver_policy != config.deliver_policy {
            return Err(MessagingError::Consumer(format!(
                "consumer '{}': deliver policy cannot be updated",
                config.durable_name
            )));
        }
        consumer.config = config.clone();

        let consumer = &s.consumers[&config.durable_name];
        Ok(s.consumer_info(consumer))
    }

    async fn delete_consumer(&self, stream: &str, durable: &str) -> Result<bool> {
        self.ensure_usable()?;
        let mut state = self.broker.state()?;
        let removed = state
            .streams
            .get_mut(stream)
            .map(|s| s.consumers.remove(durable).is_some())
            .unwrap_or(false);
        drop(state);
        self.broker.inner.notify.notify_waiters();
        Ok(removed)
    }

    async fn list_consumers(&self, stream: &str) -> Result<Vec<ConsumerInfo>> {
        self.ensure_usable()?;
        let state = self.broker.state()?;
        let s = state
            .streams
            .get(stream)
            .ok_or_else(|| MessagingError::Stream(format!("stream '{}' not found", stream)))?;
        Ok(s.consumers.values().map(|c| s.consumer_info(c)).collect())
    }

    async fn messages(&self, stream: &str, durable: &str) -> Result<MessageStream> {
        self.ensure_usable()?;
        {
            let state = self.broker.state()?;
            let exists = state
                .streams
                .get(stream)
                .map(|s| s.consumers.contains_key(durable))
                .unwrap_or(false);
            if !exists {
                return Err(MessagingError::Consumer(format!(
                    "consumer '{}' not found on stream '{}'",
                    durable, stream
                )));
            }
        }

        let cursor = Cursor {
            broker: self.broker.clone(),
            live: self.live.clone(),
            stream: stream.to_string(),
            durable: durable.to_string(),
            done: false,
        };

        Ok(Box::pin(futures::stream::unfold(cursor, |mut cursor| async move {
            if cursor.done {
                return None;
            }
            let item = cursor.next_message().await;
            if item.is_err() {
                cursor.done = true;
            }
            Some((item, cursor))
        })))
    }
}

/// Consume-loop state for one `messages()` stream
struct Cursor {
    broker: MemoryBroker,
    live: Arc<LiveConnection>,
    stream: String,
    durable: String,
    done: bool,
}

impl Cursor {
    async fn next_message(&mut self) -> Result<PendingMessage> {
        loop {
            if !self.live.usable() {
                return Err(MessagingError::Connection("connection lost".to_string()));
            }

            let notified = self.broker.inner.notify.notified();
            let wait = {
                let mut state = self.broker.state()?;
                let stream = state.streams.get_mut(&self.stream).ok_or_else(|| {
                    MessagingError::Stream(format!("stream '{}' deleted", self.stream))
                })?;
                match stream.next_delivery(&self.durable, Instant::now())? {
                    Delivery::Ready(msg) => return Ok(self.pending(msg)),
                    Delivery::WaitUntil(at) => at
                        .map(|at| at.saturating_duration_since(Instant::now()))
                        .unwrap_or(IDLE_POLL)
                        .min(IDLE_POLL),
                }
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn pending(&self, msg: ReadyMessage) -> PendingMessage {
        let ack_target = AckTarget {
            broker: self.broker.clone(),
            stream: self.stream.clone(),
            durable: self.durable.clone(),
            sequence: msg.sequence,
        };
        let nak_target = ack_target.clone();

        PendingMessage::new(
            msg.subject,
            msg.payload,
            msg.headers,
            DeliveryInfo {
                stream: self.stream.clone(),
                stream_sequence: msg.sequence,
                delivered: msg.delivered,
                published: msg.published,
            },
            move || async move { ack_target.ack() }.boxed(),
            move |delay| async move { nak_target.nak(delay) }.boxed(),
        )
    }
}

#[derive(Clone)]
struct AckTarget {
    broker: MemoryBroker,
    stream: String,
    durable: String,
    sequence: u64,
}

impl AckTarget {
    fn ack(&self) -> Result<()> {
        let mut state = self.broker.state()?;
        let stream = state
            .streams
            .get_mut(&self.stream)
            .ok_or_else(|| MessagingError::Ack(format!("stream '{}' not found", self.stream)))?;
        stream.ack(&self.durable, self.sequence)
    }

    fn nak(&self, delay: Option<Duration>) -> Result<()> {
        {
            let mut state = self.broker.state()?;
            let stream = state.streams.get_mut(&self.stream).ok_or_else(|| {
                MessagingError::Ack(format!("stream '{}' not found", self.stream))
            })?;
            let consumer = stream.consumers.get_mut(&self.durable).ok_or_else(|| {
                MessagingError::Ack(format!("consumer '{}' not found", self.durable))
            })?;
            if let Some(entry) = consumer.in_flight.get_mut(&self.sequence) {
                entry.redeliver_at = Instant::now() + delay.unwrap_or_default();
            }
        }
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }
}

struct ReadyMessage {
    sequence: u64,
    subject: String,
    payload: Bytes,
    headers: HashMap<String, String>,
    published: DateTime<Utc>,
    delivered: u64,
}

enum Delivery {
    Ready(ReadyMessage),
    /// Nothing deliverable; the earliest pending redelivery, if any
    WaitUntil(Option<Instant>),
}

impl MemStream {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            state: StreamState {
                messages: self.messages.len() as u64,
                bytes: self.bytes,
                first_sequence: self
                    .messages
                    .keys()
                    .next()
                    .copied()
                    .unwrap_or(self.last_sequence + 1),
                last_sequence: self.last_sequence,
                consumer_count: self.consumers.len(),
            },
            created: self.created,
        }
    }

    fn consumer_info(&self, consumer: &MemConsumer) -> ConsumerInfo {
        let filter = &consumer.config.filter_subject;
        let num_pending = self
            .messages
            .range(consumer.next_sequence..)
            .filter(|(_, m)| filter_matches(filter, &m.subject))
            .count() as u64;

        ConsumerInfo {
            stream_name: self.config.name.clone(),
            config: consumer.config.clone(),
            num_ack_pending: consumer.in_flight.len() as u64,
            num_redelivered: consumer
                .in_flight
                .values()
                .filter(|f| f.deliveries > 1)
                .count() as u64,
            num_pending,
            created: consumer.created,
        }
    }

    /// Drop messages past max age and dedup entries past the window
    fn expire(&mut self, now: Instant) {
        let max_age = self.config.max_age();
        if !max_age.is_zero() {
            let expired: Vec<u64> = self
                .messages
                .iter()
                .take_while(|(_, m)| now.saturating_duration_since(m.stored_at) >= max_age)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in expired {
                self.remove(seq);
            }
        }

        let window = self.config.duplicate_window();
        self.dedup
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < window);
    }

    /// Apply count/byte limits before storing a message of `size` bytes
    fn make_room(&mut self, size: u64) -> std::result::Result<(), String> {
        let over = |s: &MemStream| {
            (s.config.max_msgs >= 0 && s.messages.len() as i64 >= s.config.max_msgs)
                || (s.config.max_bytes >= 0 && (s.bytes + size) as i64 > s.config.max_bytes)
        };

        while over(self) {
            match self.config.discard {
                DiscardPolicy::New => {
                    return Err("maximum messages or bytes exceeded".to_string());
                }
                DiscardPolicy::Old => {
                    let Some(first) = self.messages.keys().next().copied() else {
                        return Err("message larger than stream max bytes".to_string());
                    };
                    self.remove(first);
                }
            }
        }
        Ok(())
    }

    fn remove(&mut self, sequence: u64) {
        if let Some(msg) = self.messages.remove(&sequence) {
            self.bytes = self.bytes.saturating_sub(msg.payload.len() as u64);
        }
    }

    fn start_sequence(&self, policy: &DeliverPolicy) -> u64 {
        let first = self
            .messages
            .keys()
            .next()
            .copied()
            .unwrap_or(self.last_sequence + 1);
        match policy {
            // LastPerSubject is not emulated; it replays like All
            DeliverPolicy::All | DeliverPolicy::LastPerSubject => first,
            DeliverPolicy::Last => self.last_sequence.max(1),
            DeliverPolicy::New => self.last_sequence + 1,
            DeliverPolicy::ByStartSequence { sequence } => (*sequence).max(1),
            DeliverPolicy::ByStartTime { timestamp } => self
                .messages
                .iter()
                .find(|(_, m)| m.published.timestamp_millis() >= *timestamp as i64)
                .map(|(seq, _)| *seq)
                .unwrap_or(self.last_sequence + 1),
        }
    }

    fn next_delivery(&mut self, durable: &str, now: Instant) -> Result<Delivery> {
        self.expire(now);

        let Some(consumer) = self.consumers.get_mut(durable) else {
            return Err(MessagingError::Consumer(format!(
                "consumer '{}' deleted",
                durable
            )));
        };
        let max_deliver = consumer.config.max_deliver;
        let ack_wait = consumer.config.ack_wait();
        let explicit = consumer.config.ack_policy != AckPolicy::None;

        // Drop in-flight entries that are gone from the stream or exhausted
        let messages = &self.messages;
        consumer.in_flight.retain(|seq, entry| {
            messages.contains_key(seq)
                && !(entry.redeliver_at <= now && max_deliver > 0 && entry.deliveries >= max_deliver as u64)
        });

        // Redeliveries first, in sequence order
        let due = consumer
            .in_flight
            .iter_mut()
            .find(|(_, entry)| entry.redeliver_at <= now);
        if let Some((seq, entry)) = due {
            entry.deliveries += 1;
            entry.redeliver_at = now + ack_wait;
            let (seq, delivered) = (*seq, entry.deliveries);
            if let Some(msg) = self.messages.get(&seq) {
                return Ok(Delivery::Ready(ready(seq, msg, delivered)));
            }
        }

        let at_capacity = consumer
            .config
            .max_ack_pending
            .map(|max| max > 0 && consumer.in_flight.len() as i64 >= max)
            .unwrap_or(false);

        if !at_capacity {
            let filter = consumer.config.filter_subject.clone();
            let next = self
                .messages
                .range(consumer.next_sequence..)
                .find(|(_, m)| filter_matches(&filter, &m.subject))
                .map(|(seq, _)| *seq);

            match next {
                Some(seq) => {
                    consumer.next_sequence = seq + 1;
                    if explicit {
                        consumer.in_flight.insert(
                            seq,
                            InFlight {
                                deliveries: 1,
                                redeliver_at: now + ack_wait,
                            },
                        );
                    }
                    return Ok(Delivery::Ready(ready(seq, &self.messages[&seq], 1)));
                }
                None => {
                    consumer.next_sequence = consumer.next_sequence.max(self.last_sequence + 1);
                }
            }
        }

        Ok(Delivery::WaitUntil(
            consumer.in_flight.values().map(|e| e.redeliver_at).min(),
        ))
    }

    fn ack(&mut self, durable: &str, sequence: u64) -> Result<()> {
        let consumer = self
            .consumers
            .get_mut(durable)
            .ok_or_else(|| MessagingError::Ack(format!("consumer '{}' not found", durable)))?;

        let acked: Vec<u64> = match consumer.config.ack_policy {
            AckPolicy::All => consumer.in_flight.range(..=sequence).map(|(s, _)| *s).collect(),
            _ => vec![sequence],
        };
        for seq in &acked {
            consumer.in_flight.remove(seq);
        }

        match self.config.retention {
            RetentionPolicy::Limits => {}
            RetentionPolicy::WorkQueue => {
                for seq in acked {
                    self.remove(seq);
                }
            }
            RetentionPolicy::Interest => {
                for seq in acked {
                    if self.all_interested_acked(seq) {
                        self.remove(seq);
                    }
                }
            }
        }
        Ok(())
    }

    fn all_interested_acked(&self, sequence: u64) -> bool {
        let Some(msg) = self.messages.get(&sequence) else {
            return true;
        };
        self.consumers.values().all(|c| {
            !filter_matches(&c.config.filter_subject, &msg.subject)
                || (c.next_sequence > sequence && !c.in_flight.contains_key(&sequence))
        })
    }
}

fn ready(sequence: u64, msg: &StoredMessage, delivered: u64) -> ReadyMessage {
    ReadyMessage {
        sequence,
        subject: msg.subject.clone(),
        payload: msg.payload.clone(),
        headers: msg.headers.clone(),
        published: msg.published,
        delivered,
    }
}

fn check_subject_overlap(state: &BrokerState, config: &StreamConfig) -> Result<()> {
    for other in state.streams.values() {
        if other.config.name == config.name {
            continue;
        }
        for mine in &config.subjects {
            for theirs in &other.config.subjects {
                if subject_matches(mine, theirs) || subject_matches(theirs, mine) {
                    return Err(MessagingError::Stream(format!(
                        "subjects overlap with an existing stream '{}'",
                        other.config.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Empty consumer filters match every subject
fn filter_matches(filter: &str, subject: &str) -> bool {
    filter.is_empty() || subject_matches(filter, subject)
}

/// Match a subject against a pattern: `*` matches one token, a trailing
/// `>` matches one or more tokens
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

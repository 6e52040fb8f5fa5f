//! Declarative configuration: connection, streams, consumers, client defaults
//!
//! All types use camelCase JSON serialization so stream definitions can be
//! supplied through the environment (`NATS_STREAMS`) or a config file.

use crate::error::{MessagingError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default broker URL
pub const DEFAULT_URL: &str = "nats://localhost:4222";

/// Connection settings for the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    /// Broker URLs (tried in order by the transport)
    pub servers: Vec<String>,

    /// Name of the owning service, used as the client name and as the
    /// prefix of derived durable consumer names
    pub service_name: String,

    /// When true, a failed connect is logged and startup continues in a
    /// disconnected state; stream/consumer provisioning is skipped
    pub optional: bool,

    /// Connect timeout in milliseconds
    pub timeout_ms: u64,

    /// Maximum reconnect attempts after a drop (negative = unlimited)
    pub max_reconnect_attempts: i64,

    /// Wait between reconnect attempts in milliseconds
    pub reconnect_wait_ms: u64,

    /// Optional auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_URL.to_string()],
            service_name: "hire-service".to_string(),
            optional: false,
            timeout_ms: 5_000,
            max_reconnect_attempts: 10,
            reconnect_wait_ms: 2_000,
            token: None,
        }
    }
}

impl ConnectionConfig {
    /// Create a config for a single server URL
    pub fn new(url: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            servers: vec![url.into()],
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Mark the connection optional
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    /// Reconnect limit as the transport expects it (`None` = unlimited)
    pub fn max_reconnects(&self) -> Option<usize> {
        usize::try_from(self.max_reconnect_attempts).ok()
    }

    /// Comma-joined server list
    pub fn server_list(&self) -> String {
        self.servers.join(",")
    }

    /// Validate the connection settings
    pub fn validate(&self) -> Result<()> {
        if self.servers.iter().all(|s| s.trim().is_empty()) {
            return Err(MessagingError::Config(
                "at least one broker URL is required".to_string(),
            ));
        }
        if self.service_name.trim().is_empty() {
            return Err(MessagingError::Config("service name is required".to_string()));
        }
        Ok(())
    }
}

/// Stream retention policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep messages until size/count/age limits evict them
    #[default]
    Limits,
    /// Keep messages while any consumer still has interest
    Interest,
    /// Remove each message once a consumer acknowledges it
    #[serde(alias = "work_queue")]
    WorkQueue,
}

/// Which messages are dropped when a stream hits its limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    /// Evict the oldest messages
    #[default]
    Old,
    /// Reject new messages
    New,
}

/// Storage backend for JetStream streams
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// File-based storage (persistent across restarts)
    #[default]
    File,
    /// Memory-based storage (faster, lost on restart)
    Memory,
}

/// Stream definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// Stream name, unique per broker
    pub name: String,

    /// Subject filters (`*` matches one token, `>` matches the tail)
    pub subjects: Vec<String>,

    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Maximum message age in milliseconds (0 = unlimited)
    #[serde(default)]
    pub max_age_ms: u64,

    /// Maximum stored messages (negative = unlimited)
    #[serde(default = "unlimited")]
    pub max_msgs: i64,

    /// Maximum stored bytes (negative = unlimited)
    #[serde(default = "unlimited")]
    pub max_bytes: i64,

    #[serde(default)]
    pub discard: DiscardPolicy,

    /// Deduplication horizon for `Nats-Msg-Id`, in milliseconds
    #[serde(default = "default_duplicate_window_ms")]
    pub duplicate_window_ms: u64,

    #[serde(default)]
    pub storage: StorageType,

    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

fn unlimited() -> i64 {
    -1
}

fn default_duplicate_window_ms() -> u64 {
    120_000
}

fn default_replicas() -> usize {
    1
}

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

impl StreamConfig {
    /// Create a limits-retention stream with default settings
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            retention: RetentionPolicy::Limits,
            max_age_ms: 7 * DAY_MS,
            max_msgs: 100_000,
            max_bytes: -1,
            discard: DiscardPolicy::Old,
            duplicate_window_ms: default_duplicate_window_ms(),
            storage: StorageType::File,
            replicas: 1,
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_window_ms)
    }

    /// Validate the stream definition
    pub fn validate(&self) -> Result<()> {
        if !is_valid_name(&self.name) {
            return Err(MessagingError::Config(format!(
                "invalid stream name '{}'",
                self.name
            )));
        }
        if self.subjects.is_empty() || self.subjects.iter().any(|s| s.trim().is_empty()) {
            return Err(MessagingError::Config(format!(
                "stream '{}' needs at least one non-empty subject",
                self.name
            )));
        }
        if self.max_age_ms > 0 && self.duplicate_window_ms > self.max_age_ms {
            return Err(MessagingError::Config(format!(
                "stream '{}': duplicate window {}ms exceeds max age {}ms",
                self.name, self.duplicate_window_ms, self.max_age_ms
            )));
        }
        Ok(())
    }

    /// Whether `other` differs in any setting that requires an update
    pub fn differs_from(&self, other: &StreamConfig) -> bool {
        let mut mine = self.subjects.clone();
        let mut theirs = other.subjects.clone();
        mine.sort();
        theirs.sort();

        mine != theirs
            || self.retention != other.retention
            || self.max_age_ms != other.max_age_ms
            || self.max_msgs != other.max_msgs
            || self.max_bytes != other.max_bytes
            || self.discard != other.discard
            || self.duplicate_window_ms != other.duplicate_window_ms
    }
}

/// Delivery policy for consumers
///
/// Controls where a new consumer starts reading from the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum DeliverPolicy {
    /// Deliver all available messages
    #[default]
    All,
    /// Deliver starting from the last message
    Last,
    /// Deliver only new messages published after the consumer is created
    New,
    /// Deliver starting from a specific sequence number
    ByStartSequence { sequence: u64 },
    /// Deliver starting from a specific timestamp (Unix milliseconds)
    ByStartTime { timestamp: u64 },
    /// Deliver the last message per subject
    LastPerSubject,
}

/// Acknowledgement policy for consumers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// No acknowledgement; delivery is fire-and-forget
    None,
    /// Acknowledging a message acknowledges every earlier one
    All,
    /// Every message is acknowledged individually
    #[default]
    Explicit,
}

/// Durable consumer definition, scoped to a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerConfig {
    /// Durable name, unique per stream
    pub durable_name: String,

    /// Only messages on matching subjects are delivered
    pub filter_subject: String,

    #[serde(default)]
    pub deliver_policy: DeliverPolicy,

    #[serde(default)]
    pub ack_policy: AckPolicy,

    /// Maximum delivery attempts (negative = unlimited)
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,

    /// How long the broker waits for an ack before redelivering
    #[serde(default = "default_ack_wait_ms")]
    pub ack_wait_ms: u64,

    /// Instances sharing a queue group split the consumer's messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_group: Option<String>,

    /// Maximum unacknowledged messages in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,
}

fn default_max_deliver() -> i64 {
    3
}

fn default_ack_wait_ms() -> u64 {
    30_000
}

impl ConsumerConfig {
    /// Create an explicit-ack durable consumer with default limits
    pub fn new(durable_name: impl Into<String>, filter_subject: impl Into<String>) -> Self {
        Self {
            durable_name: durable_name.into(),
            filter_subject: filter_subject.into(),
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::Explicit,
            max_deliver: default_max_deliver(),
            ack_wait_ms: default_ack_wait_ms(),
            queue_group: None,
            max_ack_pending: None,
        }
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }

    /// Validate the consumer definition
    pub fn validate(&self) -> Result<()> {
        if !is_valid_name(&self.durable_name) {
            return Err(MessagingError::Config(format!(
                "invalid durable consumer name '{}'",
                self.durable_name
            )));
        }
        if self.max_deliver == 0 {
            return Err(MessagingError::Config(format!(
                "consumer '{}': max_deliver must be non-zero",
                self.durable_name
            )));
        }
        Ok(())
    }

    /// Whether `other` differs in a setting the broker allows updating
    pub fn differs_from(&self, other: &ConsumerConfig) -> bool {
        self.filter_subject != other.filter_subject
            || self.max_deliver != other.max_deliver
            || self.ack_wait_ms != other.ack_wait_ms
            || self.max_ack_pending != other.max_ack_pending
    }
}

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,

    /// Streams provisioned by `initialize()`
    pub streams: Vec<StreamConfig>,

    /// Default publish timeout
    pub publish_timeout_ms: u64,

    /// Default per-message handler timeout
    pub handler_timeout_ms: u64,

    /// Default delay before a nak'd message is redelivered
    pub retry_delay_ms: u64,

    /// Default consumer max delivery attempts
    pub max_deliver: i64,

    /// Default consumer ack wait
    pub ack_wait_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            streams: default_streams(),
            publish_timeout_ms: 5_000,
            handler_timeout_ms: 30_000,
            retry_delay_ms: 5_000,
            max_deliver: default_max_deliver(),
            ack_wait_ms: default_ack_wait_ms(),
        }
    }
}

impl ClientConfig {
    /// Create a config with the given connection and default streams
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            ..Default::default()
        }
    }

    /// Replace the provisioned stream set
    pub fn with_streams(mut self, streams: Vec<StreamConfig>) -> Self {
        self.streams = streams;
        self
    }

    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    ///
    /// Recognized keys: `NATS_URL` / `NATS_SERVERS` (comma separated),
    /// `NATS_OPTIONAL`, `SERVICE_NAME`, `NATS_TIMEOUT_MS`,
    /// `NATS_MAX_RECONNECT_ATTEMPTS`, `NATS_RECONNECT_WAIT_MS`, `NATS_TOKEN`,
    /// `NATS_STREAMS` (JSON array of stream definitions).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let conn = &mut config.connection;

        if let Some(urls) = lookup("NATS_SERVERS").or_else(|| lookup("NATS_URL")) {
            let servers: Vec<String> = urls
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !servers.is_empty() {
                conn.servers = servers;
            }
        }
        if let Some(name) = lookup("SERVICE_NAME") {
            conn.service_name = name;
        }
        if let Some(optional) = parse_var::<bool>(&lookup, "NATS_OPTIONAL")? {
            conn.optional = optional;
        }
        if let Some(timeout) = parse_var(&lookup, "NATS_TIMEOUT_MS")? {
            conn.timeout_ms = timeout;
        }
        if let Some(attempts) = parse_var(&lookup, "NATS_MAX_RECONNECT_ATTEMPTS")? {
            conn.max_reconnect_attempts = attempts;
        }
        if let Some(wait) = parse_var(&lookup, "NATS_RECONNECT_WAIT_MS")? {
            conn.reconnect_wait_ms = wait;
        }
        conn.token = lookup("NATS_TOKEN").filter(|t| !t.is_empty());

        if let Some(json) = lookup("NATS_STREAMS") {
            config.streams = serde_json::from_str(&json).map_err(|e| {
                MessagingError::Config(format!("NATS_STREAMS is not valid JSON: {}", e))
            })?;
        }

        config.connection.validate()?;
        for stream in &config.streams {
            stream.validate()?;
        }

        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| MessagingError::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}

/// Default stream set for the recruitment platform
pub fn default_streams() -> Vec<StreamConfig> {
    [
        ("JOB_EVENTS", "job.>"),
        ("RESUME_EVENTS", "resume.>"),
        ("MATCHING_EVENTS", "matching.>"),
        ("QUESTIONNAIRE_EVENTS", "questionnaire.>"),
        ("INCENTIVE_EVENTS", "incentive.>"),
        ("USAGE_EVENTS", "usage.>"),
    ]
    .into_iter()
    .map(|(name, subject)| StreamConfig::new(name, vec![subject.to_string()]))
    .collect()
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

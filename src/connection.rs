//! Connection manager: owns the single broker connection and its JetStream context
//!
//! Reconnection is delegated to the transport. The manager only records the
//! status transitions the transport reports through a `ConnectionObserver`,
//! so `is_connected()` and `health_status()` reflect them as they happen.

use crate::config::ConnectionConfig;
use crate::error::{MessagingError, Result};
use crate::provider::{BrokerConnection, BrokerProvider, JetStreamApi};
use crate::types::{now_millis, HealthResult};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::time::Instant;

/// Transport status change reported by a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connection (re-)established
    Connected,
    /// Connection lost; the transport may be reconnecting
    Disconnected,
    /// Transport is about to make reconnect attempt number `attempt`
    Reconnecting { attempt: u64 },
    /// Non-fatal transport error
    Error(String),
    /// Connection closed for good (drained, or reconnects exhausted)
    Closed,
}

#[derive(Debug, Default)]
struct ConnectionStatus {
    connected: AtomicBool,
    /// Transport gave up on the connection; a new one is needed
    closed: AtomicBool,
    reconnect_attempts: AtomicU64,
    connected_at: Mutex<Option<Instant>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl ConnectionStatus {
    fn touch(&self) {
        if let Ok(mut last) = self.last_success.lock() {
            *last = Some(Utc::now());
        }
    }

    fn set_connected_at(&self, at: Option<Instant>) {
        if let Ok(mut connected_at) = self.connected_at.lock() {
            *connected_at = at;
        }
    }
}

/// Handle given to providers for reporting status changes
///
/// Cheap to clone; callbacks may fire from any task.
#[derive(Debug, Clone)]
pub struct ConnectionObserver {
    status: Arc<ConnectionStatus>,
}

impl ConnectionObserver {
    /// Record a status change
    pub fn notify(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.status.closed.store(false, Ordering::SeqCst);
                let was_connected = self.status.connected.swap(true, Ordering::SeqCst);
                if !was_connected {
                    tracing::info!("Broker connection established");
                }
                self.status.set_connected_at(Some(Instant::now()));
                self.status.touch();
            }
            ConnectionEvent::Disconnected => {
                self.status.connected.store(false, Ordering::SeqCst);
                tracing::warn!("Broker connection lost");
            }
            ConnectionEvent::Reconnecting { attempt } => {
                self.status.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                tracing::info!(attempt, "Reconnecting to broker");
            }
            ConnectionEvent::Error(error) => {
                tracing::warn!(error = %error, "Broker connection error");
            }
            ConnectionEvent::Closed => {
                self.status.closed.store(true, Ordering::SeqCst);
                self.status.connected.store(false, Ordering::SeqCst);
                self.status.set_connected_at(None);
                tracing::info!("Broker connection closed");
            }
        }
    }
}

/// Owns the broker connection and exposes its state
pub struct ConnectionManager {
    provider: Arc<dyn BrokerProvider>,
    status: Arc<ConnectionStatus>,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    server_url: RwLock<String>,
}

impl ConnectionManager {
    /// Create a disconnected manager backed by `provider`
    pub fn new(provider: Arc<dyn BrokerProvider>) -> Self {
        Self {
            provider,
            status: Arc::new(ConnectionStatus::default()),
            connection: RwLock::new(None),
            server_url: RwLock::new(String::new()),
        }
    }

    /// Establish the connection and JetStream context
    ///
    /// Fails with `MessagingError::Connection` unless `config.optional` is
    /// set, in which case the failure is logged and the manager stays
    /// disconnected. Calling `connect` while connected (or while the
    /// transport is still reconnecting) is a no-op; a connection the
    /// transport has closed is replaced.
    pub async fn connect(&self, config: &ConnectionConfig) -> Result<()> {
        config.validate()?;

        if self.current().is_some() {
            if !self.status.closed.load(Ordering::SeqCst) {
                tracing::debug!("Already connected, ignoring connect()");
                return Ok(());
            }
            tracing::info!("Previous connection was closed by the transport, reconnecting");
            if let Ok(mut slot) = self.connection.write() {
                slot.take();
            }
        }

        if let Ok(mut url) = self.server_url.write() {
            *url = config.server_list();
        }

        let observer = ConnectionObserver {
            status: self.status.clone(),
        };

        let attempt = tokio::time::timeout(
            config.timeout(),
            self.provider.connect(config, observer.clone()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(MessagingError::Connection(format!(
                "connect to {} timed out after {}ms",
                config.server_list(),
                config.timeout_ms
            )))
        });

        match attempt {
            Ok(connection) => {
                let jetstream = connection.jetstream().is_some();
                if let Ok(mut slot) = self.connection.write() {
                    *slot = Some(connection);
                }
                self.status.reconnect_attempts.store(0, Ordering::SeqCst);
                self.status.closed.store(false, Ordering::SeqCst);
                observer.notify(ConnectionEvent::Connected);

                tracing::info!(
                    provider = self.provider.name(),
                    servers = %config.server_list(),
                    service = %config.service_name,
                    jetstream,
                    "Connected to broker"
                );
                Ok(())
            }
            Err(e) if config.optional => {
                tracing::warn!(
                    servers = %config.server_list(),
                    error = %e,
                    "Broker unavailable; continuing without messaging (connection is optional)"
                );
                Ok(())
            }
            Err(e) => Err(match e {
                MessagingError::Connection(_) => e,
                other => MessagingError::Connection(other.to_string()),
            }),
        }
    }

    /// Drain and close the connection; safe to call when already disconnected
    pub async fn disconnect(&self) -> Result<()> {
        let connection = match self.connection.write() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };

        let Some(connection) = connection else {
            tracing::debug!("Not connected, nothing to disconnect");
            return Ok(());
        };

        if let Err(e) = connection.drain().await {
            tracing::warn!(error = %e, "Failed to drain broker connection");
        }

        self.status.connected.store(false, Ordering::SeqCst);
        self.status.set_connected_at(None);
        tracing::info!("Disconnected from broker");
        Ok(())
    }

    /// Current transport state
    pub fn is_connected(&self) -> bool {
        self.status.connected.load(Ordering::SeqCst) && self.current().is_some()
    }

    /// JetStream context, if connected and available
    pub fn jetstream(&self) -> Option<Arc<dyn JetStreamApi>> {
        if !self.is_connected() {
            return None;
        }
        self.current()?.jetstream()
    }

    /// JetStream context or `MessagingError::JetStreamUnavailable`
    pub fn require_jetstream(&self) -> Result<Arc<dyn JetStreamApi>> {
        self.jetstream().ok_or(MessagingError::JetStreamUnavailable)
    }

    /// Record a successful broker operation for health reporting
    pub fn record_success(&self) {
        self.status.touch();
    }

    /// Synthesize a health snapshot
    ///
    /// `active_subscriptions` is filled in by the client, which owns them.
    pub fn health_status(&self) -> HealthResult {
        let connected = self.is_connected();
        let uptime_ms = self
            .status
            .connected_at
            .lock()
            .ok()
            .and_then(|at| *at)
            .filter(|_| connected)
            .map(|at| at.elapsed().as_millis() as u64);

        HealthResult {
            connected,
            jetstream_available: self.jetstream().is_some(),
            active_subscriptions: 0,
            last_successful_operation: self.status.last_success.lock().ok().and_then(|l| *l),
            reconnect_attempts: self.status.reconnect_attempts.load(Ordering::SeqCst),
            uptime_ms,
            server_url: self
                .server_url
                .read()
                .map(|u| u.clone())
                .unwrap_or_default(),
        }
    }

    /// Generate a dedup id of the form `prefix-timestamp-random`
    pub fn generate_message_id(&self, prefix: &str) -> String {
        generate_message_id(prefix)
    }

    /// Provider name
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.connection.read().ok().and_then(|c| c.clone())
    }
}

/// Generate a dedup id of the form `prefix-timestamp-random`
pub fn generate_message_id(prefix: &str) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, now_millis(), &random[..9])
}

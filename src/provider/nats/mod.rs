//! NATS JetStream broker provider
//!
//! Implements `BrokerProvider` on top of `async-nats`. Reconnection is left
//! to the client library; its connection events are forwarded to the
//! `ConnectionObserver` so the connection manager can report them.

mod client;

pub use client::NatsJetStream;

use super::{BrokerConnection, BrokerProvider, JetStreamApi};
use crate::config::ConnectionConfig;
use crate::connection::{ConnectionEvent, ConnectionObserver};
use crate::error::{MessagingError, Result};
use async_nats::jetstream;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// NATS JetStream provider
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsProvider;

impl NatsProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerProvider for NatsProvider {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        observer: ConnectionObserver,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let servers = config.server_list();
        let client = build_connect_options(config, observer.clone())
            .connect(servers.as_str())
            .await
            .map_err(|e| MessagingError::Connection(format!("{}: {}", servers, e)))?;

        tracing::info!(servers = %servers, "Connected to NATS");

        let context = jetstream::new(client.clone());
        let jetstream = match context.query_account().await {
            Ok(account) => {
                tracing::debug!(
                    streams = account.streams,
                    consumers = account.consumers,
                    "JetStream account available"
                );
                Some(Arc::new(NatsJetStream::new(context)))
            }
            Err(e) => {
                tracing::warn!(error = %e, "JetStream not available on this server");
                None
            }
        };

        Ok(Arc::new(NatsConnection {
            client,
            jetstream,
            closed: AtomicBool::new(false),
            observer,
        }))
    }

    fn name(&self) -> &str {
        "nats"
    }
}

struct NatsConnection {
    client: async_nats::Client,
    jetstream: Option<Arc<NatsJetStream>>,
    closed: AtomicBool,
    observer: ConnectionObserver,
}

#[async_trait]
impl BrokerConnection for NatsConnection {
    fn jetstream(&self) -> Option<Arc<dyn JetStreamApi>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.jetstream
            .clone()
            .map(|js| js as Arc<dyn JetStreamApi>)
    }

    async fn drain(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Flushes pending publishes, unsubscribes, then closes the transport
        let drained = self
            .client
            .drain()
            .await
            .map_err(|e| MessagingError::Connection(format!("drain failed: {}", e)));
        self.observer.notify(ConnectionEvent::Closed);
        drained
    }
}

/// Build NATS connect options from config
fn build_connect_options(
    config: &ConnectionConfig,
    observer: ConnectionObserver,
) -> async_nats::ConnectOptions {
    let reconnect_wait = config.reconnect_wait();
    let reconnect_observer = observer.clone();

    let mut opts = async_nats::ConnectOptions::new()
        .name(config.service_name.clone())
        .connection_timeout(config.timeout())
        .max_reconnects(config.max_reconnects())
        .reconnect_delay_callback(move |attempts: usize| {
            if attempts == 0 {
                return Duration::ZERO;
            }
            reconnect_observer.notify(ConnectionEvent::Reconnecting {
                attempt: attempts as u64,
            });
            reconnect_wait
        })
        .event_callback(move |event| {
            let observer = observer.clone();
            async move {
                observer.notify(map_event(event));
            }
        });

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

fn map_event(event: async_nats::Event) -> ConnectionEvent {
    match event {
        async_nats::Event::Connected => ConnectionEvent::Connected,
        async_nats::Event::Disconnected => ConnectionEvent::Disconnected,
        async_nats::Event::Closed => ConnectionEvent::Closed,
        other => ConnectionEvent::Error(other.to_string()),
    }
}

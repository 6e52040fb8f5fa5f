//! Stream manager: declarative, idempotent stream and consumer provisioning
//!
//! Every service instance calls `ensure_streams_exist` at startup. Instances
//! racing to create the same stream or consumer do not fail: "already
//! exists" counts as success and the existing definition is reconciled.

use crate::config::{ConsumerConfig, StreamConfig};
use crate::connection::ConnectionManager;
use crate::error::{MessagingError, Result};
use crate::provider::JetStreamApi;
use crate::types::{ConsumerInfo, StreamInfo};
use std::sync::Arc;

/// Provisions and inspects streams and durable consumers
pub struct StreamManager {
    connection: Arc<ConnectionManager>,
}

impl StreamManager {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Create missing streams and update changed ones
    pub async fn ensure_streams_exist(&self, configs: &[StreamConfig]) -> Result<()> {
        for config in configs {
            self.ensure_stream(config).await?;
        }
        Ok(())
    }

    /// Create or update a single stream, returning its current description
    pub async fn ensure_stream(&self, config: &StreamConfig) -> Result<StreamInfo> {
        config.validate()?;
        let js = self.connection.require_jetstream()?;

        let existing = match js.stream_info(&config.name).await? {
            Some(existing) => existing,
            None => match js.create_stream(config).await {
                Ok(info) => {
                    tracing::info!(
                        stream = %config.name,
                        subjects = ?config.subjects,
                        retention = ?config.retention,
                        "Stream created"
                    );
                    self.connection.record_success();
                    return Ok(info);
                }
                Err(MessagingError::AlreadyExists(_)) => {
                    tracing::debug!(stream = %config.name, "Stream created concurrently");
                    js.stream_info(&config.name).await?.ok_or_else(|| {
                        MessagingError::Stream(format!(
                            "stream '{}' vanished after a concurrent create",
                            config.name
                        ))
                    })?
                }
                Err(e) => return Err(e),
            },
        };

        self.reconcile_stream(js.as_ref(), config, existing).await
    }

    async fn reconcile_stream(
        &self,
        js: &dyn JetStreamApi,
        config: &StreamConfig,
        existing: StreamInfo,
    ) -> Result<StreamInfo> {
        if !config.differs_from(&existing.config) {
            tracing::debug!(stream = %config.name, "Stream up to date");
            return Ok(existing);
        }

        let mut desired = config.clone();
        if desired.storage != existing.config.storage {
            tracing::warn!(
                stream = %config.name,
                existing = ?existing.config.storage,
                requested = ?config.storage,
                "Storage type cannot be changed, keeping existing"
            );
            desired.storage = existing.config.storage;
        }

        let info = js.update_stream(&desired).await?;
        tracing::info!(
            stream = %config.name,
            subjects = ?desired.subjects,
            retention = ?desired.retention,
            "Stream updated"
        );
        self.connection.record_success();
        Ok(info)
    }

    /// Create or update a durable consumer on `stream_name`
    pub async fn ensure_consumer_exists(
        &self,
        stream_name: &str,
        config: &ConsumerConfig,
    ) -> Result<ConsumerInfo> {
        config.validate()?;
        let js = self.connection.require_jetstream()?;

        let existing = match js.consumer_info(stream_name, &config.durable_name).await? {
            Some(existing) => existing,
            None => match js.create_consumer(stream_name, config).await {
                Ok(info) => {
                    tracing::info!(
                        stream = %stream_name,
                        consumer = %config.durable_name,
                        filter = %config.filter_subject,
                        max_deliver = config.max_deliver,
                        ack_wait_ms = config.ack_wait_ms,
                        "Consumer created"
                    );
                    self.connection.record_success();
                    return Ok(info);
                }
                Err(MessagingError::AlreadyExists(_)) => {
                    tracing::debug!(consumer = %config.durable_name, "Consumer created concurrently");
                    js.consumer_info(stream_name, &config.durable_name)
                        .await?
                        .ok_or_else(|| {
                            MessagingError::Consumer(format!(
                                "consumer '{}' vanished after a concurrent create",
                                config.durable_name
                            ))
                        })?
                }
                Err(e) => return Err(e),
            },
        };

        let mut desired = config.clone();
        if desired.max_ack_pending.is_none() {
            desired.max_ack_pending = existing.config.max_ack_pending;
        }
        if desired.deliver_policy != existing.config.deliver_policy {
            tracing::warn!(
                consumer = %config.durable_name,
                existing = ?existing.config.deliver_policy,
                requested = ?config.deliver_policy,
                "Deliver policy cannot be changed, keeping existing"
            );
            desired.deliver_policy = existing.config.deliver_policy.clone();
        }
        if desired.ack_policy != existing.config.ack_policy {
            tracing::warn!(
                consumer = %config.durable_name,
                existing = ?existing.config.ack_policy,
                requested = ?config.ack_policy,
                "Ack policy cannot be changed, keeping existing"
            );
            desired.ack_policy = existing.config.ack_policy;
        }

        if !desired.differs_from(&existing.config) {
            tracing::debug!(consumer = %config.durable_name, "Consumer up to date");
            return Ok(existing);
        }

        let info = js.update_consumer(stream_name, &desired).await?;
        tracing::info!(
            stream = %stream_name,
            consumer = %config.durable_name,
            filter = %desired.filter_subject,
            max_deliver = desired.max_deliver,
            "Consumer updated"
        );
        self.connection.record_success();
        Ok(info)
    }

    /// Stream description, `None` if absent
    pub async fn get_stream_info(&self, name: &str) -> Result<Option<StreamInfo>> {
        self.connection.require_jetstream()?.stream_info(name).await
    }

    /// Consumer description, `None` if the stream or consumer is absent
    pub async fn get_consumer_info(
        &self,
        stream_name: &str,
        durable_name: &str,
    ) -> Result<Option<ConsumerInfo>> {
        let js = self.connection.require_jetstream()?;
        if js.stream_info(stream_name).await?.is_none() {
            return Ok(None);
        }
        js.consumer_info(stream_name, durable_name).await
    }

    pub async fn list_streams(&self) -> Result<Vec<StreamInfo>> {
        self.connection.require_jetstream()?.list_streams().await
    }

    /// Consumers on `stream_name`; empty if the stream is absent
    pub async fn list_consumers(&self, stream_name: &str) -> Result<Vec<ConsumerInfo>> {
        let js = self.connection.require_jetstream()?;
        if js.stream_info(stream_name).await?.is_none() {
            return Ok(Vec::new());
        }
        js.list_consumers(stream_name).await
    }

    /// Name of the stream that captures `subject`
    pub async fn stream_for_subject(&self, subject: &str) -> Result<Option<String>> {
        self.connection
            .require_jetstream()?
            .stream_by_subject(subject)
            .await
    }

    /// Delete a stream and all its messages; `false` if it did not exist
    pub async fn delete_stream(&self, name: &str) -> Result<bool> {
        let deleted = self.connection.require_jetstream()?.delete_stream(name).await?;
        if deleted {
            tracing::warn!(stream = %name, "Stream deleted");
        }
        Ok(deleted)
    }

    /// Delete a durable consumer; `false` if it (or its stream) did not exist
    pub async fn delete_consumer(&self, stream_name: &str, durable_name: &str) -> Result<bool> {
        let js = self.connection.require_jetstream()?;
        if js.stream_info(stream_name).await?.is_none() {
            return Ok(false);
        }
        let deleted = js.delete_consumer(stream_name, durable_name).await?;
        if deleted {
            tracing::info!(stream = %stream_name, consumer = %durable_name, "Consumer deleted");
        }
        Ok(deleted)
    }
}

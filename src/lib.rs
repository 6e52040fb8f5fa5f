//! # hire-bus
//!
//! Resilient JetStream messaging core for the recruitment platform's services.
//!
//! ## Overview
//!
//! `hire-bus` gives every service the same way to publish and consume durable
//! events: one shared broker connection, declarative stream and consumer
//! provisioning, at-least-once consumption with explicit acks and bounded
//! redelivery, and broker-side deduplication by message id. Two resilience
//! primitives, retry with exponential backoff and named circuit breakers,
//! protect any outbound call (broker, LLM APIs, database).
//!
//! ## Quick Start
//!
//! ```rust
//! use hire_bus::{ClientConfig, ConnectionConfig, MessageMetadata, MessagingClient};
//! use hire_bus::{PublishOptions, SubscribeOptions};
//! use hire_bus::provider::memory::MemoryBroker;
//!
//! # async fn example() -> hire_bus::Result<()> {
//! let config = ClientConfig::new(ConnectionConfig::new("memory://local", "matcher"));
//! let client = MessagingClient::new(config, MemoryBroker::new());
//! client.initialize().await?;
//!
//! client
//!     .subscribe(
//!         "job.created",
//!         |job: serde_json::Value, meta: MessageMetadata| async move {
//!             println!("attempt {}: {}", meta.delivery_attempt, job);
//!             Ok(())
//!         },
//!         SubscribeOptions::default(),
//!     )
//!     .await?;
//!
//! let result = client
//!     .publish(
//!         "job.created",
//!         &serde_json::json!({"jobId": "J1"}),
//!         PublishOptions::with_message_id("job-J1-created"),
//!     )
//!     .await;
//! assert!(result.success);
//!
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - **nats**: NATS JetStream via `async-nats`
//! - **memory**: in-process JetStream emulation for tests and local development
//!
//! ## Architecture
//!
//! - **ConnectionManager**: owns the connection, tracks transport state
//! - **StreamManager**: idempotent stream/consumer provisioning and introspection
//! - **MessagingClient**: publish/subscribe façade with per-message ack/nak
//! - **resilience**: `with_exponential_backoff`, `CircuitBreaker`, `CircuitBreakerRegistry`

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dlq;
pub mod error;
pub mod provider;
pub mod resilience;
pub mod streams;
pub mod types;

// Re-export core types
pub use client::{HandlerResult, MessagingClient};
pub use codec::JsonCodec;
pub use config::{
    AckPolicy, ClientConfig, ConnectionConfig, ConsumerConfig, DeliverPolicy, DiscardPolicy,
    RetentionPolicy, StorageType, StreamConfig,
};
pub use connection::{ConnectionEvent, ConnectionManager};
pub use dlq::{DeadLetterHandler, DeadLetterMessage, MemoryDeadLetterHandler, SubjectDeadLetterHandler};
pub use error::{BoxError, CircuitOpenError, MessagingError, Result};
pub use provider::{BrokerConnection, BrokerProvider, JetStreamApi, PendingMessage};
pub use resilience::{
    call_with_resilience, with_exponential_backoff, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitState, RetryOptions,
};
pub use streams::StreamManager;
pub use types::{
    ConsumerInfo, HealthResult, MessageEnvelope, MessageMetadata, PublishOptions, PublishResult,
    StreamInfo, SubscribeOptions, SubscriptionInfo,
};

// Re-export providers for convenience
pub use provider::memory::MemoryBroker;
pub use provider::nats::NatsProvider;

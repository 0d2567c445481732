//! Transport layer for the broker adapter
//!
//! This module provides the seam between the broker and the NATS client so the
//! connection lifecycle, publish and dispatch logic can be exercised without a
//! live server. [`nats::NatsTransport`] is the production implementation and
//! [`crate::testing::MockTransport`] the in-memory one.

use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

pub mod nats;

pub use nats::connection::NatsOptions;

/// Multi-valued wire headers as they appear on the transport
pub type WireHeaders = BTreeMap<String, Vec<String>>;

/// Transport-native message representation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireMessage {
    pub subject: String,
    pub headers: Option<WireHeaders>,
    pub payload: Bytes,
}

impl WireMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            headers: None,
            payload: payload.into(),
        }
    }
}

/// Status reported by a live transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Closed,
    Reconnecting,
    Connecting,
    Draining,
}

impl ConnectionStatus {
    /// Active or recovering on its own; a new dial is not needed
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected | ConnectionStatus::Reconnecting | ConnectionStatus::Connecting
        )
    }
}

/// Errors raised by the transport client
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Dial failed: {0}")]
    DialFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Unsubscribe failed: {0}")]
    UnsubscribeFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Drain failed: {0}")]
    DrainFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

/// Callback invoked by the transport's delivery task for each inbound message
pub type DeliveryCallback = Arc<dyn Fn(WireMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Dials connections to the messaging system
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Blocking dial using the resolved transport-native options
    async fn dial(&self, options: &NatsOptions) -> Result<Arc<dyn Connection>, TransportError>;
}

/// One live transport connection shared by every publisher and subscriber
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    fn status(&self) -> ConnectionStatus;

    /// URL of the server currently connected to
    fn connected_url(&self) -> Option<String>;

    /// Fire-and-forget submission
    async fn publish(&self, message: WireMessage) -> Result<(), TransportError>;

    /// Register `callback` for `subject`, load-balanced across `queue_group` members when given
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        callback: DeliveryCallback,
    ) -> Result<Box<dyn TransportSubscription>, TransportError>;

    /// Start a graceful drain; completion is signalled through the lifecycle callbacks
    async fn drain(&self) -> Result<(), TransportError>;

    /// Close immediately; safe to call more than once
    async fn close(&self);
}

/// Transport-native subscription
#[async_trait::async_trait]
pub trait TransportSubscription: Send + Sync {
    fn subject(&self) -> &str;

    async fn unsubscribe(&self) -> Result<(), TransportError>;

    /// Unsubscribe after already-buffered messages have been delivered
    async fn drain(&self) -> Result<(), TransportError>;
}

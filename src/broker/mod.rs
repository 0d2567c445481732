//! Generic publish/subscribe contract
//!
//! Callers program against [`Broker`], [`Subscriber`] and [`Handler`]; none of
//! these expose transport types. [`NatsBroker`] is the NATS-backed adapter.

use crate::codec::CodecError;
use crate::context::Context;
use crate::error::BrokerResult;
use crate::message::Message;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod dispatch;
pub mod lifecycle;
pub mod nats;
pub mod options;

pub use dispatch::{PooledPublication, PublicationPool};
pub use lifecycle::{ConnectionState, DrainOutcome, DrainSignal};
pub use nats::NatsBroker;
pub use options::{BrokerOption, Options, OptionsMerger, ResolvedOptions};

/// Error returned by a message handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Hook invoked with the failed publication when decoding or handling fails
pub type ErrorHandler = Arc<dyn Fn(&Publication) + Send + Sync>;

/// Failure recorded on a publication during dispatch
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("decode failed: {0}")]
    Decode(#[source] CodecError),
    #[error("handler failed: {0}")]
    Handler(#[source] HandlerError),
}

/// One delivered message as seen by handlers and error hooks
#[derive(Debug, Default)]
pub struct Publication {
    pub(crate) topic: String,
    pub(crate) message: Message,
    pub(crate) error: Option<DispatchError>,
    pub(crate) context: Context,
}

impl Publication {
    /// Subject the message was delivered on
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Last decode or handler error, if any
    pub fn error(&self) -> Option<&DispatchError> {
        self.error.as_ref()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Acknowledgement is not supported by core NATS; always succeeds
    pub fn ack(&self) -> BrokerResult<()> {
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.topic.clear();
        self.message.reset();
        self.error = None;
        self.context = Context::default();
    }
}

/// Processes delivered publications
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, publication: &Publication) -> Result<(), HandlerError>;
}

/// Adapts a synchronous closure into a [`Handler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&Publication) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, publication: &Publication) -> Result<(), HandlerError> {
        (self.0)(publication)
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&Publication) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Per-call publish options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Send the body alone, without headers
    pub body_only: bool,
}

impl PublishOptions {
    pub fn body_only(mut self, body_only: bool) -> Self {
        self.body_only = body_only;
        self
    }
}

/// Per-subscription options
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Queue group; members share the message load
    pub group: Option<String>,
    /// Overrides the broker-level error hook for this subscription
    pub error_handler: Option<ErrorHandler>,
    pub body_only: bool,
    /// Unsubscribe by draining buffered messages first
    pub drain_on_unsubscribe: bool,
}

impl SubscribeOptions {
    pub fn queue(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn body_only(mut self, body_only: bool) -> Self {
        self.body_only = body_only;
        self
    }

    pub fn drain_on_unsubscribe(mut self, drain: bool) -> Self {
        self.drain_on_unsubscribe = drain;
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("group", &self.group)
            .field("error_handler", &self.error_handler.is_some())
            .field("body_only", &self.body_only)
            .field("drain_on_unsubscribe", &self.drain_on_unsubscribe)
            .finish()
    }
}

/// Generic broker contract
#[async_trait]
pub trait Broker: Send + Sync + fmt::Display {
    fn name(&self) -> String;

    /// Apply options; a no-op once initialized when called with none
    fn init(&self, options: Vec<BrokerOption>) -> BrokerResult<()>;

    /// Current adapter-level options
    fn options(&self) -> Options;

    /// Connected server URL, or the configured addresses when not connected
    fn address(&self) -> String;

    async fn connect(&self, ctx: &Context) -> BrokerResult<()>;

    async fn disconnect(&self, ctx: &Context) -> BrokerResult<()>;

    async fn publish(
        &self,
        ctx: &Context,
        topic: &str,
        message: Message,
        options: PublishOptions,
    ) -> BrokerResult<()>;

    /// Publish every message concurrently; each message names its topic in its headers
    async fn batch_publish(
        &self,
        ctx: &Context,
        messages: Vec<Message>,
        options: PublishOptions,
    ) -> BrokerResult<()>;

    async fn subscribe(
        &self,
        ctx: &Context,
        topic: &str,
        handler: Arc<dyn Handler>,
        options: SubscribeOptions,
    ) -> BrokerResult<Box<dyn Subscriber>>;
}

/// Handle to an active subscription
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn options(&self) -> &SubscribeOptions;

    fn topic(&self) -> &str;

    async fn unsubscribe(&self, ctx: &Context) -> BrokerResult<()>;
}

//! NATS-backed broker adapter
//!
//! # Example
//!
//! ```rust,no_run
//! use nats_broker::broker::{handler_fn, Broker, BrokerOption, NatsBroker, PublishOptions, SubscribeOptions};
//! use nats_broker::codec::JsonCodec;
//! use nats_broker::{Context, Message};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let broker = NatsBroker::new(vec![
//!     BrokerOption::Addrs(vec!["127.0.0.1:4222".to_string()]),
//!     BrokerOption::Codec(Arc::new(JsonCodec)),
//! ]);
//! broker.init(Vec::new())?;
//!
//! let ctx = Context::background();
//! broker.connect(&ctx).await?;
//!
//! let handler = handler_fn(|p| {
//!     println!("{}: {} bytes", p.topic(), p.message().body.len());
//!     Ok(())
//! });
//! let sub = broker
//!     .subscribe(&ctx, "orders", handler, SubscribeOptions::default().queue("workers"))
//!     .await?;
//!
//! broker
//!     .publish(&ctx, "orders", Message::new("hello"), PublishOptions::default())
//!     .await?;
//!
//! sub.unsubscribe(&ctx).await?;
//! broker.disconnect(&ctx).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use super::dispatch::{Dispatcher, PublicationPool};
use super::lifecycle::{ConnectionManager, ConnectionState};
use super::options::{BrokerOption, Options, OptionsMerger, ResolvedOptions};
use super::{Broker, Handler, PublishOptions, SubscribeOptions, Subscriber};
use crate::broker_span;
use crate::codec::{Codec, CodecError};
use crate::context::Context;
use crate::error::{BrokerError, BrokerResult};
use crate::message::{Message, TOPIC_HEADER};
use crate::transport::nats::{MessageHandler, NatsTransport};
use crate::transport::{Transport, TransportSubscription};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, Instrument};

/// Broker adapter over a single shared NATS connection
pub struct NatsBroker {
    options: Mutex<Options>,
    merger: Mutex<OptionsMerger>,
    resolved: Mutex<Arc<ResolvedOptions>>,
    initialized: AtomicBool,
    connection: ConnectionManager,
    pool: Arc<PublicationPool>,
}

impl NatsBroker {
    /// Broker dialing real NATS servers
    pub fn new(options: Vec<BrokerOption>) -> Self {
        Self::with_transport(Arc::new(NatsTransport::new()), options)
    }

    /// Broker over any transport implementation
    pub fn with_transport(transport: Arc<dyn Transport>, options: Vec<BrokerOption>) -> Self {
        let connection = ConnectionManager::new(transport);

        let mut snapshot = Options::default();
        for option in options {
            option.apply(&mut snapshot);
        }
        let mut merger = OptionsMerger::new();
        let resolved = merger.resolve(&snapshot, &connection.drain_callbacks());

        Self {
            options: Mutex::new(snapshot),
            merger: Mutex::new(merger),
            resolved: Mutex::new(Arc::new(resolved)),
            initialized: AtomicBool::new(false),
            connection,
            pool: Arc::new(PublicationPool::default()),
        }
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ConnectionState {
        self.connection.state().await
    }

    fn resolved(&self) -> Arc<ResolvedOptions> {
        self.resolved.lock().clone()
    }

    fn codec(&self) -> BrokerResult<Arc<dyn Codec>> {
        self.resolved().codec.clone().ok_or(BrokerError::MissingCodec)
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn name(&self) -> String {
        self.options.lock().name.clone().unwrap_or_default()
    }

    fn init(&self, options: Vec<BrokerOption>) -> BrokerResult<()> {
        if options.is_empty() && self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut snapshot = self.options.lock();
        let mut updated = snapshot.clone();
        for option in options {
            option.apply(&mut updated);
        }
        if updated.codec.is_none() {
            return Err(BrokerError::MissingCodec);
        }

        let resolved = self
            .merger
            .lock()
            .resolve(&updated, &self.connection.drain_callbacks());
        *snapshot = updated;
        *self.resolved.lock() = Arc::new(resolved);
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn options(&self) -> Options {
        self.options.lock().clone()
    }

    fn address(&self) -> String {
        self.connection
            .connected_url()
            .unwrap_or_else(|| self.resolved().addrs.join(","))
    }

    async fn connect(&self, _ctx: &Context) -> BrokerResult<()> {
        let resolved = self.resolved();
        self.connection
            .connect(&resolved)
            .instrument(broker_span!(operation = "connect"))
            .await
    }

    async fn disconnect(&self, _ctx: &Context) -> BrokerResult<()> {
        let resolved = self.resolved();
        self.connection
            .disconnect(resolved.drain, resolved.native.drain_timeout)
            .instrument(broker_span!(operation = "disconnect", drain = resolved.drain))
            .await
    }

    async fn publish(
        &self,
        ctx: &Context,
        topic: &str,
        mut message: Message,
        options: PublishOptions,
    ) -> BrokerResult<()> {
        let codec = self.codec();
        let span = broker_span!(
            operation = "publish",
            topic,
            request_id = ctx.request_id().unwrap_or_default()
        );

        self.connection
            .with_connection(|conn| async move {
                let codec = codec?;
                message.header.insert(TOPIC_HEADER.to_string(), topic.to_string());
                let wire = MessageHandler::encode(codec.as_ref(), topic, &message, options.body_only)?;
                conn.publish(wire).await.map_err(BrokerError::from)
            })
            .instrument(span)
            .await
    }

    async fn batch_publish(
        &self,
        ctx: &Context,
        messages: Vec<Message>,
        options: PublishOptions,
    ) -> BrokerResult<()> {
        let codec = self.codec();
        let span = broker_span!(
            operation = "batch_publish",
            count = messages.len(),
            request_id = ctx.request_id().unwrap_or_default()
        );

        self.connection
            .with_connection(|conn| async move {
                let codec = codec?;
                let wires = messages
                    .iter()
                    .map(|message| {
                        let topic = message.topic().ok_or(CodecError::MissingTopic)?;
                        MessageHandler::encode(codec.as_ref(), topic, message, options.body_only)
                    })
                    .collect::<Result<Vec<_>, CodecError>>()?;

                let submissions = wires.into_iter().map(|wire| {
                    let conn = Arc::clone(&conn);
                    async move { conn.publish(wire).await }
                });
                let results = join_all(submissions).await;

                let failed = results.iter().filter(|r| r.is_err()).count();
                if failed > 0 {
                    debug!(failed, total = results.len(), "Batch publish had failures");
                }
                match results.into_iter().find_map(Result::err) {
                    Some(err) => Err(BrokerError::Transport(err)),
                    None => Ok(()),
                }
            })
            .instrument(span)
            .await
    }

    async fn subscribe(
        &self,
        _ctx: &Context,
        topic: &str,
        handler: Arc<dyn Handler>,
        options: SubscribeOptions,
    ) -> BrokerResult<Box<dyn Subscriber>> {
        let resolved = self.resolved();
        let codec = self.codec();
        let error_handler = options
            .error_handler
            .clone()
            .or_else(|| resolved.error_handler());
        let pool = Arc::clone(&self.pool);
        let group = options.group.clone();
        let body_only = options.body_only;
        let span = broker_span!(operation = "subscribe", topic, queue_group = ?group);

        let inner = self
            .connection
            .with_connection(|conn| async move {
                let dispatcher = Dispatcher::new(handler, error_handler, codec?, body_only, pool);
                conn.subscribe(topic, group.as_deref(), dispatcher.into_callback())
                    .await
                    .map_err(BrokerError::from)
            })
            .instrument(span)
            .await?;

        Ok(Box::new(NatsSubscriber {
            topic: topic.to_string(),
            options,
            inner,
        }))
    }
}

impl fmt::Display for NatsBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("nats")
    }
}

impl fmt::Debug for NatsBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsBroker")
            .field("options", &*self.options.lock())
            .field("initialized", &self.initialized.load(Ordering::SeqCst))
            .finish()
    }
}

/// Subscription handle returned by [`NatsBroker::subscribe`]
struct NatsSubscriber {
    topic: String,
    options: SubscribeOptions,
    inner: Box<dyn TransportSubscription>,
}

#[async_trait]
impl Subscriber for NatsSubscriber {
    fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn unsubscribe(&self, _ctx: &Context) -> BrokerResult<()> {
        let result = if self.options.drain_on_unsubscribe {
            self.inner.drain().await
        } else {
            self.inner.unsubscribe().await
        };
        debug!(topic = %self.topic, drained = self.options.drain_on_unsubscribe, "Unsubscribed");
        result.map_err(BrokerError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::testing::MockTransport;
    use crate::transport::nats::DEFAULT_URL;

    fn broker(transport: Arc<MockTransport>, extra: Vec<BrokerOption>) -> NatsBroker {
        let mut options = vec![BrokerOption::Codec(Arc::new(JsonCodec))];
        options.extend(extra);
        NatsBroker::with_transport(transport, options)
    }

    #[test]
    fn test_identity_accessors() {
        let broker = broker(
            Arc::new(MockTransport::new()),
            vec![BrokerOption::Name("orders".to_string())],
        );
        assert_eq!(broker.to_string(), "nats");
        assert_eq!(broker.name(), "orders");
        assert!(broker.options().codec.is_some());
    }

    #[test]
    fn test_init_requires_codec() {
        let broker = NatsBroker::with_transport(Arc::new(MockTransport::new()), Vec::new());
        let err = broker.init(Vec::new()).unwrap_err();
        assert_eq!(err.to_string(), "codec is nil");

        broker
            .init(vec![BrokerOption::Codec(Arc::new(JsonCodec))])
            .unwrap();
        broker.init(Vec::new()).unwrap();
    }

    #[test]
    fn test_failed_init_leaves_options_untouched() {
        let broker = NatsBroker::with_transport(Arc::new(MockTransport::new()), Vec::new());
        let result = broker.init(vec![BrokerOption::Name("ignored".to_string())]);
        assert!(result.is_err());
        assert_eq!(broker.name(), "");
    }

    #[test]
    fn test_address_uses_configured_addrs_when_disconnected() {
        let broker = broker(
            Arc::new(MockTransport::new()),
            vec![BrokerOption::Addrs(vec![
                "a:4222".to_string(),
                "nats://b:4222".to_string(),
            ])],
        );
        assert_eq!(broker.address(), "nats://a:4222,nats://b:4222");

        let default = broker_without_addrs();
        assert_eq!(default.address(), DEFAULT_URL);
    }

    fn broker_without_addrs() -> NatsBroker {
        broker(Arc::new(MockTransport::new()), Vec::new())
    }

    #[tokio::test]
    async fn test_address_reports_connected_url() {
        let transport = Arc::new(MockTransport::new());
        let broker = broker(transport, vec![BrokerOption::Addrs(vec!["x:4222".to_string()])]);
        broker.connect(&Context::background()).await.unwrap();

        assert_eq!(broker.address(), "nats://x:4222");
        assert_eq!(broker.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_publish_sets_topic_header() {
        let transport = Arc::new(MockTransport::new());
        let broker = broker(transport.clone(), Vec::new());
        let ctx = Context::background();
        broker.connect(&ctx).await.unwrap();

        broker
            .publish(&ctx, "orders", Message::new("hi"), PublishOptions::default())
            .await
            .unwrap();

        let published = transport.published();
        assert_eq!(published.len(), 1);
        let mut decoded = Message::default();
        JsonCodec.unmarshal(&published[0].payload, &mut decoded).unwrap();
        assert_eq!(decoded.topic(), Some("orders"));
    }

    #[tokio::test]
    async fn test_batch_requires_topic_header() {
        let transport = Arc::new(MockTransport::new());
        let broker = broker(transport.clone(), Vec::new());
        let ctx = Context::background();
        broker.connect(&ctx).await.unwrap();

        let result = broker
            .batch_publish(&ctx, vec![Message::new("no topic")], PublishOptions::default())
            .await;

        assert!(matches!(result, Err(BrokerError::Codec(CodecError::MissingTopic))));
        assert!(transport.published().is_empty());
    }
}

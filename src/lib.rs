//! NATS broker adapter
//!
//! Exposes a generic publish/subscribe contract (connect, publish, batch
//! publish, subscribe with queue groups, graceful drain on disconnect) on top
//! of a single shared NATS connection.
//!
//! # Overview
//!
//! - [`broker`] - the [`Broker`] contract and the NATS-backed [`NatsBroker`]
//! - [`message`] - the generic message envelope
//! - [`codec`] - pluggable message codecs
//! - [`transport`] - the seam between the broker and the NATS client
//! - [`config`] - TOML configuration loading
//! - [`observability`] - structured logging setup
//! - [`testing`] - an in-memory transport for tests
//!
//! # Quick Start
//!
//! ```rust
//! use nats_broker::broker::{handler_fn, Broker, BrokerOption, NatsBroker, PublishOptions, SubscribeOptions};
//! use nats_broker::codec::JsonCodec;
//! use nats_broker::testing::MockTransport;
//! use nats_broker::{Context, Message};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let transport = Arc::new(MockTransport::new());
//! let broker = NatsBroker::with_transport(transport.clone(), vec![
//!     BrokerOption::Codec(Arc::new(JsonCodec)),
//! ]);
//! broker.init(Vec::new()).unwrap();
//!
//! let ctx = Context::background();
//! broker.connect(&ctx).await.unwrap();
//!
//! let handler = handler_fn(|p| {
//!     assert_eq!(p.message().body, b"hello");
//!     Ok(())
//! });
//! broker.subscribe(&ctx, "greetings", handler, SubscribeOptions::default()).await.unwrap();
//! broker
//!     .publish(&ctx, "greetings", Message::new("hello"), PublishOptions::default())
//!     .await
//!     .unwrap();
//!
//! assert_eq!(transport.published().len(), 1);
//! broker.disconnect(&ctx).await.unwrap();
//! # });
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod observability;
pub mod testing;
pub mod transport;

pub use broker::{Broker, Handler, NatsBroker, Publication, Subscriber};
pub use config::{BrokerConfig, ConfigError};
pub use context::Context;
pub use error::{BrokerError, BrokerResult};
pub use message::Message;

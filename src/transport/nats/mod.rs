//! NATS client transport
//!
//! Split the same way as the rest of the transport layer: pure configuration
//! and translation live apart from the code that performs I/O.
//!
//! # Architecture
//!
//! - [`connection`] - Pure connect options, lifecycle callbacks and address normalization
//! - [`message_handler`] - Pure envelope encode/decode between broker and wire messages
//! - [`client`] - Impure I/O on top of `async-nats`
//!
//! # Usage
//!
//! ```rust,no_run
//! use nats_broker::transport::nats::{normalize_addrs, NatsOptions, NatsTransport};
//! use nats_broker::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let options = NatsOptions {
//!     servers: normalize_addrs(&["127.0.0.1:4222"]),
//!     ..Default::default()
//! };
//!
//! let connection = NatsTransport::new().dial(&options).await?;
//! println!("{:?}", connection.status());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::NatsTransport;
pub use connection::{
    normalize_addrs, AsyncError, Auth, ConnectionCallbacks, NatsOptions, TlsConfig, DEFAULT_URL,
};
pub use message_handler::MessageHandler;

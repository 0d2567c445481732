//! Pure connection configuration for the NATS transport
//!
//! This module contains the transport-native options, the lifecycle callbacks
//! the transport invokes from its own tasks, and address normalization.

use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// URL scheme every server address carries
pub const NATS_SCHEME: &str = "nats://";

/// Address used when no server is configured
pub const DEFAULT_URL: &str = "nats://127.0.0.1:4222";

/// TLS material for the connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM root certificates used to verify the server
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate (requires `key_file`)
    pub cert_file: Option<PathBuf>,
    /// PEM client key (requires `cert_file`)
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub require_tls: bool,
}

/// Credentials presented when dialing
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    UserPassword { user: String, password: String },
    Token(String),
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::UserPassword { user, .. } => f
                .debug_struct("UserPassword")
                .field("user", user)
                .field("password", &"***")
                .finish(),
            Auth::Token(_) => f.write_str("Token(***)"),
        }
    }
}

/// Asynchronous error kinds reported outside any call path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncError {
    /// Drain did not finish within the configured drain timeout
    DrainTimeout,
    SlowConsumer(u64),
    Server(String),
    Client(String),
}

impl fmt::Display for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncError::DrainTimeout => f.write_str("drain timeout"),
            AsyncError::SlowConsumer(sid) => write!(f, "slow consumer on subscription {sid}"),
            AsyncError::Server(msg) => write!(f, "server error: {msg}"),
            AsyncError::Client(msg) => write!(f, "client error: {msg}"),
        }
    }
}

pub type ClosedCallback = Arc<dyn Fn() + Send + Sync>;
pub type AsyncErrorCallback = Arc<dyn Fn(AsyncError) + Send + Sync>;
pub type DisconnectedErrCallback = Arc<dyn Fn(Option<TransportError>) + Send + Sync>;

/// Callbacks bound to a connection at dial time.
///
/// They run on the transport's own tasks and must never block.
#[derive(Clone, Default)]
pub struct ConnectionCallbacks {
    pub closed: Option<ClosedCallback>,
    pub async_error: Option<AsyncErrorCallback>,
    pub disconnected_err: Option<DisconnectedErrCallback>,
}

impl ConnectionCallbacks {
    pub fn on_closed(&self) {
        if let Some(cb) = &self.closed {
            cb();
        }
    }

    pub fn on_async_error(&self, error: AsyncError) {
        if let Some(cb) = &self.async_error {
            cb(error);
        }
    }

    pub fn on_disconnected(&self, error: Option<TransportError>) {
        if let Some(cb) = &self.disconnected_err {
            cb(error);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.closed.is_none() && self.async_error.is_none() && self.disconnected_err.is_none()
    }
}

impl fmt::Debug for ConnectionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCallbacks")
            .field("closed", &self.closed.is_some())
            .field("async_error", &self.async_error.is_some())
            .field("disconnected_err", &self.disconnected_err.is_some())
            .finish()
    }
}

/// Transport-native connect options
#[derive(Debug, Clone)]
pub struct NatsOptions {
    pub servers: Vec<String>,
    pub name: Option<String>,
    pub tls: Option<TlsConfig>,
    pub auth: Option<Auth>,
    pub connection_timeout: Duration,
    pub reconnect_wait: Duration,
    /// `None` reconnects forever
    pub max_reconnects: Option<usize>,
    pub ping_interval: Duration,
    pub drain_timeout: Duration,
    pub callbacks: ConnectionCallbacks,
}

impl Default for NatsOptions {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            name: None,
            tls: None,
            auth: None,
            connection_timeout: Duration::from_secs(2),
            reconnect_wait: Duration::from_secs(2),
            max_reconnects: Some(60),
            ping_interval: Duration::from_secs(120),
            drain_timeout: Duration::from_secs(30),
            callbacks: ConnectionCallbacks::default(),
        }
    }
}

/// Canonicalize user supplied server addresses.
///
/// Empty entries are dropped, the `nats://` scheme is added where missing and
/// an empty result falls back to [`DEFAULT_URL`]. Order is preserved.
pub fn normalize_addrs<S: AsRef<str>>(addrs: &[S]) -> Vec<String> {
    let normalized: Vec<String> = addrs
        .iter()
        .map(AsRef::as_ref)
        .filter(|addr| !addr.is_empty())
        .map(|addr| {
            if addr.starts_with(NATS_SCHEME) {
                addr.to_string()
            } else {
                format!("{NATS_SCHEME}{addr}")
            }
        })
        .collect();

    if normalized.is_empty() {
        vec![DEFAULT_URL.to_string()]
    } else {
        normalized
    }
}

//! Adapter-level options and their reconciliation with transport-native options
//!
//! Options are applied in the order given, later values overriding earlier
//! ones. [`OptionsMerger`] then folds them together with the transport-native
//! [`NatsOptions`]:
//!
//! 1. Native defaults are established once per merger.
//! 2. A [`BrokerOption::NatsOptions`] override replaces the native options outright.
//! 3. Adapter addresses and TLS win when set; otherwise the native values are adopted.
//! 4. With drain enabled, the lifecycle callbacks are installed on the native options.

use super::ErrorHandler;
use crate::codec::Codec;
use crate::transport::nats::{normalize_addrs, ConnectionCallbacks, NatsOptions, TlsConfig};
use std::fmt;
use std::sync::Arc;

/// Adapter-level configuration
#[derive(Clone, Default)]
pub struct Options {
    pub name: Option<String>,
    pub addrs: Vec<String>,
    pub codec: Option<Arc<dyn Codec>>,
    pub tls: Option<TlsConfig>,
    pub error_handler: Option<ErrorHandler>,
    /// Transport-native escape hatch
    pub nats_options: Option<NatsOptions>,
    pub drain_connection: bool,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("name", &self.name)
            .field("addrs", &self.addrs)
            .field("codec", &self.codec.as_ref().map(|c| c.name().to_string()))
            .field("tls", &self.tls)
            .field("error_handler", &self.error_handler.is_some())
            .field("nats_options", &self.nats_options)
            .field("drain_connection", &self.drain_connection)
            .finish()
    }
}

/// One configuration change applied by `NatsBroker::new` or `Broker::init`
#[derive(Clone)]
pub enum BrokerOption {
    Name(String),
    Addrs(Vec<String>),
    Codec(Arc<dyn Codec>),
    Tls(TlsConfig),
    ErrorHandler(ErrorHandler),
    NatsOptions(NatsOptions),
    /// Drain the connection on disconnect instead of closing it immediately
    DrainConnection,
}

impl BrokerOption {
    pub fn apply(self, options: &mut Options) {
        match self {
            BrokerOption::Name(name) => options.name = Some(name),
            BrokerOption::Addrs(addrs) => options.addrs = addrs,
            BrokerOption::Codec(codec) => options.codec = Some(codec),
            BrokerOption::Tls(tls) => options.tls = Some(tls),
            BrokerOption::ErrorHandler(handler) => options.error_handler = Some(handler),
            BrokerOption::NatsOptions(native) => options.nats_options = Some(native),
            BrokerOption::DrainConnection => options.drain_connection = true,
        }
    }
}

impl fmt::Debug for BrokerOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerOption::Name(name) => f.debug_tuple("Name").field(name).finish(),
            BrokerOption::Addrs(addrs) => f.debug_tuple("Addrs").field(addrs).finish(),
            BrokerOption::Codec(codec) => f.debug_tuple("Codec").field(&codec.name()).finish(),
            BrokerOption::Tls(tls) => f.debug_tuple("Tls").field(tls).finish(),
            BrokerOption::ErrorHandler(_) => f.write_str("ErrorHandler(..)"),
            BrokerOption::NatsOptions(native) => f.debug_tuple("NatsOptions").field(native).finish(),
            BrokerOption::DrainConnection => f.write_str("DrainConnection"),
        }
    }
}

/// Configuration the connection lifecycle and dispatch work from
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    /// Normalized, never empty
    pub addrs: Vec<String>,
    pub codec: Option<Arc<dyn Codec>>,
    pub tls: Option<TlsConfig>,
    pub error_handler: Option<ErrorHandlerSlot>,
    pub drain: bool,
    pub native: NatsOptions,
}

/// Error hook wrapper so resolved options stay printable
#[derive(Clone)]
pub struct ErrorHandlerSlot(pub ErrorHandler);

impl fmt::Debug for ErrorHandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorHandler(..)")
    }
}

impl ResolvedOptions {
    /// Native options to dial with: resolved addresses and TLS merged in
    pub fn connect_options(&self) -> NatsOptions {
        let mut native = self.native.clone();
        native.servers = self.addrs.clone();
        native.tls = self.tls.clone();
        native
    }

    pub fn error_handler(&self) -> Option<ErrorHandler> {
        self.error_handler.as_ref().map(|slot| slot.0.clone())
    }
}

/// Reconciles adapter options with transport-native options
#[derive(Debug, Default)]
pub struct OptionsMerger {
    native: Option<NatsOptions>,
}

impl OptionsMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `options`; `drain_callbacks` are installed when drain is enabled
    pub fn resolve(
        &mut self,
        options: &Options,
        drain_callbacks: &ConnectionCallbacks,
    ) -> ResolvedOptions {
        let native = self.native.get_or_insert_with(NatsOptions::default);
        if let Some(override_options) = &options.nats_options {
            *native = override_options.clone();
        }

        let addrs = if options.addrs.is_empty() {
            normalize_addrs(&native.servers)
        } else {
            normalize_addrs(&options.addrs)
        };
        let tls = options.tls.clone().or_else(|| native.tls.clone());

        if options.drain_connection {
            native.callbacks = drain_callbacks.clone();
        }

        ResolvedOptions {
            addrs,
            codec: options.codec.clone(),
            tls,
            error_handler: options.error_handler.clone().map(ErrorHandlerSlot),
            drain: options.drain_connection,
            native: native.clone(),
        }
    }
}

//! Impure I/O operations for the NATS transport
//!
//! This module wraps the `async-nats` client behind the [`Transport`],
//! [`Connection`] and [`TransportSubscription`] traits. Client events are
//! translated into the lifecycle callbacks bound at dial time, and each
//! subscription is serviced by its own delivery task. The connection keeps a
//! handle to every delivery task: drain waits for them to run dry and close
//! aborts them, so no subscriber keeps the client's connection handler alive.

use super::connection::{AsyncError, Auth, ConnectionCallbacks, NatsOptions};
use crate::transport::{
    Connection, ConnectionStatus, DeliveryCallback, Transport, TransportError,
    TransportSubscription, WireHeaders, WireMessage,
};
use async_nats::connection::State;
use async_nats::{Client, ClientError, ConnectOptions, Event, HeaderMap, ServerAddr};
use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Dials real NATS servers
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsTransport;

impl NatsTransport {
    pub fn new() -> Self {
        Self
    }

    /// Parse normalized addresses into server addresses
    pub fn parse_servers(servers: &[String]) -> Result<Vec<ServerAddr>, TransportError> {
        servers
            .iter()
            .map(|server| {
                server
                    .parse::<ServerAddr>()
                    .map_err(|e| TransportError::InvalidAddress(format!("{server}: {e}")))
            })
            .collect()
    }

    /// Translate transport-native options into client connect options
    fn configure_connect_options(options: &NatsOptions, flags: ConnectionFlags) -> ConnectOptions {
        let reconnect_wait = options.reconnect_wait;
        let mut connect_options = ConnectOptions::new()
            .connection_timeout(options.connection_timeout)
            .ping_interval(options.ping_interval)
            .max_reconnects(options.max_reconnects)
            .reconnect_delay_callback(move |_attempts| reconnect_wait);

        if let Some(name) = &options.name {
            connect_options = connect_options.name(name.as_str());
        }

        if let Some(tls) = &options.tls {
            connect_options = connect_options.require_tls(tls.require_tls);
            if let Some(ca_file) = &tls.ca_file {
                connect_options = connect_options.add_root_certificates(ca_file.clone());
            }
            if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
                connect_options = connect_options.add_client_certificate(cert.clone(), key.clone());
            }
        }

        match &options.auth {
            Some(Auth::UserPassword { user, password }) => {
                connect_options = connect_options.user_and_password(user.clone(), password.clone());
            }
            Some(Auth::Token(token)) => {
                connect_options = connect_options.token(token.clone());
            }
            None => {}
        }

        let callbacks = options.callbacks.clone();
        connect_options.event_callback(move |event| {
            let callbacks = callbacks.clone();
            let flags = flags.clone();
            async move { Self::route_event(&callbacks, &flags, event) }
        })
    }

    /// Route a client event to the lifecycle callbacks.
    ///
    /// `flags.terminated` is set once the client's connection handler has
    /// stopped for good and will not reconnect on its own.
    fn route_event(callbacks: &ConnectionCallbacks, flags: &ConnectionFlags, event: Event) {
        match event {
            Event::Closed => {
                flags.terminated.store(true, Ordering::SeqCst);
                flags.notify_closed(callbacks);
            }
            Event::Disconnected => callbacks.on_disconnected(None),
            Event::SlowConsumer(sid) => callbacks.on_async_error(AsyncError::SlowConsumer(sid)),
            Event::ServerError(err) => callbacks.on_async_error(AsyncError::Server(err.to_string())),
            Event::ClientError(ClientError::MaxReconnects) => {
                warn!(target: "nats_transport", "Reconnect attempts exhausted");
                flags.terminated.store(true, Ordering::SeqCst);
                callbacks.on_async_error(AsyncError::Client(ClientError::MaxReconnects.to_string()));
            }
            Event::ClientError(err) => callbacks.on_async_error(AsyncError::Client(err.to_string())),
            other => debug!(target: "nats_transport", "NATS event: {:?}", other),
        }
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn dial(&self, options: &NatsOptions) -> Result<Arc<dyn Connection>, TransportError> {
        let servers = Self::parse_servers(&options.servers)?;
        let flags = ConnectionFlags::default();
        let connect_options = Self::configure_connect_options(options, flags.clone());

        let client = connect_options
            .connect(options.servers.clone())
            .await
            .map_err(|e| TransportError::DialFailed(Box::new(e)))?;

        info!(servers = ?options.servers, count = servers.len(), "Connected to NATS");
        Ok(Arc::new(NatsConnection {
            client: Mutex::new(Some(client)),
            servers: options.servers.clone(),
            tasks: Mutex::new(Vec::new()),
            draining: AtomicBool::new(false),
            flags,
            drain_timeout: options.drain_timeout,
            callbacks: options.callbacks.clone(),
        }))
    }
}

/// State shared between a connection and its client event callback
#[derive(Clone, Default)]
struct ConnectionFlags {
    terminated: Arc<AtomicBool>,
    closed_notified: Arc<AtomicBool>,
}

impl ConnectionFlags {
    /// Fire the closed callback at most once per connection
    fn notify_closed(&self, callbacks: &ConnectionCallbacks) {
        if !self.closed_notified.swap(true, Ordering::SeqCst) {
            callbacks.on_closed();
        }
    }
}

/// Live `async-nats` connection
pub struct NatsConnection {
    client: Mutex<Option<Client>>,
    /// Normalized addresses this connection was dialed with
    servers: Vec<String>,
    /// One delivery task per subscription
    tasks: Mutex<Vec<JoinHandle<()>>>,
    draining: AtomicBool,
    flags: ConnectionFlags,
    drain_timeout: Duration,
    callbacks: ConnectionCallbacks,
}

impl NatsConnection {
    fn client(&self) -> Result<Client, TransportError> {
        self.client
            .lock()
            .clone()
            .ok_or(TransportError::ConnectionClosed)
    }

    fn notify_closed(&self) {
        self.flags.notify_closed(&self.callbacks);
    }
}

/// Map client state onto the transport status (pure function)
fn map_status(state: State, draining: bool, terminated: bool) -> ConnectionStatus {
    if terminated {
        return ConnectionStatus::Closed;
    }
    if draining {
        return ConnectionStatus::Draining;
    }
    match state {
        State::Connected => ConnectionStatus::Connected,
        State::Pending => ConnectionStatus::Connecting,
        _ => ConnectionStatus::Reconnecting,
    }
}

/// URL of the connected server (pure function).
///
/// Servers listening on all interfaces advertise an unspecified host; the
/// dialed address with the advertised port is reported instead.
fn advertised_url(host: &str, port: u16, dialed: &[String]) -> String {
    let unspecified = host.is_empty()
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false);

    if unspecified {
        let same_port = dialed.iter().find(|server| {
            server
                .parse::<ServerAddr>()
                .map(|addr| addr.port() == port)
                .unwrap_or(false)
        });
        if let Some(server) = same_port.or_else(|| dialed.first()) {
            return server.clone();
        }
    }

    if host.contains(':') {
        format!("nats://[{host}]:{port}")
    } else {
        format!("nats://{host}:{port}")
    }
}

#[async_trait]
impl Connection for NatsConnection {
    fn status(&self) -> ConnectionStatus {
        let guard = self.client.lock();
        let Some(client) = guard.as_ref() else {
            return ConnectionStatus::Closed;
        };
        map_status(
            client.connection_state(),
            self.draining.load(Ordering::SeqCst),
            self.flags.terminated.load(Ordering::SeqCst),
        )
    }

    fn connected_url(&self) -> Option<String> {
        let guard = self.client.lock();
        let client = guard.as_ref()?;
        if !matches!(client.connection_state(), State::Connected) {
            return None;
        }
        let info = client.server_info();
        Some(advertised_url(&info.host, info.port, &self.servers))
    }

    async fn publish(&self, message: WireMessage) -> Result<(), TransportError> {
        let client = self.client()?;
        let result = match &message.headers {
            Some(headers) => {
                client
                    .publish_with_headers(message.subject, to_header_map(headers), message.payload)
                    .await
            }
            None => client.publish(message.subject, message.payload).await,
        };
        result.map_err(|e| TransportError::PublishFailed(Box::new(e)))
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        callback: DeliveryCallback,
    ) -> Result<Box<dyn TransportSubscription>, TransportError> {
        let client = self.client()?;
        let subscriber = match queue_group {
            Some(group) => {
                client
                    .queue_subscribe(subject.to_string(), group.to_string())
                    .await
            }
            None => client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))?;

        let (commands_tx, commands_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_delivery(subscriber, callback, commands_rx));
        {
            let mut tasks = self.tasks.lock();
            tasks.retain(|task| !task.is_finished());
            tasks.push(task);
        }

        debug!(target: "nats_transport", subject, ?queue_group, "Subscription registered");
        Ok(Box::new(NatsSubscription {
            subject: subject.to_string(),
            commands: commands_tx,
        }))
    }

    async fn drain(&self) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .flush()
            .await
            .map_err(|e| TransportError::DrainFailed(Box::new(e)))?;

        self.draining.store(true, Ordering::SeqCst);
        if let Err(e) = client.drain().await {
            self.draining.store(false, Ordering::SeqCst);
            return Err(TransportError::DrainFailed(Box::new(e)));
        }
        drop(client);

        // Every subscriber stream ends once its buffered messages are delivered
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let drained = tokio::time::timeout(self.drain_timeout, join_all(tasks.iter_mut()))
            .await
            .is_ok();

        if drained {
            debug!(target: "nats_transport", subscriptions = tasks.len(), "Drain completed");
            self.notify_closed();
        } else {
            warn!(timeout = ?self.drain_timeout, "NATS drain timed out");
            // Still running; aborted on close
            tasks.retain(|task| !task.is_finished());
            self.tasks.lock().extend(tasks);
            self.callbacks.on_async_error(AsyncError::DrainTimeout);
        }
        Ok(())
    }

    async fn close(&self) {
        let client = self.client.lock().take();
        let tasks = std::mem::take(&mut *self.tasks.lock());

        // Each subscriber holds a handle to the client's connection handler;
        // the socket only closes once all of them and the client are dropped.
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        if client.is_some() {
            drop(client);
            self.notify_closed();
        }
        self.draining.store(false, Ordering::SeqCst);
    }
}

enum SubscriptionCommand {
    Unsubscribe(oneshot::Sender<Result<(), TransportError>>),
    Drain(oneshot::Sender<Result<(), TransportError>>),
}

/// Delivery task: one per subscription, invoking the callback sequentially
async fn run_delivery(
    mut subscriber: async_nats::Subscriber,
    callback: DeliveryCallback,
    mut commands: mpsc::Receiver<SubscriptionCommand>,
) {
    let mut accepting_commands = true;

    loop {
        tokio::select! {
            command = commands.recv(), if accepting_commands => match command {
                Some(SubscriptionCommand::Unsubscribe(reply)) => {
                    let result = subscriber
                        .unsubscribe()
                        .await
                        .map_err(|e| TransportError::UnsubscribeFailed(Box::new(e)));
                    let _ = reply.send(result);
                    break;
                }
                Some(SubscriptionCommand::Drain(reply)) => {
                    let result = subscriber
                        .drain()
                        .await
                        .map_err(|e| TransportError::UnsubscribeFailed(Box::new(e)));
                    let failed = result.is_err();
                    let _ = reply.send(result);
                    if failed {
                        break;
                    }
                    // Keep delivering until the buffered messages run out
                    accepting_commands = false;
                }
                // Every handle dropped; the subscription itself stays alive
                None => accepting_commands = false,
            },
            message = subscriber.next() => match message {
                Some(message) => callback(from_nats_message(message)).await,
                None => break,
            },
        }
    }

    debug!(target: "nats_transport", "Delivery task stopped");
}

struct NatsSubscription {
    subject: String,
    commands: mpsc::Sender<SubscriptionCommand>,
}

impl NatsSubscription {
    async fn send(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), TransportError>>) -> SubscriptionCommand,
    ) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(build(reply_tx)).await.is_err() {
            // Delivery task already gone: nothing left to unsubscribe
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }
}

#[async_trait]
impl TransportSubscription for NatsSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.send(SubscriptionCommand::Unsubscribe).await
    }

    async fn drain(&self) -> Result<(), TransportError> {
        self.send(SubscriptionCommand::Drain).await
    }
}

/// Convert wire headers into NATS headers (pure function)
pub fn to_header_map(headers: &WireHeaders) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        for value in values {
            map.append(name.as_str(), value.as_str());
        }
    }
    map
}

/// Convert NATS headers into wire headers (pure function)
pub fn from_header_map(headers: &HeaderMap) -> WireHeaders {
    headers
        .iter()
        .map(|(name, values)| {
            (
                name.to_string(),
                values.iter().map(|value| value.to_string()).collect(),
            )
        })
        .collect()
}

fn from_nats_message(message: async_nats::Message) -> WireMessage {
    WireMessage {
        subject: message.subject.to_string(),
        headers: message.headers.as_ref().map(from_header_map),
        payload: message.payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_servers_accepts_normalized_urls() {
        let servers = vec![
            "nats://127.0.0.1:4222".to_string(),
            "nats://10.0.0.2:5222".to_string(),
        ];
        let parsed = NatsTransport::parse_servers(&servers).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_servers_rejects_garbage() {
        let servers = vec!["nats://exa mple:4222".to_string()];
        let result = NatsTransport::parse_servers(&servers);
        assert!(matches!(result, Err(TransportError::InvalidAddress(_))));
    }

    #[test]
    fn test_header_map_roundtrip_keeps_multiple_values() {
        let mut headers = WireHeaders::new();
        headers.insert("Micro-Topic".to_string(), vec!["orders".to_string()]);
        headers.insert(
            "Accept".to_string(),
            vec!["a".to_string(), "b".to_string()],
        );

        let back = from_header_map(&to_header_map(&headers));
        assert_eq!(back, headers);
    }

    #[test]
    fn test_status_reports_closed_once_client_terminated() {
        // Reconnect attempts exhausted: the client still reads Disconnected
        assert_eq!(
            map_status(State::Disconnected, false, true),
            ConnectionStatus::Closed
        );
        assert!(!map_status(State::Disconnected, false, true).is_usable());
        assert_eq!(
            map_status(State::Disconnected, false, false),
            ConnectionStatus::Reconnecting
        );
        assert_eq!(
            map_status(State::Connected, true, false),
            ConnectionStatus::Draining
        );
        assert_eq!(
            map_status(State::Pending, false, false),
            ConnectionStatus::Connecting
        );
        assert_eq!(
            map_status(State::Connected, false, false),
            ConnectionStatus::Connected
        );
    }

    #[test]
    fn test_route_event_marks_terminated_on_max_reconnects() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let callbacks = ConnectionCallbacks {
            async_error: Some(Arc::new(move |err| sink.lock().push(err.to_string()))),
            ..Default::default()
        };
        let flags = ConnectionFlags::default();

        NatsTransport::route_event(&callbacks, &flags, Event::Disconnected);
        assert!(!flags.terminated.load(Ordering::SeqCst));

        NatsTransport::route_event(
            &callbacks,
            &flags,
            Event::ClientError(ClientError::MaxReconnects),
        );
        assert!(flags.terminated.load(Ordering::SeqCst));
        assert_eq!(errors.lock().len(), 1);
    }

    #[test]
    fn test_closed_callback_fires_once() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        let callbacks = ConnectionCallbacks {
            closed: Some(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let flags = ConnectionFlags::default();

        NatsTransport::route_event(&callbacks, &flags, Event::Closed);
        flags.notify_closed(&callbacks);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(flags.terminated.load(Ordering::SeqCst));
    }

    #[test]
    fn test_advertised_url_uses_concrete_host() {
        let dialed = vec!["nats://localhost:4222".to_string()];
        assert_eq!(
            advertised_url("10.1.2.3", 4222, &dialed),
            "nats://10.1.2.3:4222"
        );
        assert_eq!(advertised_url("::1", 4222, &dialed), "nats://[::1]:4222");
    }

    #[test]
    fn test_advertised_url_replaces_unspecified_host_with_dialed_server() {
        let dialed = vec![
            "nats://127.0.0.1:4222".to_string(),
            "nats://127.0.0.1:5222".to_string(),
        ];
        assert_eq!(
            advertised_url("0.0.0.0", 5222, &dialed),
            "nats://127.0.0.1:5222"
        );
        assert_eq!(advertised_url("::", 4222, &dialed), "nats://127.0.0.1:4222");
        assert_eq!(advertised_url("", 4222, &dialed), "nats://127.0.0.1:4222");
        // No dialed server on that port: first dialed server
        assert_eq!(
            advertised_url("0.0.0.0", 6222, &dialed),
            "nats://127.0.0.1:4222"
        );
    }

    #[tokio::test]
    async fn test_dial_fails_fast_on_invalid_address() {
        let options = NatsOptions {
            servers: vec!["nats://exa mple:4222".to_string()],
            ..Default::default()
        };
        let result = NatsTransport::new().dial(&options).await;
        assert!(matches!(result, Err(TransportError::InvalidAddress(_))));
    }
}

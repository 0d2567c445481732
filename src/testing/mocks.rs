//! Mock implementations for testing
//!
//! [`MockTransport`] is an in-memory NATS stand-in: it records dials and
//! publishes, routes published messages to matching subscriptions (queue
//! groups load-balanced round robin) and simulates the drain outcomes a real
//! server can produce.

use crate::transport::nats::{AsyncError, ConnectionCallbacks, NatsOptions};
use crate::transport::{
    Connection, ConnectionStatus, DeliveryCallback, Transport, TransportError,
    TransportSubscription, WireMessage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// How the mock connection reacts to a drain request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DrainBehavior {
    /// Returns at once, then fires the closed callback and a duplicate
    /// disconnected callback from a background task
    #[default]
    Complete,
    /// Reports a drain timeout through the async error callback
    Timeout,
    /// The drain call itself fails
    Fail,
    /// Accepts the drain but never signals completion
    Silent,
}

struct MockSubscriptionEntry {
    id: u64,
    subject: String,
    group: Option<String>,
    callback: DeliveryCallback,
}

#[derive(Default)]
struct MockState {
    dial_count: AtomicUsize,
    publish_attempts: AtomicUsize,
    drain_count: AtomicUsize,
    close_count: AtomicUsize,
    unsubscribe_count: AtomicUsize,
    drain_unsubscribe_count: AtomicUsize,
    fail_dial: AtomicBool,
    failing_subjects: Mutex<HashSet<String>>,
    published: Mutex<Vec<WireMessage>>,
    subscriptions: Mutex<Vec<MockSubscriptionEntry>>,
    next_subscription_id: AtomicU64,
    round_robin: Mutex<HashMap<(String, String), usize>>,
    status: Mutex<Option<ConnectionStatus>>,
    last_options: Mutex<Option<NatsOptions>>,
    drain_behavior: Mutex<DrainBehavior>,
}

impl MockState {
    fn subscribers_for(&self, subject: &str) -> Vec<DeliveryCallback> {
        let subscriptions = self.subscriptions.lock();
        let mut callbacks = Vec::new();
        let mut groups: HashMap<&str, Vec<&MockSubscriptionEntry>> = HashMap::new();

        for entry in subscriptions.iter().filter(|e| subject_matches(&e.subject, subject)) {
            match &entry.group {
                Some(group) => groups.entry(group.as_str()).or_default().push(entry),
                None => callbacks.push(Arc::clone(&entry.callback)),
            }
        }

        let mut round_robin = self.round_robin.lock();
        for (group, members) in groups {
            let counter = round_robin
                .entry((subject.to_string(), group.to_string()))
                .or_insert(0);
            let member = members[*counter % members.len()];
            *counter += 1;
            callbacks.push(Arc::clone(&member.callback));
        }

        callbacks
    }

    async fn route(&self, message: WireMessage) {
        for callback in self.subscribers_for(&message.subject) {
            callback(message.clone()).await;
        }
    }
}

/// NATS subject matching with `*` (one token) and `>` (one or more trailing tokens)
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// In-memory transport for tests
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dial fails with a connection refused error
    pub fn with_failing_dial() -> Self {
        let transport = Self::new();
        transport.state.fail_dial.store(true, Ordering::SeqCst);
        transport
    }

    pub fn with_drain_behavior(self, behavior: DrainBehavior) -> Self {
        *self.state.drain_behavior.lock() = behavior;
        self
    }

    /// Make publishes to `subject` fail
    pub fn fail_subject(&self, subject: impl Into<String>) {
        self.state.failing_subjects.lock().insert(subject.into());
    }

    /// Override the status the live connection reports
    pub fn set_status(&self, status: ConnectionStatus) {
        *self.state.status.lock() = Some(status);
    }

    /// Inject a raw wire message as if it arrived from the server
    pub async fn deliver(&self, message: WireMessage) {
        self.state.route(message).await;
    }

    pub fn dial_count(&self) -> usize {
        self.state.dial_count.load(Ordering::SeqCst)
    }

    pub fn publish_attempts(&self) -> usize {
        self.state.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn drain_count(&self) -> usize {
        self.state.drain_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.close_count.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.state.unsubscribe_count.load(Ordering::SeqCst)
    }

    pub fn drain_unsubscribe_count(&self) -> usize {
        self.state.drain_unsubscribe_count.load(Ordering::SeqCst)
    }

    /// Successfully published messages, in completion order
    pub fn published(&self) -> Vec<WireMessage> {
        self.state.published.lock().clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.subscriptions.lock().len()
    }

    /// Options passed to the most recent dial
    pub fn last_options(&self) -> Option<NatsOptions> {
        self.state.last_options.lock().clone()
    }

    pub fn status(&self) -> Option<ConnectionStatus> {
        *self.state.status.lock()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn dial(&self, options: &NatsOptions) -> Result<Arc<dyn Connection>, TransportError> {
        self.state.dial_count.fetch_add(1, Ordering::SeqCst);
        *self.state.last_options.lock() = Some(options.clone());

        if self.state.fail_dial.load(Ordering::SeqCst) {
            return Err(TransportError::DialFailed("connection refused".into()));
        }

        *self.state.status.lock() = Some(ConnectionStatus::Connected);
        Ok(Arc::new(MockConnection {
            state: Arc::clone(&self.state),
            url: options.servers.first().cloned(),
            callbacks: options.callbacks.clone(),
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
    url: Option<String>,
    callbacks: ConnectionCallbacks,
}

#[async_trait]
impl Connection for MockConnection {
    fn status(&self) -> ConnectionStatus {
        self.state
            .status
            .lock()
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    fn connected_url(&self) -> Option<String> {
        match self.status() {
            ConnectionStatus::Connected => self.url.clone(),
            _ => None,
        }
    }

    async fn publish(&self, message: WireMessage) -> Result<(), TransportError> {
        self.state.publish_attempts.fetch_add(1, Ordering::SeqCst);
        // Let concurrent submissions interleave
        tokio::task::yield_now().await;

        if self.status() == ConnectionStatus::Closed {
            return Err(TransportError::ConnectionClosed);
        }
        if self.state.failing_subjects.lock().contains(&message.subject) {
            return Err(TransportError::PublishFailed(
                format!("publish to {} rejected", message.subject).into(),
            ));
        }

        self.state.published.lock().push(message.clone());
        self.state.route(message).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        callback: DeliveryCallback,
    ) -> Result<Box<dyn TransportSubscription>, TransportError> {
        if self.status() == ConnectionStatus::Closed {
            return Err(TransportError::ConnectionClosed);
        }

        let id = self.state.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.state.subscriptions.lock().push(MockSubscriptionEntry {
            id,
            subject: subject.to_string(),
            group: queue_group.map(str::to_string),
            callback,
        });

        Ok(Box::new(MockSubscription {
            id,
            subject: subject.to_string(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn drain(&self) -> Result<(), TransportError> {
        self.state.drain_count.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.state.drain_behavior.lock();

        match behavior {
            DrainBehavior::Complete => {
                *self.state.status.lock() = Some(ConnectionStatus::Draining);
                let callbacks = self.callbacks.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    callbacks.on_closed();
                    callbacks.on_disconnected(None);
                });
            }
            DrainBehavior::Timeout => self.callbacks.on_async_error(AsyncError::DrainTimeout),
            DrainBehavior::Fail => {
                return Err(TransportError::DrainFailed("drain refused".into()));
            }
            DrainBehavior::Silent => {}
        }
        Ok(())
    }

    async fn close(&self) {
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
        *self.state.status.lock() = Some(ConnectionStatus::Closed);
        self.state.subscriptions.lock().clear();
    }
}

struct MockSubscription {
    id: u64,
    subject: String,
    state: Arc<MockState>,
}

impl MockSubscription {
    fn remove(&self) {
        self.state.subscriptions.lock().retain(|entry| entry.id != self.id);
    }
}

#[async_trait]
impl TransportSubscription for MockSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.state.unsubscribe_count.fetch_add(1, Ordering::SeqCst);
        self.remove();
        Ok(())
    }

    async fn drain(&self) -> Result<(), TransportError> {
        self.state.drain_unsubscribe_count.fetch_add(1, Ordering::SeqCst);
        self.remove();
        Ok(())
    }
}

//! Connection lifecycle management
//!
//! Owns the single shared transport connection. Writers (connect, disconnect)
//! take the state lock exclusively; publishers and subscribers take it shared
//! for the duration of their transport call, so a disconnect only proceeds once
//! in-flight operations have finished with the handle.
//!
//! Drain completion is reported by transport callbacks through [`DrainSignal`],
//! a one-shot slot armed per disconnect. Signals arriving while nothing is
//! armed, or after the slot already fired, are dropped without blocking the
//! transport.

use super::options::ResolvedOptions;
use crate::error::{BrokerError, BrokerResult};
use crate::transport::nats::{AsyncError, ConnectionCallbacks};
use crate::transport::{Connection, Transport, TransportError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

/// Extra wait on top of the native drain timeout before giving up on the signal
pub const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Draining,
}

/// How a drain finished, as reported by the transport
#[derive(Debug)]
pub enum DrainOutcome {
    /// Connection closed after flushing
    Completed,
    /// The transport gave up waiting for the drain
    TimedOut,
    /// Connection dropped during the drain
    Disconnected(Option<TransportError>),
}

impl DrainOutcome {
    fn into_result(self, drain_timeout: Duration) -> BrokerResult<()> {
        match self {
            DrainOutcome::Completed | DrainOutcome::Disconnected(None) => Ok(()),
            DrainOutcome::TimedOut => Err(BrokerError::DrainTimeout(drain_timeout)),
            DrainOutcome::Disconnected(Some(err)) => Err(err.into()),
        }
    }
}

/// Single-fire drain completion slot
#[derive(Debug, Default)]
pub struct DrainSignal {
    slot: Mutex<Option<oneshot::Sender<DrainOutcome>>>,
}

impl DrainSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot for one drain; replaces any stale sender
    pub fn arm(&self) -> oneshot::Receiver<DrainOutcome> {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock() = Some(tx);
        rx
    }

    pub fn disarm(&self) {
        self.slot.lock().take();
    }

    /// Deliver `outcome` if armed. Returns whether a waiter received it.
    pub fn notify(&self, outcome: DrainOutcome) -> bool {
        let sender = self.slot.lock().take();
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => {
                debug!(?outcome, "Drain signal not armed, dropping");
                false
            }
        }
    }

    /// Transport callbacks feeding this signal
    pub fn callbacks(self: &Arc<Self>) -> ConnectionCallbacks {
        let closed = Arc::clone(self);
        let async_error = Arc::clone(self);
        let disconnected = Arc::clone(self);

        ConnectionCallbacks {
            closed: Some(Arc::new(move || {
                closed.notify(DrainOutcome::Completed);
            })),
            async_error: Some(Arc::new(move |error| match error {
                AsyncError::DrainTimeout => {
                    async_error.notify(DrainOutcome::TimedOut);
                }
                other => debug!(error = %other, "Ignoring async transport error"),
            })),
            disconnected_err: Some(Arc::new(move |error| {
                disconnected.notify(DrainOutcome::Disconnected(error));
            })),
        }
    }
}

struct Inner {
    state: ConnectionState,
    conn: Option<Arc<dyn Connection>>,
}

/// Owner of the shared transport connection
pub struct ConnectionManager {
    inner: RwLock<Inner>,
    transport: Arc<dyn Transport>,
    drain_signal: Arc<DrainSignal>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: ConnectionState::Disconnected,
                conn: None,
            }),
            transport,
            drain_signal: Arc::new(DrainSignal::new()),
        }
    }

    pub fn drain_callbacks(&self) -> ConnectionCallbacks {
        self.drain_signal.callbacks()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.read().await.state
    }

    /// Connected URL without waiting; `None` while a writer holds the lock
    pub fn connected_url(&self) -> Option<String> {
        let inner = self.inner.try_read().ok()?;
        if inner.state != ConnectionState::Connected {
            return None;
        }
        inner.conn.as_ref().and_then(|conn| conn.connected_url())
    }

    /// Dial unless a usable connection already exists
    pub async fn connect(&self, resolved: &ResolvedOptions) -> BrokerResult<()> {
        let mut inner = self.inner.write().await;

        if let Some(conn) = &inner.conn {
            let status = conn.status();
            if status.is_usable() {
                debug!(?status, "Connection already established");
                inner.state = ConnectionState::Connected;
                return Ok(());
            }
        }

        if let Some(stale) = inner.conn.take() {
            debug!(status = ?stale.status(), "Releasing unusable connection before redial");
            stale.close().await;
        }

        let options = resolved.connect_options();
        match self.transport.dial(&options).await {
            Ok(conn) => {
                info!(servers = ?options.servers, "Broker connected");
                inner.conn = Some(conn);
                inner.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, servers = ?options.servers, "Error connecting to broker");
                Err(e.into())
            }
        }
    }

    /// Close the connection, draining first when `drain` is set
    pub async fn disconnect(&self, drain: bool, drain_timeout: Duration) -> BrokerResult<()> {
        let mut inner = self.inner.write().await;

        let Some(conn) = inner.conn.clone() else {
            inner.state = ConnectionState::Disconnected;
            return Ok(());
        };

        let outcome = if drain {
            inner.state = ConnectionState::Draining;
            let completion = self.drain_signal.arm();

            if let Err(e) = conn.drain().await {
                warn!(error = %e, "Drain failed");
                self.drain_signal.disarm();
                inner.state = ConnectionState::Connected;
                return Err(e.into());
            }

            match tokio::time::timeout(drain_timeout + DRAIN_GRACE, completion).await {
                Ok(Ok(outcome)) => outcome.into_result(drain_timeout),
                Ok(Err(_)) => Err(BrokerError::DrainInterrupted(
                    "completion signal dropped".to_string(),
                )),
                Err(_) => {
                    self.drain_signal.disarm();
                    Err(BrokerError::DrainTimeout(drain_timeout))
                }
            }
        } else {
            Ok(())
        };

        conn.close().await;
        inner.conn = None;
        inner.state = ConnectionState::Disconnected;
        info!(drained = drain, "Broker disconnected");
        outcome
    }

    /// Run `op` against the live connection while holding the shared lock
    pub async fn with_connection<F, Fut, T>(&self, op: F) -> BrokerResult<T>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let inner = self.inner.read().await;
        let conn = match (&inner.state, &inner.conn) {
            (ConnectionState::Connected, Some(conn)) => Arc::clone(conn),
            _ => return Err(BrokerError::NotConnected),
        };
        let result = op(conn).await;
        drop(inner);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::options::{Options, OptionsMerger};
    use crate::testing::{DrainBehavior, MockTransport};

    fn resolved(manager: &ConnectionManager, drain: bool) -> ResolvedOptions {
        let options = Options {
            drain_connection: drain,
            ..Default::default()
        };
        OptionsMerger::new().resolve(&options, &manager.drain_callbacks())
    }

    #[test]
    fn test_drain_signal_tolerates_duplicates() {
        let signal = Arc::new(DrainSignal::new());
        let callbacks = signal.callbacks();

        // Nothing armed: dropped without blocking
        callbacks.on_closed();

        let mut rx = signal.arm();
        callbacks.on_closed();
        callbacks.on_disconnected(None);
        callbacks.on_closed();

        assert!(matches!(rx.try_recv(), Ok(DrainOutcome::Completed)));
    }

    #[test]
    fn test_drain_signal_ignores_other_async_errors() {
        let signal = Arc::new(DrainSignal::new());
        let callbacks = signal.callbacks();
        let mut rx = signal.arm();

        callbacks.on_async_error(AsyncError::SlowConsumer(3));
        assert!(rx.try_recv().is_err());

        callbacks.on_async_error(AsyncError::DrainTimeout);
        assert!(matches!(rx.try_recv(), Ok(DrainOutcome::TimedOut)));
    }

    #[tokio::test]
    async fn test_connect_twice_dials_once() {
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(transport.clone());
        let options = resolved(&manager, false);

        manager.connect(&options).await.unwrap();
        manager.connect(&options).await.unwrap();

        assert_eq!(transport.dial_count(), 1);
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_when_never_connected_is_noop() {
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(transport.clone());

        manager.disconnect(true, Duration::from_secs(1)).await.unwrap();

        assert_eq!(transport.drain_count(), 0);
        assert_eq!(transport.close_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_timeout_surfaces_after_close() {
        let transport = Arc::new(MockTransport::new().with_drain_behavior(DrainBehavior::Timeout));
        let manager = ConnectionManager::new(transport.clone());
        let options = resolved(&manager, true);
        manager.connect(&options).await.unwrap();

        let result = manager.disconnect(true, Duration::from_millis(50)).await;

        assert!(matches!(result, Err(BrokerError::DrainTimeout(_))));
        assert_eq!(transport.close_count(), 1);
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_silent_drain_is_bounded() {
        let transport = Arc::new(MockTransport::new().with_drain_behavior(DrainBehavior::Silent));
        let manager = ConnectionManager::new(transport.clone());
        let options = resolved(&manager, true);
        manager.connect(&options).await.unwrap();

        let result = manager.disconnect(true, Duration::from_millis(10)).await;

        assert!(matches!(result, Err(BrokerError::DrainTimeout(_))));
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_drain_keeps_connection() {
        let transport = Arc::new(MockTransport::new().with_drain_behavior(DrainBehavior::Fail));
        let manager = ConnectionManager::new(transport.clone());
        let options = resolved(&manager, true);
        manager.connect(&options).await.unwrap();

        let result = manager.disconnect(true, Duration::from_secs(1)).await;

        assert!(matches!(result, Err(BrokerError::Transport(TransportError::DrainFailed(_)))));
        assert_eq!(transport.close_count(), 0);
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_with_connection_requires_connect() {
        let manager = ConnectionManager::new(Arc::new(MockTransport::new()));
        let result = manager.with_connection(|_| async { Ok(()) }).await;
        assert!(matches!(result, Err(BrokerError::NotConnected)));
    }
}

//! Connection lifecycle tests
//!
//! Connect/disconnect behavior of the broker against the in-memory transport:
//! idempotent connect, no-op disconnect, and each way a drain can end.

use nats_broker::broker::{Broker, BrokerOption, ConnectionState, NatsBroker, PublishOptions};
use nats_broker::codec::JsonCodec;
use nats_broker::testing::{DrainBehavior, MockTransport};
use nats_broker::transport::nats::NatsOptions;
use nats_broker::transport::{ConnectionStatus, TransportError};
use nats_broker::{BrokerError, Context, Message};
use std::sync::Arc;
use std::time::Duration;

fn broker_with(transport: &Arc<MockTransport>, extra: Vec<BrokerOption>) -> NatsBroker {
    let mut options = vec![
        BrokerOption::Codec(Arc::new(JsonCodec)),
        BrokerOption::Addrs(vec!["10.0.0.1:4222".to_string()]),
    ];
    options.extend(extra);
    let broker = NatsBroker::with_transport(transport.clone(), options);
    broker.init(Vec::new()).unwrap();
    broker
}

fn fast_drain() -> BrokerOption {
    BrokerOption::NatsOptions(NatsOptions {
        drain_timeout: Duration::from_millis(20),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_connect_twice_performs_one_dial() {
    // Arrange
    let transport = Arc::new(MockTransport::new());
    let broker = broker_with(&transport, Vec::new());
    let ctx = Context::background();

    // Act
    broker.connect(&ctx).await.unwrap();
    broker.connect(&ctx).await.unwrap();

    // Assert
    assert_eq!(transport.dial_count(), 1);
    assert_eq!(broker.state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_concurrent_connects_share_one_dial() {
    let transport = Arc::new(MockTransport::new());
    let broker = Arc::new(broker_with(&transport, Vec::new()));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.connect(&Context::background()).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(transport.dial_count(), 1);
}

#[tokio::test]
async fn test_connect_while_reconnecting_does_not_redial() {
    let transport = Arc::new(MockTransport::new());
    let broker = broker_with(&transport, Vec::new());
    let ctx = Context::background();
    broker.connect(&ctx).await.unwrap();

    transport.set_status(ConnectionStatus::Reconnecting);
    broker.connect(&ctx).await.unwrap();

    assert_eq!(transport.dial_count(), 1);
}

#[tokio::test]
async fn test_connect_redials_closed_connection() {
    let transport = Arc::new(MockTransport::new());
    let broker = broker_with(&transport, Vec::new());
    let ctx = Context::background();
    broker.connect(&ctx).await.unwrap();

    transport.set_status(ConnectionStatus::Closed);
    broker.connect(&ctx).await.unwrap();

    assert_eq!(transport.dial_count(), 2);
    // The dead connection is released before the redial
    assert_eq!(transport.close_count(), 1);
    assert_eq!(broker.state().await, ConnectionState::Connected);
    broker
        .publish(&ctx, "orders", Message::new("after redial"), PublishOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_drain_completion_signalled_asynchronously() {
    let transport = Arc::new(MockTransport::new().with_drain_behavior(DrainBehavior::Complete));
    let broker = broker_with(&transport, vec![BrokerOption::DrainConnection, fast_drain()]);
    let ctx = Context::background();
    broker.connect(&ctx).await.unwrap();

    // Completion arrives after drain() has already returned
    let result = tokio::time::timeout(Duration::from_secs(5), broker.disconnect(&ctx))
        .await
        .expect("disconnect must be bounded");

    result.unwrap();
    assert_eq!(transport.close_count(), 1);
    assert_eq!(broker.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_dial_failure_is_returned_unchanged() {
    let transport = Arc::new(MockTransport::with_failing_dial());
    let broker = broker_with(&transport, Vec::new());

    let result = broker.connect(&Context::background()).await;

    assert!(matches!(
        result,
        Err(BrokerError::Transport(TransportError::DialFailed(_)))
    ));
    assert_eq!(broker.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_dial_uses_normalized_addresses() {
    let transport = Arc::new(MockTransport::new());
    let broker = broker_with(
        &transport,
        vec![BrokerOption::Addrs(vec![
            "10.0.0.1:4222".to_string(),
            String::new(),
        ])],
    );

    broker.connect(&Context::background()).await.unwrap();

    let dialed = transport.last_options().unwrap();
    assert_eq!(dialed.servers, vec!["nats://10.0.0.1:4222"]);
    assert!(dialed.callbacks.is_empty());
}

#[tokio::test]
async fn test_disconnect_when_never_connected_is_noop() {
    let transport = Arc::new(MockTransport::new());
    let broker = broker_with(&transport, vec![BrokerOption::DrainConnection]);

    broker.disconnect(&Context::background()).await.unwrap();

    assert_eq!(transport.drain_count(), 0);
    assert_eq!(transport.close_count(), 0);
}

#[tokio::test]
async fn test_disconnect_without_drain_closes_immediately() {
    let transport = Arc::new(MockTransport::new());
    let broker = broker_with(&transport, Vec::new());
    let ctx = Context::background();
    broker.connect(&ctx).await.unwrap();

    broker.disconnect(&ctx).await.unwrap();
    broker.disconnect(&ctx).await.unwrap();

    assert_eq!(transport.drain_count(), 0);
    assert_eq!(transport.close_count(), 1);
    assert_eq!(broker.state().await, ConnectionState::Disconnected);
    assert_eq!(broker.address(), "nats://10.0.0.1:4222");
}

#[tokio::test]
async fn test_drain_completion_disconnects() {
    let transport = Arc::new(MockTransport::new().with_drain_behavior(DrainBehavior::Complete));
    let broker = broker_with(&transport, vec![BrokerOption::DrainConnection]);
    let ctx = Context::background();
    broker.connect(&ctx).await.unwrap();
    assert!(transport.last_options().unwrap().callbacks.closed.is_some());

    // Complete fires closed and a duplicate disconnected callback
    broker.disconnect(&ctx).await.unwrap();

    assert_eq!(transport.drain_count(), 1);
    assert_eq!(transport.close_count(), 1);
    assert_eq!(broker.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_drain_timeout_reported_after_close() {
    let transport = Arc::new(MockTransport::new().with_drain_behavior(DrainBehavior::Timeout));
    let broker = broker_with(&transport, vec![BrokerOption::DrainConnection, fast_drain()]);
    let ctx = Context::background();
    broker.connect(&ctx).await.unwrap();

    let result = broker.disconnect(&ctx).await;

    assert!(matches!(result, Err(BrokerError::DrainTimeout(_))));
    assert_eq!(transport.close_count(), 1);
    assert_eq!(broker.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_silent_drain_does_not_hang() {
    let transport = Arc::new(MockTransport::new().with_drain_behavior(DrainBehavior::Silent));
    let broker = broker_with(&transport, vec![BrokerOption::DrainConnection, fast_drain()]);
    let ctx = Context::background();
    broker.connect(&ctx).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), broker.disconnect(&ctx))
        .await
        .expect("disconnect must be bounded");

    assert!(matches!(result, Err(BrokerError::DrainTimeout(_))));
    assert_eq!(transport.close_count(), 1);
}

#[tokio::test]
async fn test_failed_drain_keeps_broker_usable() {
    let transport = Arc::new(MockTransport::new().with_drain_behavior(DrainBehavior::Fail));
    let broker = broker_with(&transport, vec![BrokerOption::DrainConnection]);
    let ctx = Context::background();
    broker.connect(&ctx).await.unwrap();

    let result = broker.disconnect(&ctx).await;

    assert!(matches!(
        result,
        Err(BrokerError::Transport(TransportError::DrainFailed(_)))
    ));
    assert_eq!(transport.close_count(), 0);
    broker
        .publish(&ctx, "orders", Message::new("still here"), PublishOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let transport = Arc::new(MockTransport::new());
    let broker = broker_with(&transport, Vec::new());
    let ctx = Context::background();

    broker.connect(&ctx).await.unwrap();
    broker.disconnect(&ctx).await.unwrap();
    let result = broker
        .publish(&ctx, "orders", Message::new("x"), PublishOptions::default())
        .await;
    assert!(matches!(result, Err(BrokerError::NotConnected)));

    broker.connect(&ctx).await.unwrap();
    broker
        .publish(&ctx, "orders", Message::new("x"), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(transport.dial_count(), 2);
}

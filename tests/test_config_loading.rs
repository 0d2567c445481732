//! Configuration loading and validation tests
//!
//! Tests focus on observable outcomes: what a config file turns into once the
//! broker applies it, and which files are rejected.

use nats_broker::broker::{Broker, NatsBroker};
use nats_broker::config::{BrokerConfig, ConfigError};
use nats_broker::testing::MockTransport;
use nats_broker::Context;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[broker]
name = "orders"
addrs = ["10.0.0.1:4222"]
codec = "json"
"#,
    );

    let config = BrokerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.name.as_deref(), Some("orders"));
    assert_eq!(config.broker.addrs, vec!["10.0.0.1:4222"]);
    assert!(config.broker.tls.is_none());
}

#[test]
fn test_missing_file_is_read_error() {
    let result = BrokerConfig::load_from_file(Path::new("/nonexistent/broker.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_missing_broker_section_is_parse_error() {
    let temp_file = write_config("[server]\nport = 1\n");
    let result = BrokerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[tokio::test]
async fn test_config_options_drive_the_broker() {
    // Arrange
    let temp_file = write_config(
        r#"
[broker]
name = "billing"
addrs = ["10.0.0.5:4222", ""]
codec = "noop"
drain_on_close = true

[broker.nats]
connection_timeout_ms = 750
drain_timeout_ms = 5000
max_reconnects = 3
"#,
    );
    let config = BrokerConfig::load_from_file(temp_file.path()).unwrap();
    let transport = Arc::new(MockTransport::new());

    // Act
    let broker = NatsBroker::with_transport(transport.clone(), config.to_options().unwrap());
    broker.init(Vec::new()).unwrap();
    broker.connect(&Context::background()).await.unwrap();

    // Assert
    assert_eq!(broker.name(), "billing");
    assert_eq!(broker.options().codec.unwrap().name(), "noop");

    let dialed = transport.last_options().unwrap();
    assert_eq!(dialed.servers, vec!["nats://10.0.0.5:4222"]);
    assert_eq!(dialed.connection_timeout, Duration::from_millis(750));
    assert_eq!(dialed.drain_timeout, Duration::from_secs(5));
    assert_eq!(dialed.max_reconnects, Some(3));
    assert_eq!(dialed.name.as_deref(), Some("billing"));
    assert!(!dialed.callbacks.is_empty());
}

#[test]
fn test_tls_table_reaches_options() {
    let temp_file = write_config(
        r#"
[broker]
[broker.tls]
ca_file = "ca.pem"
cert_file = "client.pem"
key_file = "client.key"
require_tls = true
"#,
    );
    let config = BrokerConfig::load_from_file(temp_file.path()).unwrap();

    let broker = NatsBroker::with_transport(
        Arc::new(MockTransport::new()),
        config.to_options().unwrap(),
    );

    let tls = broker.options().tls.unwrap();
    assert!(tls.require_tls);
    assert_eq!(tls.key_file.unwrap().to_str(), Some("client.key"));
}

#[test]
fn test_unknown_codec_is_rejected() {
    let temp_file = write_config("[broker]\ncodec = \"avro\"\n");
    let result = BrokerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::UnknownCodec(_))));
}

#[test]
fn test_key_without_cert_is_rejected() {
    let temp_file = write_config("[broker]\n[broker.tls]\nkey_file = \"client.key\"\n");
    let result = BrokerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_user_without_password_is_rejected() {
    let temp_file = write_config("[broker]\n[broker.nats]\nuser_env = \"NATS_USER\"\n");
    let result = BrokerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

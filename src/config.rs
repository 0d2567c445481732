//! Configuration file support for the broker
//!
//! A TOML file with a `[broker]` section, an optional `[broker.nats]` table of
//! transport-native settings and an optional `[broker.tls]` table. Credentials
//! are never stored in the file; only the names of the environment variables
//! holding them are.

use crate::broker::BrokerOption;
use crate::codec::codec_by_name;
use crate::transport::nats::{Auth, NatsOptions, TlsConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    pub broker: BrokerSection,
}

/// `[broker]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    #[serde(default)]
    pub name: Option<String>,
    /// Server addresses; the scheme is optional
    #[serde(default)]
    pub addrs: Vec<String>,
    /// Codec identifier: "json" or "noop"
    #[serde(default = "default_codec")]
    pub codec: String,
    /// Drain the connection on disconnect
    #[serde(default)]
    pub drain_on_close: bool,
    pub nats: Option<NatsSection>,
    pub tls: Option<TlsConfig>,
}

fn default_codec() -> String {
    "json".to_string()
}

/// `[broker.nats]` transport-native settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NatsSection {
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_reconnect_wait_ms")]
    pub reconnect_wait_ms: u64,
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: usize,
    /// Ignore `max_reconnects` and keep reconnecting
    #[serde(default)]
    pub reconnect_forever: bool,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Environment variable containing the user name
    pub user_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    /// Environment variable containing the auth token
    pub token_env: Option<String>,
}

fn default_connection_timeout_ms() -> u64 {
    2_000
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_reconnect_wait_ms() -> u64 {
    2_000
}

fn default_max_reconnects() -> usize {
    60
}

fn default_ping_interval_secs() -> u64 {
    120
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Unknown codec: {0}")]
    UnknownCodec(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BrokerConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if codec_by_name(&self.broker.codec).is_none() {
            return Err(ConfigError::UnknownCodec(self.broker.codec.clone()));
        }

        if let Some(tls) = &self.broker.tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(ConfigError::InvalidConfig(
                    "[broker.tls] cert_file and key_file must be set together".to_string(),
                ));
            }
        }

        if let Some(nats) = &self.broker.nats {
            if nats.user_env.is_some() != nats.password_env.is_some() {
                return Err(ConfigError::InvalidConfig(
                    "[broker.nats] user_env and password_env must be set together".to_string(),
                ));
            }
            if nats.user_env.is_some() && nats.token_env.is_some() {
                return Err(ConfigError::InvalidConfig(
                    "[broker.nats] use either user/password or token authentication".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Broker options in application order.
    ///
    /// Credentials are read from the environment here.
    pub fn to_options(&self) -> Result<Vec<BrokerOption>, ConfigError> {
        let section = &self.broker;
        let codec = codec_by_name(&section.codec)
            .ok_or_else(|| ConfigError::UnknownCodec(section.codec.clone()))?;

        let mut options = vec![BrokerOption::Codec(codec)];
        if let Some(name) = &section.name {
            options.push(BrokerOption::Name(name.clone()));
        }
        if let Some(nats) = &section.nats {
            options.push(BrokerOption::NatsOptions(
                nats.to_native(section.name.as_deref())?,
            ));
        }
        if !section.addrs.is_empty() {
            options.push(BrokerOption::Addrs(section.addrs.clone()));
        }
        if let Some(tls) = &section.tls {
            options.push(BrokerOption::Tls(tls.clone()));
        }
        if section.drain_on_close {
            options.push(BrokerOption::DrainConnection);
        }

        Ok(options)
    }

    /// Minimal configuration for tests
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self::from_toml(
            r#"
[broker]
name = "test-broker"
addrs = ["127.0.0.1:4222"]
"#,
        )
        .expect("Test config should parse")
    }
}

impl NatsSection {
    /// Transport-native options; servers stay empty so adapter addresses apply
    pub fn to_native(&self, name: Option<&str>) -> Result<NatsOptions, ConfigError> {
        Ok(NatsOptions {
            name: name.map(str::to_string),
            auth: self.auth()?,
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            reconnect_wait: Duration::from_millis(self.reconnect_wait_ms),
            max_reconnects: (!self.reconnect_forever).then_some(self.max_reconnects),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            ..Default::default()
        })
    }

    fn auth(&self) -> Result<Option<Auth>, ConfigError> {
        if let (Some(user_env), Some(password_env)) = (&self.user_env, &self.password_env) {
            return Ok(Some(Auth::UserPassword {
                user: get_env_var_required(user_env)?,
                password: get_env_var_required(password_env)?,
            }));
        }
        match &self.token_env {
            Some(token_env) => Ok(Some(Auth::Token(get_env_var_required(token_env)?))),
            None => Ok(None),
        }
    }
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

//! Generic broker message envelope
//!
//! A [`Message`] is an ordered header mapping plus an opaque body. Routing
//! metadata such as the topic travels in the headers so that any transport can
//! carry it without knowing about this crate's types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header carrying the topic a message was published to
pub const TOPIC_HEADER: &str = "Micro-Topic";

/// Header carrying the request id of the publisher
pub const ID_HEADER: &str = "Micro-Id";

/// Ordered string header mapping
pub type Metadata = BTreeMap<String, String>;

/// Generic message handed to publishers and subscribers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub header: Metadata,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            header: Metadata::new(),
            body: body.into(),
        }
    }

    /// Add a header (builder style)
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    /// Topic recorded in the routing header, if any
    pub fn topic(&self) -> Option<&str> {
        self.header.get(TOPIC_HEADER).map(String::as_str)
    }

    /// Clear headers and body while keeping allocated capacity
    pub fn reset(&mut self) {
        self.header.clear();
        self.body.clear();
    }
}

//! Request-scoped context
//!
//! Carried alongside publish/subscribe calls and attached to every delivered
//! [`Publication`](crate::broker::Publication). It is metadata for tracing and
//! propagation only: nothing in the broker cancels an in-flight transport call
//! based on it.

use crate::message::{Metadata, ID_HEADER};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    request_id: Option<String>,
    values: Metadata,
}

impl Context {
    /// Empty context with no request id
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Build the context for one inbound delivery.
    ///
    /// The request id is taken from the publisher's id header when present,
    /// otherwise a fresh one is generated so every delivery can be traced.
    pub(crate) fn for_delivery(subject: &str, headers: Option<&Metadata>) -> Self {
        let request_id = headers
            .and_then(|h| h.get(ID_HEADER))
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self::background()
            .with_request_id(request_id)
            .with_value("subject", subject)
    }
}

//! Observability for the broker adapter
//!
//! Structured logging only; every component reports through `tracing`.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{broker_span, delivery_span};

//! Testing utilities and mock implementations
//!
//! This module provides an in-memory transport so the broker can be exercised
//! without a running NATS server.

pub mod mocks;

pub use mocks::*;

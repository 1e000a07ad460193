//! # Resilience
//!
//! Protection for calls to flaky remote dependencies.
//!
//! ## Components
//! - `CircuitBreaker`: fast-fails calls after repeated failures, then probes recovery.
//! - `RetryPolicy`: capped exponential backoff with jitter.
//! - `ResilientClient`: HTTP client combining both.

pub mod circuit_breaker;
pub mod client;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitOpenError, CircuitSnapshot, CircuitState, Permit};
pub use client::{ClientConfig, ClientError, ResilientClient};
pub use retry::RetryPolicy;

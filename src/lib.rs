//! Courier – resilient request dispatch for AO processes
//!
//! This crate provides:
//! - Dry-run, signed-message and HyperBEAM compute-path transports behind one dispatcher
//! - Response validation with retry, escalating backoff and a refresh signal
//! - A bounded, rate-limited request queue with a periodic driver on top
//! - Scroll-driven pagination that tolerates out-of-order page responses
//! - A GraphQL fallback for transaction discovery

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Client layers: dispatcher, queue, periodic driver, paginator and GraphQL
pub mod client;

// Re-export key types for convenience
pub use client::{ClientConfig, Completion, Courier, Request, RequestHandler, ResponseEnvelope};

/// Current version of the courier crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

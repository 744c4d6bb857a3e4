//! Broker daemon library crate.
//!
//! Exposes the daemon's subsystems (configuration, HTTP and RESP transports,
//! TLS setup, observability bootstrap) for use by the `miniqueued` binary and
//! its integration tests.

pub mod config;
pub mod http;
pub mod observability;
pub mod resp;
pub mod tls;

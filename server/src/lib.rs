//! Echo server built on the reactor framework.
//!
//! Exists to exercise the public API end-to-end: TOML configuration,
//! structured logging, metrics, and the `echo-server` binary.

pub mod config;
pub mod echo;
pub mod logging;
pub mod metrics;

pub use config::Config;
pub use echo::EchoServer;

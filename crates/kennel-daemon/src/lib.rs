//! # kennel-daemon
//!
//! The kennel storage provider process: configuration, HTTP file server,
//! and lifecycle of the engine's background loops.
//!
//! ## Modules
//!
//! - [`config`] — `config.toml` sections and defaults.
//! - [`node`] — Startup wiring and graceful shutdown.
//! - [`server`] — axum routes for upload, download and administration.

pub mod config;
pub mod node;
pub mod server;

pub use config::DaemonConfig;
pub use node::Node;

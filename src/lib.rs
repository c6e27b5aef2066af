//! Rota transports - upstream proxy connection layer
//!
//! Builds connections to targets through upstream proxy providers.
//!
//! ## Features
//!
//! - One transport contract shared by every provider
//! - Datacenter proxies over mutual TLS, Zyte and Bright Data super proxies
//! - Nested CONNECT tunnels with TLS to the target over the tunnel
//! - Typed upstream rejections, kept apart from network failures
//! - Socket accounting with forced close, idle expiry and cancellation
//! - Fingerprint probes with bounded concurrency

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{Result, RotaError, TransportError};

//! Upstream transports and tunnel establishment
//!
//! This module provides:
//! - The provider agnostic [`Transport`] contract and its connection arguments
//! - CONNECT tunnels, optionally with TLS to the target over the tunnel
//! - Datacenter (mutual TLS), Zyte and Bright Data provider transports
//! - Socket accounting with forced close and idle expiry
//! - Fingerprint probes

pub mod client;
pub mod fingerprint;
pub mod headers;
pub mod providers;
pub mod registry;
pub mod sockets;
pub mod tls;
pub mod transport;
pub mod tunnel;
pub mod url;

#[cfg(test)]
pub(crate) mod testing;

pub use client::send_request;
pub use fingerprint::{FingerprintChecker, FingerprintCheckerConfig, FingerprintResult};
pub use headers::HeaderSet;
pub use providers::{BrightdataTransport, DatacenterTransport, ZyteTransport};
pub use registry::TransportRegistry;
pub use sockets::{SocketLabel, SocketLease, SocketRegistry, SocketRole, TrackedStream};
pub use transport::{ConnectionArgs, ProxyConnection, ProxyStream, SocketFactory, Transport};
pub use tunnel::{spawn_connect, TunnelHandle, TunnelState};
pub use url::UrlOptions;

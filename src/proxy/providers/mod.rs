//! Upstream provider transports
//!
//! Each provider supplies only its deltas (hop address, credentials and
//! certificate material); CONNECT handling is shared in
//! [`crate::proxy::tunnel`].

mod brightdata;
mod datacenter;
mod zyte;

pub use brightdata::BrightdataTransport;
pub use datacenter::DatacenterTransport;
pub use zyte::ZyteTransport;

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use http::uri::Authority;
use http::Method;

use crate::error::{Result, RotaError};
use crate::proxy::headers::HeaderSet;
use crate::proxy::sockets::SocketRegistry;
use crate::proxy::tls::TargetServerName;
use crate::proxy::transport::{ConnectionArgs, DirectSocketFactory, TunnelSocketFactory};
use crate::proxy::tunnel::{Hop, TunnelRequest};
use crate::proxy::url::{format_authority, UrlOptions};

pub const TRANSPORT_DATACENTER_TYPE: &str = "datacenter";
pub const TRANSPORT_ZYTE_TYPE: &str = "zyte";
pub const TRANSPORT_BRIGHTDATA_TYPE: &str = "brightdata";

/// Region value meaning "no preference"
pub(crate) const REGION_ALL: &str = "all";

/// `Proxy-Authorization` value for Basic credentials
pub(crate) fn basic_auth(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        BASE64.encode(format!("{}:{}", username, password))
    )
}

/// CONNECT target of a tunneled request.
///
/// Taken from the `Host` of `headers_connect` when the caller set one, else
/// the target authority. A `Host` without a port gets the target port.
pub(crate) fn connect_authority(headers_connect: &HeaderSet, url: &UrlOptions) -> Result<String> {
    let Some(host) = headers_connect.get("Host") else {
        return Ok(url.authority());
    };

    let authority = host
        .trim()
        .parse::<Authority>()
        .map_err(|e| RotaError::InvalidHeader(format!("Host {}: {}", host, e)))?;

    Ok(match authority.port_u16() {
        Some(_) => authority.as_str().to_string(),
        None => format_authority(authority.host(), url.port),
    })
}

/// Server name for the TLS handshake to the target, when it speaks TLS
pub(crate) fn target_tls(url: &UrlOptions) -> Result<Option<TargetServerName>> {
    if url.scheme()?.is_tls() {
        TargetServerName::for_host(&url.hostname).map(Some)
    } else {
        Ok(None)
    }
}

/// Request written in absolute form straight to a forward proxy
pub(crate) fn forward_args(
    origin: &'static str,
    method: Method,
    url: &UrlOptions,
    headers: HeaderSet,
    hop: Hop,
    sockets: &SocketRegistry,
    timeout: Duration,
) -> ConnectionArgs {
    let factory = Arc::new(DirectSocketFactory::new(origin, hop.clone(), timeout));
    ConnectionArgs::new(
        method,
        &hop,
        url.to_url(true),
        headers.with_default("Host", url.host_header()),
        timeout,
        factory,
        sockets,
    )
}

/// Request written in origin form through a CONNECT tunnel
pub(crate) fn tunneled_args(
    method: Method,
    url: &UrlOptions,
    headers: HeaderSet,
    request: TunnelRequest,
    sockets: &SocketRegistry,
    timeout: Duration,
) -> ConnectionArgs {
    let hop = request.hop.clone();
    ConnectionArgs::new(
        method,
        &hop,
        url.to_url(false),
        headers.with_default("Host", url.host_header()),
        timeout,
        Arc::new(TunnelSocketFactory::new(request)),
        sockets,
    )
}

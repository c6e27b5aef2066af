//! Zyte Smart Proxy Manager transport

use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use tracing::instrument;

use super::{
    basic_auth, connect_authority, forward_args, target_tls, tunneled_args, REGION_ALL,
    TRANSPORT_ZYTE_TYPE,
};
use crate::config::UpstreamEndpoint;
use crate::error::Result;
use crate::models::{ConnectorProxyRefreshed, ConnectorToRefresh, ProxyToConnect, ZyteProxyConfig};
use crate::proxy::headers::{HeaderSet, HEADER_PROXY_ERROR};
use crate::proxy::sockets::SocketRegistry;
use crate::proxy::transport::{with_deadline, ConnectionArgs, ProxyStream, Transport};
use crate::proxy::tunnel::{self, Hop, ReasonSource, TunnelRequest};
use crate::proxy::url::{TargetScheme, UrlOptions};

const HEADER_SESSION: &str = "X-Crawlera-Session";
const HEADER_REGION: &str = "X-Crawlera-Region";
const ERROR_HEADERS: &[&str] = &[HEADER_PROXY_ERROR, "x-crawlera-error"];

#[derive(Debug, Clone)]
pub struct ZyteTransport {
    endpoint: UpstreamEndpoint,
}

impl ZyteTransport {
    pub fn new(endpoint: UpstreamEndpoint) -> Self {
        Self { endpoint }
    }

    fn hop(&self) -> Hop {
        Hop::plain(self.endpoint.hostname.clone(), self.endpoint.port)
    }
}

impl Default for ZyteTransport {
    fn default() -> Self {
        Self::new(UpstreamEndpoint::zyte())
    }
}

/// Add credentials and session pinning to `headers`.
///
/// Zyte expects the region upper-cased inside CONNECT frames only.
fn session_headers(
    headers: HeaderSet,
    config: &ZyteProxyConfig,
    key: &str,
    uppercase_region: bool,
) -> HeaderSet {
    let headers = headers
        .with("Proxy-Authorization", basic_auth(&config.token, ""))
        .with(HEADER_SESSION, key);

    if config.region == REGION_ALL {
        return headers;
    }

    let region = if uppercase_region {
        config.region.to_uppercase()
    } else {
        config.region.clone()
    };
    headers.with(HEADER_REGION, region)
}

#[async_trait]
impl Transport for ZyteTransport {
    fn transport_type(&self) -> &str {
        TRANSPORT_ZYTE_TYPE
    }

    fn complete_proxy_config(
        &self,
        proxy: &mut ConnectorProxyRefreshed,
        connector: &ConnectorToRefresh,
    ) -> Result<()> {
        let token = connector.zyte_token()?.to_string();
        let region = connector.zyte_region()?.to_string();

        let config = proxy.config.as_zyte_mut()?;
        config.token = token;
        config.region = region;
        Ok(())
    }

    #[instrument(skip_all, fields(proxy_id = %proxy.id, target = %url.authority()))]
    fn build_request_args(
        &self,
        method: Method,
        url: &UrlOptions,
        headers: HeaderSet,
        headers_connect: HeaderSet,
        proxy: &ProxyToConnect,
        sockets: &SocketRegistry,
        timeout: Duration,
    ) -> Result<ConnectionArgs> {
        let scheme = url.scheme()?;
        let config = proxy.config.as_zyte()?;

        match scheme {
            TargetScheme::Http => Ok(forward_args(
                "zyte:http",
                method,
                url,
                session_headers(headers, config, &proxy.key, false),
                self.hop(),
                sockets,
                timeout,
            )),
            TargetScheme::Https => {
                let request = TunnelRequest {
                    origin: "zyte:https",
                    hop: self.hop(),
                    authority: connect_authority(&headers_connect, url)?,
                    headers: session_headers(headers_connect, config, &proxy.key, true),
                    error_headers: ERROR_HEADERS,
                    reason: ReasonSource::Body,
                    target_tls: target_tls(url)?,
                    idle_timeout: timeout,
                };
                Ok(tunneled_args(method, url, headers, request, sockets, timeout))
            }
        }
    }

    #[instrument(skip(self, headers, proxy, sockets), fields(proxy_id = %proxy.id))]
    async fn connect(
        &self,
        target: &str,
        headers: HeaderSet,
        proxy: &ProxyToConnect,
        sockets: &SocketRegistry,
        timeout: Duration,
    ) -> Result<ProxyStream> {
        let config = proxy.config.as_zyte()?;

        let request = TunnelRequest {
            origin: "zyte:connect",
            hop: self.hop(),
            authority: target.to_string(),
            headers: session_headers(headers, config, &proxy.key, false),
            error_headers: ERROR_HEADERS,
            reason: ReasonSource::Header,
            target_tls: None,
            idle_timeout: timeout,
        };

        with_deadline(timeout, tunnel::establish(&request, sockets)).await
    }
}

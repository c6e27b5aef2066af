//! Bright Data super proxy transport
//!
//! Session pinning and country targeting are encoded in the Basic auth
//! username rather than in dedicated headers.

use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use tracing::instrument;

use super::{
    basic_auth, connect_authority, forward_args, target_tls, tunneled_args, REGION_ALL,
    TRANSPORT_BRIGHTDATA_TYPE,
};
use crate::config::UpstreamEndpoint;
use crate::error::Result;
use crate::models::{
    BrightdataProxyConfig, ConnectorProxyRefreshed, ConnectorToRefresh, ProxyToConnect,
};
use crate::proxy::headers::{HeaderSet, HEADER_PROXY_ERROR};
use crate::proxy::sockets::SocketRegistry;
use crate::proxy::transport::{with_deadline, ConnectionArgs, ProxyStream, Transport};
use crate::proxy::tunnel::{self, Hop, ReasonSource, TunnelRequest};
use crate::proxy::url::{TargetScheme, UrlOptions};

const ERROR_HEADERS: &[&str] = &[HEADER_PROXY_ERROR, "x-brd-error", "x-luminati-error"];

#[derive(Debug, Clone)]
pub struct BrightdataTransport {
    endpoint: UpstreamEndpoint,
}

impl BrightdataTransport {
    pub fn new(endpoint: UpstreamEndpoint) -> Self {
        Self { endpoint }
    }

    fn hop(&self) -> Hop {
        Hop::plain(self.endpoint.hostname.clone(), self.endpoint.port)
    }
}

impl Default for BrightdataTransport {
    fn default() -> Self {
        Self::new(UpstreamEndpoint::brightdata())
    }
}

/// `<username>-session-<key>[-country-<cc>]`
fn session_username(config: &BrightdataProxyConfig, key: &str) -> String {
    let mut username = format!("{}-session-{}", config.username, key);
    if config.country != REGION_ALL {
        username.push_str("-country-");
        username.push_str(&config.country.to_lowercase());
    }
    username
}

fn auth_headers(headers: HeaderSet, config: &BrightdataProxyConfig, key: &str) -> HeaderSet {
    headers.with(
        "Proxy-Authorization",
        basic_auth(&session_username(config, key), &config.password),
    )
}

#[async_trait]
impl Transport for BrightdataTransport {
    fn transport_type(&self) -> &str {
        TRANSPORT_BRIGHTDATA_TYPE
    }

    fn complete_proxy_config(
        &self,
        proxy: &mut ConnectorProxyRefreshed,
        connector: &ConnectorToRefresh,
    ) -> Result<()> {
        let (username, password) = connector.brightdata_credential()?;
        let country = connector.brightdata_country()?;

        let config = proxy.config.as_brightdata_mut()?;
        config.username = username.to_string();
        config.password = password.to_string();
        config.country = country.to_string();
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
        let config = proxy.config.as_brightdata()?;

        match scheme {
            TargetScheme::Http => Ok(forward_args(
                "brightdata:http",
                method,
                url,
                auth_headers(headers, config, &proxy.key),
                self.hop(),
                sockets,
                timeout,
            )),
            TargetScheme::Https => {
                let request = TunnelRequest {
                    origin: "brightdata:https",
                    hop: self.hop(),
                    authority: connect_authority(&headers_connect, url)?,
                    headers: auth_headers(headers_connect, config, &proxy.key),
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
        let config = proxy.config.as_brightdata()?;

        let request = TunnelRequest {
            origin: "brightdata:connect",
            hop: self.hop(),
            authority: target.to_string(),
            headers: auth_headers(headers, config, &proxy.key),
            error_headers: ERROR_HEADERS,
            reason: ReasonSource::Header,
            target_tls: None,
            idle_timeout: timeout,
        };

        with_deadline(timeout, tunnel::establish(&request, sockets)).await
    }
}
